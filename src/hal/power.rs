//! Sleep control

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SleepMode {
    Idle = 0,
    AdcNoiseReduction = 1,
    PowerDown = 2,
    PowerSave = 3,
    Standby = 6,
    ExtendedStandby = 7,
}

impl SleepMode {
    /// SM2:0 as laid out in MCUCR (SM2 is bit 2, SM1:0 are bits 4:3)
    pub const fn mcucr_bits(self) -> u8 {
        let sm = self as u8;
        ((sm & 0b011) << 3) | (sm & 0b100)
    }
}

#[cfg(target_arch = "avr")]
pub use avr::{AvrPlatform, Power};

#[cfg(target_arch = "avr")]
mod avr {
    use super::SleepMode;
    use crate::hal::watchdog::Watchdog;
    use crate::hal::Platform;
    use avr_device::atmega128a::CPU;

    const SE: u8 = 1 << 5;
    const SM_MASK: u8 = 0b0001_1100;

    /// Owns MCUCR through the CPU register block
    pub struct Power {
        cpu: CPU,
    }

    impl Power {
        pub fn new(cpu: CPU) -> Self {
            Self { cpu }
        }

        #[inline]
        pub fn set_sleep_mode(&mut self, mode: SleepMode) {
            self.cpu
                .mcucr
                .modify(|r, w| unsafe { w.bits((r.bits() & !SM_MASK) | mode.mcucr_bits()) });
        }

        #[inline]
        pub fn enable_sleep(&mut self) {
            self.cpu.mcucr.modify(|r, w| unsafe { w.bits(r.bits() | SE) });
        }

        #[inline]
        pub fn disable_sleep(&mut self) {
            self.cpu.mcucr.modify(|r, w| unsafe { w.bits(r.bits() & !SE) });
        }
    }

    /// Idle-mode sleep and watchdog of an ATmega128 board.
    ///
    /// Idle keeps the timers clocked, which the countdown needs to wake us.
    pub struct AvrPlatform {
        power: Power,
        watchdog: Watchdog,
    }

    impl AvrPlatform {
        pub fn new(mut power: Power, watchdog: Watchdog) -> Self {
            power.set_sleep_mode(SleepMode::Idle);
            Self { power, watchdog }
        }
    }

    impl Platform for AvrPlatform {
        #[inline]
        fn feed_watchdog(&mut self) {
            self.watchdog.feed();
        }

        fn sleep_unless(&mut self, wake: &dyn Fn() -> bool) {
            avr_device::interrupt::disable();
            if wake() {
                unsafe { avr_device::interrupt::enable() };
                return;
            }
            self.power.enable_sleep();
            // SEI takes effect after the next instruction, so no interrupt
            // can slip in between it and SLEEP.
            unsafe { avr_device::interrupt::enable() };
            avr_device::asm::sleep();
            self.power.disable_sleep();
        }
    }
}
