//! Watchdog timer

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum WatchdogTimeout {
    Ms16 = 0,
    Ms32 = 1,
    Ms64 = 2,
    Ms125 = 3,
    Ms250 = 4,
    Ms500 = 5,
    Ms1000 = 6,
    Ms2000 = 7,
}

impl WatchdogTimeout {
    /// Typical timeout at VCC = 5 V, shorter than the variant names suggest
    pub const fn millis(self) -> u32 {
        match self {
            Self::Ms16 => 14,
            Self::Ms32 => 28,
            Self::Ms64 => 56,
            Self::Ms125 => 112,
            Self::Ms250 => 225,
            Self::Ms500 => 450,
            Self::Ms1000 => 900,
            Self::Ms2000 => 1800,
        }
    }
}

#[cfg(target_arch = "avr")]
pub use avr::Watchdog;

#[cfg(target_arch = "avr")]
mod avr {
    use super::WatchdogTimeout;
    use avr_device::atmega128a::WDT;

    const WDCE: u8 = 1 << 4;
    const WDE: u8 = 1 << 3;

    /// Owns the watchdog peripheral
    pub struct Watchdog {
        wdt: WDT,
    }

    impl Watchdog {
        pub fn new(wdt: WDT) -> Self {
            Self { wdt }
        }

        pub fn start(&mut self, timeout: WatchdogTimeout) {
            // Timed sequence: set WDCE and WDE, then the new value within
            // four cycles
            avr_device::interrupt::free(|_| unsafe {
                self.wdt.wdtcr.write(|w| w.bits(WDCE | WDE));
                self.wdt.wdtcr.write(|w| w.bits(WDE | timeout as u8));
            });
        }

        #[inline]
        pub fn feed(&mut self) {
            avr_device::asm::wdr();
        }

        pub fn disable(&mut self) {
            avr_device::interrupt::free(|_| unsafe {
                self.wdt.wdtcr.write(|w| w.bits(WDCE | WDE));
                self.wdt.wdtcr.write(|w| w.bits(0));
            });
        }
    }
}
