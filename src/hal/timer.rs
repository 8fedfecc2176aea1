//! Timer/counter peripheral abstraction
//!
//! [`TimerPeripheral`] is the only surface the timer engine touches. The
//! ATmega128 counters implement it below; host tests use the simulated
//! counter in `crate::testing`.

use crate::error::TimerError;

/// Clock divider between the system clock and a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Prescaler {
    Div1,
    Div8,
    Div32,
    Div64,
    Div128,
    Div256,
    Div1024,
}

impl Prescaler {
    /// Number of system clock cycles per counter tick
    pub const fn divisor(self) -> u32 {
        match self {
            Prescaler::Div1 => 1,
            Prescaler::Div8 => 8,
            Prescaler::Div32 => 32,
            Prescaler::Div64 => 64,
            Prescaler::Div128 => 128,
            Prescaler::Div256 => 256,
            Prescaler::Div1024 => 1024,
        }
    }
}

/// Prescalers of the asynchronous 8-bit Timer0
pub const ASYNC_PRESCALERS: &[Prescaler] = &[
    Prescaler::Div1,
    Prescaler::Div8,
    Prescaler::Div32,
    Prescaler::Div64,
    Prescaler::Div128,
    Prescaler::Div256,
    Prescaler::Div1024,
];

/// Prescalers of the synchronous timers (Timer1, Timer3)
pub const SYNC_PRESCALERS: &[Prescaler] = &[
    Prescaler::Div1,
    Prescaler::Div8,
    Prescaler::Div64,
    Prescaler::Div256,
    Prescaler::Div1024,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CounterWidth {
    Bits8,
    Bits16,
}

impl CounterWidth {
    /// Number of distinct counter values, i.e. ticks per overflow
    pub const fn range(self) -> u32 {
        match self {
            CounterWidth::Bits8 => 1 << 8,
            CounterWidth::Bits16 => 1 << 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaveformMode {
    /// Free running up-counter, overflow at the top of the range
    Normal,
    /// Clear timer on compare match A
    Ctc,
    FastPwm,
    PhaseCorrectPwm,
}

/// Behaviour of a compare output pin on match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CompareOutputMode {
    Disconnected,
    Toggle,
    Clear,
    Set,
}

impl CompareOutputMode {
    const fn bits(self) -> u8 {
        match self {
            CompareOutputMode::Disconnected => 0b00,
            CompareOutputMode::Toggle => 0b01,
            CompareOutputMode::Clear => 0b10,
            CompareOutputMode::Set => 0b11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Interrupt {
    Overflow,
    CompareA,
}

/// One hardware counter with divider, compare unit and interrupt flags
pub trait TimerPeripheral {
    fn width(&self) -> CounterWidth;

    /// Supported prescalers, ascending
    fn prescalers(&self) -> &'static [Prescaler];

    /// Select the clock source; `None` stops the counter.
    fn set_prescaler(&mut self, prescaler: Option<Prescaler>);

    fn counter(&self) -> u16;

    fn set_counter(&mut self, value: u16);

    fn set_compare_a(&mut self, value: u16);

    /// Compare unit B, if the counter has one
    fn set_compare_b(&mut self, value: u16) -> Result<(), TimerError>;

    fn configure_waveform(
        &mut self,
        waveform: WaveformMode,
        output_a: CompareOutputMode,
        output_b: CompareOutputMode,
    ) -> Result<(), TimerError>;

    fn set_interrupt(&mut self, interrupt: Interrupt, enabled: bool);

    fn is_pending(&self, interrupt: Interrupt) -> bool;

    fn clear_pending(&mut self, interrupt: Interrupt);

    /// Return every register to its power-on value.
    fn reset(&mut self);

    fn supports(&self, prescaler: Prescaler) -> bool {
        self.prescalers().contains(&prescaler)
    }

    /// Largest supported divider not exceeding `cycles`, falling back to the
    /// smallest one.
    fn divider_for(&self, cycles: u32) -> Prescaler {
        let prescalers = self.prescalers();
        prescalers
            .iter()
            .rev()
            .copied()
            .find(|p| p.divisor() <= cycles)
            .unwrap_or(prescalers[0])
    }
}

#[cfg(target_arch = "avr")]
pub use avr::*;

#[cfg(target_arch = "avr")]
mod avr {
    //! ATmega128A Timer0, Timer1 and Timer3 through the PAC register blocks.

    use super::*;
    use avr_device::atmega128a::{TC0, TC1, TC3};

    // TIMSK/TIFR for Timer0
    const TOIE0: u8 = 1 << 0;
    const OCIE0: u8 = 1 << 1;

    // TIMSK/TIFR for Timer1, ETIMSK/ETIFR for Timer3
    const TOIE_16: u8 = 1 << 2;
    const OCIE_A_16: u8 = 1 << 4;

    fn clock_select(prescalers: &[Prescaler], prescaler: Option<Prescaler>) -> u8 {
        prescaler
            .and_then(|p| prescalers.iter().position(|&q| q == p))
            .map_or(0, |i| i as u8 + 1)
    }

    fn timer0_bit(interrupt: Interrupt) -> u8 {
        match interrupt {
            Interrupt::Overflow => TOIE0,
            Interrupt::CompareA => OCIE0,
        }
    }

    fn timer16_bit(interrupt: Interrupt) -> u8 {
        match interrupt {
            Interrupt::Overflow => TOIE_16,
            Interrupt::CompareA => OCIE_A_16,
        }
    }

    /// WGMn3:0 for the 16-bit counters
    fn timer16_wgm(waveform: WaveformMode) -> u8 {
        match waveform {
            WaveformMode::Normal => 0b0000,
            WaveformMode::Ctc => 0b0100,
            WaveformMode::PhaseCorrectPwm => 0b1010,
            WaveformMode::FastPwm => 0b1110,
        }
    }

    impl TimerPeripheral for TC0 {
        fn width(&self) -> CounterWidth {
            CounterWidth::Bits8
        }

        fn prescalers(&self) -> &'static [Prescaler] {
            ASYNC_PRESCALERS
        }

        fn set_prescaler(&mut self, prescaler: Option<Prescaler>) {
            let cs = clock_select(ASYNC_PRESCALERS, prescaler);
            self.tccr0
                .modify(|r, w| unsafe { w.bits((r.bits() & !0x07) | cs) });
        }

        fn counter(&self) -> u16 {
            self.tcnt0.read().bits() as u16
        }

        fn set_counter(&mut self, value: u16) {
            self.tcnt0.write(|w| unsafe { w.bits(value as u8) });
        }

        fn set_compare_a(&mut self, value: u16) {
            self.ocr0.write(|w| unsafe { w.bits(value as u8) });
        }

        fn set_compare_b(&mut self, _value: u16) -> Result<(), TimerError> {
            Err(TimerError::Hardware)
        }

        fn configure_waveform(
            &mut self,
            waveform: WaveformMode,
            output_a: CompareOutputMode,
            output_b: CompareOutputMode,
        ) -> Result<(), TimerError> {
            if output_b != CompareOutputMode::Disconnected {
                return Err(TimerError::Hardware);
            }
            // WGM00 is bit 6, WGM01 is bit 3
            let wgm = match waveform {
                WaveformMode::Normal => 0,
                WaveformMode::PhaseCorrectPwm => 1 << 6,
                WaveformMode::Ctc => 1 << 3,
                WaveformMode::FastPwm => (1 << 6) | (1 << 3),
            };
            self.tccr0.modify(|r, w| unsafe {
                w.bits((r.bits() & 0x07) | wgm | (output_a.bits() << 4))
            });
            Ok(())
        }

        fn set_interrupt(&mut self, interrupt: Interrupt, enabled: bool) {
            let bit = timer0_bit(interrupt);
            self.timsk.modify(|r, w| unsafe {
                w.bits(if enabled { r.bits() | bit } else { r.bits() & !bit })
            });
        }

        fn is_pending(&self, interrupt: Interrupt) -> bool {
            self.tifr.read().bits() & timer0_bit(interrupt) != 0
        }

        fn clear_pending(&mut self, interrupt: Interrupt) {
            // Flags clear by writing a one; writing zeros leaves the rest alone
            self.tifr.write(|w| unsafe { w.bits(timer0_bit(interrupt)) });
        }

        fn reset(&mut self) {
            unsafe {
                self.tccr0.write(|w| w.bits(0));
                self.tcnt0.write(|w| w.bits(0));
                self.ocr0.write(|w| w.bits(0));
                self.timsk
                    .modify(|r, w| w.bits(r.bits() & !(TOIE0 | OCIE0)));
                self.tifr.write(|w| w.bits(TOIE0 | OCIE0));
            }
        }
    }

    // Timer1 and Timer3 share a layout but not register names
    macro_rules! impl_timer16 {
        ($TC:ident, $tccra:ident, $tccrb:ident, $tcnt:ident, $ocra:ident, $ocrb:ident, $timsk:ident, $tifr:ident) => {
            impl TimerPeripheral for $TC {
                fn width(&self) -> CounterWidth {
                    CounterWidth::Bits16
                }

                fn prescalers(&self) -> &'static [Prescaler] {
                    SYNC_PRESCALERS
                }

                fn set_prescaler(&mut self, prescaler: Option<Prescaler>) {
                    let cs = clock_select(SYNC_PRESCALERS, prescaler);
                    self.$tccrb
                        .modify(|r, w| unsafe { w.bits((r.bits() & !0x07) | cs) });
                }

                fn counter(&self) -> u16 {
                    self.$tcnt.read().bits()
                }

                fn set_counter(&mut self, value: u16) {
                    self.$tcnt.write(|w| unsafe { w.bits(value) });
                }

                fn set_compare_a(&mut self, value: u16) {
                    self.$ocra.write(|w| unsafe { w.bits(value) });
                }

                fn set_compare_b(&mut self, value: u16) -> Result<(), TimerError> {
                    self.$ocrb.write(|w| unsafe { w.bits(value) });
                    Ok(())
                }

                fn configure_waveform(
                    &mut self,
                    waveform: WaveformMode,
                    output_a: CompareOutputMode,
                    output_b: CompareOutputMode,
                ) -> Result<(), TimerError> {
                    // WGMn1:0 live in TCCRnA, WGMn3:2 in TCCRnB bits 4:3
                    let wgm = timer16_wgm(waveform);
                    unsafe {
                        self.$tccra.write(|w| {
                            w.bits((output_a.bits() << 6) | (output_b.bits() << 4) | (wgm & 0b11))
                        });
                        self.$tccrb
                            .modify(|r, w| w.bits((r.bits() & 0x07) | ((wgm >> 2) << 3)));
                    }
                    Ok(())
                }

                fn set_interrupt(&mut self, interrupt: Interrupt, enabled: bool) {
                    let bit = timer16_bit(interrupt);
                    self.$timsk.modify(|r, w| unsafe {
                        w.bits(if enabled { r.bits() | bit } else { r.bits() & !bit })
                    });
                }

                fn is_pending(&self, interrupt: Interrupt) -> bool {
                    self.$tifr.read().bits() & timer16_bit(interrupt) != 0
                }

                fn clear_pending(&mut self, interrupt: Interrupt) {
                    self.$tifr.write(|w| unsafe { w.bits(timer16_bit(interrupt)) });
                }

                fn reset(&mut self) {
                    unsafe {
                        self.$tccrb.write(|w| w.bits(0));
                        self.$tccra.write(|w| w.bits(0));
                        self.$tcnt.write(|w| w.bits(0));
                        self.$ocra.write(|w| w.bits(0));
                        self.$ocrb.write(|w| w.bits(0));
                        self.$timsk
                            .modify(|r, w| w.bits(r.bits() & !(TOIE_16 | OCIE_A_16)));
                        self.$tifr.write(|w| w.bits(TOIE_16 | OCIE_A_16));
                    }
                }
            }
        };
    }

    impl_timer16!(TC1, tccr1a, tccr1b, tcnt1, ocr1a, ocr1b, timsk, tifr);
    impl_timer16!(TC3, tccr3a, tccr3b, tcnt3, ocr3a, ocr3b, etimsk, etifr);
}
