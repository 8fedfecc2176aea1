//! Timer engine
//!
//! A [`Timer`] wraps one [`TimerPeripheral`] and layers three primitives on
//! the raw counter: one-shot runs, a stopwatch and a countdown. Handles live
//! in a [`TimerSlot`] so that the main line and the timer interrupts can
//! share them:
//!
//! ```ignore
//! static TIMER1: TimerSlot<TC1, ()> = TimerSlot::new();
//!
//! #[avr_device::interrupt(atmega128a)]
//! fn TIMER1_OVF() {
//!     TIMER1.on_overflow();
//! }
//! ```

mod countdown;
mod stopwatch;

use core::cell::RefCell;

use critical_section::Mutex;

use crate::config;
use crate::error::TimerError;
use crate::hal::timer::{CompareOutputMode, Interrupt, Prescaler, TimerPeripheral, WaveformMode};
use crate::logger::debug;

pub use countdown::Repeat;
use countdown::Countdown;
use stopwatch::Stopwatch;

/// Callback run from the timer interrupt with its registered argument
pub type TimerCallback<A> = fn(A);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerMode {
    Stopped,
    /// Free running at the configured prescaler
    Running,
    /// Running until the next overflow
    OneShot,
    Countdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopMode {
    /// Keep counting and stop at the next overflow
    OnOverflow,
    Immediate,
    /// Stop, zero the counter and drop pending interrupt flags
    ImmediateAndReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// Divider for plain counting and the stopwatch
    pub prescaler: Prescaler,
    pub waveform: WaveformMode,
    pub output_a: CompareOutputMode,
    pub output_b: CompareOutputMode,
    /// A countdown fires once fewer cycles than this remain
    pub imprecision_cycles: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            prescaler: config::DEFAULT_PRESCALER,
            waveform: WaveformMode::Normal,
            output_a: CompareOutputMode::Disconnected,
            output_b: CompareOutputMode::Disconnected,
            imprecision_cycles: config::COUNTDOWN_IMPRECISION_CYCLES,
        }
    }
}

#[derive(Clone, Copy)]
struct OverflowHandler<A> {
    callback: TimerCallback<A>,
    arg: A,
    period: u16,
    count: u16,
}

/// Callbacks due after an interrupt, run once the handle is released
#[must_use]
pub(crate) struct Fired<A> {
    overflow: Option<(TimerCallback<A>, A)>,
    countdown: Option<(TimerCallback<A>, A)>,
}

impl<A: Copy> Fired<A> {
    const fn none() -> Self {
        Self {
            overflow: None,
            countdown: None,
        }
    }

    fn invoke(self) {
        if let Some((callback, arg)) = self.overflow {
            callback(arg);
        }
        if let Some((callback, arg)) = self.countdown {
            callback(arg);
        }
    }
}

/// One hardware counter and the state of the primitives built on it
pub struct Timer<P, A> {
    peripheral: P,
    config: TimerConfig,
    mode: TimerMode,
    /// Divider the counter is clocked from right now
    clock: Option<Prescaler>,
    stopwatch: Stopwatch,
    overflow: Option<OverflowHandler<A>>,
    countdown: Option<Countdown<A>>,
}

impl<P: TimerPeripheral, A: Copy> Timer<P, A> {
    /// Bring the peripheral to a known state and apply `config`.
    ///
    /// Nothing is committed unless every step succeeds; on failure the
    /// peripheral comes back at its power-on state.
    pub fn new(mut peripheral: P, config: TimerConfig) -> Result<Self, (TimerError, P)> {
        if !peripheral.supports(config.prescaler) {
            return Err((TimerError::BadParameter, peripheral));
        }

        peripheral.reset();
        if let Err(e) =
            peripheral.configure_waveform(config.waveform, config.output_a, config.output_b)
        {
            peripheral.reset();
            return Err((e, peripheral));
        }

        debug!("timer up, divider {=u32}", config.prescaler.divisor());

        Ok(Self {
            peripheral,
            config,
            mode: TimerMode::Stopped,
            clock: None,
            stopwatch: Stopwatch::new(),
            overflow: None,
            countdown: None,
        })
    }

    /// Reset the hardware to its power-on state and hand it back.
    pub fn release(mut self) -> P {
        self.peripheral.reset();
        self.peripheral
    }

    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    pub fn prescaler(&self) -> Prescaler {
        self.config.prescaler
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }

    pub fn peripheral_mut(&mut self) -> &mut P {
        &mut self.peripheral
    }

    /// Count freely at the configured prescaler.
    pub fn start(&mut self) -> Result<(), TimerError> {
        if self.mode == TimerMode::Countdown {
            return Err(TimerError::IncompatibleMode);
        }
        self.set_clock(Some(self.config.prescaler));
        self.mode = TimerMode::Running;
        self.sync_interrupts();
        Ok(())
    }

    /// Count from zero until the next overflow, then stop.
    pub fn one_shot(&mut self) -> Result<(), TimerError> {
        if self.mode == TimerMode::Countdown {
            return Err(TimerError::IncompatibleMode);
        }
        self.halt();
        self.set_clock(Some(self.config.prescaler));
        self.mode = TimerMode::OneShot;
        self.sync_interrupts();
        Ok(())
    }

    /// Stop counting. Any countdown in progress is abandoned without firing.
    pub fn stop(&mut self, mode: StopMode) {
        self.countdown = None;
        match mode {
            StopMode::OnOverflow => {
                self.mode = if self.clock.is_some() {
                    TimerMode::OneShot
                } else {
                    TimerMode::Stopped
                };
            }
            StopMode::Immediate => {
                self.fold_pending_overflow();
                self.set_clock(None);
                self.mode = TimerMode::Stopped;
            }
            StopMode::ImmediateAndReset => {
                self.halt();
                self.mode = TimerMode::Stopped;
            }
        }
        self.sync_interrupts();
    }

    /// Call `callback` every `period` overflows; `None` removes it.
    pub fn set_overflow_callback(
        &mut self,
        callback: Option<(TimerCallback<A>, A)>,
        period: u16,
    ) -> Result<(), TimerError> {
        self.overflow = match callback {
            Some(_) if period == 0 => return Err(TimerError::BadParameter),
            Some((callback, arg)) => Some(OverflowHandler {
                callback,
                arg,
                period,
                count: 0,
            }),
            None => None,
        };
        self.sync_interrupts();
        Ok(())
    }

    pub fn set_output_compare_registers(&mut self, a: u16, b: u16) -> Result<(), TimerError> {
        if self.mode == TimerMode::Countdown {
            // Compare unit A paces the countdown
            return Err(TimerError::IncompatibleMode);
        }
        self.peripheral.set_compare_b(b)?;
        self.peripheral.set_compare_a(a);
        Ok(())
    }

    /// Change the plain-counting divider, applying it at once if counting.
    pub fn set_clock_prescaler(&mut self, prescaler: Prescaler) -> Result<(), TimerError> {
        if !self.peripheral.supports(prescaler) {
            return Err(TimerError::BadParameter);
        }
        self.config.prescaler = prescaler;
        if matches!(self.mode, TimerMode::Running | TimerMode::OneShot) {
            self.fold_pending_overflow();
            self.set_clock(Some(prescaler));
        }
        Ok(())
    }

    /// Overflow interrupt body.
    pub(crate) fn on_overflow(&mut self) -> Fired<A> {
        let mut fired = Fired::none();
        self.stopwatch
            .fold(self.range().wrapping_mul(self.active_divisor()));

        if let Some(handler) = self.overflow.as_mut() {
            handler.count += 1;
            if handler.count >= handler.period {
                handler.count = 0;
                fired.overflow = Some((handler.callback, handler.arg));
            }
        }

        match self.mode {
            TimerMode::OneShot => {
                self.set_clock(None);
                self.mode = TimerMode::Stopped;
            }
            TimerMode::Countdown => fired.countdown = self.countdown_overflow(),
            TimerMode::Stopped | TimerMode::Running => {}
        }

        self.sync_interrupts();
        fired
    }

    /// Compare-match A interrupt body.
    pub(crate) fn on_compare_match(&mut self) -> Fired<A> {
        let mut fired = Fired::none();
        if self.mode == TimerMode::Countdown {
            fired.countdown = self.countdown_match();
        }
        self.sync_interrupts();
        fired
    }

    fn range(&self) -> u32 {
        self.peripheral.width().range()
    }

    fn active_divisor(&self) -> u32 {
        self.clock.map_or(0, Prescaler::divisor)
    }

    /// Switch the counter clock, keeping the stopwatch exact.
    fn set_clock(&mut self, clock: Option<Prescaler>) {
        if clock == self.clock {
            return;
        }
        let count = self.peripheral.counter() as u32;
        let new_divisor = clock.map_or(0, Prescaler::divisor);
        self.stopwatch
            .rebase(count, self.active_divisor(), new_divisor);
        self.peripheral.set_prescaler(clock);
        self.clock = clock;
    }

    /// Fold an overflow the interrupt has not serviced yet and drop its flag.
    fn fold_pending_overflow(&mut self) {
        if self.peripheral.is_pending(Interrupt::Overflow) {
            self.stopwatch
                .fold(self.range().wrapping_mul(self.active_divisor()));
            self.peripheral.clear_pending(Interrupt::Overflow);
        }
    }

    /// Stop the counter, zero it and clear both flags.
    fn halt(&mut self) {
        self.fold_pending_overflow();
        self.set_clock(None);
        self.peripheral.set_counter(0);
        self.peripheral.clear_pending(Interrupt::CompareA);
    }

    /// Derive the interrupt enables from the current state.
    fn sync_interrupts(&mut self) {
        let overflow = self.stopwatch.is_enabled()
            || self.overflow.is_some()
            || matches!(self.mode, TimerMode::OneShot | TimerMode::Countdown);
        let compare = self
            .countdown
            .as_ref()
            .map_or(false, Countdown::awaits_match);
        self.peripheral.set_interrupt(Interrupt::Overflow, overflow);
        self.peripheral.set_interrupt(Interrupt::CompareA, compare);
    }
}

/// Statically allocatable home of a timer handle, shared with interrupts
pub struct TimerSlot<P, A> {
    timer: Mutex<RefCell<Option<Timer<P, A>>>>,
}

impl<P, A> TimerSlot<P, A> {
    pub const fn new() -> Self {
        Self {
            timer: Mutex::new(RefCell::new(None)),
        }
    }
}

impl<P, A> Default for TimerSlot<P, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: TimerPeripheral, A: Copy> TimerSlot<P, A> {
    /// Build a handle around `peripheral` and move it into the slot.
    ///
    /// On failure the peripheral is handed back untouched or reset.
    pub fn init(&self, peripheral: P, config: TimerConfig) -> Result<(), (TimerError, P)> {
        if self.is_initialized() {
            return Err((TimerError::AlreadyInitialized, peripheral));
        }
        let timer = Timer::new(peripheral, config)?;
        self.install(timer)
            .map_err(|(e, timer)| (e, timer.release()))
    }

    /// Move a ready handle into the slot, or give it back if occupied.
    pub fn install(&self, timer: Timer<P, A>) -> Result<(), (TimerError, Timer<P, A>)> {
        critical_section::with(|cs| {
            let mut slot = self.timer.borrow_ref_mut(cs);
            if slot.is_some() {
                return Err((TimerError::AlreadyInitialized, timer));
            }
            *slot = Some(timer);
            Ok(())
        })
    }

    pub fn is_initialized(&self) -> bool {
        critical_section::with(|cs| self.timer.borrow_ref(cs).is_some())
    }

    /// Shut the timer down and return the peripheral at power-on defaults.
    pub fn exit(&self) -> Option<P> {
        critical_section::with(|cs| self.timer.borrow_ref_mut(cs).take())
            .map(Timer::release)
    }

    /// Run `f` on the handle with interrupts masked.
    pub fn with<R>(&self, f: impl FnOnce(&mut Timer<P, A>) -> R) -> Result<R, TimerError> {
        critical_section::with(|cs| {
            self.timer
                .borrow_ref_mut(cs)
                .as_mut()
                .map(f)
                .ok_or(TimerError::NotInitialized)
        })
    }

    /// Entry point for the overflow interrupt vector.
    pub fn on_overflow(&self) {
        if let Ok(fired) = self.with(Timer::on_overflow) {
            fired.invoke();
        }
    }

    /// Entry point for the compare-match A interrupt vector.
    pub fn on_compare_match(&self) {
        if let Ok(fired) = self.with(Timer::on_compare_match) {
            fired.invoke();
        }
    }
}
