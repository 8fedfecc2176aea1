//! Simulated hardware for host tests
//!
//! [`SimTimer`] models an AVR counter tick by tick: prescaler phase,
//! overflow and compare flags, interrupt enables. [`Sim`] owns simulated
//! time. Advancing it runs the counter up to the next enabled interrupt,
//! then services that interrupt through the slot's vector entry points,
//! exactly as the hardware would between two instructions.

use core::cell::Cell;

use crate::error::TimerError;
use crate::hal::timer::{
    CompareOutputMode, CounterWidth, Interrupt, Prescaler, TimerPeripheral, WaveformMode,
    ASYNC_PRESCALERS, SYNC_PRESCALERS,
};
use crate::hal::Platform;
use crate::timer::TimerSlot;

#[derive(Debug, Clone)]
pub struct SimTimer {
    width: CounterWidth,
    prescalers: &'static [Prescaler],
    has_compare_b: bool,
    refuse_configuration: bool,
    clock: Option<Prescaler>,
    /// Cycles counted towards the next tick
    phase: u32,
    counter: u16,
    compare_a: u16,
    compare_b: u16,
    waveform: WaveformMode,
    overflow_enabled: bool,
    compare_enabled: bool,
    overflow_flag: bool,
    compare_flag: bool,
    drop_next_match: bool,
}

impl SimTimer {
    fn new(width: CounterWidth, prescalers: &'static [Prescaler], has_compare_b: bool) -> Self {
        Self {
            width,
            prescalers,
            has_compare_b,
            refuse_configuration: false,
            clock: None,
            phase: 0,
            counter: 0,
            compare_a: 0,
            compare_b: 0,
            waveform: WaveformMode::Normal,
            overflow_enabled: false,
            compare_enabled: false,
            overflow_flag: false,
            compare_flag: false,
            drop_next_match: false,
        }
    }

    /// 8-bit asynchronous counter, like Timer0
    pub fn timer0() -> Self {
        Self::new(CounterWidth::Bits8, ASYNC_PRESCALERS, false)
    }

    /// 16-bit counter, like Timer1
    pub fn timer1() -> Self {
        Self::new(CounterWidth::Bits16, SYNC_PRESCALERS, true)
    }

    /// Make every waveform configuration fail.
    pub fn refusing_configuration(mut self) -> Self {
        self.refuse_configuration = true;
        self
    }

    pub fn compare_a(&self) -> u16 {
        self.compare_a
    }

    pub fn compare_b(&self) -> u16 {
        self.compare_b
    }

    pub fn clock(&self) -> Option<Prescaler> {
        self.clock
    }

    pub fn is_at_reset(&self) -> bool {
        self.clock.is_none()
            && self.counter == 0
            && self.compare_a == 0
            && self.compare_b == 0
            && self.waveform == WaveformMode::Normal
            && !self.overflow_enabled
            && !self.compare_enabled
            && !self.overflow_flag
            && !self.compare_flag
    }

    /// Let the next compare match pass without raising its flag.
    pub fn drop_compare_match(&mut self) {
        self.drop_next_match = true;
    }

    /// Count `ticks` ticks, raising flags but servicing nothing.
    pub fn tick_without_service(&mut self, ticks: u32) {
        let range = self.width.range();
        let to_match = self.ticks_to_match();
        if ticks >= to_match {
            if self.drop_next_match {
                self.drop_next_match = false;
            } else {
                self.compare_flag = true;
            }
        }
        if ticks >= range - self.counter as u32 {
            self.overflow_flag = true;
        }
        self.counter = ((self.counter as u32 + ticks) % range) as u16;
    }

    fn ticks_to_match(&self) -> u32 {
        let counter = self.counter as u32;
        let compare = self.compare_a as u32;
        if compare > counter {
            compare - counter
        } else {
            self.width.range() - counter + compare
        }
    }

    /// Cycles until an enabled interrupt raises its flag.
    fn cycles_to_event(&self) -> Option<u32> {
        let divisor = self.clock?.divisor();
        let overflow = self
            .overflow_enabled
            .then(|| self.width.range() - self.counter as u32);
        let compare = (self.compare_enabled && !self.drop_next_match).then(|| self.ticks_to_match());
        let ticks = match (overflow, compare) {
            (Some(a), Some(b)) => a.min(b),
            (a, b) => a.or(b)?,
        };
        Some(ticks * divisor - self.phase)
    }

    fn run(&mut self, cycles: u32) {
        let Some(prescaler) = self.clock else {
            return;
        };
        let total = self.phase + cycles;
        self.phase = total % prescaler.divisor();
        self.tick_without_service(total / prescaler.divisor());
    }

    /// Claim the highest priority pending interrupt, clearing its flag.
    fn take_pending(&mut self) -> Option<Interrupt> {
        if self.compare_flag && self.compare_enabled {
            self.compare_flag = false;
            Some(Interrupt::CompareA)
        } else if self.overflow_flag && self.overflow_enabled {
            self.overflow_flag = false;
            Some(Interrupt::Overflow)
        } else {
            None
        }
    }
}

impl TimerPeripheral for SimTimer {
    fn width(&self) -> CounterWidth {
        self.width
    }

    fn prescalers(&self) -> &'static [Prescaler] {
        self.prescalers
    }

    fn set_prescaler(&mut self, prescaler: Option<Prescaler>) {
        if prescaler != self.clock {
            self.phase = 0;
            self.clock = prescaler;
        }
    }

    fn counter(&self) -> u16 {
        self.counter
    }

    fn set_counter(&mut self, value: u16) {
        self.counter = value;
    }

    fn set_compare_a(&mut self, value: u16) {
        self.compare_a = value;
    }

    fn set_compare_b(&mut self, value: u16) -> Result<(), TimerError> {
        if !self.has_compare_b {
            return Err(TimerError::Hardware);
        }
        self.compare_b = value;
        Ok(())
    }

    fn configure_waveform(
        &mut self,
        waveform: WaveformMode,
        _output_a: CompareOutputMode,
        output_b: CompareOutputMode,
    ) -> Result<(), TimerError> {
        if self.refuse_configuration
            || (!self.has_compare_b && output_b != CompareOutputMode::Disconnected)
        {
            return Err(TimerError::Hardware);
        }
        self.waveform = waveform;
        Ok(())
    }

    fn set_interrupt(&mut self, interrupt: Interrupt, enabled: bool) {
        match interrupt {
            Interrupt::Overflow => self.overflow_enabled = enabled,
            Interrupt::CompareA => self.compare_enabled = enabled,
        }
    }

    fn is_pending(&self, interrupt: Interrupt) -> bool {
        match interrupt {
            Interrupt::Overflow => self.overflow_flag,
            Interrupt::CompareA => self.compare_flag,
        }
    }

    fn clear_pending(&mut self, interrupt: Interrupt) {
        match interrupt {
            Interrupt::Overflow => self.overflow_flag = false,
            Interrupt::CompareA => self.compare_flag = false,
        }
    }

    fn reset(&mut self) {
        *self = Self {
            refuse_configuration: self.refuse_configuration,
            ..Self::new(self.width, self.prescalers, self.has_compare_b)
        };
    }
}

/// Simulation guard: no test needs more than a minute of simulated time
const MAX_CYCLES: u64 = 60 * crate::config::CPU_FREQ_HZ as u64;

/// Simulated time around one timer slot
pub struct Sim<'a, A> {
    slot: &'a TimerSlot<SimTimer, A>,
    now: Cell<u64>,
    interrupts: Cell<u32>,
    sleeps: Cell<u32>,
    watchdog_feeds: Cell<u32>,
    last_feed: Cell<u64>,
    longest_unfed: Cell<u64>,
}

impl<'a, A: Copy> Sim<'a, A> {
    pub fn new(slot: &'a TimerSlot<SimTimer, A>) -> Self {
        Self {
            slot,
            now: Cell::new(0),
            interrupts: Cell::new(0),
            sleeps: Cell::new(0),
            watchdog_feeds: Cell::new(0),
            last_feed: Cell::new(0),
            longest_unfed: Cell::new(0),
        }
    }

    /// Cycles since the simulation started
    pub fn now(&self) -> u64 {
        self.now.get()
    }

    /// Timer interrupts serviced so far
    pub fn interrupts(&self) -> u32 {
        self.interrupts.get()
    }

    pub fn sleeps(&self) -> u32 {
        self.sleeps.get()
    }

    pub fn watchdog_feeds(&self) -> u32 {
        self.watchdog_feeds.get()
    }

    /// Longest stretch of cycles without a watchdog feed, counted from the
    /// start of the simulation
    pub fn longest_watchdog_gap(&self) -> u64 {
        self.longest_unfed.get()
    }

    pub fn platform(&self) -> SimPlatform<'_, 'a, A> {
        SimPlatform { sim: self }
    }

    /// Busy-run for `cycles`, servicing interrupts as they come due.
    pub fn advance(&self, cycles: u32) {
        let mut left = cycles;
        self.service();
        while left > 0 {
            let step = self
                .peripheral(|p| p.cycles_to_event())
                .flatten()
                .map_or(left, |c| c.min(left));
            self.peripheral(|p| p.run(step));
            self.elapse(step);
            left -= step;
            self.service();
        }
    }

    /// Run to the next enabled interrupt; `false` if none can occur.
    pub fn step_to_next_event(&self) -> bool {
        match self.peripheral(|p| p.cycles_to_event()).flatten() {
            Some(cycles) => {
                self.advance(cycles);
                true
            }
            None => false,
        }
    }

    pub fn run_until_idle(&self) {
        while self.step_to_next_event() {}
    }

    /// Service every pending, enabled interrupt.
    pub fn service(&self) {
        while let Some(interrupt) = self.peripheral(SimTimer::take_pending).flatten() {
            self.interrupts.set(self.interrupts.get() + 1);
            match interrupt {
                Interrupt::CompareA => self.slot.on_compare_match(),
                Interrupt::Overflow => self.slot.on_overflow(),
            }
        }
    }

    fn peripheral<R>(&self, f: impl FnOnce(&mut SimTimer) -> R) -> Option<R> {
        self.slot.with(|t| f(t.peripheral_mut())).ok()
    }

    fn elapse(&self, cycles: u32) {
        let now = self.now.get() + cycles as u64;
        assert!(now <= MAX_CYCLES, "simulation ran away");
        self.now.set(now);
    }
}

/// [`Platform`] whose sleep fast-forwards simulated time
pub struct SimPlatform<'s, 'a, A> {
    sim: &'s Sim<'a, A>,
}

impl<A: Copy> Platform for SimPlatform<'_, '_, A> {
    fn feed_watchdog(&mut self) {
        let sim = self.sim;
        sim.watchdog_feeds.set(sim.watchdog_feeds.get() + 1);
        let gap = sim.now() - sim.last_feed.replace(sim.now());
        sim.longest_unfed.set(sim.longest_unfed.get().max(gap));
    }

    fn sleep_unless(&mut self, wake: &dyn Fn() -> bool) {
        if wake() {
            return;
        }
        let sleeps = &self.sim.sleeps;
        sleeps.set(sleeps.get() + 1);
        assert!(
            self.sim.step_to_next_event(),
            "sleeping with no interrupt that could wake the CPU"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_raises_flags_at_the_right_tick() {
        let mut timer = SimTimer::timer0();
        timer.set_compare_a(10);
        timer.set_prescaler(Some(Prescaler::Div8));
        timer.run(79);
        assert_eq!(timer.counter(), 9);
        assert!(!timer.is_pending(Interrupt::CompareA));
        timer.run(1);
        assert!(timer.is_pending(Interrupt::CompareA));
        timer.run(246 * 8);
        assert_eq!(timer.counter(), 0);
        assert!(timer.is_pending(Interrupt::Overflow));
    }

    #[test]
    fn next_event_only_counts_enabled_sources() {
        let mut timer = SimTimer::timer1();
        assert_eq!(timer.cycles_to_event(), None);
        timer.set_prescaler(Some(Prescaler::Div64));
        timer.set_compare_a(100);
        assert_eq!(timer.cycles_to_event(), None);
        timer.set_interrupt(Interrupt::Overflow, true);
        assert_eq!(timer.cycles_to_event(), Some(65_536 * 64));
        timer.set_interrupt(Interrupt::CompareA, true);
        timer.run(10);
        assert_eq!(timer.cycles_to_event(), Some(100 * 64 - 10));
    }

    #[test]
    fn watchdog_gap_is_the_longest_unfed_stretch() {
        let slot: TimerSlot<SimTimer, ()> = TimerSlot::new();
        let sim = Sim::new(&slot);
        let mut platform = sim.platform();

        sim.advance(100);
        platform.feed_watchdog();
        sim.advance(300);
        platform.feed_watchdog();
        sim.advance(50);
        platform.feed_watchdog();

        assert_eq!(sim.watchdog_feeds(), 3);
        assert_eq!(sim.longest_watchdog_gap(), 300);
    }
}
