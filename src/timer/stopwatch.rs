//! Elapsed-cycle accumulation across divider changes and counter wraps
//!
//! The elapsed time is always `cycles + counter * active divisor`. Anything
//! that zeroes the counter or swaps the divider folds the live part into
//! `cycles` first, and every overflow folds one full range. The accumulator
//! wraps silently after `u32::MAX` cycles (about 268 s at 16 MHz).

use super::Timer;
use crate::config;
use crate::hal::timer::{Interrupt, TimerPeripheral};

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Stopwatch {
    enabled: bool,
    cycles: u32,
}

impl Stopwatch {
    pub(crate) const fn new() -> Self {
        Self {
            enabled: false,
            cycles: 0,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Add cycles that left the live counter.
    pub(crate) fn fold(&mut self, cycles: u32) {
        if self.enabled {
            self.cycles = self.cycles.wrapping_add(cycles);
        }
    }

    /// The counter keeps `count` but is about to tick at `new_divisor`.
    ///
    /// Ticks already counted are worth `old_divisor` each; the live part
    /// will report them at `new_divisor`, so the difference is carried here.
    pub(crate) fn rebase(&mut self, count: u32, old_divisor: u32, new_divisor: u32) {
        if self.enabled {
            self.cycles = self
                .cycles
                .wrapping_add(count.wrapping_mul(old_divisor))
                .wrapping_sub(count.wrapping_mul(new_divisor));
        }
    }

    /// Start measuring from zero at the instant the live part equals `live`.
    pub(crate) fn restart(&mut self, enabled: bool, live: u32) {
        self.enabled = enabled;
        self.cycles = 0u32.wrapping_sub(live);
    }

    pub(crate) fn read(&mut self, live: u32, reset: bool) -> u32 {
        if !self.enabled {
            return 0;
        }
        let elapsed = self.cycles.wrapping_add(live);
        if reset {
            self.cycles = 0u32.wrapping_sub(live);
        }
        elapsed
    }
}

impl<P: TimerPeripheral, A: Copy> Timer<P, A> {
    /// Enable or disable the stopwatch; either way the count restarts at zero.
    pub fn reset_stopwatch(&mut self, enable: bool) {
        let live = self.live_cycles();
        self.stopwatch.restart(enable, live);
        self.sync_interrupts();
    }

    /// Cycles elapsed since the stopwatch was last reset.
    ///
    /// With `reset` the next read measures from this instant. Returns zero
    /// while the stopwatch is disabled.
    pub fn stopwatch_cycles(&mut self, reset: bool) -> u32 {
        let live = self.live_cycles();
        self.stopwatch.read(live, reset)
    }

    pub fn stopwatch_millis(&mut self, reset: bool) -> u32 {
        config::cycles_to_ms(self.stopwatch_cycles(reset))
    }

    /// Cycles held in the hardware that the accumulator has not seen yet,
    /// including an overflow whose interrupt is still pending.
    pub(super) fn live_cycles(&self) -> u32 {
        let divisor = self.active_divisor();
        let mut count = self.peripheral.counter() as u32;
        let mut extra = 0;
        if self.peripheral.is_pending(Interrupt::Overflow) {
            // The counter may have wrapped between the two reads
            count = self.peripheral.counter() as u32;
            extra = self.range().wrapping_mul(divisor);
        }
        count.wrapping_mul(divisor).wrapping_add(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::timer::Prescaler;
    use crate::testing::{Sim, SimTimer};
    use crate::timer::{TimerConfig, TimerSlot};

    fn running_sim(peripheral: SimTimer, prescaler: Prescaler) -> TimerSlot<SimTimer, ()> {
        let slot = TimerSlot::new();
        let config = TimerConfig {
            prescaler,
            ..TimerConfig::default()
        };
        slot.init(peripheral, config).unwrap();
        slot.with(|t| {
            t.reset_stopwatch(true);
            t.start().unwrap();
        })
        .unwrap();
        slot
    }

    #[test]
    fn disabled_stopwatch_reads_zero() {
        let mut sw = Stopwatch::new();
        sw.fold(1000);
        assert_eq!(sw.read(50, false), 0);
    }

    #[test]
    fn rebase_keeps_total_exact() {
        let mut sw = Stopwatch::new();
        sw.restart(true, 0);
        // 10 ticks at /64, then the divider becomes /8
        sw.rebase(10, 64, 8);
        // 20 more ticks at /8 leave the counter at 30
        assert_eq!(sw.read(30 * 8, false), 10 * 64 + 20 * 8);
    }

    #[test]
    fn counts_across_overflows() {
        let slot = running_sim(SimTimer::timer0(), Prescaler::Div8);
        let sim = Sim::new(&slot);
        // Timer0 overflows every 2048 cycles at /8
        sim.advance(10_000);
        let cycles = slot.with(|t| t.stopwatch_cycles(false)).unwrap();
        assert_eq!(cycles, 10_000);
        assert_eq!(sim.interrupts(), 4);
    }

    #[test]
    fn divider_changes_do_not_distort_the_sum() {
        let slot = running_sim(SimTimer::timer0(), Prescaler::Div8);
        let sim = Sim::new(&slot);
        let schedule = [
            (Prescaler::Div1, 3_000),
            (Prescaler::Div1024, 600_000),
            (Prescaler::Div32, 17_000),
            (Prescaler::Div128, 250_000),
        ];
        sim.advance(5_000);
        let mut expected = 5_000;
        for (prescaler, cycles) in schedule {
            slot.with(|t| t.set_clock_prescaler(prescaler).unwrap())
                .unwrap();
            sim.advance(cycles);
            expected += cycles;
        }
        let cycles = slot.with(|t| t.stopwatch_cycles(false)).unwrap();
        // Only partial ticks (a divider change, the final read) go missing
        let slack = 8 + 1 + 1024 + 32 + 128;
        assert!(cycles <= expected && expected - cycles <= slack);
    }

    #[test]
    fn resetting_read_measures_from_the_read() {
        let slot = running_sim(SimTimer::timer1(), Prescaler::Div1);
        let sim = Sim::new(&slot);
        sim.advance(70_000);
        let first = slot.with(|t| t.stopwatch_cycles(true)).unwrap();
        sim.advance(1_234);
        let second = slot.with(|t| t.stopwatch_cycles(true)).unwrap();
        assert_eq!(first, 70_000);
        assert_eq!(second, 1_234);
        assert_eq!(slot.with(|t| t.stopwatch_cycles(false)).unwrap(), 0);
    }

    #[test]
    fn pending_overflow_is_counted_before_service() {
        let slot = running_sim(SimTimer::timer0(), Prescaler::Div1);
        let sim = Sim::new(&slot);
        sim.advance(250);
        // Wrap the counter without servicing the interrupt
        slot.with(|t| t.peripheral_mut().tick_without_service(10))
            .unwrap();
        assert_eq!(slot.with(|t| t.stopwatch_cycles(false)).unwrap(), 260);
        sim.service();
        assert_eq!(slot.with(|t| t.stopwatch_cycles(false)).unwrap(), 260);
    }

    #[test]
    fn millisecond_reading() {
        let slot = running_sim(SimTimer::timer1(), Prescaler::Div64);
        let sim = Sim::new(&slot);
        sim.advance(config::ms_to_cycles(125).unwrap());
        assert_eq!(slot.with(|t| t.stopwatch_millis(false)).unwrap(), 125);
    }
}
