//! Countdown: fire a callback after an arbitrary number of cycles
//!
//! A duration rarely fits the counter at one divider. Each phase picks the
//! largest divider that fits what is left, runs whole overflow passes while
//! the tick count exceeds the counter range and otherwise arms compare
//! match A for the sub-range part. The truncated remainder is carried into
//! the next phase, so a handful of ever finer phases lands within the
//! imprecision tolerance while long waits cost one interrupt per pass.
//!
//! When the stopwatch is running, the counter is never stopped off a tick
//! edge: the first phase starts from the live count at the live divider.

use super::{Timer, TimerCallback, TimerMode};
use crate::config;
use crate::error::TimerError;
use crate::hal::timer::{Interrupt, Prescaler, TimerPeripheral, WaveformMode};
use crate::logger::trace;

/// How many times a countdown fires before the timer goes idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Repeat {
    Times(u16),
    Forever,
}

impl Repeat {
    /// State after one firing, `None` once exhausted.
    fn after_firing(self) -> Option<Repeat> {
        match self {
            Repeat::Forever => Some(Repeat::Forever),
            Repeat::Times(n) if n > 1 => Some(Repeat::Times(n - 1)),
            Repeat::Times(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for this many more overflows
    Passes(u32),
    /// Waiting for the counter to reach the compare value
    Match(u16),
}

#[derive(Clone, Copy)]
pub(crate) struct Countdown<A> {
    callback: TimerCallback<A>,
    arg: A,
    total_cycles: u32,
    remaining_cycles: u32,
    phase: Phase,
    repeat: Repeat,
}

impl<A> Countdown<A> {
    pub(crate) fn awaits_match(&self) -> bool {
        matches!(self.phase, Phase::Match(_))
    }
}

impl<P: TimerPeripheral, A: Copy> Timer<P, A> {
    /// Call `callback(arg)` after `duration_ms`, `repeat` times in a row.
    pub fn start_countdown(
        &mut self,
        callback: TimerCallback<A>,
        arg: A,
        duration_ms: u32,
        repeat: Repeat,
    ) -> Result<(), TimerError> {
        let cycles = config::ms_to_cycles(duration_ms).ok_or(TimerError::BadParameter)?;
        self.start_countdown_cycles(callback, arg, cycles, repeat)
    }

    /// Cycle-exact variant of [`Timer::start_countdown`].
    pub fn start_countdown_cycles(
        &mut self,
        callback: TimerCallback<A>,
        arg: A,
        cycles: u32,
        repeat: Repeat,
    ) -> Result<(), TimerError> {
        if self.config.waveform != WaveformMode::Normal {
            return Err(TimerError::IncompatibleMode);
        }
        if cycles == 0 || repeat == Repeat::Times(0) {
            return Err(TimerError::BadParameter);
        }

        self.countdown = Some(Countdown {
            callback,
            arg,
            total_cycles: cycles,
            remaining_cycles: cycles,
            phase: Phase::Passes(0),
            repeat,
        });
        self.mode = TimerMode::Countdown;
        match self.clock {
            Some(clock) if self.stopwatch.is_enabled() => self.arm_live_phase(clock),
            _ => self.arm_phase(),
        }
        Ok(())
    }

    /// Abandon a running countdown without firing it.
    pub fn cancel_countdown(&mut self) {
        if self.mode == TimerMode::Countdown {
            self.finish_countdown();
        }
    }

    /// Cycles the current countdown still has to cover after its phase.
    pub fn countdown_remaining(&self) -> Option<u32> {
        self.countdown.as_ref().map(|c| c.remaining_cycles)
    }

    pub(super) fn countdown_overflow(&mut self) -> Option<(TimerCallback<A>, A)> {
        let countdown = self.countdown.as_mut()?;
        let phase = countdown.phase;
        match phase {
            Phase::Passes(passes) if passes > 1 => {
                countdown.phase = Phase::Passes(passes - 1);
                None
            }
            // A wrap while waiting for the match means the match was missed
            Phase::Passes(_) | Phase::Match(_) => self.phase_complete(),
        }
    }

    pub(super) fn countdown_match(&mut self) -> Option<(TimerCallback<A>, A)> {
        let target = match self.countdown.as_ref()?.phase {
            Phase::Match(target) => target,
            Phase::Passes(_) => return None,
        };
        let wrapped = self.peripheral.is_pending(Interrupt::Overflow);
        if self.peripheral.counter() < target && !wrapped {
            // Early match; compare A stays armed
            return None;
        }
        self.phase_complete()
    }

    /// A phase ran out: refine, fire, repeat or go idle.
    fn phase_complete(&mut self) -> Option<(TimerCallback<A>, A)> {
        let tolerance = self.config.imprecision_cycles;
        let countdown = self.countdown.as_mut()?;
        if countdown.remaining_cycles > tolerance {
            self.arm_phase();
            return None;
        }

        let fired = (countdown.callback, countdown.arg);
        match countdown.repeat.after_firing() {
            Some(repeat) => {
                countdown.repeat = repeat;
                countdown.remaining_cycles = countdown.total_cycles;
                self.arm_phase();
            }
            None => self.finish_countdown(),
        }
        Some(fired)
    }

    /// Program the counter for the next phase of the countdown.
    fn arm_phase(&mut self) {
        self.halt();

        let range = self.range();
        let Some(countdown) = self.countdown.as_mut() else {
            return;
        };
        let remaining = countdown.remaining_cycles;
        let prescaler = self.peripheral.divider_for(remaining);
        let divisor = prescaler.divisor();
        let ticks = remaining / divisor;

        if ticks >= range {
            let passes = ticks / range;
            countdown.remaining_cycles -= passes * range * divisor;
            countdown.phase = Phase::Passes(passes);
        } else {
            countdown.remaining_cycles -= ticks * divisor;
            countdown.phase = Phase::Match(ticks as u16);
            self.peripheral.set_compare_a(ticks as u16);
        }

        trace!(
            "countdown phase: divider {=u32}, ticks {=u32}, carry {=u32}",
            divisor,
            ticks,
            countdown.remaining_cycles
        );

        self.sync_interrupts();
        self.set_clock(Some(prescaler));
    }

    /// First phase on a counter that is already running at `clock`.
    ///
    /// Stopping or zeroing the counter here would drop the part of a tick
    /// counted so far, which the stopwatch cannot see. So the counter keeps
    /// running and the phase ends at a tick edge: compare match A at least
    /// one tick ahead, or the end of the current pass. Everything after
    /// that edge is refined by [`Timer::arm_phase`].
    fn arm_live_phase(&mut self, clock: Prescaler) {
        self.fold_pending_overflow();
        self.peripheral.clear_pending(Interrupt::CompareA);

        let range = self.range();
        let divisor = clock.divisor();
        let count = self.peripheral.counter() as u32;
        let Some(countdown) = self.countdown.as_mut() else {
            return;
        };
        let ticks = (countdown.remaining_cycles / divisor).max(1);

        if count + ticks >= range {
            let covered = (range - count) * divisor;
            countdown.remaining_cycles = countdown.remaining_cycles.saturating_sub(covered);
            countdown.phase = Phase::Passes(1);
        } else {
            let target = (count + ticks) as u16;
            countdown.remaining_cycles = countdown
                .remaining_cycles
                .saturating_sub(ticks * divisor);
            countdown.phase = Phase::Match(target);
            self.peripheral.set_compare_a(target);
        }

        trace!(
            "countdown on live counter: divider {=u32}, from {=u32}, carry {=u32}",
            divisor,
            count,
            countdown.remaining_cycles
        );
        self.sync_interrupts();
    }

    /// Leave countdown mode; keep counting if the stopwatch needs it.
    fn finish_countdown(&mut self) {
        self.countdown = None;
        if self.stopwatch.is_enabled() {
            // Only the divider changes, the count carries on
            self.fold_pending_overflow();
            self.peripheral.clear_pending(Interrupt::CompareA);
            self.set_clock(Some(self.config.prescaler));
            self.mode = TimerMode::Running;
        } else {
            self.halt();
            self.mode = TimerMode::Stopped;
        }
        self.sync_interrupts();
    }
}
