//! Deadline-driven cooperative runloop
//!
//! The [`Runloop`] is the part shared with interrupts: the task table and a
//! few wake-up flags. The [`Scheduler`] owns the timer, the console
//! transport and the console, and drives the loop:
//!
//! 1. read the stopwatch and move every task forward by the elapsed cycles,
//!    running whatever became due, until a pass neither adds nor runs a task;
//! 2. arm a single countdown for the nearest deadline, capped so that the
//!    watchdog is fed in time;
//! 3. sleep until the countdown fires, a task is added, the console escape
//!    byte arrives or the loop is stopped. Other interrupts only feed the
//!    watchdog and go back to sleep.
//!
//! Deadlines are measured on the stopwatch, so the countdown only decides
//! when to wake up. A late wake-up costs jitter, never drift.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex;
use embedded_hal::serial;

use super::task::{Job, Outcome, Task, TaskCallback, TaskId, TaskTable};
use crate::config;
use crate::drivers::{Console, ConsoleOptions};
use crate::error::{SchedulerError, TimerError};
use crate::hal::timer::{Prescaler, TimerPeripheral};
use crate::hal::uart::{Transport, TriggerFlags};
use crate::hal::Platform;
use crate::logger::{debug, error, info, trace, warning};
use crate::timer::{Repeat, StopMode, Timer, TimerConfig, TimerSlot};

/// Called with the task's argument when a task fails, before it is removed
pub type TaskErrorHandler<A> = fn(A, TaskId, u8);

/// Called with the number of executions skipped to realign a late task
pub type SyncErrorHandler<A> = fn(A, TaskId, u32);

/// Argument of the countdown callback: the flag it raises
pub type WakeSignal<'a> = &'a AtomicBool;

type Error<T, C> = SchedulerError<<T as serial::Write<u8>>::Error, <C as Console<T>>::Error>;

/// A failed [`Scheduler::init`]: the error and every resource it was given.
///
/// The peripheral comes back reset, the transport without the escape trigger.
pub struct InitFailure<E, P, T, C> {
    pub error: E,
    pub peripheral: P,
    pub transport: T,
    pub console: C,
}

impl<E, P, T, C> InitFailure<E, P, T, C> {
    fn new(error: E, peripheral: P, transport: T, console: C) -> Self {
        Self {
            error,
            peripheral,
            transport,
            console,
        }
    }
}

fn raise(signal: &AtomicBool) {
    signal.store(true, Ordering::Release);
}

/// Task table and wake-up flags, shared between the loop and interrupts
pub struct Runloop<A, const N: usize = { config::MAX_TASKS }> {
    tasks: Mutex<RefCell<TaskTable<A, N>>>,
    running: AtomicBool,
    task_added: AtomicBool,
    countdown_elapsed: AtomicBool,
    console_requested: AtomicBool,
}

impl<A: Copy, const N: usize> Runloop<A, N> {
    pub const fn new() -> Self {
        Self {
            tasks: Mutex::new(RefCell::new(TaskTable::new())),
            running: AtomicBool::new(false),
            task_added: AtomicBool::new(false),
            countdown_elapsed: AtomicBool::new(false),
            console_requested: AtomicBool::new(false),
        }
    }

    /// Schedule `callback(arg)` every `period_ms`, first after
    /// `initial_delay_ms`. `executions == 0` repeats forever.
    ///
    /// Callable from task callbacks and interrupt handlers; the delay counts
    /// from the next scheduling pass, which the call itself triggers.
    pub fn add_task(
        &self,
        callback: TaskCallback<A>,
        arg: A,
        executions: u16,
        period_ms: u32,
        initial_delay_ms: u32,
    ) -> Result<TaskId, SchedulerError> {
        let (Some(period), Some(delay)) = (
            config::ms_to_cycles(period_ms),
            config::ms_to_cycles(initial_delay_ms),
        ) else {
            return Err(SchedulerError::BadParameter);
        };
        if period == 0 {
            return Err(SchedulerError::BadParameter);
        }

        let task = Task::new(callback, arg, executions, period, delay);
        let Some(id) = critical_section::with(|cs| self.tasks.borrow_ref_mut(cs).insert(task)) else {
            return Err(SchedulerError::NoSlotFree);
        };
        self.task_added.store(true, Ordering::Release);

        debug!(
            "task {=usize} added: period {=u32} ms, delay {=u32} ms",
            id.index(),
            period_ms,
            initial_delay_ms
        );
        Ok(id)
    }

    /// Ask [`Scheduler::run`] to return after its current pass.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Tasks currently holding a slot
    pub fn task_count(&self) -> usize {
        critical_section::with(|cs| self.tasks.borrow_ref(cs).len())
    }

    fn wake_pending(&self) -> bool {
        self.countdown_elapsed.load(Ordering::Acquire)
            || self.task_added.load(Ordering::Acquire)
            || self.console_requested.load(Ordering::Acquire)
            || !self.is_running()
    }
}

impl<A: Copy, const N: usize> Default for Runloop<A, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a [`Runloop`] with one hardware timer
pub struct Scheduler<'a, P, A, T, C, const N: usize = { config::MAX_TASKS }> {
    runloop: &'a Runloop<A, N>,
    timer: &'a TimerSlot<P, WakeSignal<'a>>,
    transport: T,
    console: C,
    task_error: Option<TaskErrorHandler<A>>,
    sync_error: Option<SyncErrorHandler<A>>,
}

impl<'a, P, A, T, C, const N: usize> Scheduler<'a, P, A, T, C, N>
where
    P: TimerPeripheral,
    A: Copy,
    T: Transport<'a>,
    C: Console<T>,
{
    /// Bring up the timer in plain counting mode, hook the console escape
    /// byte and initialize the console unless it already is.
    ///
    /// A failing step undoes the ones before it and everything is handed
    /// back in the [`InitFailure`]. The slot is only filled once the rest is
    /// up.
    #[allow(clippy::type_complexity)]
    pub fn init(
        runloop: &'a Runloop<A, N>,
        timer: &'a TimerSlot<P, WakeSignal<'a>>,
        peripheral: P,
        prescaler: Option<Prescaler>,
        mut transport: T,
        mut console: C,
    ) -> Result<Self, InitFailure<Error<T, C>, P, T, C>> {
        let timer_config = TimerConfig {
            prescaler: prescaler.unwrap_or(config::DEFAULT_PRESCALER),
            ..TimerConfig::default()
        };
        if timer.is_initialized() {
            warning!("runloop timer slot already taken");
            let error = SchedulerError::TimerInitFailed(TimerError::AlreadyInitialized);
            return Err(InitFailure::new(error, peripheral, transport, console));
        }
        let handle = match Timer::new(peripheral, timer_config) {
            Ok(handle) => handle,
            Err((e, peripheral)) => {
                warning!("runloop timer refused: {}", e);
                let error = SchedulerError::TimerInitFailed(e);
                return Err(InitFailure::new(error, peripheral, transport, console));
            }
        };

        let flags = TriggerFlags {
            enqueue: false,
            during_wait: false,
        };
        if let Err(e) = transport.register_trigger(
            config::CONSOLE_ESCAPE_BYTE,
            flags,
            &runloop.console_requested,
        ) {
            warning!("console escape trigger refused, unwinding");
            let error = SchedulerError::Transport(e);
            return Err(InitFailure::new(error, handle.release(), transport, console));
        }

        if !console.is_initialized() {
            if let Err(e) = console.init(&mut transport, ConsoleOptions::default()) {
                warning!("console init failed, unwinding");
                Self::unhook(&mut transport);
                let error = SchedulerError::Console(e);
                return Err(InitFailure::new(error, handle.release(), transport, console));
            }
        }

        if let Err((e, handle)) = timer.install(handle) {
            warning!("runloop timer slot taken during init, unwinding");
            Self::unhook(&mut transport);
            let error = SchedulerError::TimerInitFailed(e);
            return Err(InitFailure::new(error, handle.release(), transport, console));
        }

        info!(
            "runloop ready: {=usize} slots, divider {=u32}",
            N,
            timer_config.prescaler.divisor()
        );
        Ok(Self {
            runloop,
            timer,
            transport,
            console,
            task_error: None,
            sync_error: None,
        })
    }

    pub fn runloop(&self) -> &'a Runloop<A, N> {
        self.runloop
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn on_task_error(&mut self, handler: Option<TaskErrorHandler<A>>) {
        self.task_error = handler;
    }

    pub fn on_sync_error(&mut self, handler: Option<SyncErrorHandler<A>>) {
        self.sync_error = handler;
    }

    /// Run tasks until [`Runloop::stop`].
    ///
    /// Errors only when the timer fails underneath the loop; the timer is
    /// left stopped with its stopwatch disabled either way.
    pub fn run(&mut self, platform: &mut impl Platform) -> Result<(), Error<T, C>> {
        self.runloop.running.store(true, Ordering::Release);
        info!("runloop started");

        let result = self.cycle(platform);
        self.runloop.running.store(false, Ordering::Release);
        let wound_down = self.wind_down();

        info!("runloop stopped");
        result.and(wound_down).map_err(|e| {
            error!("runloop timer failed: {}", e);
            SchedulerError::Timer(e)
        })
    }

    /// Remove the escape trigger and hand back the pieces.
    pub fn release(mut self) -> (Option<P>, T, C) {
        Self::unhook(&mut self.transport);
        (self.timer.exit(), self.transport, self.console)
    }

    fn unhook(transport: &mut T) {
        if transport
            .unregister_trigger(config::CONSOLE_ESCAPE_BYTE)
            .is_err()
        {
            warning!("console escape trigger could not be removed");
        }
    }

    fn cycle(&mut self, platform: &mut impl Platform) -> Result<(), TimerError> {
        let runloop = self.runloop;
        runloop.countdown_elapsed.store(false, Ordering::Relaxed);
        self.timer.with(|t| {
            t.reset_stopwatch(true);
            t.start()
        })??;

        while runloop.is_running() {
            self.drain()?;
            if !runloop.is_running() {
                break;
            }
            self.arm_wakeup()?;

            if nb::block!(self.transport.flush()).is_err() {
                warning!("console transport flush failed");
            }
            platform.feed_watchdog();
            while !runloop.wake_pending() {
                platform.sleep_unless(&|| runloop.wake_pending());
                platform.feed_watchdog();
            }

            runloop.countdown_elapsed.store(false, Ordering::Relaxed);
            if runloop.console_requested.swap(false, Ordering::AcqRel) {
                self.console_takeover(platform);
            }
        }
        Ok(())
    }

    /// Batch passes until one neither promotes nor runs a task.
    fn drain(&self) -> Result<(), TimerError> {
        let tasks = &self.runloop.tasks;
        while self.runloop.is_running() {
            // One snapshot per pass: every task in it sees the same instant
            let elapsed = self.timer.with(|t| t.stopwatch_cycles(true))?;
            let added = self.runloop.task_added.swap(false, Ordering::AcqRel);
            let due = critical_section::with(|cs| tasks.borrow_ref_mut(cs).advance(elapsed));

            if due {
                for index in 0..N {
                    self.execute(index);
                }
            }
            if !added && !due {
                break;
            }
        }
        Ok(())
    }

    fn execute(&self, index: usize) {
        let tasks = &self.runloop.tasks;
        let Some(job) = critical_section::with(|cs| tasks.borrow_ref_mut(cs).take_due(index)) else {
            return;
        };
        let result = (job.callback)(job.arg);
        let outcome = critical_section::with(|cs| tasks.borrow_ref_mut(cs).complete(&job, result));
        self.report(&job, outcome);
    }

    fn report(&self, job: &Job<A>, outcome: Outcome) {
        let id = job.id;
        match outcome {
            Outcome::Rescheduled => {}
            Outcome::Realigned { dropped } => {
                warning!("task {=usize} late, {=u32} executions dropped", id.index(), dropped);
                if let Some(handler) = self.sync_error {
                    handler(job.arg, id, dropped);
                }
            }
            Outcome::Finished => debug!("task {=usize} finished", id.index()),
            Outcome::Aborted => debug!("task {=usize} aborted", id.index()),
            Outcome::Failed(code) => {
                warning!("task {=usize} failed with {=u8}", id.index(), code);
                if let Some(handler) = self.task_error {
                    handler(job.arg, id, code);
                }
            }
        }
    }

    /// Arm the countdown for the nearest deadline, at most
    /// [`config::MAX_SLEEP_CYCLES`] ahead.
    fn arm_wakeup(&self) -> Result<(), TimerError> {
        let runloop = self.runloop;
        let head = critical_section::with(|cs| runloop.tasks.borrow_ref(cs).head());
        let cycles = match head {
            Some((id, cycles)) => {
                trace!("next: task {=usize} in {=u32} cycles", id.index(), cycles);
                cycles
            }
            None => config::MAX_SLEEP_CYCLES,
        };
        // A task promoted after the last snapshot may be due at once
        let cycles = cycles.clamp(1, config::MAX_SLEEP_CYCLES);
        let signal = &runloop.countdown_elapsed;
        self.timer
            .with(|t| t.start_countdown_cycles(raise, signal, cycles, Repeat::Times(1)))?
    }

    /// Hand the CPU to the console. The countdown and stopwatch keep
    /// running, so the time spent there is seen as overdue afterwards.
    fn console_takeover(&mut self, platform: &mut impl Platform) {
        info!("console takeover");
        let mut feed = || platform.feed_watchdog();
        if self.console.run(&mut self.transport, &mut feed).is_err() {
            warning!("console returned an error");
        }
        info!("console released, resuming tasks");
    }

    fn wind_down(&self) -> Result<(), TimerError> {
        self.timer.with(|t| {
            t.stop(StopMode::Immediate);
            t.reset_stopwatch(false);
        })
    }
}
