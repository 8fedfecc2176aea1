//! Error types for the timer engine and the runloop

use ufmt::derive::uDebug;

/// Errors reported synchronously by the timer engine
#[derive(Debug, uDebug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerError {
    /// The timer slot holds no initialized handle
    NotInitialized,
    /// The timer slot is already in use
    AlreadyInitialized,
    /// A parameter is out of range or unsupported by the peripheral
    BadParameter,
    /// The operation needs plain counting but the timer runs a PWM mode
    IncompatibleMode,
    /// The peripheral refused the requested configuration
    Hardware,
}

/// Errors reported by the runloop
///
/// `TE` and `CE` carry the errors of the console transport and the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SchedulerError<TE = (), CE = ()> {
    /// The timer could not be brought up in plain counting mode
    TimerInitFailed(TimerError),
    /// The console transport refused the escape trigger
    Transport(TE),
    /// The console failed to initialize
    Console(CE),
    /// A task parameter is out of range
    BadParameter,
    /// Every task slot is occupied
    NoSlotFree,
    /// The timer failed while the runloop was active
    Timer(TimerError),
}

impl<TE, CE> From<TimerError> for SchedulerError<TE, CE> {
    fn from(error: TimerError) -> Self {
        SchedulerError::Timer(error)
    }
}

/// Failure returned by a task callback
#[derive(Debug, uDebug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TaskError {
    /// Remove the task without reporting an error
    Abort,
    /// Remove the task and report the code to the task-error handler
    Failed(u8),
}
