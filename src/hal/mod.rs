pub mod power;
pub mod timer;
pub mod uart;
pub mod watchdog;

// Re-export commonly used types
pub use power::SleepMode;
pub use timer::{CounterWidth, Prescaler, TimerPeripheral, WaveformMode};
pub use uart::{TriggerFlags, TriggerTable};
pub use watchdog::WatchdogTimeout;

#[cfg(target_arch = "avr")]
pub use power::{AvrPlatform, Power};
#[cfg(target_arch = "avr")]
pub use uart::Uart;
#[cfg(target_arch = "avr")]
pub use watchdog::Watchdog;

/// What the runloop needs from the board between task batches
pub trait Platform {
    fn feed_watchdog(&mut self);

    /// Sleep until the next interrupt unless `wake` already holds.
    ///
    /// The check and entering sleep must be atomic with respect to
    /// interrupts, otherwise a wake-up raised in between is slept through.
    fn sleep_unless(&mut self, wake: &dyn Fn() -> bool);
}
