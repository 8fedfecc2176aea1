//! Deadline-driven cooperative runloop and timer engine for the ATmega128
//!
//! One hardware counter provides one-shot runs, a stopwatch and a countdown
//! ([`timer`]); the runloop ([`rtos`]) keeps a small table of periodic tasks
//! on top of it and sleeps until the nearest deadline.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_arch = "avr", feature(abi_avr_interrupt))]

pub mod config;
pub mod drivers;
pub mod error;
pub mod hal;
mod logger;
pub mod rtos;
pub mod timer;

#[cfg(test)]
mod testing;

pub use error::{SchedulerError, TaskError, TimerError};
pub use rtos::{InitFailure, Runloop, Scheduler, TaskId};
pub use timer::{Repeat, StopMode, Timer, TimerConfig, TimerMode, TimerSlot};
