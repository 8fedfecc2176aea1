pub mod scheduler;
pub mod task;

pub use scheduler::{InitFailure, Runloop, Scheduler, SyncErrorHandler, TaskErrorHandler, WakeSignal};
pub use task::{TaskCallback, TaskId};
