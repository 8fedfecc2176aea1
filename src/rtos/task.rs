//! Fixed-capacity task table
//!
//! Times are kept relative: a task's `remaining` counts the cycles from the
//! instant of the last batch read to its next deadline. Each batch pass
//! takes one elapsed snapshot and moves every active task forward by it.

use crate::error::TaskError;

/// Periodic task body; `Err` removes the task from the table
pub type TaskCallback<A> = fn(A) -> Result<(), TaskError>;

/// Slot index of a task in its table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskId(usize);

impl TaskId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// Added since the last batch pass; its delay starts at the next one
    Pending,
    Active,
    /// Deadline reached in the current pass, this many cycles late
    Due(u32),
}

#[derive(Clone, Copy)]
pub(crate) struct Task<A> {
    callback: TaskCallback<A>,
    arg: A,
    /// `None` runs forever
    executions_left: Option<u16>,
    period: u32,
    remaining: u32,
    state: TaskState,
}

impl<A> Task<A> {
    /// `executions == 0` runs forever.
    pub(crate) fn new(
        callback: TaskCallback<A>,
        arg: A,
        executions: u16,
        period: u32,
        delay: u32,
    ) -> Self {
        Self {
            callback,
            arg,
            executions_left: (executions != 0).then_some(executions),
            period,
            remaining: delay,
            state: TaskState::Pending,
        }
    }
}

/// What became of a task after one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Rescheduled,
    /// The task fell behind by whole periods that were skipped
    Realigned { dropped: u32 },
    Finished,
    Aborted,
    Failed(u8),
}

/// A task picked for execution, run outside the table lock
pub(crate) struct Job<A> {
    pub(crate) id: TaskId,
    pub(crate) callback: TaskCallback<A>,
    pub(crate) arg: A,
    pub(crate) overdue: u32,
}

pub struct TaskTable<A, const N: usize> {
    slots: [Option<Task<A>>; N],
}

impl<A: Copy, const N: usize> TaskTable<A, N> {
    pub const fn new() -> Self {
        Self { slots: [None; N] }
    }

    pub(crate) fn insert(&mut self, task: Task<A>) -> Option<TaskId> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())?;
        *slot = Some(task);
        Some(TaskId(index))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Move every task forward by `elapsed` cycles.
    ///
    /// Pending tasks become active with their delay untouched. Active tasks
    /// whose deadline falls within `elapsed` are marked due. Returns whether
    /// any task is due.
    pub(crate) fn advance(&mut self, elapsed: u32) -> bool {
        let mut any_due = false;
        for task in self.slots.iter_mut().flatten() {
            match task.state {
                TaskState::Pending => task.state = TaskState::Active,
                TaskState::Active if task.remaining <= elapsed => {
                    task.state = TaskState::Due(elapsed - task.remaining);
                    any_due = true;
                }
                TaskState::Active => task.remaining -= elapsed,
                TaskState::Due(_) => any_due = true,
            }
        }
        any_due
    }

    /// Claim slot `index` for execution if it is due.
    pub(crate) fn take_due(&mut self, index: usize) -> Option<Job<A>> {
        let task = self.slots.get_mut(index)?.as_mut()?;
        let TaskState::Due(overdue) = task.state else {
            return None;
        };
        task.state = TaskState::Active;
        Some(Job {
            id: TaskId(index),
            callback: task.callback,
            arg: task.arg,
            overdue,
        })
    }

    /// Account for one execution of `job` and compute its next deadline.
    pub(crate) fn complete(&mut self, job: &Job<A>, result: Result<(), TaskError>) -> Outcome {
        let slot = &mut self.slots[job.id.0];
        let Some(task) = slot.as_mut() else {
            return Outcome::Finished;
        };

        let outcome = match result {
            Err(TaskError::Abort) => Outcome::Aborted,
            Err(TaskError::Failed(code)) => Outcome::Failed(code),
            Ok(()) => match task.executions_left.as_mut() {
                Some(left) if *left <= 1 => Outcome::Finished,
                left => {
                    if let Some(left) = left {
                        *left -= 1;
                    }
                    let (overdue, period) = (job.overdue, task.period);
                    if overdue < period {
                        task.remaining = period - overdue;
                        Outcome::Rescheduled
                    } else {
                        // Keep the original phase, skip the missed periods
                        task.remaining = period - overdue % period;
                        Outcome::Realigned {
                            dropped: overdue / period,
                        }
                    }
                }
            },
        };

        if matches!(
            outcome,
            Outcome::Finished | Outcome::Aborted | Outcome::Failed(_)
        ) {
            *slot = None;
        }
        outcome
    }

    /// Active task with the nearest deadline; ties go to the lowest slot.
    pub(crate) fn head(&self) -> Option<(TaskId, u32)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Some(task) if task.state == TaskState::Active => Some((TaskId(index), task.remaining)),
                _ => None,
            })
            .min_by_key(|&(_, remaining)| remaining)
    }
}

impl<A: Copy, const N: usize> Default for TaskTable<A, N> {
    fn default() -> Self {
        Self::new()
    }
}
