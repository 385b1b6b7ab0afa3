use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle of a task.
///
/// `Queued -> Active -> Completed` for tasks that run, `Queued -> Expired ->
/// Completed` for tasks cancelled before they started. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskState {
    Queued = 0,
    Active = 1,
    Completed = 2,
    Expired = 3,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Queued,
            1 => TaskState::Active,
            2 => TaskState::Completed,
            _ => TaskState::Expired,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == TaskState::Completed
    }
}

/// A [`TaskState`] readable from any thread.
///
/// Every transition is a compare-exchange from one expected state, so a
/// producer expiring a task and its worker activating it cannot both win.
#[derive(Debug)]
pub(crate) struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(TaskState::Queued as u8))
    }

    pub(crate) fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from -> to`. On failure returns the state actually observed.
    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> Result<(), TaskState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TaskState::from_u8)
    }
}
