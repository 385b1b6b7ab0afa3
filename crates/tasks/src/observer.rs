use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::task::{TaskId, TaskKind, TaskOutcome, WorkerId};

/// Completion notice delivered to a [`TaskObserver`].
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    /// The lane that completed the task.
    pub worker: WorkerId,
    pub outcome: TaskOutcome,
    /// Manager-wide completion order, starting at 1.
    pub sequence: u64,
    pub completed_at: DateTime<Utc>,
    /// Time spent in the body; zero for expired tasks.
    pub duration: Duration,
}

/// Receives a [`TaskEvent`] for every task that completes.
///
/// Called on the completing worker while its queue lock is held, right
/// after the task's dependents were released. Keep it short.
pub trait TaskObserver: Send + Sync {
    fn on_complete(&self, event: &TaskEvent);
}
