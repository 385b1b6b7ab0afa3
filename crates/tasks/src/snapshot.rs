//! Read-only views of worker queues for tooling.

use serde::Serialize;

use crate::task::{TaskId, TaskState, WorkerId};

/// Whether a lane is driven by a pool thread or by an external context owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LaneKind {
    Pool,
    Context,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub deferrals: u32,
}

/// One lane's queues at a moment in time. Best effort: may be a pass old.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub worker: WorkerId,
    pub kind: LaneKind,
    /// Context lanes carry their registered name.
    pub label: Option<String>,
    pub fence: bool,
    /// Regular tasks, newest first.
    pub tasks: Vec<TaskSnapshot>,
    /// Destruction tasks, newest first.
    pub destruction: Vec<TaskSnapshot>,
}

impl QueueSnapshot {
    pub fn len(&self) -> usize {
        self.tasks.len() + self.destruction.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.destruction.is_empty()
    }
}
