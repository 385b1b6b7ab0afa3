use std::time::Duration;

use dream_core::DreamError;
use thiserror::Error;

use crate::arena::TaskHandle;
use crate::task::{TaskId, TaskState, WorkerId};

/// Errors returned by the task manager and context queues.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unknown or reclaimed task handle {0}")]
    UnknownTask(TaskHandle),

    #[error("no lane with id {0}")]
    UnknownWorker(WorkerId),

    #[error("no context lane named {0:?}")]
    UnknownContext(String),

    #[error("task {0} is a destruction task and cannot expire")]
    NotExpirable(TaskId),

    #[error("task {id} is {state:?}, only queued tasks can expire")]
    NotQueued { id: TaskId, state: TaskState },

    #[error("task arena has no free slots; call reclaim_completed between batches")]
    ArenaFull,

    #[error("task manager is shutting down")]
    ShuttingDown,

    #[error("context lane {0} is owned by another thread")]
    WrongThread(WorkerId),

    #[error("worker {0} is no longer running")]
    WorkerLost(WorkerId),

    #[error("fence not reached after {0:?}")]
    FenceTimeout(Duration),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Config(#[from] DreamError),
}
