//! Cooperative, poll-based task scheduler for engine runtime work.
//!
//! A [`TaskManager`] owns a fixed pool of worker threads. Each worker polls
//! its own pair of queues (regular tasks and resource-destruction tasks),
//! runs whatever is ready, defers whatever still waits on a dependency and
//! raises its fence once both queues are empty. The frame loop opens a batch
//! with [`TaskManager::clear_fences`] and joins it with
//! [`TaskManager::wait_for_fence`].
//!
//! Tasks are pinned to one worker at submission and never migrate, so a
//! destruction task can release a native resource on the thread that created
//! it. Context lanes extend the same protocol to threads outside the pool,
//! such as the one holding a GL context.

pub mod arena;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod observer;
pub mod snapshot;
mod sync;
pub mod task;
pub mod thread;

pub use arena::TaskHandle;
pub use error::TaskError;
pub use manager::{Affinity, TaskManager, TaskManagerBuilder};
pub use metrics::{LaneMetrics, SchedulerMetrics};
pub use observer::{TaskEvent, TaskObserver};
pub use snapshot::{LaneKind, QueueSnapshot, TaskSnapshot};
pub use task::record::TaskView;
pub use task::{
    DestructionTask, ExecutionContext, FnDestruction, FnTask, ResourceHandle, Task, TaskId,
    TaskKind, TaskOutcome, TaskState, WorkerId,
};
pub use thread::{ContextQueue, PassSummary};
