//! Task bodies and their shared lifecycle records.
//!
//! A submitted task is split in two: the body (a [`Task`] or
//! [`DestructionTask`]) is owned by the queue of the worker it is pinned to,
//! while its [`TaskRecord`](record::TaskRecord) holds the state every other
//! thread may observe (lifecycle state, deferrals, dependency edges).

pub mod id;
pub(crate) mod record;
pub mod state;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use id::{ResourceHandle, TaskId, WorkerId};
pub use state::TaskState;

/// What the worker knows about the task it is running.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext {
    /// The lane executing the body. Equals the task's affinity.
    pub worker: WorkerId,
    pub task: TaskId,
    /// Number of passes the task spent blocked on dependencies.
    pub deferrals: u32,
}

/// A unit of deferred work.
///
/// `execute` runs exactly once, on the worker the task was pinned to at
/// submission, and only after every dependency has completed. It must not
/// block on I/O or on other tasks; ordering is expressed through dependencies.
/// Failures belong in the task's own result state.
pub trait Task: Send {
    /// Human-readable name for logging, metrics and snapshots.
    fn name(&self) -> &str;

    fn execute(&mut self, ctx: &ExecutionContext);
}

/// Releases a native resource on the thread that owns it.
///
/// Never expired: a destruction task always runs exactly once, including
/// while the manager is shutting down.
pub trait DestructionTask: Send {
    fn name(&self) -> &str;

    /// The resource this task releases.
    fn resource(&self) -> ResourceHandle;

    fn execute(&mut self, ctx: &ExecutionContext);
}

/// Which queue a task lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Regular,
    Destruction,
}

/// How a task reached (or has not yet reached) `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    /// Not completed yet.
    Pending,
    /// Body ran to completion.
    Executed,
    /// Fast-forwarded without running the body.
    Expired,
    /// Body panicked; dependents were still released.
    Panicked,
}

/// [`Task`] adapter for a closure.
pub struct FnTask<F> {
    name: String,
    body: Option<F>,
}

impl<F> FnTask<F>
where
    F: FnOnce(&ExecutionContext) + Send,
{
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body: Some(body),
        }
    }
}

impl<F> Task for FnTask<F>
where
    F: FnOnce(&ExecutionContext) + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&mut self, ctx: &ExecutionContext) {
        if let Some(body) = self.body.take() {
            body(ctx);
        }
    }
}

impl<F> fmt::Debug for FnTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask").field("name", &self.name).finish()
    }
}

/// [`DestructionTask`] adapter for a closure receiving the resource handle.
pub struct FnDestruction<F> {
    name: String,
    resource: ResourceHandle,
    release: Option<F>,
}

impl<F> FnDestruction<F>
where
    F: FnOnce(ResourceHandle, &ExecutionContext) + Send,
{
    pub fn new(name: impl Into<String>, resource: ResourceHandle, release: F) -> Self {
        Self {
            name: name.into(),
            resource,
            release: Some(release),
        }
    }
}

impl<F> DestructionTask for FnDestruction<F>
where
    F: FnOnce(ResourceHandle, &ExecutionContext) + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn resource(&self) -> ResourceHandle {
        self.resource
    }

    fn execute(&mut self, ctx: &ExecutionContext) {
        if let Some(release) = self.release.take() {
            release(self.resource, ctx);
        }
    }
}

impl<F> fmt::Debug for FnDestruction<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnDestruction")
            .field("name", &self.name)
            .field("resource", &self.resource)
            .finish()
    }
}
