//! Worker lanes and the threads that drive them.
//!
//! - `lane`: queues, fence and the drain pass shared by both lane kinds
//! - `context`: lanes drained by an external owner thread (e.g. a GL context)
//! - `TaskThread`: the OS thread running a pool lane's poll loop

mod context;
pub(crate) mod lane;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::Backoff;
use dream_core::TaskConfig;
use tracing::{debug, error, trace, warn};

use crate::error::TaskError;

pub use context::ContextQueue;
pub use lane::PassSummary;
pub(crate) use lane::{DestructionEntry, Entry, Lane, LaneShared, TaskEntry};

/// One pool worker: an OS thread polling its lane until stopped.
pub(crate) struct TaskThread {
    lane: Arc<Lane>,
    handle: Option<JoinHandle<()>>,
}

impl TaskThread {
    pub(crate) fn spawn(lane: Arc<Lane>, config: &TaskConfig) -> Result<Self, TaskError> {
        let mut builder =
            thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, lane.id().0));
        if let Some(stack_size) = config.stack_size() {
            builder = builder.stack_size(stack_size);
        }

        let idle_sleep = config.idle_sleep();
        let worker_lane = Arc::clone(&lane);
        lane.set_alive(true);
        let handle = builder
            .spawn(move || execute_task_queue(worker_lane, idle_sleep))
            .map_err(|e| {
                lane.set_alive(false);
                TaskError::Spawn(e)
            })?;

        Ok(Self {
            lane,
            handle: Some(handle),
        })
    }

    /// Ask the loop to exit after its teardown drain.
    pub(crate) fn stop(&self) {
        self.lane.stop();
    }

    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            trace!(worker = %self.lane.id(), "joining task thread");
            if handle.join().is_err() {
                warn!(worker = %self.lane.id(), "task thread terminated by panic");
            }
        }
    }
}

/// Clears the lane's alive flag however the loop exits.
struct AliveGuard<'a>(&'a Lane);

impl Drop for AliveGuard<'_> {
    fn drop(&mut self) {
        self.0.set_alive(false);
    }
}

/// The worker poll loop. No blocking waits: a raised fence or a contended
/// queue lock only ever leads to a yield (or a short sleep once idle).
fn execute_task_queue(lane: Arc<Lane>, idle_sleep: Duration) {
    let _alive = AliveGuard(&lane);
    if let Err(e) = lane.claim() {
        error!(worker = %lane.id(), error = %e, "task thread could not claim its lane");
        return;
    }
    debug!(worker = %lane.id(), "task thread started");

    let backoff = Backoff::new();
    while lane.is_running() {
        if lane.fence_raised() {
            if !backoff.is_completed() {
                backoff.snooze();
            } else if idle_sleep.is_zero() {
                thread::yield_now();
            } else {
                thread::sleep(idle_sleep);
            }
            continue;
        }
        backoff.reset();

        lane.run_pass();
        if lane.try_raise_fence() {
            trace!(worker = %lane.id(), "queues drained, fence raised");
        }
        thread::yield_now();
    }

    lane.finish();
    debug!(worker = %lane.id(), "task thread finished");
}
