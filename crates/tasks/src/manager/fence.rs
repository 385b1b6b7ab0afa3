use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use tracing::{debug, trace};

use crate::error::TaskError;

use super::TaskManager;

impl TaskManager {
    /// Open a batch: lower every pool worker's fence so queued work runs.
    ///
    /// Until the matching [`wait_for_fence`](Self::wait_for_fence) returns,
    /// every push also lowers its target's fence. Context lanes have no
    /// fence; their owners drain them explicitly.
    pub fn clear_fences(&self) {
        let batch = self.batches.fetch_add(1, Ordering::AcqRel) + 1;
        self.batch_open.store(true, Ordering::Release);
        for lane in self.pool_lanes() {
            lane.clear_fence();
        }
        debug!(batch, "fences cleared");
    }

    /// Block the calling thread until every pool worker has emptied both
    /// of its queues and raised its fence.
    ///
    /// Fails with [`TaskError::WorkerLost`] if a worker thread is gone, and
    /// with [`TaskError::ShuttingDown`] once shutdown started.
    pub fn wait_for_fence(&self) -> Result<(), TaskError> {
        self.wait_until(None)
    }

    /// [`wait_for_fence`](Self::wait_for_fence) with an upper bound.
    pub fn wait_for_fence_timeout(&self, timeout: Duration) -> Result<(), TaskError> {
        self.wait_until(Some((Instant::now() + timeout, timeout)))
    }

    fn wait_until(&self, deadline: Option<(Instant, Duration)>) -> Result<(), TaskError> {
        let started = Instant::now();
        let backoff = Backoff::new();
        loop {
            if self.is_shutting_down() {
                return Err(TaskError::ShuttingDown);
            }
            if self.fences_raised()? {
                self.batch_open.store(false, Ordering::Release);
                trace!(elapsed = ?started.elapsed(), "fence reached");
                return Ok(());
            }
            if let Some((deadline, timeout)) = deadline {
                if Instant::now() >= deadline {
                    return Err(TaskError::FenceTimeout(timeout));
                }
            }
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    fn fences_raised(&self) -> Result<bool, TaskError> {
        let mut raised = true;
        for lane in self.pool_lanes() {
            if !lane.is_alive() {
                return Err(TaskError::WorkerLost(lane.id()));
            }
            raised &= lane.fence_raised();
        }
        Ok(raised)
    }
}
