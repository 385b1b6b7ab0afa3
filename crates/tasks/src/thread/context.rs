use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::TaskError;
use crate::snapshot::QueueSnapshot;
use crate::task::WorkerId;

use super::lane::{Lane, PassSummary};

/// A lane drained by the thread that owns some native context, such as the
/// render thread holding the GL context.
///
/// The pool never touches it. The first thread to call
/// [`run_pending`](ContextQueue::run_pending) or [`finish`](ContextQueue::finish)
/// becomes its owner; every later call from another thread is rejected.
#[derive(Clone)]
pub struct ContextQueue {
    lane: Arc<Lane>,
}

impl ContextQueue {
    pub(crate) fn new(lane: Arc<Lane>) -> Self {
        Self { lane }
    }

    pub fn id(&self) -> WorkerId {
        self.lane.id()
    }

    pub fn name(&self) -> &str {
        self.lane.label().unwrap_or_default()
    }

    /// Entries queued on this lane.
    pub fn pending(&self) -> usize {
        self.lane.pending()
    }

    pub fn is_idle(&self) -> bool {
        self.lane.pending() == 0
    }

    /// Run one drain pass over both queues on the calling (owner) thread.
    pub fn run_pending(&self) -> Result<PassSummary, TaskError> {
        self.lane.claim()?;
        Ok(self.lane.run_pass())
    }

    /// Teardown: expire queued regular tasks and release every queued resource.
    pub fn finish(&self) -> Result<(), TaskError> {
        self.lane.claim()?;
        debug!(worker = %self.lane.id(), name = self.name(), "finishing context queue");
        self.lane.finish();
        if self.lane.pending() > 0 {
            warn!(
                worker = %self.lane.id(),
                pending = self.lane.pending(),
                "context queue received work during teardown"
            );
        }
        Ok(())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.lane.snapshot()
    }
}
