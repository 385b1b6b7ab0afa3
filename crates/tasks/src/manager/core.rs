use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dream_core::{DreamError, TaskConfig};
use tracing::{info, warn};

use crate::arena::TaskArena;
use crate::error::TaskError;
use crate::metrics::SchedulerMetrics;
use crate::observer::TaskObserver;
use crate::snapshot::{LaneKind, QueueSnapshot};
use crate::sync::lock;
use crate::task::WorkerId;
use crate::thread::{ContextQueue, Lane, LaneShared, TaskThread};

/// Owns a fixed pool of worker threads, the context lanes and every task
/// record. Create one per runtime session and pass it down explicitly.
pub struct TaskManager {
    pub(super) config: TaskConfig,
    /// Pool lanes `0..pool_size`, then context lanes.
    pub(super) lanes: Vec<Arc<Lane>>,
    pub(super) pool_size: usize,
    pub(super) threads: Mutex<Vec<TaskThread>>,
    pub(super) contexts: HashMap<String, WorkerId>,
    pub(super) arena: TaskArena,
    pub(super) next_id: AtomicU64,
    pub(super) submitted: AtomicU64,
    /// Set by `clear_fences`, cleared when `wait_for_fence` returns.
    pub(super) batch_open: AtomicBool,
    pub(super) batches: AtomicU64,
    pub(super) shutting_down: AtomicBool,
}

/// Configures observers and context lanes before the pool starts.
pub struct TaskManagerBuilder {
    config: TaskConfig,
    observer: Option<Arc<dyn TaskObserver>>,
    contexts: Vec<String>,
}

impl TaskManagerBuilder {
    /// Receive a completion event for every task.
    pub fn observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Register a context lane drained by an external owner thread.
    pub fn context(mut self, name: impl Into<String>) -> Self {
        self.contexts.push(name.into());
        self
    }

    /// Validate the config and start the worker threads.
    pub fn build(self) -> Result<TaskManager, TaskError> {
        self.config.validate()?;
        let pool_size = self.config.resolved_worker_threads();
        let shared = Arc::new(LaneShared::new(
            self.observer,
            self.config.deferral_warn_threshold,
        ));

        let mut lanes: Vec<Arc<Lane>> = (0..pool_size)
            .map(|i| Arc::new(Lane::new(WorkerId(i), LaneKind::Pool, None, Arc::clone(&shared))))
            .collect();

        let mut contexts = HashMap::new();
        for name in self.contexts {
            let id = WorkerId(lanes.len());
            if contexts.insert(name.clone(), id).is_some() {
                return Err(DreamError::Config(format!("duplicate context lane {name:?}")).into());
            }
            lanes.push(Arc::new(Lane::new(
                id,
                LaneKind::Context,
                Some(name),
                Arc::clone(&shared),
            )));
        }

        let manager = TaskManager {
            config: self.config,
            lanes,
            pool_size,
            threads: Mutex::new(Vec::with_capacity(pool_size)),
            contexts,
            arena: TaskArena::new(),
            next_id: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            batch_open: AtomicBool::new(false),
            batches: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        };

        // On a spawn failure the partially built manager is dropped,
        // which stops and joins the threads that did start.
        for lane in &manager.lanes[..pool_size] {
            let thread = TaskThread::spawn(Arc::clone(lane), &manager.config)?;
            lock(&manager.threads).push(thread);
        }

        info!(
            "Task manager started with {} workers, {} context lanes",
            pool_size,
            manager.contexts.len()
        );
        Ok(manager)
    }
}

impl TaskManager {
    pub fn builder(config: TaskConfig) -> TaskManagerBuilder {
        TaskManagerBuilder {
            config,
            observer: None,
            contexts: Vec::new(),
        }
    }

    /// Start a pool with no observer and no context lanes.
    pub fn new(config: TaskConfig) -> Result<Self, TaskError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Number of pool threads.
    pub fn worker_count(&self) -> usize {
        self.pool_size
    }

    pub fn worker_ids(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.pool_lanes().iter().map(|lane| lane.id())
    }

    pub fn context_id(&self, name: &str) -> Option<WorkerId> {
        self.contexts.get(name).copied()
    }

    /// Handle for draining a context lane on its owner thread.
    pub fn context_queue(&self, name: &str) -> Result<ContextQueue, TaskError> {
        let id = self
            .context_id(name)
            .ok_or_else(|| TaskError::UnknownContext(name.to_string()))?;
        Ok(ContextQueue::new(Arc::clone(&self.lanes[id.0])))
    }

    /// Queued entries on a lane.
    pub fn queue_len(&self, worker: WorkerId) -> Result<usize, TaskError> {
        self.lane(worker).map(|lane| lane.pending())
    }

    pub(super) fn pool_lanes(&self) -> &[Arc<Lane>] {
        &self.lanes[..self.pool_size]
    }

    pub(super) fn lane(&self, worker: WorkerId) -> Result<&Arc<Lane>, TaskError> {
        self.lanes
            .get(worker.0)
            .ok_or(TaskError::UnknownWorker(worker))
    }

    /// Best-effort view of every lane's queues.
    pub fn snapshot(&self) -> Vec<QueueSnapshot> {
        self.lanes.iter().map(|lane| lane.snapshot()).collect()
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        let lanes = self
            .lanes
            .iter()
            .map(|lane| (lane.id(), lane.metrics()))
            .collect();
        SchedulerMetrics {
            batches: self.batches.load(Ordering::Acquire),
            submitted: self.submitted.load(Ordering::Acquire),
            live_tasks: self.arena.len(),
            ..SchedulerMetrics::from_lanes(lanes)
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop accepting work, run every pool worker's teardown drain and join
    /// the threads. Idempotent; also run on drop.
    ///
    /// A pool destruction task that depends on a context lane's task cannot
    /// run until that lane completes it, so call [`ContextQueue::finish`] on
    /// each owner thread first. Otherwise the join waits for it, and the
    /// stalled worker logs a warning.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Task manager shutdown requested");

        let mut threads = lock(&self.threads);
        for thread in threads.iter() {
            thread.stop();
        }
        for thread in threads.iter_mut() {
            thread.join();
        }
        threads.clear();

        for lane in &self.lanes[self.pool_size..] {
            if lane.pending() > 0 {
                warn!(
                    worker = %lane.id(),
                    name = lane.label().unwrap_or_default(),
                    pending = lane.pending(),
                    "context lane still holds tasks; call ContextQueue::finish on its owner thread"
                );
            }
        }
        info!("Task manager stopped");
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("workers", &self.pool_size)
            .field("contexts", &self.contexts)
            .field("live_tasks", &self.arena.len())
            .field("batch_open", &self.batch_open.load(Ordering::Relaxed))
            .finish()
    }
}
