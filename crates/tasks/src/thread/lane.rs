use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_utils::CachePadded;
use serde::Serialize;
use tracing::{error, trace, warn};

use crate::error::TaskError;
use crate::metrics::LaneMetrics;
use crate::observer::{TaskEvent, TaskObserver};
use crate::snapshot::{LaneKind, QueueSnapshot, TaskSnapshot};
use crate::sync::{lock, try_lock};
use crate::task::record::TaskRecord;
use crate::task::{
    DestructionTask, ExecutionContext, Task, TaskKind, TaskOutcome, TaskState, WorkerId,
};

/// How long a teardown drain may go without completing anything before it
/// warns.
const TEARDOWN_STALL_WARN: Duration = Duration::from_secs(1);

/// State every lane of one manager shares.
pub(crate) struct LaneShared {
    /// Completion sequence; the next completed task gets `clock + 1`.
    clock: AtomicU64,
    observer: Option<Arc<dyn TaskObserver>>,
    deferral_warn_threshold: u32,
}

impl LaneShared {
    pub(crate) fn new(observer: Option<Arc<dyn TaskObserver>>, deferral_warn_threshold: u32) -> Self {
        Self {
            clock: AtomicU64::new(0),
            observer,
            deferral_warn_threshold,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Queue entry: the shared record plus the body only this lane may touch.
pub(crate) struct Entry<B> {
    record: Arc<TaskRecord>,
    body: B,
    elapsed: Duration,
}

impl<B> Entry<B> {
    pub(crate) fn new(record: Arc<TaskRecord>, body: B) -> Self {
        Self {
            record,
            body,
            elapsed: Duration::ZERO,
        }
    }
}

pub(crate) type TaskEntry = Entry<Box<dyn Task>>;
pub(crate) type DestructionEntry = Entry<Box<dyn DestructionTask>>;

trait QueueBody: Send {
    fn run(&mut self, ctx: &ExecutionContext);
}

impl QueueBody for Box<dyn Task> {
    fn run(&mut self, ctx: &ExecutionContext) {
        self.as_mut().execute(ctx);
    }
}

impl QueueBody for Box<dyn DestructionTask> {
    fn run(&mut self, ctx: &ExecutionContext) {
        self.as_mut().execute(ctx);
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// Bodies run this pass.
    pub executed: usize,
    /// Tasks fast-forwarded from `Expired`.
    pub expired: usize,
    /// Task checks that found a dependency outstanding.
    pub deferred: usize,
    /// Entries still queued after the pass.
    pub remaining: usize,
    /// A queue lock was held elsewhere and that queue was skipped.
    pub contended: bool,
}

impl PassSummary {
    pub fn completed(&self) -> usize {
        self.executed + self.expired
    }
}

/// One worker's queues, fence and counters.
///
/// A pool lane is driven by its `TaskThread`; a context lane by whichever
/// thread first claims it. Either way only one thread ever drains it.
pub(crate) struct Lane {
    id: WorkerId,
    kind: LaneKind,
    label: Option<String>,
    tasks: Mutex<VecDeque<TaskEntry>>,
    destruction: Mutex<VecDeque<DestructionEntry>>,
    /// Pushes made by the draining thread while it holds the queue lock
    /// itself. Spliced into the queue before each sweep.
    staged_tasks: Mutex<VecDeque<TaskEntry>>,
    staged_destruction: Mutex<VecDeque<DestructionEntry>>,
    fence: CachePadded<AtomicBool>,
    running: AtomicBool,
    alive: AtomicBool,
    /// Entries across both queues, for least-loaded assignment.
    pending: AtomicUsize,
    /// The one thread allowed to drain this lane.
    owner: OnceLock<ThreadId>,
    metrics: Mutex<LaneMetrics>,
    published: Mutex<(Vec<TaskSnapshot>, Vec<TaskSnapshot>)>,
    shared: Arc<LaneShared>,
}

impl Lane {
    pub(crate) fn new(
        id: WorkerId,
        kind: LaneKind,
        label: Option<String>,
        shared: Arc<LaneShared>,
    ) -> Self {
        Self {
            id,
            kind,
            label,
            tasks: Mutex::new(VecDeque::new()),
            destruction: Mutex::new(VecDeque::new()),
            staged_tasks: Mutex::new(VecDeque::new()),
            staged_destruction: Mutex::new(VecDeque::new()),
            // Raised until the first batch opens.
            fence: CachePadded::new(AtomicBool::new(true)),
            running: AtomicBool::new(true),
            alive: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            owner: OnceLock::new(),
            metrics: Mutex::new(LaneMetrics::default()),
            published: Mutex::new((Vec::new(), Vec::new())),
            shared,
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    // ── Flags ────────────────────────────────────────────────────

    pub(crate) fn fence_raised(&self) -> bool {
        self.fence.load(Ordering::Acquire)
    }

    pub(crate) fn clear_fence(&self) {
        self.fence.store(false, Ordering::Release);
    }

    /// Raise the fence iff both queues are empty, checked under both locks
    /// so no push can slip in between the check and the store.
    pub(crate) fn try_raise_fence(&self) -> bool {
        let Some(tasks) = try_lock(&self.tasks) else {
            return false;
        };
        let Some(destruction) = try_lock(&self.destruction) else {
            return false;
        };
        let (Some(staged_tasks), Some(staged_destruction)) =
            (try_lock(&self.staged_tasks), try_lock(&self.staged_destruction))
        else {
            return false;
        };
        if tasks.is_empty()
            && destruction.is_empty()
            && staged_tasks.is_empty()
            && staged_destruction.is_empty()
        {
            self.fence.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// Bind the lane to the calling thread on first use; reject any other thread.
    pub(crate) fn claim(&self) -> Result<(), TaskError> {
        let current = thread::current().id();
        if *self.owner.get_or_init(|| current) == current {
            Ok(())
        } else {
            Err(TaskError::WrongThread(self.id))
        }
    }

    fn is_owner(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    // ── Admission ────────────────────────────────────────────────

    /// Push without blocking; hands the entry back if the queue is contended.
    ///
    /// A push from the lane's own drainer (a body submitting a continuation
    /// to its own lane) never waits on the lock that drainer holds: the
    /// entry is staged and picked up by the running drain.
    pub(crate) fn try_push_task(&self, entry: TaskEntry, open_batch: bool) -> Result<(), TaskEntry> {
        self.try_push(&self.tasks, &self.staged_tasks, entry, open_batch)
    }

    pub(crate) fn try_push_destruction(
        &self,
        entry: DestructionEntry,
        open_batch: bool,
    ) -> Result<(), DestructionEntry> {
        self.try_push(&self.destruction, &self.staged_destruction, entry, open_batch)
    }

    fn try_push<B>(
        &self,
        queue: &Mutex<VecDeque<Entry<B>>>,
        staged: &Mutex<VecDeque<Entry<B>>>,
        entry: Entry<B>,
        open_batch: bool,
    ) -> Result<(), Entry<B>> {
        match try_lock(queue) {
            Some(mut queue) => self.admit(&mut queue, entry, open_batch),
            None if self.is_owner() => self.admit(&mut lock(staged), entry, open_batch),
            None => return Err(entry),
        }
        Ok(())
    }

    fn admit<B>(&self, queue: &mut VecDeque<Entry<B>>, entry: Entry<B>, open_batch: bool) {
        let bound = entry.record.bind_worker(self.id);
        debug_assert!(
            bound || entry.record.worker() == Some(self.id),
            "task {} already pinned to {:?}",
            entry.record.id(),
            entry.record.worker()
        );
        queue.push_back(entry);
        self.pending.fetch_add(1, Ordering::AcqRel);
        if open_batch {
            self.clear_fence();
        }
    }

    // ── Draining ─────────────────────────────────────────────────

    /// One pass over both queues. Each queue whose lock is free is swept
    /// repeatedly for as long as its sweeps keep completing tasks.
    pub(crate) fn run_pass(&self) -> PassSummary {
        let mut summary = PassSummary::default();
        let mut acquired = false;

        if let Some(mut queue) = try_lock(&self.tasks) {
            acquired = true;
            self.drain(&mut queue, &self.staged_tasks, &mut summary);
            summary.remaining += queue.len();
            self.publish(|published| published.0 = entries(queue.iter()));
        } else {
            summary.contended = true;
        }

        if let Some(mut queue) = try_lock(&self.destruction) {
            acquired = true;
            self.drain(&mut queue, &self.staged_destruction, &mut summary);
            summary.remaining += queue.len();
            self.publish(|published| published.1 = entries(queue.iter()));
        } else {
            summary.contended = true;
        }

        if acquired {
            lock(&self.metrics).passes += 1;
        }
        if summary.completed() > 0 || summary.deferred > 0 {
            trace!(
                worker = %self.id,
                executed = summary.executed,
                expired = summary.expired,
                deferred = summary.deferred,
                remaining = summary.remaining,
                "drain pass"
            );
        }
        summary
    }

    /// Bodies and observers run without the metrics lock held, so either may
    /// read `TaskManager::metrics`. The pass's counters land in one merge.
    fn drain<B: QueueBody>(
        &self,
        queue: &mut VecDeque<Entry<B>>,
        staged: &Mutex<VecDeque<Entry<B>>>,
        summary: &mut PassSummary,
    ) {
        let mut delta = LaneMetrics::default();
        loop {
            queue.append(&mut lock(staged));
            if queue.is_empty() {
                break;
            }
            for entry in queue.iter_mut() {
                self.step(entry, &mut delta, summary);
            }

            let before = queue.len();
            queue.retain(|entry| {
                if entry.record.state() == TaskState::Completed {
                    self.complete(entry, &mut delta);
                    false
                } else {
                    true
                }
            });
            let removed = before - queue.len();
            self.pending.fetch_sub(removed, Ordering::AcqRel);

            // Nothing finished: everything left waits on other lanes.
            if removed == 0 && lock(staged).is_empty() {
                break;
            }
        }
        lock(&self.metrics).merge(&delta);
    }

    fn step<B: QueueBody>(
        &self,
        entry: &mut Entry<B>,
        metrics: &mut LaneMetrics,
        summary: &mut PassSummary,
    ) {
        let record = Arc::clone(&entry.record);
        match record.state() {
            TaskState::Expired => {
                if record.fast_forward(self.shared.tick()) {
                    summary.expired += 1;
                }
            }
            TaskState::Queued if record.is_waiting_for_dependencies() => {
                let deferrals = record.defer();
                metrics.deferrals += 1;
                summary.deferred += 1;
                if deferrals == self.shared.deferral_warn_threshold {
                    warn!(
                        worker = %self.id,
                        task = %record.id(),
                        name = record.name(),
                        deferrals,
                        "task still waiting for dependencies"
                    );
                }
            }
            TaskState::Queued => {
                // Loses only to a concurrent expiry; the next sweep fast-forwards it.
                if !record.activate() {
                    return;
                }
                let ctx = ExecutionContext {
                    worker: self.id,
                    task: record.id(),
                    deferrals: record.deferrals(),
                };
                let started = Instant::now();
                let result = panic::catch_unwind(AssertUnwindSafe(|| entry.body.run(&ctx)));
                entry.elapsed = started.elapsed();
                if let Err(payload) = &result {
                    error!(
                        worker = %self.id,
                        task = %record.id(),
                        name = record.name(),
                        "task body panicked: {}",
                        panic_message(&**payload)
                    );
                }
                record.finish(self.shared.tick(), result.is_err());
                summary.executed += 1;
            }
            TaskState::Active | TaskState::Completed => {}
        }
    }

    fn complete<B>(&self, entry: &Entry<B>, metrics: &mut LaneMetrics) {
        let record = &entry.record;
        let first = record.notify_dependents();
        debug_assert!(first, "task {} notified twice", record.id());
        if !first {
            return;
        }

        let outcome = record.outcome();
        match outcome {
            TaskOutcome::Executed => {
                metrics.record_execution(record.name(), entry.elapsed);
                if record.kind() == TaskKind::Destruction {
                    metrics.destroyed += 1;
                }
            }
            TaskOutcome::Expired => metrics.record_expired(),
            TaskOutcome::Panicked => metrics.panicked += 1,
            TaskOutcome::Pending => {}
        }

        if let Some(observer) = &self.shared.observer {
            observer.on_complete(&TaskEvent {
                id: record.id(),
                name: record.name().to_string(),
                kind: record.kind(),
                worker: self.id,
                outcome,
                sequence: record.completion_seq(),
                completed_at: Utc::now(),
                duration: entry.elapsed,
            });
        }
    }

    /// Teardown drain: expire every regular task, then run the destruction
    /// queue to empty regardless of the fence.
    ///
    /// A destruction task waiting on another lane's task keeps this looping
    /// until that lane completes it; a context lane only does so in
    /// `ContextQueue::finish`.
    pub(crate) fn finish(&self) {
        self.finish_queue(&self.tasks, &self.staged_tasks, true);
        self.finish_queue(&self.destruction, &self.staged_destruction, false);
        self.publish(|published| *published = (Vec::new(), Vec::new()));
    }

    fn finish_queue<B: QueueBody>(
        &self,
        queue: &Mutex<VecDeque<Entry<B>>>,
        staged: &Mutex<VecDeque<Entry<B>>>,
        expire: bool,
    ) {
        let mut last_progress = Instant::now();
        let mut warned = false;
        loop {
            let mut summary = PassSummary::default();
            let mut queue = lock(queue);
            if expire {
                queue.append(&mut lock(staged));
                for entry in queue.iter() {
                    let _ = entry.record.expire();
                }
            }
            self.drain(&mut queue, staged, &mut summary);
            if queue.is_empty() {
                break;
            }

            if summary.completed() > 0 {
                last_progress = Instant::now();
            } else if !warned && last_progress.elapsed() >= TEARDOWN_STALL_WARN {
                warned = true;
                warn!(
                    worker = %self.id,
                    waiting = queue.len(),
                    "teardown stalled on dependencies owned by another lane; \
                     finish context queues before shutting the manager down"
                );
            }
            drop(queue);
            thread::yield_now();
        }
    }

    // ── Introspection ────────────────────────────────────────────

    fn publish(&self, update: impl FnOnce(&mut (Vec<TaskSnapshot>, Vec<TaskSnapshot>))) {
        if let Some(mut published) = try_lock(&self.published) {
            update(&mut published);
        }
    }

    /// Live view when the queues are free, otherwise what the last pass published.
    pub(crate) fn snapshot(&self) -> QueueSnapshot {
        let live_tasks = live_entries(&self.tasks, &self.staged_tasks);
        let live_destruction = live_entries(&self.destruction, &self.staged_destruction);
        let published = lock(&self.published);
        QueueSnapshot {
            worker: self.id,
            kind: self.kind,
            label: self.label.clone(),
            fence: self.fence_raised(),
            tasks: live_tasks.unwrap_or_else(|| published.0.clone()),
            destruction: live_destruction.unwrap_or_else(|| published.1.clone()),
        }
    }

    pub(crate) fn metrics(&self) -> LaneMetrics {
        lock(&self.metrics).clone()
    }
}

fn live_entries<B>(
    queue: &Mutex<VecDeque<Entry<B>>>,
    staged: &Mutex<VecDeque<Entry<B>>>,
) -> Option<Vec<TaskSnapshot>> {
    let queue = try_lock(queue)?;
    let staged = try_lock(staged)?;
    Some(entries(queue.iter().chain(staged.iter())))
}

fn entries<'a, B: 'a>(queue: impl Iterator<Item = &'a Entry<B>>) -> Vec<TaskSnapshot> {
    let mut out: Vec<TaskSnapshot> = queue
        .map(|entry| TaskSnapshot {
            id: entry.record.id(),
            name: entry.record.name().to_string(),
            state: entry.record.state(),
            deferrals: entry.record.deferrals(),
        })
        .collect();
    out.sort_by(|a, b| b.id.cmp(&a.id));
    out
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
