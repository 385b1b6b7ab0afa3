use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde::Serialize;

use crate::sync::lock;

use super::state::AtomicTaskState;
use super::{ResourceHandle, TaskId, TaskKind, TaskOutcome, TaskState, WorkerId};

#[derive(Debug, Default)]
struct Dependents {
    notified: bool,
    list: Vec<Weak<TaskRecord>>,
}

/// Cross-thread lifecycle state of one task.
///
/// Written only by the owning worker (plus the producer-side expiry CAS);
/// any thread may read it. Dependency edges are weak: a dependency record
/// is only dropped after the arena reclaimed it, which requires it to be
/// completed, so a dead edge counts as satisfied.
#[derive(Debug)]
pub(crate) struct TaskRecord {
    id: TaskId,
    name: String,
    kind: TaskKind,
    resource: Option<ResourceHandle>,
    state: AtomicTaskState,
    worker: OnceLock<WorkerId>,
    deferrals: AtomicU32,
    executions: AtomicU32,
    panicked: AtomicBool,
    /// Manager-wide completion order, 0 until completed.
    completion_seq: AtomicU64,
    dependencies: Vec<Weak<TaskRecord>>,
    pending_dependencies: AtomicUsize,
    dependents: Mutex<Dependents>,
}

impl TaskRecord {
    /// Create the record and register it as a dependent of each upstream.
    pub(crate) fn new(
        id: TaskId,
        name: String,
        kind: TaskKind,
        resource: Option<ResourceHandle>,
        dependencies: &[Arc<TaskRecord>],
    ) -> Arc<Self> {
        let record = Arc::new(Self {
            id,
            name,
            kind,
            resource,
            state: AtomicTaskState::new(),
            worker: OnceLock::new(),
            deferrals: AtomicU32::new(0),
            executions: AtomicU32::new(0),
            panicked: AtomicBool::new(false),
            completion_seq: AtomicU64::new(0),
            dependencies: dependencies.iter().map(Arc::downgrade).collect(),
            pending_dependencies: AtomicUsize::new(0),
            dependents: Mutex::new(Dependents::default()),
        });
        for dep in dependencies {
            dep.add_dependent(&record);
        }
        record
    }

    fn add_dependent(&self, dependent: &Arc<TaskRecord>) {
        let mut dependents = lock(&self.dependents);
        if dependents.notified {
            return;
        }
        dependent.pending_dependencies.fetch_add(1, Ordering::AcqRel);
        dependents.list.push(Arc::downgrade(dependent));
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn kind(&self) -> TaskKind {
        self.kind
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.load()
    }

    pub(crate) fn worker(&self) -> Option<WorkerId> {
        self.worker.get().copied()
    }

    /// Pin the task to a lane. Only the first call has an effect.
    pub(crate) fn bind_worker(&self, worker: WorkerId) -> bool {
        self.worker.set(worker).is_ok()
    }

    pub(crate) fn deferrals(&self) -> u32 {
        self.deferrals.load(Ordering::Relaxed)
    }

    /// Record one pass spent blocked; returns the new count.
    pub(crate) fn defer(&self) -> u32 {
        self.deferrals.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// True iff some dependency has not reached `Completed`.
    pub(crate) fn is_waiting_for_dependencies(&self) -> bool {
        self.dependencies.iter().any(|dep| {
            dep.upgrade()
                .is_some_and(|dep| dep.state() != TaskState::Completed)
        })
    }

    /// `Queued -> Expired`, the producer-side cancellation.
    pub(crate) fn expire(&self) -> Result<(), TaskState> {
        self.state.transition(TaskState::Queued, TaskState::Expired)
    }

    /// `Queued -> Active`. Fails if a producer expired the task first.
    pub(crate) fn activate(&self) -> bool {
        if self.state.transition(TaskState::Queued, TaskState::Active).is_ok() {
            self.executions.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// `Active -> Completed` after the body returned (or panicked).
    pub(crate) fn finish(&self, seq: u64, panicked: bool) {
        if panicked {
            self.panicked.store(true, Ordering::Release);
        }
        self.completion_seq.store(seq, Ordering::Release);
        let finished = self.state.transition(TaskState::Active, TaskState::Completed);
        debug_assert!(finished.is_ok(), "task {} finished from {:?}", self.id, finished);
    }

    /// `Expired -> Completed` without running the body.
    pub(crate) fn fast_forward(&self, seq: u64) -> bool {
        self.completion_seq.store(seq, Ordering::Release);
        self.state
            .transition(TaskState::Expired, TaskState::Completed)
            .is_ok()
    }

    /// Release every registered dependent. Returns false if already notified.
    pub(crate) fn notify_dependents(&self) -> bool {
        let released = {
            let mut dependents = lock(&self.dependents);
            if dependents.notified {
                return false;
            }
            dependents.notified = true;
            std::mem::take(&mut dependents.list)
        };
        for dependent in released.iter().filter_map(Weak::upgrade) {
            dependent.pending_dependencies.fetch_sub(1, Ordering::AcqRel);
        }
        true
    }

    pub(crate) fn is_notified(&self) -> bool {
        lock(&self.dependents).notified
    }

    pub(crate) fn completion_seq(&self) -> u64 {
        self.completion_seq.load(Ordering::Acquire)
    }

    pub(crate) fn outcome(&self) -> TaskOutcome {
        if self.state() != TaskState::Completed {
            TaskOutcome::Pending
        } else if self.panicked.load(Ordering::Acquire) {
            TaskOutcome::Panicked
        } else if self.executions.load(Ordering::Acquire) == 0 {
            TaskOutcome::Expired
        } else {
            TaskOutcome::Executed
        }
    }

    pub(crate) fn view(&self) -> TaskView {
        let seq = self.completion_seq.load(Ordering::Acquire);
        TaskView {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            resource: self.resource,
            state: self.state(),
            worker: self.worker(),
            deferrals: self.deferrals(),
            executions: self.executions.load(Ordering::Acquire),
            pending_dependencies: self.pending_dependencies.load(Ordering::Acquire),
            outcome: self.outcome(),
            notified: self.is_notified(),
            completion_seq: (seq != 0).then_some(seq),
        }
    }
}

/// Point-in-time view of one task, returned by `TaskManager::task`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    /// Set for destruction tasks.
    pub resource: Option<ResourceHandle>,
    pub state: TaskState,
    /// The lane the task is pinned to.
    pub worker: Option<WorkerId>,
    pub deferrals: u32,
    /// How many times the body was entered. Never above 1.
    pub executions: u32,
    /// Upstream tasks that have not notified yet.
    pub pending_dependencies: usize,
    pub outcome: TaskOutcome,
    pub notified: bool,
    /// Position in the manager-wide completion order.
    pub completion_seq: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, deps: &[Arc<TaskRecord>]) -> Arc<TaskRecord> {
        TaskRecord::new(TaskId(id), format!("t{id}"), TaskKind::Regular, None, deps)
    }

    fn complete(record: &TaskRecord, seq: u64) {
        assert!(record.activate());
        record.finish(seq, false);
    }

    #[test]
    fn waits_until_dependency_completes() {
        let upstream = record(1, &[]);
        let downstream = record(2, &[Arc::clone(&upstream)]);

        assert!(downstream.is_waiting_for_dependencies());
        assert_eq!(downstream.view().pending_dependencies, 1);

        complete(&upstream, 1);
        assert!(!downstream.is_waiting_for_dependencies());

        assert!(upstream.notify_dependents());
        assert_eq!(downstream.view().pending_dependencies, 0);
    }

    #[test]
    fn expired_dependency_still_blocks_until_fast_forwarded() {
        let upstream = record(1, &[]);
        let downstream = record(2, &[Arc::clone(&upstream)]);

        upstream.expire().unwrap();
        assert!(downstream.is_waiting_for_dependencies());

        assert!(upstream.fast_forward(1));
        assert!(!downstream.is_waiting_for_dependencies());
        assert_eq!(upstream.outcome(), TaskOutcome::Expired);
    }

    #[test]
    fn notify_fires_once() {
        let upstream = record(1, &[]);
        complete(&upstream, 1);
        assert!(upstream.notify_dependents());
        assert!(!upstream.notify_dependents());
        assert!(upstream.is_notified());
    }

    #[test]
    fn late_dependent_of_notified_task_is_not_counted() {
        let upstream = record(1, &[]);
        complete(&upstream, 1);
        upstream.notify_dependents();

        let downstream = record(2, &[Arc::clone(&upstream)]);
        assert_eq!(downstream.view().pending_dependencies, 0);
        assert!(!downstream.is_waiting_for_dependencies());
    }

    #[test]
    fn dropped_dependency_counts_as_satisfied() {
        let upstream = record(1, &[]);
        let downstream = record(2, &[Arc::clone(&upstream)]);
        complete(&upstream, 1);
        drop(upstream);
        assert!(!downstream.is_waiting_for_dependencies());
    }

    #[test]
    fn worker_binding_is_set_once() {
        let task = record(1, &[]);
        assert_eq!(task.worker(), None);
        assert!(task.bind_worker(WorkerId(2)));
        assert!(!task.bind_worker(WorkerId(3)));
        assert_eq!(task.worker(), Some(WorkerId(2)));
    }

    #[test]
    fn activation_counts_executions() {
        let task = record(1, &[]);
        assert!(task.activate());
        assert!(!task.activate());
        task.finish(5, false);

        let view = task.view();
        assert_eq!(view.executions, 1);
        assert_eq!(view.outcome, TaskOutcome::Executed);
        assert_eq!(view.completion_seq, Some(5));
    }

    #[test]
    fn panicked_outcome() {
        let task = record(1, &[]);
        assert!(task.activate());
        task.finish(1, true);
        assert_eq!(task.outcome(), TaskOutcome::Panicked);
    }

    #[test]
    fn expire_is_rejected_once_active() {
        let task = record(1, &[]);
        assert!(task.activate());
        assert_eq!(task.expire(), Err(TaskState::Active));
    }

    #[test]
    fn deferral_counter() {
        let task = record(1, &[]);
        assert_eq!(task.defer(), 1);
        assert_eq!(task.defer(), 2);
        assert_eq!(task.deferrals(), 2);
    }
}
