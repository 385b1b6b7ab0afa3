use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dream_core::{DreamError, TaskConfig};

use super::{Affinity, TaskManager};
use crate::arena::TaskHandle;
use crate::error::TaskError;
use crate::observer::{TaskEvent, TaskObserver};
use crate::task::{ExecutionContext, FnDestruction, FnTask, ResourceHandle, TaskOutcome, TaskState, WorkerId};

const FENCE_TIMEOUT: Duration = Duration::from_secs(10);

fn manager(workers: usize) -> TaskManager {
    TaskManager::new(TaskConfig::with_workers(workers)).unwrap()
}

fn noop(name: &str) -> FnTask<impl FnOnce(&ExecutionContext) + Send> {
    FnTask::new(name, |_: &ExecutionContext| {})
}

#[test]
fn starts_requested_pool() {
    let manager = manager(3);
    assert_eq!(manager.worker_count(), 3);
    assert_eq!(
        manager.worker_ids().collect::<Vec<_>>(),
        vec![WorkerId(0), WorkerId(1), WorkerId(2)]
    );
    assert!(manager.snapshot().iter().all(|lane| lane.fence));
}

#[test]
fn any_affinity_spreads_by_queue_length() {
    let manager = manager(2);
    // No batch open: workers keep their fences up and leave the queues alone.
    let handles: Vec<_> = (0..4)
        .map(|i| manager.submit(noop(&format!("t{i}")), &[]).unwrap())
        .collect();

    let workers: Vec<_> = handles
        .iter()
        .map(|&h| manager.task(h).unwrap().worker)
        .collect();
    assert_eq!(
        workers,
        vec![
            Some(WorkerId(0)),
            Some(WorkerId(1)),
            Some(WorkerId(0)),
            Some(WorkerId(1))
        ]
    );
    assert_eq!(manager.queue_len(WorkerId(0)).unwrap(), 2);
}

#[test]
fn same_as_follows_the_referenced_task() {
    let manager = manager(3);
    let create = manager.submit_pinned(noop("create"), &[], WorkerId(2)).unwrap();
    let destroy = manager
        .submit_destruction(
            FnDestruction::new("free", ResourceHandle(1), |_: ResourceHandle, _: &ExecutionContext| {}),
            &[create],
            Affinity::SameAs(create),
        )
        .unwrap();
    assert_eq!(manager.task(destroy).unwrap().worker, Some(WorkerId(2)));
    assert_eq!(manager.task(destroy).unwrap().pending_dependencies, 1);
}

#[test]
fn rejects_unknown_worker() {
    let manager = manager(1);
    let err = manager.submit_pinned(noop("x"), &[], WorkerId(9)).unwrap_err();
    assert!(matches!(err, TaskError::UnknownWorker(WorkerId(9))));
}

#[test]
fn stale_handle_is_rejected_after_reclaim() {
    let manager = manager(1);
    let done = manager.submit(noop("done"), &[]).unwrap();
    manager.clear_fences();
    manager.wait_for_fence_timeout(FENCE_TIMEOUT).unwrap();

    assert_eq!(manager.reclaim_completed(), 1);
    assert!(matches!(manager.task(done), Err(TaskError::UnknownTask(_))));
    let err = manager.submit(noop("late"), &[done]).unwrap_err();
    assert!(matches!(err, TaskError::UnknownTask(h) if h == done));
}

#[test]
fn expiry_rules() {
    let manager = manager(1);
    let regular = manager.submit(noop("regular"), &[]).unwrap();
    let destroy = manager
        .submit_destruction(
            FnDestruction::new("free", ResourceHandle(3), |_: ResourceHandle, _: &ExecutionContext| {}),
            &[],
            Affinity::Any,
        )
        .unwrap();

    assert!(matches!(
        manager.mark_expired(destroy),
        Err(TaskError::NotExpirable(_))
    ));
    manager.mark_expired(regular).unwrap();
    assert_eq!(manager.state(regular).unwrap(), TaskState::Expired);
    assert!(matches!(
        manager.mark_expired(regular),
        Err(TaskError::NotQueued {
            state: TaskState::Expired,
            ..
        })
    ));

    manager.clear_fences();
    manager.wait_for_fence_timeout(FENCE_TIMEOUT).unwrap();
    assert_eq!(manager.task(regular).unwrap().outcome, TaskOutcome::Expired);
    assert_eq!(manager.task(destroy).unwrap().outcome, TaskOutcome::Executed);
}

#[test]
fn batch_counter_and_metrics() {
    let manager = manager(2);
    for frame in 0..3 {
        for i in 0..5 {
            manager.submit(noop(&format!("f{frame}-{i}")), &[]).unwrap();
        }
        manager.clear_fences();
        manager.wait_for_fence_timeout(FENCE_TIMEOUT).unwrap();
    }

    let metrics = manager.metrics();
    assert_eq!(metrics.batches, 3);
    assert_eq!(metrics.submitted, 15);
    assert_eq!(metrics.totals.total_executed(), 15);
    assert_eq!(metrics.live_tasks, 15);

    manager.reclaim_completed();
    assert_eq!(manager.metrics().live_tasks, 0);
}

#[test]
fn duplicate_context_is_a_config_error() {
    let err = TaskManager::builder(TaskConfig::with_workers(1))
        .context("render")
        .context("render")
        .build()
        .unwrap_err();
    assert!(matches!(err, TaskError::Config(DreamError::Config(_))));
}

#[test]
fn invalid_config_is_rejected() {
    let config = TaskConfig {
        thread_name_prefix: String::new(),
        ..TaskConfig::with_workers(1)
    };
    assert!(matches!(
        TaskManager::new(config),
        Err(TaskError::Config(_))
    ));
}

#[test]
fn context_lanes_follow_the_pool() {
    let manager = TaskManager::builder(TaskConfig::with_workers(2))
        .context("render")
        .context("audio")
        .build()
        .unwrap();
    assert_eq!(manager.context_id("render"), Some(WorkerId(2)));
    assert_eq!(manager.context_id("audio"), Some(WorkerId(3)));
    assert!(matches!(
        manager.context_queue("physics"),
        Err(TaskError::UnknownContext(_))
    ));

    // Any-affinity work never lands on a context lane.
    for _ in 0..6 {
        manager.submit(noop("pool"), &[]).unwrap();
    }
    assert_eq!(manager.queue_len(WorkerId(2)).unwrap(), 0);
    assert_eq!(manager.queue_len(WorkerId(3)).unwrap(), 0);
}

#[test]
fn shutdown_rejects_new_work() {
    let manager = manager(1);
    manager.shutdown();
    manager.shutdown();

    assert!(manager.is_shutting_down());
    assert!(matches!(
        manager.submit(noop("late"), &[]),
        Err(TaskError::ShuttingDown)
    ));
    assert!(matches!(
        manager.wait_for_fence(),
        Err(TaskError::ShuttingDown)
    ));
}

/// Runs a task whose body submits `follow_up` with the given affinity, then
/// returns both handles once the batch is over.
fn submit_from_body(
    manager: &Arc<TaskManager>,
    pinned: Option<WorkerId>,
    affinity: impl Fn(TaskHandle) -> Affinity + Send + 'static,
) -> (TaskHandle, TaskHandle) {
    let own: Arc<OnceLock<TaskHandle>> = Arc::default();
    let follow_up: Arc<OnceLock<TaskHandle>> = Arc::default();
    let weak = Arc::downgrade(manager);
    let (own_slot, follow_slot) = (Arc::clone(&own), Arc::clone(&follow_up));

    let body = FnTask::new("parent", move |_: &ExecutionContext| {
        let manager = weak.upgrade().unwrap();
        let parent = *own_slot.get().unwrap();
        let child = manager
            .submit_with(noop("child"), &[parent], affinity(parent))
            .unwrap();
        follow_slot.set(child).unwrap();
    });
    let parent = match pinned {
        Some(worker) => manager.submit_pinned(body, &[], worker).unwrap(),
        None => manager.submit(body, &[]).unwrap(),
    };
    own.set(parent).unwrap();

    manager.clear_fences();
    manager.wait_for_fence_timeout(FENCE_TIMEOUT).unwrap();
    (parent, *follow_up.get().unwrap())
}

#[test]
fn body_submits_continuation_to_its_own_lane() {
    let manager = Arc::new(manager(2));
    let (parent, child) = submit_from_body(&manager, Some(WorkerId(0)), Affinity::SameAs);

    let view = manager.task(child).unwrap();
    assert_eq!(view.state, TaskState::Completed);
    assert_eq!(view.outcome, TaskOutcome::Executed);
    assert_eq!(view.worker, Some(WorkerId(0)));
    assert!(manager.task(parent).unwrap().completion_seq < view.completion_seq);
    assert_eq!(manager.queue_len(WorkerId(0)).unwrap(), 0);
}

#[test]
fn body_submits_pinned_to_its_own_worker() {
    let manager = Arc::new(manager(2));
    let (_, child) =
        submit_from_body(&manager, Some(WorkerId(1)), |_| Affinity::Worker(WorkerId(1)));
    assert_eq!(manager.state(child).unwrap(), TaskState::Completed);
    assert_eq!(manager.task(child).unwrap().worker, Some(WorkerId(1)));
}

#[test]
fn body_submits_any_on_single_worker_pool() {
    let manager = Arc::new(manager(1));
    let (_, child) = submit_from_body(&manager, None, |_| Affinity::Any);
    assert_eq!(manager.state(child).unwrap(), TaskState::Completed);
    assert_eq!(manager.metrics().totals.total_executed(), 2);
}

#[derive(Default)]
struct MetricsReader {
    manager: OnceLock<Weak<TaskManager>>,
    reads: AtomicU32,
}

impl TaskObserver for MetricsReader {
    fn on_complete(&self, _: &TaskEvent) {
        if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
            let _ = manager.metrics();
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn body_and_observer_can_read_metrics() {
    let reader = Arc::new(MetricsReader::default());
    let manager = Arc::new(
        TaskManager::builder(TaskConfig::with_workers(1))
            .observer(reader.clone())
            .build()
            .unwrap(),
    );
    assert!(reader.manager.set(Arc::downgrade(&manager)).is_ok());

    let body_reads = Arc::new(AtomicU32::new(0));
    for i in 0..3 {
        let weak = Arc::downgrade(&manager);
        let reads = Arc::clone(&body_reads);
        manager
            .submit(
                FnTask::new(format!("read{i}"), move |_: &ExecutionContext| {
                    if let Some(manager) = weak.upgrade() {
                        let _ = manager.metrics();
                        reads.fetch_add(1, Ordering::SeqCst);
                    }
                }),
                &[],
            )
            .unwrap();
    }

    manager.clear_fences();
    manager.wait_for_fence_timeout(FENCE_TIMEOUT).unwrap();

    assert_eq!(body_reads.load(Ordering::SeqCst), 3);
    assert_eq!(reader.reads.load(Ordering::SeqCst), 3);
    assert_eq!(manager.metrics().totals.total_executed(), 3);
}
