//! Integration tests for destruction tasks, context lanes and teardown.
//!
//! Destruction tasks release native resources, so the thread they run on
//! matters as much as when they run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use dream_core::TaskConfig;
use dream_tasks::{
    Affinity, ExecutionContext, FnDestruction, FnTask, ResourceHandle, TaskError, TaskManager,
    TaskOutcome, WorkerId,
};

const FENCE_TIMEOUT: Duration = Duration::from_secs(10);

type ReleaseLog = Arc<Mutex<Vec<(ResourceHandle, WorkerId, Option<String>)>>>;

fn release_into(
    log: &ReleaseLog,
    name: &str,
    resource: ResourceHandle,
) -> FnDestruction<impl FnOnce(ResourceHandle, &ExecutionContext) + Send> {
    let log = Arc::clone(log);
    FnDestruction::new(name, resource, move |res: ResourceHandle, ctx: &ExecutionContext| {
        let thread_name = thread::current().name().map(str::to_string);
        log.lock().unwrap().push((res, ctx.worker, thread_name));
    })
}

fn noop(name: &str) -> FnTask<impl FnOnce(&ExecutionContext) + Send> {
    FnTask::new(name, |_: &ExecutionContext| {})
}

#[test]
fn release_runs_on_the_pinned_worker_thread() {
    let manager = TaskManager::new(TaskConfig::with_workers(3)).unwrap();
    let log = ReleaseLog::default();

    for i in 0..10 {
        manager.submit_pinned(noop(&format!("draw{i}")), &[], WorkerId(1)).unwrap();
    }
    let handle = manager
        .submit_destruction(
            release_into(&log, "free_texture", ResourceHandle(77)),
            &[],
            Affinity::Worker(WorkerId(2)),
        )
        .unwrap();

    manager.clear_fences();
    manager.wait_for_fence_timeout(FENCE_TIMEOUT).unwrap();

    let log = log.lock().unwrap();
    assert_eq!(
        *log,
        vec![(ResourceHandle(77), WorkerId(2), Some("dream-task-2".to_string()))]
    );
    let view = manager.task(handle).unwrap();
    assert_eq!(view.resource, Some(ResourceHandle(77)));
    assert_eq!(view.outcome, TaskOutcome::Executed);
}

#[test]
fn release_follows_creator_and_waits_for_last_use() {
    let manager = TaskManager::new(TaskConfig::with_workers(4)).unwrap();
    let log = ReleaseLog::default();
    let used = Arc::new(AtomicBool::new(false));
    let released_after_use = Arc::new(AtomicBool::new(false));

    let create = manager.submit(noop("create_buffer"), &[]).unwrap();
    let flag = Arc::clone(&used);
    let last_use = manager
        .submit(
            FnTask::new("draw", move |_: &ExecutionContext| {
                thread::sleep(Duration::from_millis(5));
                flag.store(true, Ordering::SeqCst);
            }),
            &[create],
        )
        .unwrap();

    let check_used = Arc::clone(&used);
    let check_flag = Arc::clone(&released_after_use);
    let sink = Arc::clone(&log);
    let destroy = manager
        .submit_destruction(
            FnDestruction::new(
                "free_buffer",
                ResourceHandle(5),
                move |res: ResourceHandle, ctx: &ExecutionContext| {
                    check_flag.store(check_used.load(Ordering::SeqCst), Ordering::SeqCst);
                    sink.lock().unwrap().push((res, ctx.worker, None));
                },
            ),
            &[last_use],
            Affinity::SameAs(create),
        )
        .unwrap();

    manager.clear_fences();
    manager.wait_for_fence_timeout(FENCE_TIMEOUT).unwrap();

    let creator = manager.task(create).unwrap().worker;
    assert_eq!(manager.task(destroy).unwrap().worker, creator);
    assert!(released_after_use.load(Ordering::SeqCst));
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn shutdown_drains_destruction_and_expires_regular_work() {
    let manager = TaskManager::new(TaskConfig::with_workers(2)).unwrap();
    let log = ReleaseLog::default();
    let ran = Arc::new(AtomicBool::new(false));

    // No batch is opened: everything is still queued when shutdown starts.
    let flag = Arc::clone(&ran);
    manager
        .submit(
            FnTask::new("never", move |_: &ExecutionContext| {
                flag.store(true, Ordering::SeqCst);
            }),
            &[],
        )
        .unwrap();
    for i in 0..6 {
        manager
            .submit_destruction(
                release_into(&log, "free", ResourceHandle(i)),
                &[],
                Affinity::Any,
            )
            .unwrap();
    }

    manager.shutdown();

    assert!(!ran.load(Ordering::SeqCst));
    let mut released: Vec<u64> = log.lock().unwrap().iter().map(|(r, _, _)| r.0).collect();
    released.sort_unstable();
    assert_eq!(released, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(manager.metrics().totals.expired, 1);
    assert_eq!(manager.metrics().totals.destroyed, 6);
}

#[test]
fn context_lane_runs_uploads_on_the_owner_thread() {
    let manager = TaskManager::builder(TaskConfig::with_workers(2))
        .context("render")
        .build()
        .unwrap();
    let render = manager.context_id("render").unwrap();
    let queue = manager.context_queue("render").unwrap();
    let owner = thread::current().id();
    let upload_threads: Arc<Mutex<Vec<ThreadId>>> = Arc::default();

    for i in 0..4 {
        let decode = manager.submit(noop(&format!("decode{i}")), &[]).unwrap();
        let threads = Arc::clone(&upload_threads);
        manager
            .submit_pinned(
                FnTask::new(format!("upload{i}"), move |_: &ExecutionContext| {
                    threads.lock().unwrap().push(thread::current().id());
                }),
                &[decode],
                render,
            )
            .unwrap();
    }

    manager.clear_fences();
    manager.wait_for_fence_timeout(FENCE_TIMEOUT).unwrap();
    assert_eq!(queue.pending(), 4);

    let summary = queue.run_pending().unwrap();
    assert_eq!(summary.executed, 4);
    assert!(queue.is_idle());
    assert!(upload_threads.lock().unwrap().iter().all(|&id| id == owner));

    let other = queue.clone();
    let err = thread::spawn(move || other.run_pending()).join().unwrap().unwrap_err();
    assert!(matches!(err, TaskError::WrongThread(id) if id == render));
}

#[test]
fn context_finish_releases_context_resources() {
    let manager = TaskManager::builder(TaskConfig::with_workers(1))
        .context("render")
        .build()
        .unwrap();
    let render = manager.context_id("render").unwrap();
    let queue = manager.context_queue("render").unwrap();
    let log = ReleaseLog::default();

    let texture = manager.submit_pinned(noop("create_texture"), &[], render).unwrap();
    manager
        .submit_destruction(
            release_into(&log, "free_texture", ResourceHandle(11)),
            &[],
            Affinity::SameAs(texture),
        )
        .unwrap();

    queue.finish().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].1, render);
    assert_eq!(manager.task(texture).unwrap().outcome, TaskOutcome::Expired);
}

#[test]
fn pool_release_waiting_on_context_work_finishes_after_context_teardown() {
    let manager = TaskManager::builder(TaskConfig::with_workers(2))
        .context("render")
        .build()
        .unwrap();
    let render = manager.context_id("render").unwrap();
    let queue = manager.context_queue("render").unwrap();
    let log = ReleaseLog::default();

    let upload = manager.submit_pinned(noop("upload"), &[], render).unwrap();
    let release = manager
        .submit_destruction(
            release_into(&log, "free_staging", ResourceHandle(21)),
            &[upload],
            Affinity::Worker(WorkerId(1)),
        )
        .unwrap();

    // Context lane first, then the pool.
    queue.finish().unwrap();
    manager.shutdown();

    assert_eq!(manager.task(upload).unwrap().outcome, TaskOutcome::Expired);
    assert_eq!(manager.task(release).unwrap().outcome, TaskOutcome::Executed);
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].1, WorkerId(1));
}
