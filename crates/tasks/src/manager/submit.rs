use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_utils::Backoff;
use serde::Serialize;
use tracing::debug;

use crate::arena::TaskHandle;
use crate::error::TaskError;
use crate::task::record::{TaskRecord, TaskView};
use crate::task::{DestructionTask, ResourceHandle, Task, TaskId, TaskKind, TaskState, WorkerId};
use crate::thread::{DestructionEntry, Entry, Lane, TaskEntry};

use super::TaskManager;

/// Where a submitted task may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Affinity {
    /// The pool lane with the fewest queued entries.
    Any,
    /// A specific lane: a pool worker or a context lane.
    Worker(WorkerId),
    /// Whatever lane an earlier task was pinned to.
    SameAs(TaskHandle),
}

/// A task's record, allocated but not yet queued.
struct Admitted {
    record: Arc<TaskRecord>,
    handle: TaskHandle,
    target: Option<Arc<Lane>>,
}

impl TaskManager {
    /// Queue a task on the least-loaded pool worker.
    ///
    /// Every dependency must be a live handle returned by an earlier
    /// submission, so the dependency graph can never contain a cycle.
    pub fn submit<T>(&self, task: T, dependencies: &[TaskHandle]) -> Result<TaskHandle, TaskError>
    where
        T: Task + 'static,
    {
        self.submit_with(task, dependencies, Affinity::Any)
    }

    /// Queue a task on a specific lane.
    pub fn submit_pinned<T>(
        &self,
        task: T,
        dependencies: &[TaskHandle],
        worker: WorkerId,
    ) -> Result<TaskHandle, TaskError>
    where
        T: Task + 'static,
    {
        self.submit_with(task, dependencies, Affinity::Worker(worker))
    }

    pub fn submit_with<T>(
        &self,
        task: T,
        dependencies: &[TaskHandle],
        affinity: Affinity,
    ) -> Result<TaskHandle, TaskError>
    where
        T: Task + 'static,
    {
        let admitted = self.admit(
            task.name().to_string(),
            TaskKind::Regular,
            None,
            dependencies,
            affinity,
        )?;
        let handle = admitted.handle;
        let entry: TaskEntry = Entry::new(Arc::clone(&admitted.record), Box::new(task));
        let worker = self.enqueue(entry, admitted.target.as_ref(), Lane::try_push_task);
        self.log_submitted(&admitted.record, worker, dependencies.len());
        Ok(handle)
    }

    /// Queue a resource release on the lane that owns the resource.
    ///
    /// Destruction tasks can depend on regular tasks (release a texture after
    /// the last draw that uses it) but can never be expired.
    pub fn submit_destruction<T>(
        &self,
        task: T,
        dependencies: &[TaskHandle],
        affinity: Affinity,
    ) -> Result<TaskHandle, TaskError>
    where
        T: DestructionTask + 'static,
    {
        let admitted = self.admit(
            task.name().to_string(),
            TaskKind::Destruction,
            Some(task.resource()),
            dependencies,
            affinity,
        )?;
        let handle = admitted.handle;
        let entry: DestructionEntry = Entry::new(Arc::clone(&admitted.record), Box::new(task));
        let worker = self.enqueue(entry, admitted.target.as_ref(), Lane::try_push_destruction);
        self.log_submitted(&admitted.record, worker, dependencies.len());
        Ok(handle)
    }

    fn admit(
        &self,
        name: String,
        kind: TaskKind,
        resource: Option<ResourceHandle>,
        dependencies: &[TaskHandle],
        affinity: Affinity,
    ) -> Result<Admitted, TaskError> {
        if self.is_shutting_down() {
            return Err(TaskError::ShuttingDown);
        }

        let upstream = dependencies
            .iter()
            .map(|&handle| self.record(handle))
            .collect::<Result<Vec<_>, _>>()?;
        let target = self.resolve(affinity)?;

        let id = TaskId(self.next_id.fetch_add(1, Ordering::AcqRel) + 1);
        let record = TaskRecord::new(id, name, kind, resource, &upstream);
        let handle = self
            .arena
            .insert(Arc::clone(&record))
            .ok_or(TaskError::ArenaFull)?;
        self.submitted.fetch_add(1, Ordering::AcqRel);

        Ok(Admitted {
            record,
            handle,
            target,
        })
    }

    fn resolve(&self, affinity: Affinity) -> Result<Option<Arc<Lane>>, TaskError> {
        let worker = match affinity {
            Affinity::Any => return Ok(None),
            Affinity::Worker(worker) => worker,
            Affinity::SameAs(handle) => self
                .record(handle)?
                .worker()
                .ok_or(TaskError::UnknownTask(handle))?,
        };
        self.lane(worker).map(|lane| Some(Arc::clone(lane)))
    }

    /// Push to the target lane, or to the least-loaded pool lane whose queue
    /// is free. A contended queue only ever costs a retry, never a block. A
    /// body submitting to its own lane never sees contention: the lane
    /// stages the entry for its running drain.
    fn enqueue<B>(
        &self,
        mut entry: Entry<B>,
        target: Option<&Arc<Lane>>,
        push: impl Fn(&Lane, Entry<B>, bool) -> Result<(), Entry<B>>,
    ) -> WorkerId {
        let backoff = Backoff::new();
        loop {
            let open_batch = self.batch_open.load(Ordering::Acquire);
            match target {
                Some(lane) => match push(&**lane, entry, open_batch) {
                    Ok(()) => return lane.id(),
                    Err(rejected) => entry = rejected,
                },
                None => {
                    for lane in self.by_load() {
                        match push(&**lane, entry, open_batch) {
                            Ok(()) => return lane.id(),
                            Err(rejected) => entry = rejected,
                        }
                    }
                }
            }
            backoff.snooze();
        }
    }

    /// Pool lanes ordered by queued entries, lowest id first on ties.
    fn by_load(&self) -> Vec<&Arc<Lane>> {
        let mut lanes: Vec<&Arc<Lane>> = self.pool_lanes().iter().collect();
        lanes.sort_by_key(|lane| (lane.pending(), lane.id()));
        lanes
    }

    fn log_submitted(&self, record: &TaskRecord, worker: WorkerId, dependencies: usize) {
        debug!(
            task = %record.id(),
            name = record.name(),
            kind = ?record.kind(),
            worker = %worker,
            dependencies,
            "task submitted"
        );
    }

    pub(super) fn record(&self, handle: TaskHandle) -> Result<Arc<TaskRecord>, TaskError> {
        self.arena.get(handle).ok_or(TaskError::UnknownTask(handle))
    }

    /// Cancel a queued regular task. Its worker completes it without running
    /// the body and still notifies its dependents.
    pub fn mark_expired(&self, handle: TaskHandle) -> Result<(), TaskError> {
        let record = self.record(handle)?;
        if record.kind() == TaskKind::Destruction {
            return Err(TaskError::NotExpirable(record.id()));
        }
        record.expire().map_err(|state| TaskError::NotQueued {
            id: record.id(),
            state,
        })?;
        debug!(task = %record.id(), name = record.name(), "task expired");
        Ok(())
    }

    /// Current view of a task that has not been reclaimed.
    pub fn task(&self, handle: TaskHandle) -> Result<TaskView, TaskError> {
        self.record(handle).map(|record| record.view())
    }

    pub fn state(&self, handle: TaskHandle) -> Result<TaskState, TaskError> {
        self.record(handle).map(|record| record.state())
    }

    /// Drop every record that completed and notified its dependents. Their
    /// handles become unknown. Returns how many slots were freed.
    pub fn reclaim_completed(&self) -> usize {
        let freed = self.arena.reclaim_completed();
        if freed > 0 {
            debug!(freed, live = self.arena.len(), "reclaimed completed tasks");
        }
        freed
    }
}
