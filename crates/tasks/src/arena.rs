//! Manager-owned storage for task records.
//!
//! Producers refer to tasks through [`TaskHandle`]s (slot index plus
//! generation). Reclaiming a slot bumps its generation, so a handle kept
//! past reclamation resolves to nothing instead of to an unrelated task.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::sync::{read, write};
use crate::task::record::TaskRecord;
use crate::task::TaskState;

/// Reference to a submitted task, valid until its slot is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    record: Option<Arc<TaskRecord>>,
}

#[derive(Debug, Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

#[derive(Debug, Default)]
pub(crate) struct TaskArena {
    inner: RwLock<Slots>,
}

impl TaskArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store a record. `None` once every `u32` slot index is in use.
    pub(crate) fn insert(&self, record: Arc<TaskRecord>) -> Option<TaskHandle> {
        let mut inner = write(&self.inner);
        if let Some(index) = inner.free.pop() {
            inner.live += 1;
            let slot = &mut inner.slots[index as usize];
            slot.record = Some(record);
            return Some(TaskHandle {
                index,
                generation: slot.generation,
            });
        }
        let index = u32::try_from(inner.slots.len()).ok()?;
        inner.live += 1;
        inner.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        Some(TaskHandle {
            index,
            generation: 0,
        })
    }

    pub(crate) fn get(&self, handle: TaskHandle) -> Option<Arc<TaskRecord>> {
        let inner = read(&self.inner);
        inner
            .slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.clone())
    }

    /// Free every slot whose task has completed and notified its dependents.
    pub(crate) fn reclaim_completed(&self) -> usize {
        let mut inner = write(&self.inner);
        let mut freed = Vec::new();
        for (index, slot) in inner.slots.iter_mut().enumerate() {
            let done = slot
                .record
                .as_ref()
                .is_some_and(|r| r.state() == TaskState::Completed && r.is_notified());
            if done {
                slot.record = None;
                slot.generation = slot.generation.wrapping_add(1);
                freed.push(index as u32);
            }
        }
        inner.live -= freed.len();
        let count = freed.len();
        inner.free.extend(freed);
        count
    }

    /// Number of occupied slots.
    pub(crate) fn len(&self) -> usize {
        read(&self.inner).live
    }
}
