use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::task::WorkerId;

/// Counters kept by one lane, updated by its owning thread only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LaneMetrics {
    /// Executed bodies by task name (regular and destruction).
    pub tasks_executed: HashMap<String, u64>,
    /// Average body duration by task name.
    pub avg_task_duration: HashMap<String, Duration>,
    /// Tasks fast-forwarded without running.
    pub expired: u64,
    /// Bodies that panicked.
    pub panicked: u64,
    /// Destruction tasks executed.
    pub destroyed: u64,
    /// Total deferrals recorded across all tasks.
    pub deferrals: u64,
    /// Drain passes that acquired at least one queue.
    pub passes: u64,
    pub last_completed: Option<DateTime<Utc>>,
}

impl LaneMetrics {
    /// Record a task execution.
    pub fn record_execution(&mut self, task_name: &str, duration: Duration) {
        let count = {
            let executed = self.tasks_executed.entry(task_name.to_string()).or_default();
            *executed += 1;
            *executed
        };
        self.last_completed = Some(Utc::now());

        let prev_avg = self
            .avg_task_duration
            .get(task_name)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_task_duration.insert(task_name.to_string(), new_avg);
    }

    pub fn record_expired(&mut self) {
        self.expired += 1;
        self.last_completed = Some(Utc::now());
    }

    pub fn total_executed(&self) -> u64 {
        self.tasks_executed.values().sum()
    }

    /// Fold another lane's counters into this one.
    pub fn merge(&mut self, other: &LaneMetrics) {
        for (name, &count) in &other.tasks_executed {
            let mine = self.tasks_executed.get(name).copied().unwrap_or(0);
            let total = mine + count;
            let my_avg = self.avg_task_duration.get(name).copied().unwrap_or_default();
            let their_avg = other.avg_task_duration.get(name).copied().unwrap_or_default();
            let weighted = (my_avg.as_nanos() as f64 * mine as f64
                + their_avg.as_nanos() as f64 * count as f64)
                / total.max(1) as f64;
            self.tasks_executed.insert(name.clone(), total);
            self.avg_task_duration
                .insert(name.clone(), Duration::from_nanos(weighted as u64));
        }
        self.expired += other.expired;
        self.panicked += other.panicked;
        self.destroyed += other.destroyed;
        self.deferrals += other.deferrals;
        self.passes += other.passes;
        self.last_completed = self.last_completed.max(other.last_completed);
    }
}

/// Aggregated view over every lane, returned by `TaskManager::metrics`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    pub lanes: Vec<(WorkerId, LaneMetrics)>,
    pub totals: LaneMetrics,
    /// Batches opened with `clear_fences`.
    pub batches: u64,
    /// Tasks submitted since the manager started.
    pub submitted: u64,
    /// Records still held in the arena.
    pub live_tasks: usize,
}

impl SchedulerMetrics {
    pub(crate) fn from_lanes(lanes: Vec<(WorkerId, LaneMetrics)>) -> Self {
        let mut totals = LaneMetrics::default();
        for (_, lane) in &lanes {
            totals.merge(lane);
        }
        Self {
            lanes,
            totals,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = LaneMetrics::default();
        m.record_execution("decode_png", Duration::from_millis(100));

        assert_eq!(m.tasks_executed["decode_png"], 1);
        assert!(m.last_completed.is_some());
        assert_eq!(m.avg_task_duration["decode_png"], Duration::from_millis(100));
    }

    #[test]
    fn record_multiple_executions_averages() {
        let mut m = LaneMetrics::default();
        m.record_execution("task", Duration::from_millis(100));
        m.record_execution("task", Duration::from_millis(200));

        assert_eq!(m.tasks_executed["task"], 2);
        // Average of 100ms and 200ms = 150ms
        let avg = m.avg_task_duration["task"].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn merge_weights_averages_by_count() {
        let mut a = LaneMetrics::default();
        a.record_execution("link", Duration::from_millis(100));
        a.expired = 2;

        let mut b = LaneMetrics::default();
        b.record_execution("link", Duration::from_millis(400));
        b.record_execution("link", Duration::from_millis(400));
        b.destroyed = 1;

        a.merge(&b);
        assert_eq!(a.tasks_executed["link"], 3);
        assert_eq!(a.expired, 2);
        assert_eq!(a.destroyed, 1);
        let avg = a.avg_task_duration["link"].as_millis();
        assert!((295..=305).contains(&avg), "expected ~300ms, got {}ms", avg);
    }

    #[test]
    fn totals_cover_all_lanes() {
        let mut lane0 = LaneMetrics::default();
        lane0.record_execution("a", Duration::from_millis(1));
        let mut lane1 = LaneMetrics::default();
        lane1.record_execution("b", Duration::from_millis(1));
        lane1.record_expired();

        let metrics = SchedulerMetrics::from_lanes(vec![(WorkerId(0), lane0), (WorkerId(1), lane1)]);
        assert_eq!(metrics.totals.total_executed(), 2);
        assert_eq!(metrics.totals.expired, 1);
        assert_eq!(metrics.lanes.len(), 2);
    }

    #[test]
    fn default_metrics() {
        let m = SchedulerMetrics::default();
        assert_eq!(m.batches, 0);
        assert_eq!(m.live_tasks, 0);
        assert!(m.totals.tasks_executed.is_empty());
    }
}
