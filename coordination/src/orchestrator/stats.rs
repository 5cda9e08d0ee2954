//! Orchestrator statistics. Updated only when a task reaches a terminal
//! state.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::task::{Task, TaskStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    /// Tasks that reached a terminal state
    pub total_tasks: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Mean run time of tasks that started running
    pub average_execution_ms: f64,
    pub peak_concurrency: usize,
    pub running: usize,
    pub queued: usize,
    /// Calls issued per subsystem, retries included
    pub subsystem_calls: BTreeMap<String, u64>,
    pub tasks_by_strategy: BTreeMap<String, u64>,
}

#[derive(Default)]
struct Totals {
    stats: OrchestratorStats,
    timed_tasks: u64,
    total_execution_ms: u64,
}

#[derive(Default)]
pub struct StatsRecorder {
    totals: Mutex<Totals>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a finished task into the totals
    pub fn record_terminal(&self, task: &Task, calls: &BTreeMap<String, u64>) {
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        let stats = &mut totals.stats;
        match task.status {
            TaskStatus::Completed => stats.completed += 1,
            TaskStatus::Failed => stats.failed += 1,
            TaskStatus::Cancelled => stats.cancelled += 1,
            TaskStatus::Pending | TaskStatus::Running => return,
        }
        stats.total_tasks += 1;
        *stats
            .tasks_by_strategy
            .entry(task.strategy.as_str().to_string())
            .or_insert(0) += 1;
        for (name, count) in calls {
            *stats.subsystem_calls.entry(name.clone()).or_insert(0) += count;
        }

        if task.start_time.is_some() {
            totals.timed_tasks += 1;
            totals.total_execution_ms += task.duration_ms();
            totals.stats.average_execution_ms =
                totals.total_execution_ms as f64 / totals.timed_tasks as f64;
        }
    }

    /// Snapshot with the live gauges filled in
    pub fn snapshot(&self, running: usize, queued: usize, peak: usize) -> OrchestratorStats {
        let totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        OrchestratorStats {
            running,
            queued,
            peak_concurrency: peak,
            ..totals.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::ExecutionStrategy;

    #[test]
    fn test_only_terminal_tasks_count() {
        let recorder = StatsRecorder::new();
        let mut task = Task::new("q", ExecutionStrategy::Parallel);
        recorder.record_terminal(&task, &BTreeMap::new());
        assert_eq!(recorder.snapshot(0, 0, 0).total_tasks, 0);

        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        let calls = BTreeMap::from([("knowledge".to_string(), 2)]);
        recorder.record_terminal(&task, &calls);

        let stats = recorder.snapshot(1, 2, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.subsystem_calls.get("knowledge"), Some(&2));
        assert_eq!(stats.tasks_by_strategy.get("parallel"), Some(&1));
        assert_eq!((stats.running, stats.queued, stats.peak_concurrency), (1, 2, 3));
    }
}
