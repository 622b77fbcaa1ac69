//! Read-only network statistics derived from presence and the task ledger.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::task_ledger::TaskSnapshot;
use crate::domain::presence::{NodeRole, PresenceProbe};
use crate::domain::task::{TaskRecord, TaskStatus};
use crate::ports::Snapshot;

/// Tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
}

impl TaskCounts {
    fn record(&mut self, status: TaskStatus) {
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Assigned => &mut self.assigned,
            TaskStatus::Running => &mut self.running,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Stopped => &mut self.stopped,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.pending + self.assigned + self.running + self.completed + self.failed + self.stopped
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    /// Client presences seen inside the active window.
    pub active_users: usize,
    /// Completed tasks created since UTC midnight.
    pub total_tasks_today: usize,
    pub tasks_last_hour: usize,
    /// Mean `completedAt - createdAt` of completed tasks, rounded to seconds.
    pub average_latency_secs: u64,
    pub counts: TaskCounts,
}

impl NetworkStats {
    pub fn compute(
        presence: &Snapshot,
        tasks: &TaskSnapshot,
        now: DateTime<Utc>,
        active_window: Duration,
    ) -> Self {
        let active_users = presence
            .values()
            .filter(|v| PresenceProbe::from_value(v).is_live(NodeRole::Client, now, active_window))
            .count();

        let mut counts = TaskCounts::default();
        for record in tasks.values() {
            counts.record(record.status);
        }

        let start_of_day = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc())
            .unwrap_or(now);
        let hour_ago = now - Duration::hours(1);

        let completed: Vec<&TaskRecord> = tasks
            .values()
            .filter(|r| r.status == TaskStatus::Completed)
            .collect();
        let total_tasks_today = completed.iter().filter(|r| r.created_at >= start_of_day).count();
        let tasks_last_hour = completed.iter().filter(|r| r.created_at >= hour_ago).count();

        let latencies: Vec<i64> = completed
            .iter()
            .filter_map(|r| r.completed_at.map(|done| (done - r.created_at).num_milliseconds().max(0)))
            .collect();
        let average_latency_secs = if latencies.is_empty() {
            0
        } else {
            let mean_ms = latencies.iter().sum::<i64>() as f64 / latencies.len() as f64;
            (mean_ms / 1000.0).round() as u64
        };

        Self {
            active_users,
            total_tasks_today,
            tasks_last_hour,
            average_latency_secs,
            counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{Identity, NodeId, TaskId};
    use crate::domain::task::TaskPayload;
    use chrono::TimeZone;
    use serde_json::json;
    use ulid::Ulid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap()
    }

    fn task(status: TaskStatus, created_ago: Duration, latency: Option<Duration>) -> TaskRecord {
        let created = now() - created_ago;
        let mut record = TaskRecord::new(
            Identity::new("alice"),
            NodeId::new("node-a"),
            TaskPayload::code("print(1)"),
            created,
        );
        record.status = status;
        record.completed_at = latency.map(|l| created + l);
        record
    }

    #[test]
    fn computes_counts_windows_and_latency() {
        let presence: Snapshot = [
            ("a", json!({"status": "online", "type": "client", "lastSeen": now() - Duration::minutes(2)})),
            ("b", json!({"status": "online", "type": "client", "lastSeen": now() - Duration::minutes(6)})),
            ("c", json!({"status": "idle", "type": "worker", "lastSeen": now()})),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let tasks: TaskSnapshot = [
            task(TaskStatus::Completed, Duration::minutes(10), Some(Duration::seconds(4))),
            task(TaskStatus::Completed, Duration::hours(3), Some(Duration::seconds(7))),
            task(TaskStatus::Completed, Duration::hours(13), Some(Duration::seconds(1))),
            task(TaskStatus::Pending, Duration::minutes(1), None),
            task(TaskStatus::Failed, Duration::minutes(1), None),
        ]
        .into_iter()
        .map(|r| (TaskId::from_ulid(Ulid::new()), r))
        .collect();

        let stats = NetworkStats::compute(&presence, &tasks, now(), Duration::minutes(5));

        assert_eq!(stats.active_users, 1);
        assert_eq!(stats.total_tasks_today, 2);
        assert_eq!(stats.tasks_last_hour, 1);
        assert_eq!(stats.average_latency_secs, 4);
        assert_eq!(stats.counts.completed, 3);
        assert_eq!(stats.counts.pending, 1);
        assert_eq!(stats.counts.failed, 1);
        assert_eq!(stats.counts.total(), 5);
    }

    #[test]
    fn empty_network_is_all_zero() {
        let stats = NetworkStats::compute(&Snapshot::new(), &TaskSnapshot::new(), now(), Duration::minutes(5));
        assert_eq!(stats, NetworkStats::default());
    }
}
