use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TASK_JOB_CREATED: &str = "job_created";
pub const TASK_PIPELINE_STARTED: &str = "pipeline_started";
pub const TASK_PIPELINE_COMPLETED: &str = "pipeline_completed";
pub const TASK_PIPELINE_ERROR: &str = "pipeline_error";
pub const TASK_PIPELINE_CANCELLED: &str = "pipeline_cancelled";
pub const TASK_PIPELINE_INTERRUPTED: &str = "pipeline_interrupted";

/// Task type recorded for a stage's own log entry.
pub fn stage_task_type(stage: &str) -> String {
    format!("step_{}", stage)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Processing,
    Completed,
    Failed,
}

/// Immutable audit record. `seq` is assigned by the store and orders entries
/// of one job in append order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub task_type: String,
    pub outcome: LogOutcome,
    pub message: String,
    #[serde(default)]
    pub detail: serde_json::Value,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewLogEntry {
    pub job_id: Uuid,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub task_type: String,
    pub outcome: LogOutcome,
    pub message: String,
    #[serde(default)]
    pub detail: serde_json::Value,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
}

impl NewLogEntry {
    pub fn new(
        job_id: Uuid,
        task_type: impl Into<String>,
        outcome: LogOutcome,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            run_id: None,
            task_type: task_type.into(),
            outcome,
            message: message.into(),
            detail: serde_json::Value::Null,
            execution_time_ms: None,
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.execution_time_ms = Some(ms);
        self
    }

    /// Stamp the entry with the identity the store assigns.
    pub fn into_entry(self, seq: u64, created_at: DateTime<Utc>) -> LogEntry {
        LogEntry {
            id: Uuid::now_v7(),
            job_id: self.job_id,
            seq,
            run_id: self.run_id,
            task_type: self.task_type,
            outcome: self.outcome,
            message: self.message,
            detail: self.detail,
            execution_time_ms: self.execution_time_ms,
            created_at,
        }
    }
}

/// Aggregate counts for one task type of one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatistics {
    pub task_type: String,
    pub total: usize,
    pub completed: usize,
    pub avg_execution_time_ms: f64,
}

/// Group entries by task type, in order of first appearance.
pub fn compute_statistics(entries: &[LogEntry]) -> Vec<TaskStatistics> {
    let mut stats: Vec<(TaskStatistics, u64, usize)> = Vec::new();
    for entry in entries {
        let idx = match stats.iter().position(|(s, _, _)| s.task_type == entry.task_type) {
            Some(idx) => idx,
            None => {
                stats.push((
                    TaskStatistics {
                        task_type: entry.task_type.clone(),
                        total: 0,
                        completed: 0,
                        avg_execution_time_ms: 0.0,
                    },
                    0,
                    0,
                ));
                stats.len() - 1
            }
        };
        let (stat, time_sum, timed) = &mut stats[idx];
        stat.total += 1;
        if entry.outcome == LogOutcome::Completed {
            stat.completed += 1;
        }
        if let Some(ms) = entry.execution_time_ms {
            *time_sum += ms;
            *timed += 1;
        }
    }

    stats
        .into_iter()
        .map(|(mut stat, time_sum, timed)| {
            if timed > 0 {
                stat.avg_execution_time_ms = time_sum as f64 / timed as f64;
            }
            stat
        })
        .collect()
}
