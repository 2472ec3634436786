use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::JobStatus;

/// Progress notifications published while runs execute. Delivery is best
/// effort: a send with no subscribers is dropped.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum PipelineEvent {
    RunStarted {
        job_id: Uuid,
        run_id: Uuid,
        regenerate: bool,
        timestamp: DateTime<Utc>,
    },
    StageStarted {
        job_id: Uuid,
        run_id: Uuid,
        stage: String,
        status: JobStatus,
        progress: u8,
        timestamp: DateTime<Utc>,
    },
    StageFinished {
        job_id: Uuid,
        run_id: Uuid,
        stage: String,
        success: bool,
        execution_time_ms: u64,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        job_id: Uuid,
        run_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        job_id: Uuid,
        run_id: Uuid,
        progress: u8,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            PipelineEvent::RunStarted { job_id, .. }
            | PipelineEvent::StageStarted { job_id, .. }
            | PipelineEvent::StageFinished { job_id, .. }
            | PipelineEvent::RunCompleted { job_id, .. }
            | PipelineEvent::RunFailed { job_id, .. } => *job_id,
        }
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::RunStarted { .. } => "run_started",
            PipelineEvent::StageStarted { .. } => "stage_started",
            PipelineEvent::StageFinished { .. } => "stage_finished",
            PipelineEvent::RunCompleted { .. } => "run_completed",
            PipelineEvent::RunFailed { .. } => "run_failed",
        }
    }
}
