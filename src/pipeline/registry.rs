use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::{Job, JobStatus};
use crate::storage::JobStore;

/// What a stage executor reports back to the runner.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub success: bool,
    pub detail: Value,
}

impl StageOutcome {
    pub fn ok(detail: Value) -> Self {
        Self {
            success: true,
            detail,
        }
    }

    pub fn failed(detail: Value) -> Self {
        Self {
            success: false,
            detail,
        }
    }
}

/// Handle a stage uses to record its artifacts on the job. It can only
/// write artifacts owned by the stage it was created for.
#[derive(Clone)]
pub struct StageContext {
    job_id: Uuid,
    stage: String,
    job_store: Arc<dyn JobStore>,
}

impl StageContext {
    pub fn new(job_id: Uuid, stage: &str, job_store: Arc<dyn JobStore>) -> Self {
        Self {
            job_id,
            stage: stage.to_string(),
            job_store,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub async fn put_artifact(&self, key: &str, value: impl Into<String>) -> anyhow::Result<()> {
        self.job_store
            .set_artifact(self.job_id, &self.stage, key, value.into())
            .await?;
        Ok(())
    }
}

/// The work behind one stage. `Err` is a stage failure; panics are treated
/// as faults by the runner.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn run(&self, job: &Job, ctx: &StageContext) -> anyhow::Result<StageOutcome>;
}

#[derive(Clone)]
pub struct StageDefinition {
    pub name: String,
    pub description: String,
    /// Status the job holds while this stage runs.
    pub status: JobStatus,
    pub weight: u8,
    pub executor: Arc<dyn StageExecutor>,
}

impl StageDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        status: JobStatus,
        weight: u8,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            status,
            weight,
            executor,
        }
    }
}

impl std::fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("weight", &self.weight)
            .finish()
    }
}

/// Ordered, validated list of stages. Built once at startup.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: Vec<StageDefinition>,
}

impl StageRegistry {
    pub fn new(stages: Vec<StageDefinition>) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::Validation(
                "Stage registry must contain at least one stage".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut statuses = HashSet::new();
        let mut total: u32 = 0;

        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(PipelineError::Validation(
                    "Stage name cannot be empty".to_string(),
                ));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "Duplicate stage name '{}'",
                    stage.name
                )));
            }
            if !stage.status.is_processing() {
                return Err(PipelineError::Validation(format!(
                    "Stage '{}' uses non-intermediate status '{}'",
                    stage.name, stage.status
                )));
            }
            if !statuses.insert(stage.status) {
                return Err(PipelineError::Validation(format!(
                    "Status '{}' is used by more than one stage",
                    stage.status
                )));
            }
            if stage.weight == 0 {
                return Err(PipelineError::Validation(format!(
                    "Stage '{}' must have a positive weight",
                    stage.name
                )));
            }
            total += u32::from(stage.weight);
        }

        if total != 100 {
            return Err(PipelineError::Validation(format!(
                "Stage weights must sum to 100, got {}",
                total
            )));
        }

        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Status a job enters when a run is admitted.
    pub fn first_status(&self) -> JobStatus {
        self.stages[0].status
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn total_weight(&self) -> u32 {
        self.stages.iter().map(|s| u32::from(s.weight)).sum()
    }
}
