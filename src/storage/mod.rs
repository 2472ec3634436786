pub mod jobs;
pub mod logs;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::log::compute_statistics;
use crate::models::{Job, JobStatus, LogEntry, NewJob, NewLogEntry, TaskStatistics};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn list_jobs(&self) -> Result<Vec<Job>>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;
    async fn create_job(&self, new: NewJob) -> Result<Job>;
    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        progress: u8,
        message: Option<String>,
    ) -> Result<Job>;
    /// Check-and-set used to admit a run: the eligibility check and the
    /// write of `first_status` with progress 0 happen under one lock.
    async fn begin_run(
        &self,
        id: Uuid,
        regenerate: bool,
        first_status: JobStatus,
        message: String,
    ) -> Result<Job>;
    async fn set_artifact(&self, id: Uuid, stage: &str, key: &str, value: String) -> Result<Job>;
    async fn delete_job(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append_log(&self, entry: NewLogEntry) -> Result<LogEntry>;
    /// Append all entries or none of them.
    async fn append_logs(&self, entries: Vec<NewLogEntry>) -> Result<Vec<LogEntry>>;
    /// All entries of a job in append order.
    async fn logs_for_job(&self, job_id: Uuid) -> Result<Vec<LogEntry>>;
    async fn delete_logs(&self, job_id: Uuid) -> Result<()>;

    /// Newest first, with the total count before pagination.
    async fn list_logs(
        &self,
        job_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<LogEntry>, usize)> {
        let mut entries = self.logs_for_job(job_id).await?;
        let total = entries.len();
        entries.reverse();
        Ok((entries.into_iter().skip(offset).take(limit).collect(), total))
    }

    async fn latest_by_type(&self, job_id: Uuid, task_type: &str) -> Result<Option<LogEntry>> {
        let entries = self.logs_for_job(job_id).await?;
        Ok(entries.into_iter().rev().find(|e| e.task_type == task_type))
    }

    async fn statistics(&self, job_id: Uuid) -> Result<Vec<TaskStatistics>> {
        let entries = self.logs_for_job(job_id).await?;
        Ok(compute_statistics(&entries))
    }
}

/// Eligibility rules for starting a run on `job`.
pub fn check_startable(job: &Job, regenerate: bool) -> Result<(), PipelineError> {
    if job.status.is_processing() {
        return Err(PipelineError::AlreadyRunning(format!(
            "Job '{}' is already being processed ({})",
            job.id, job.status
        )));
    }
    if job.status == JobStatus::Completed && !regenerate {
        return Err(PipelineError::AlreadyCompleted(format!(
            "Job '{}' already completed. Use regenerate to run it again.",
            job.id
        )));
    }
    Ok(())
}

/// Apply a begin-run transition in place after checking eligibility.
pub(crate) fn apply_begin_run(
    job: &mut Job,
    regenerate: bool,
    first_status: JobStatus,
    message: String,
) -> Result<(), PipelineError> {
    check_startable(job, regenerate)?;
    reset_artifacts(job);
    job.status = first_status;
    job.progress = 0;
    job.message = Some(message);
    job.updated_at = chrono::Utc::now();
    Ok(())
}

/// Record `value` under `key` unless another stage already owns the key.
pub(crate) fn apply_artifact(
    job: &mut Job,
    stage: &str,
    key: &str,
    value: String,
) -> Result<(), PipelineError> {
    if let Some(existing) = job.artifacts.get(key) {
        if existing.stage != stage {
            return Err(PipelineError::Conflict(format!(
                "Artifact '{}' is owned by stage '{}'",
                key, existing.stage
            )));
        }
    }
    job.artifacts.insert(
        key.to_string(),
        crate::models::Artifact {
            value,
            stage: stage.to_string(),
        },
    );
    job.updated_at = chrono::Utc::now();
    Ok(())
}

/// Drop everything earlier runs produced, keeping only a script supplied at
/// creation, so a run never sees stale stage outputs.
fn reset_artifacts(job: &mut Job) {
    job.artifacts.clear();
    if let Some(script) = &job.script {
        job.artifacts.insert(
            crate::pipeline::stages::ARTIFACT_SCRIPT.to_string(),
            crate::models::Artifact {
                value: script.clone(),
                stage: crate::pipeline::stages::STAGE_SCRIPT.to_string(),
            },
        );
    }
}

/// Build a fresh pending job from a validated NewJob.
pub(crate) fn new_pending_job(new: NewJob) -> Job {
    let now = chrono::Utc::now();
    let mut job = Job {
        id: Uuid::now_v7(),
        title: new.title,
        episode_number: new.episode_number,
        status: JobStatus::Pending,
        progress: 0,
        message: None,
        script: new.script,
        artifacts: Default::default(),
        created_at: now,
        updated_at: now,
    };
    reset_artifacts(&mut job);
    job
}

/// Duplicate (title, episode_number) check shared by the stores.
pub(crate) fn check_unique(jobs: &[Job], new: &NewJob) -> Result<(), PipelineError> {
    if jobs
        .iter()
        .any(|j| j.title == new.title && j.episode_number == new.episode_number)
    {
        return Err(PipelineError::Conflict(format!(
            "Episode {} of '{}' already exists",
            new.episode_number, new.title
        )));
    }
    Ok(())
}

/// Reject a batch that spans more than one job.
pub(crate) fn single_job_batch(entries: &[NewLogEntry]) -> Result<Option<Uuid>, PipelineError> {
    let Some(first) = entries.first() else {
        return Ok(None);
    };
    if entries.iter().any(|e| e.job_id != first.job_id) {
        return Err(PipelineError::Validation(
            "A log batch must belong to a single job".to_string(),
        ));
    }
    Ok(Some(first.job_id))
}
