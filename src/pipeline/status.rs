use std::sync::Arc;

use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::log::TASK_JOB_CREATED;
use crate::models::{Job, JobStatus, LogEntry, LogOutcome, NewJob, NewLogEntry};
use crate::storage::{JobStore, LogStore};

/// Typed view of the persistence collaborator used by the pipeline. Every
/// store error comes back as a `PipelineError`; untyped failures become
/// `StoreUnavailable`. Writes are attempted once.
#[derive(Clone)]
pub struct StatusStore {
    jobs: Arc<dyn JobStore>,
    logs: Arc<dyn LogStore>,
}

impl StatusStore {
    pub fn new(jobs: Arc<dyn JobStore>, logs: Arc<dyn LogStore>) -> Self {
        Self { jobs, logs }
    }

    pub fn job_store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.jobs)
    }

    pub fn log_store(&self) -> Arc<dyn LogStore> {
        Arc::clone(&self.logs)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, PipelineError> {
        self.jobs
            .get_job(id)
            .await
            .map_err(PipelineError::from_store)?
            .ok_or_else(|| PipelineError::NotFound(format!("Job with id '{}' not found", id)))
    }

    /// Persist status and progress. Does not write a log entry.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        progress: u8,
        message: impl Into<String>,
    ) -> Result<Job, PipelineError> {
        self.jobs
            .update_status(id, status, progress, Some(message.into()))
            .await
            .map_err(PipelineError::from_store)
    }

    pub async fn begin_run(
        &self,
        id: Uuid,
        regenerate: bool,
        first_status: JobStatus,
        message: impl Into<String>,
    ) -> Result<Job, PipelineError> {
        self.jobs
            .begin_run(id, regenerate, first_status, message.into())
            .await
            .map_err(PipelineError::from_store)
    }

    pub async fn append_log(&self, entry: NewLogEntry) -> Result<LogEntry, PipelineError> {
        self.logs
            .append_log(entry)
            .await
            .map_err(PipelineError::from_store)
    }

    /// All-or-nothing.
    pub async fn append_logs(
        &self,
        entries: Vec<NewLogEntry>,
    ) -> Result<Vec<LogEntry>, PipelineError> {
        self.logs
            .append_logs(entries)
            .await
            .map_err(PipelineError::from_store)
    }

    /// Job plus its log entries in append order. Pure read.
    pub async fn job_with_logs(&self, id: Uuid) -> Result<(Job, Vec<LogEntry>), PipelineError> {
        let job = self.get_job(id).await?;
        let logs = self
            .logs
            .logs_for_job(id)
            .await
            .map_err(PipelineError::from_store)?;
        Ok((job, logs))
    }

    /// Create a pending job and record its `job_created` entry.
    pub async fn create_job(&self, new: NewJob) -> Result<Job, PipelineError> {
        let job = self
            .jobs
            .create_job(new)
            .await
            .map_err(PipelineError::from_store)?;

        self.append_log(
            NewLogEntry::new(
                job.id,
                TASK_JOB_CREATED,
                LogOutcome::Completed,
                format!("Episode {} '{}' created", job.episode_number, job.title),
            )
            .with_detail(serde_json::json!({
                "title": job.title,
                "episode_number": job.episode_number,
            })),
        )
        .await?;

        Ok(job)
    }

    /// Delete a job and cascade to its log entries.
    pub async fn delete_job(&self, id: Uuid) -> Result<(), PipelineError> {
        self.jobs
            .delete_job(id)
            .await
            .map_err(PipelineError::from_store)?;
        self.logs
            .delete_logs(id)
            .await
            .map_err(PipelineError::from_store)
    }
}
