//! In-memory stores, used by `epl serve --in-memory` and by tests.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::job::validate_new_job;
use crate::models::{Job, JobStatus, LogEntry, NewJob, NewLogEntry};
use crate::storage::{
    apply_artifact, apply_begin_run, check_unique, new_pending_job, single_job_batch, JobStore,
    LogStore,
};

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<Vec<Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: Uuid) -> PipelineError {
    PipelineError::NotFound(format!("Job with id '{}' not found", id))
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.read().await.clone())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.iter().find(|j| j.id == id).cloned())
    }

    async fn create_job(&self, new: NewJob) -> Result<Job> {
        validate_new_job(&new)?;
        let mut jobs = self.jobs.write().await;
        check_unique(&jobs, &new)?;
        let job = new_pending_job(new);
        jobs.push(job.clone());
        Ok(job)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        progress: u8,
        message: Option<String>,
    ) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| not_found(id))?;
        job.status = status;
        job.progress = progress.min(100);
        if message.is_some() {
            job.message = message;
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn begin_run(
        &self,
        id: Uuid,
        regenerate: bool,
        first_status: JobStatus,
        message: String,
    ) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| not_found(id))?;
        apply_begin_run(job, regenerate, first_status, message)?;
        Ok(job.clone())
    }

    async fn set_artifact(&self, id: Uuid, stage: &str, key: &str, value: String) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| not_found(id))?;
        apply_artifact(job, stage, key, value)?;
        Ok(job.clone())
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let idx = jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| not_found(id))?;
        if jobs[idx].status.is_processing() {
            return Err(PipelineError::Conflict(format!(
                "Job '{}' is being processed and cannot be deleted",
                id
            ))
            .into());
        }
        jobs.remove(idx);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryLogStore {
    logs: RwLock<HashMap<Uuid, Vec<LogEntry>>>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append_log(&self, entry: NewLogEntry) -> Result<LogEntry> {
        let mut logs = self.logs.write().await;
        let job_logs = logs.entry(entry.job_id).or_default();
        let seq = job_logs.last().map(|e| e.seq + 1).unwrap_or(1);
        let stored = entry.into_entry(seq, Utc::now());
        job_logs.push(stored.clone());
        Ok(stored)
    }

    async fn append_logs(&self, entries: Vec<NewLogEntry>) -> Result<Vec<LogEntry>> {
        let Some(job_id) = single_job_batch(&entries)? else {
            return Ok(Vec::new());
        };
        let mut logs = self.logs.write().await;
        let job_logs = logs.entry(job_id).or_default();
        let mut seq = job_logs.last().map(|e| e.seq + 1).unwrap_or(1);
        let now = Utc::now();
        let mut stored = Vec::with_capacity(entries.len());
        for entry in entries {
            stored.push(entry.into_entry(seq, now));
            seq += 1;
        }
        job_logs.extend(stored.iter().cloned());
        Ok(stored)
    }

    async fn logs_for_job(&self, job_id: Uuid) -> Result<Vec<LogEntry>> {
        Ok(self
            .logs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_logs(&self, job_id: Uuid) -> Result<()> {
        self.logs.write().await.remove(&job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogOutcome;

    fn new_job(title: &str, episode: u32) -> NewJob {
        NewJob {
            title: title.to_string(),
            episode_number: episode,
            script: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_job() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(new_job("Pilot", 1)).await.expect("create");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        let fetched = store.get_job(job.id).await.expect("get").expect("found");
        assert_eq!(fetched, job);
    }

    #[tokio::test]
    async fn test_duplicate_episode_conflict() {
        let store = InMemoryJobStore::new();
        store.create_job(new_job("Pilot", 1)).await.expect("create");
        let err = store.create_job(new_job("Pilot", 1)).await.unwrap_err();
        assert!(matches!(
            PipelineError::from_store(err),
            PipelineError::Conflict(_)
        ));
        store.create_job(new_job("Pilot", 2)).await.expect("other episode");
    }

    #[tokio::test]
    async fn test_update_status_not_found() {
        let store = InMemoryJobStore::new();
        let err = store
            .update_status(Uuid::now_v7(), JobStatus::Failed, 0, None)
            .await
            .unwrap_err();
        assert!(matches!(
            PipelineError::from_store(err),
            PipelineError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_update_status_keeps_message_when_none() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(new_job("Pilot", 1)).await.expect("create");
        store
            .update_status(job.id, JobStatus::GeneratingScript, 0, Some("go".into()))
            .await
            .expect("update");
        let updated = store
            .update_status(job.id, JobStatus::GeneratingImages, 20, None)
            .await
            .expect("update");
        assert_eq!(updated.message.as_deref(), Some("go"));
        assert_eq!(updated.progress, 20);
    }

    #[tokio::test]
    async fn test_begin_run_is_exclusive() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(new_job("Pilot", 1)).await.expect("create");
        store
            .begin_run(job.id, false, JobStatus::GeneratingScript, "started".into())
            .await
            .expect("first begin");
        let err = store
            .begin_run(job.id, false, JobStatus::GeneratingScript, "started".into())
            .await
            .unwrap_err();
        assert!(matches!(
            PipelineError::from_store(err),
            PipelineError::AlreadyRunning(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_processing_job_rejected() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(new_job("Pilot", 1)).await.expect("create");
        store
            .begin_run(job.id, false, JobStatus::GeneratingScript, "started".into())
            .await
            .expect("begin");
        assert!(store.delete_job(job.id).await.is_err());
        store
            .update_status(job.id, JobStatus::Failed, 0, None)
            .await
            .expect("fail");
        store.delete_job(job.id).await.expect("delete");
        assert!(store.get_job(job.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_log_seq_is_append_order() {
        let store = InMemoryLogStore::new();
        let job_id = Uuid::now_v7();
        let first = store
            .append_log(NewLogEntry::new(job_id, "a", LogOutcome::Completed, "1"))
            .await
            .expect("append");
        let batch = store
            .append_logs(vec![
                NewLogEntry::new(job_id, "b", LogOutcome::Completed, "2"),
                NewLogEntry::new(job_id, "a", LogOutcome::Failed, "3"),
            ])
            .await
            .expect("batch");
        assert_eq!(first.seq, 1);
        assert_eq!(batch[0].seq, 2);
        assert_eq!(batch[1].seq, 3);

        let latest = store
            .latest_by_type(job_id, "a")
            .await
            .expect("latest")
            .expect("found");
        assert_eq!(latest.message, "3");

        let (page, total) = store.list_logs(job_id, 2, 0).await.expect("list");
        assert_eq!(total, 3);
        assert_eq!(page[0].seq, 3);
        assert_eq!(page[1].seq, 2);
    }

    #[tokio::test]
    async fn test_batch_spanning_jobs_rejected_without_writes() {
        let store = InMemoryLogStore::new();
        let a = Uuid::now_v7();
        let result = store
            .append_logs(vec![
                NewLogEntry::new(a, "x", LogOutcome::Completed, "1"),
                NewLogEntry::new(Uuid::now_v7(), "x", LogOutcome::Completed, "2"),
            ])
            .await;
        assert!(result.is_err());
        assert!(store.logs_for_job(a).await.expect("logs").is_empty());
    }
}
