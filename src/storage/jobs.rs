use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::job::validate_new_job;
use crate::models::{Job, JobStatus, NewJob};
use crate::storage::{apply_artifact, apply_begin_run, check_unique, new_pending_job, JobStore};

pub struct JsonJobStore {
    file_path: PathBuf,
    cache: RwLock<Vec<Job>>,
}

impl JsonJobStore {
    /// Create a new JsonJobStore, loading existing data from disk if present.
    ///
    /// If `jobs.json` is corrupted (invalid JSON), creates a backup at
    /// `jobs.json.bak`, logs a warning, and starts with an empty job list.
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .context("Failed to create data directory")?;

        let file_path = data_dir.join("jobs.json");

        let jobs = if file_path.exists() {
            let content = tokio::fs::read_to_string(&file_path)
                .await
                .context("Failed to read jobs.json")?;
            match serde_json::from_str::<Vec<Job>>(&content) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(
                        "jobs.json is corrupted ({}), creating backup and starting empty",
                        e
                    );
                    let backup_path = data_dir.join("jobs.json.bak");
                    if let Err(backup_err) = tokio::fs::copy(&file_path, &backup_path).await {
                        tracing::error!(
                            "Failed to create backup of corrupted jobs.json: {}",
                            backup_err
                        );
                    }
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Ok(Self {
            file_path,
            cache: RwLock::new(jobs),
        })
    }

    /// Atomically write the jobs cache to disk.
    /// Writes to a .tmp file first, then renames to the actual file.
    async fn persist(&self, jobs: &[Job]) -> Result<()> {
        let tmp_path = self.file_path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(jobs).context("Failed to serialize jobs")?;

        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .context("Failed to write temporary jobs file")?;

        tokio::fs::rename(&tmp_path, &self.file_path)
            .await
            .context("Failed to rename temporary jobs file")?;

        Ok(())
    }

    /// Mutate one job under the write lock and persist. The cache is only
    /// changed if the mutation succeeds and the write reaches disk.
    async fn modify<F>(&self, id: Uuid, mutate: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> std::result::Result<(), PipelineError> + Send,
    {
        let mut cache = self.cache.write().await;

        let idx = cache
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| PipelineError::NotFound(format!("Job with id '{}' not found", id)))?;

        let mut updated = cache[idx].clone();
        mutate(&mut updated)?;

        let previous = std::mem::replace(&mut cache[idx], updated.clone());
        if let Err(e) = self.persist(&cache).await {
            cache[idx] = previous;
            return Err(e);
        }

        Ok(updated)
    }
}

#[async_trait]
impl JobStore for JsonJobStore {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let cache = self.cache.read().await;
        Ok(cache.clone())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let cache = self.cache.read().await;
        Ok(cache.iter().find(|j| j.id == id).cloned())
    }

    async fn create_job(&self, new: NewJob) -> Result<Job> {
        validate_new_job(&new)?;

        let mut cache = self.cache.write().await;
        check_unique(&cache, &new)?;

        let job = new_pending_job(new);
        cache.push(job.clone());
        if let Err(e) = self.persist(&cache).await {
            cache.pop();
            return Err(e);
        }

        Ok(job)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        progress: u8,
        message: Option<String>,
    ) -> Result<Job> {
        self.modify(id, move |job| {
            job.status = status;
            job.progress = progress.min(100);
            if message.is_some() {
                job.message = message;
            }
            job.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn begin_run(
        &self,
        id: Uuid,
        regenerate: bool,
        first_status: JobStatus,
        message: String,
    ) -> Result<Job> {
        self.modify(id, move |job| {
            apply_begin_run(job, regenerate, first_status, message)
        })
        .await
    }

    async fn set_artifact(&self, id: Uuid, stage: &str, key: &str, value: String) -> Result<Job> {
        self.modify(id, |job| apply_artifact(job, stage, key, value))
            .await
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        let mut cache = self.cache.write().await;

        let idx = cache
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| PipelineError::NotFound(format!("Job with id '{}' not found", id)))?;

        if cache[idx].status.is_processing() {
            return Err(PipelineError::Conflict(format!(
                "Job '{}' is being processed and cannot be deleted",
                id
            ))
            .into());
        }

        let removed = cache.remove(idx);
        if let Err(e) = self.persist(&cache).await {
            cache.insert(idx, removed);
            return Err(e);
        }

        Ok(())
    }
}
