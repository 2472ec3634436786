use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, watch, Mutex};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::log::{TASK_PIPELINE_CANCELLED, TASK_PIPELINE_INTERRUPTED, TASK_PIPELINE_STARTED};
use crate::models::{Job, JobStatus, LogOutcome, NewLogEntry};
use crate::pipeline::events::PipelineEvent;
use crate::pipeline::runner::{PipelineRunner, RunOutcome};
use crate::pipeline::status::StatusStore;

pub const STARTED_MESSAGE: &str = "pipeline started";

/// Handle to an active run, allowing cancellation and joining.
pub struct RunHandle {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub join_handle: tokio::task::JoinHandle<()>,
    pub cancel_tx: watch::Sender<bool>,
}

/// Returned when a start request is admitted.
#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    pub job_id: Uuid,
    pub run_id: Uuid,
    pub status: JobStatus,
}

/// Admits start requests and runs each admitted job on its own task.
pub struct JobDispatcher {
    status: StatusStore,
    runner: Arc<PipelineRunner>,
    event_tx: broadcast::Sender<PipelineEvent>,
    active: Arc<Mutex<HashMap<Uuid, RunHandle>>>,
    /// Set once `shutdown` begins. Only flipped while `active` is locked.
    shutting_down: AtomicBool,
}

impl JobDispatcher {
    pub fn new(
        status: StatusStore,
        runner: Arc<PipelineRunner>,
        event_tx: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            status,
            runner,
            event_tx,
            active: Arc::new(Mutex::new(HashMap::new())),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn status_store(&self) -> &StatusStore {
        &self.status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    /// Validate and admit a run, then return without waiting for it.
    ///
    /// The eligibility check and the switch to the first intermediate status
    /// are one atomic store operation, so two concurrent calls for the same
    /// job admit at most one run.
    pub async fn start(&self, job_id: Uuid, regenerate: bool) -> Result<Accepted, PipelineError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::warn!("Start of job {} refused: service is shutting down", job_id);
            return Err(shutting_down_error(job_id));
        }

        let first_status = self.runner.registry().first_status();

        let job = match self
            .status
            .begin_run(job_id, regenerate, first_status, STARTED_MESSAGE)
            .await
        {
            Ok(job) => job,
            Err(e) => {
                match e.rejection() {
                    Some(reason) => {
                        tracing::warn!("Start of job {} rejected: {}", job_id, reason)
                    }
                    None => tracing::error!("Failed to admit job {}: {}", job_id, e),
                }
                return Err(e);
            }
        };

        let run_id = Uuid::now_v7();
        let started = NewLogEntry::new(
            job_id,
            TASK_PIPELINE_STARTED,
            LogOutcome::Processing,
            "Video generation pipeline started",
        )
        .with_run(run_id)
        .with_detail(json!({
            "regenerate": regenerate,
            "total_steps": self.runner.registry().len(),
        }));

        if let Err(e) = self.status.append_log(started).await {
            tracing::error!("Failed to record start of job {}: {}", job_id, e);
            // Nothing will run, so do not leave the job looking busy.
            if let Err(mark) = self
                .status
                .update_status(job_id, JobStatus::Failed, 0, format!("Pipeline failed: {}", e))
                .await
            {
                tracing::error!("Failed to mark job {} as failed: {}", job_id, mark);
            }
            return Err(e);
        }

        let _ = self.event_tx.send(PipelineEvent::RunStarted {
            job_id,
            run_id,
            regenerate,
            timestamp: Utc::now(),
        });
        tracing::info!(
            "Started run {} for job {} ('{}' episode {})",
            run_id,
            job_id,
            job.title,
            job.episode_number
        );

        // Shutdown may have begun while the run was being admitted.
        if let Err(e) = self.spawn_run(job_id, run_id).await {
            self.abandon(job_id, run_id, &e).await;
            return Err(e);
        }

        Ok(Accepted {
            job_id,
            run_id,
            status: job.status,
        })
    }

    async fn spawn_run(&self, job_id: Uuid, run_id: Uuid) -> Result<(), PipelineError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let runner = Arc::clone(&self.runner);
        let active = Arc::clone(&self.active);

        // Held across the spawn so the task's removal cannot precede the insert.
        let mut runs = self.active.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(shutting_down_error(job_id));
        }

        let join_handle = tokio::spawn(async move {
            match runner.run(job_id, run_id, cancel_rx).await {
                Ok(RunOutcome::Completed) => {}
                Ok(outcome) => tracing::info!("Run {} for job {} ended: {:?}", run_id, job_id, outcome),
                Err(e) => tracing::error!("Run {} for job {} aborted: {}", run_id, job_id, e),
            }

            let mut runs = active.lock().await;
            if runs.get(&job_id).map(|h| h.run_id) == Some(run_id) {
                runs.remove(&job_id);
            }
        });

        runs.insert(
            job_id,
            RunHandle {
                run_id,
                job_id,
                join_handle,
                cancel_tx,
            },
        );
        Ok(())
    }

    /// Close out an admitted run that was never spawned, the same way a
    /// cancelled run closes itself out.
    async fn abandon(&self, job_id: Uuid, run_id: Uuid, reason: &PipelineError) {
        tracing::warn!("Run {} for job {} not started: {}", run_id, job_id, reason);
        let cancelled = NewLogEntry::new(
            job_id,
            TASK_PIPELINE_CANCELLED,
            LogOutcome::Failed,
            "Pipeline cancelled: service is shutting down",
        )
        .with_run(run_id);
        if let Err(e) = self.status.append_log(cancelled).await {
            tracing::error!("Failed to record cancellation of job {}: {}", job_id, e);
        }
        if let Err(e) = self
            .status
            .update_status(job_id, JobStatus::Failed, 0, "Pipeline cancelled: service is shutting down")
            .await
        {
            tracing::error!("Failed to mark job {} as failed: {}", job_id, e);
        }
        let _ = self.event_tx.send(PipelineEvent::RunFailed {
            job_id,
            run_id,
            progress: 0,
            error: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Ask the active run of `job_id` to stop. Returns false if none is active.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let runs = self.active.lock().await;
        match runs.get(&job_id) {
            Some(handle) => handle.cancel_tx.send(true).is_ok(),
            None => false,
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Wait until no run is active or `timeout` elapses. Returns true when idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_count().await == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop admitting runs, give in-flight runs `grace` to finish, then
    /// cancel whatever is left and wait for those runs to record their
    /// cancellation.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let _runs = self.active.lock().await;
            self.shutting_down.store(true, Ordering::SeqCst);
        }

        if self.wait_idle(grace).await {
            return;
        }

        let job_ids: Vec<Uuid> = self.active.lock().await.keys().copied().collect();
        tracing::warn!("Cancelling {} run(s) still active at shutdown", job_ids.len());
        for job_id in job_ids {
            if !self.cancel(job_id).await {
                tracing::debug!("Run for job {} finished before it could be cancelled", job_id);
            }
        }

        let handles: Vec<RunHandle> = self.active.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.join_handle.await {
                tracing::error!("Run {} for job {} did not stop cleanly: {}", handle.run_id, handle.job_id, e);
            }
        }
    }

    /// Fail jobs left in an intermediate status by a previous process. Must
    /// run before any new run is admitted.
    pub async fn recover_interrupted(&self) -> Result<Vec<Job>, PipelineError> {
        let jobs = self
            .status
            .job_store()
            .list_jobs()
            .await
            .map_err(PipelineError::from_store)?;

        let mut recovered = Vec::new();
        for job in jobs.into_iter().filter(|j| j.status.is_processing()) {
            tracing::warn!(
                "Job {} was left in '{}' at {}%, marking failed",
                job.id,
                job.status,
                job.progress
            );
            self.status
                .append_log(
                    NewLogEntry::new(
                        job.id,
                        TASK_PIPELINE_INTERRUPTED,
                        LogOutcome::Failed,
                        "Pipeline interrupted by service restart",
                    )
                    .with_detail(json!({
                        "status": job.status,
                        "progress": job.progress,
                    })),
                )
                .await?;
            let updated = self
                .status
                .update_status(
                    job.id,
                    JobStatus::Failed,
                    job.progress,
                    "Pipeline interrupted by service restart",
                )
                .await?;
            recovered.push(updated);
        }

        Ok(recovered)
    }
}

fn shutting_down_error(job_id: Uuid) -> PipelineError {
    PipelineError::ShuttingDown(format!("job {} not started", job_id))
}
