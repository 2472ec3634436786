use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::models::log::{
    stage_task_type, TASK_PIPELINE_CANCELLED, TASK_PIPELINE_COMPLETED, TASK_PIPELINE_ERROR,
};
use crate::models::{Job, JobStatus, LogOutcome, NewLogEntry};
use crate::pipeline::events::PipelineEvent;
use crate::pipeline::registry::{StageContext, StageDefinition, StageOutcome, StageRegistry};
use crate::pipeline::status::StatusStore;

pub const COMPLETED_MESSAGE: &str = "Video generation completed successfully";
pub const TIMED_OUT_ERROR: &str = "stage timed out";

/// How a run ended. Store failures are reported as `Err` instead.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    StageFailed { stage: String, progress: u8 },
    Faulted { stage: String, progress: u8 },
    Cancelled { progress: u8 },
}

enum StageAttempt {
    Finished(StageOutcome),
    Errored(anyhow::Error),
    TimedOut,
    Panicked(String),
    Cancelled,
}

/// Walks the registry for one job, one stage at a time.
pub struct PipelineRunner {
    registry: Arc<StageRegistry>,
    status: StatusStore,
    event_tx: broadcast::Sender<PipelineEvent>,
    stage_timeout: Option<Duration>,
}

impl PipelineRunner {
    pub fn new(
        registry: Arc<StageRegistry>,
        status: StatusStore,
        event_tx: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            registry,
            status,
            event_tx,
            stage_timeout: None,
        }
    }

    /// Bound each stage's execution. `None` waits forever.
    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Execute every stage for `job_id`. The job must already have been
    /// admitted by the dispatcher. Stage failures and faults end in a FAILED
    /// job and an `Ok` outcome; a failed store write aborts the run with `Err`
    /// after a best-effort attempt to mark the job FAILED.
    pub async fn run(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<RunOutcome, PipelineError> {
        let mut progress: u8 = 0;

        match self
            .execute(job_id, run_id, &mut cancel_rx, &mut progress)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(
                    "Run {} for job {} aborted by store failure: {}",
                    run_id,
                    job_id,
                    e
                );
                self.abort(job_id, run_id, progress, &e).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        cancel_rx: &mut watch::Receiver<bool>,
        progress: &mut u8,
    ) -> Result<RunOutcome, PipelineError> {
        let stages = self.registry.stages();
        tracing::info!("Running {} stages for job {} (run {})", stages.len(), job_id, run_id);

        for (index, stage) in stages.iter().enumerate() {
            let step_number = index + 1;

            if *cancel_rx.borrow() {
                return self
                    .finish_cancelled(job_id, run_id, stage, step_number, *progress)
                    .await;
            }

            self.status
                .update_status(job_id, stage.status, *progress, stage.description.clone())
                .await?;
            self.emit(PipelineEvent::StageStarted {
                job_id,
                run_id,
                stage: stage.name.clone(),
                status: stage.status,
                progress: *progress,
                timestamp: Utc::now(),
            });
            tracing::debug!("Job {} entering stage '{}' at {}%", job_id, stage.name, progress);

            // Fresh snapshot so the stage sees artifacts written by earlier ones.
            let job = self.status.get_job(job_id).await?;
            let ctx = StageContext::new(job_id, &stage.name, self.status.job_store());

            let started = Instant::now();
            let attempt = self.invoke(stage, &job, &ctx, cancel_rx).await;
            let execution_time_ms = started.elapsed().as_millis() as u64;

            let (success, result) = match attempt {
                StageAttempt::Finished(outcome) => (outcome.success, outcome.detail),
                StageAttempt::Errored(e) => (false, json!({ "error": format!("{:#}", e) })),
                StageAttempt::TimedOut => (false, json!({ "error": TIMED_OUT_ERROR })),
                StageAttempt::Panicked(message) => {
                    return self
                        .finish_faulted(job_id, run_id, stage, step_number, *progress, message)
                        .await;
                }
                StageAttempt::Cancelled => {
                    return self
                        .finish_cancelled(job_id, run_id, stage, step_number, *progress)
                        .await;
                }
            };

            let outcome = if success {
                LogOutcome::Completed
            } else {
                LogOutcome::Failed
            };
            self.status
                .append_log(
                    NewLogEntry::new(
                        job_id,
                        stage_task_type(&stage.name),
                        outcome,
                        stage.description.clone(),
                    )
                    .with_run(run_id)
                    .with_detail(json!({
                        "execution_time_ms": execution_time_ms,
                        "step_number": step_number,
                        "result": result,
                    }))
                    .with_execution_time(execution_time_ms),
                )
                .await?;
            self.emit(PipelineEvent::StageFinished {
                job_id,
                run_id,
                stage: stage.name.clone(),
                success,
                execution_time_ms,
                timestamp: Utc::now(),
            });

            if !success {
                let message = format!("Step '{}' failed", stage.name);
                tracing::warn!("Job {}: {} at {}%", job_id, message, progress);
                self.status
                    .update_status(job_id, JobStatus::Failed, *progress, message.clone())
                    .await?;
                self.emit(PipelineEvent::RunFailed {
                    job_id,
                    run_id,
                    progress: *progress,
                    error: message,
                    timestamp: Utc::now(),
                });
                return Ok(RunOutcome::StageFailed {
                    stage: stage.name.clone(),
                    progress: *progress,
                });
            }

            *progress = progress.saturating_add(stage.weight).min(100);
        }

        self.status
            .update_status(job_id, JobStatus::Completed, 100, COMPLETED_MESSAGE)
            .await?;
        *progress = 100;
        self.status
            .append_log(
                NewLogEntry::new(
                    job_id,
                    TASK_PIPELINE_COMPLETED,
                    LogOutcome::Completed,
                    "All pipeline steps completed successfully",
                )
                .with_run(run_id)
                .with_detail(json!({ "total_steps": stages.len() })),
            )
            .await?;
        self.emit(PipelineEvent::RunCompleted {
            job_id,
            run_id,
            timestamp: Utc::now(),
        });
        tracing::info!("Job {} completed (run {})", job_id, run_id);

        Ok(RunOutcome::Completed)
    }

    /// Run one executor, racing it against cancellation and the optional
    /// timeout. A panic inside the executor is caught here.
    async fn invoke(
        &self,
        stage: &StageDefinition,
        job: &Job,
        ctx: &StageContext,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> StageAttempt {
        let guarded = AssertUnwindSafe(stage.executor.run(job, ctx)).catch_unwind();
        let bounded = async {
            match self.stage_timeout {
                Some(limit) => tokio::time::timeout(limit, guarded).await.ok(),
                None => Some(guarded.await),
            }
        };

        tokio::select! {
            result = bounded => match result {
                None => StageAttempt::TimedOut,
                Some(Ok(Ok(outcome))) => StageAttempt::Finished(outcome),
                Some(Ok(Err(e))) => StageAttempt::Errored(e),
                Some(Err(payload)) => StageAttempt::Panicked(panic_message(payload.as_ref())),
            },
            Ok(()) = cancel_rx.changed() => StageAttempt::Cancelled,
        }
    }

    async fn finish_faulted(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        stage: &StageDefinition,
        step_number: usize,
        progress: u8,
        message: String,
    ) -> Result<RunOutcome, PipelineError> {
        tracing::error!("Stage '{}' of job {} panicked: {}", stage.name, job_id, message);

        self.status
            .append_log(
                NewLogEntry::new(
                    job_id,
                    TASK_PIPELINE_ERROR,
                    LogOutcome::Failed,
                    format!("Unexpected error in pipeline: {}", message),
                )
                .with_run(run_id)
                .with_detail(json!({
                    "error": message,
                    "error_type": "panic",
                    "stage": stage.name,
                    "step_number": step_number,
                })),
            )
            .await?;
        self.status
            .update_status(
                job_id,
                JobStatus::Failed,
                progress,
                format!("Pipeline failed: {}", message),
            )
            .await?;
        self.emit(PipelineEvent::RunFailed {
            job_id,
            run_id,
            progress,
            error: message,
            timestamp: Utc::now(),
        });

        Ok(RunOutcome::Faulted {
            stage: stage.name.clone(),
            progress,
        })
    }

    async fn finish_cancelled(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        stage: &StageDefinition,
        step_number: usize,
        progress: u8,
    ) -> Result<RunOutcome, PipelineError> {
        tracing::warn!("Run {} for job {} cancelled during '{}'", run_id, job_id, stage.name);

        self.status
            .append_log(
                NewLogEntry::new(
                    job_id,
                    TASK_PIPELINE_CANCELLED,
                    LogOutcome::Failed,
                    "Pipeline cancelled",
                )
                .with_run(run_id)
                .with_detail(json!({
                    "stage": stage.name,
                    "step_number": step_number,
                })),
            )
            .await?;
        self.status
            .update_status(job_id, JobStatus::Failed, progress, "Pipeline cancelled")
            .await?;
        self.emit(PipelineEvent::RunFailed {
            job_id,
            run_id,
            progress,
            error: "cancelled".to_string(),
            timestamp: Utc::now(),
        });

        Ok(RunOutcome::Cancelled { progress })
    }

    /// Best effort: the store just failed, so these writes may fail too.
    async fn abort(&self, job_id: Uuid, run_id: Uuid, progress: u8, error: &PipelineError) {
        let entry = NewLogEntry::new(
            job_id,
            TASK_PIPELINE_ERROR,
            LogOutcome::Failed,
            format!("Unexpected error in pipeline: {}", error),
        )
        .with_run(run_id)
        .with_detail(json!({
            "error": error.to_string(),
            "error_type": "store_unavailable",
        }));
        if let Err(e) = self.status.append_log(entry).await {
            tracing::error!("Failed to record pipeline error for job {}: {}", job_id, e);
        }
        if let Err(e) = self
            .status
            .update_status(
                job_id,
                JobStatus::Failed,
                progress,
                format!("Pipeline failed: {}", error),
            )
            .await
        {
            tracing::error!("Failed to mark job {} as failed: {}", job_id, e);
        }
        self.emit(PipelineEvent::RunFailed {
            job_id,
            run_id,
            progress,
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
