//! Scripted executors and instrumented stores shared by the pipeline tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::models::{Job, JobStatus, LogEntry, NewJob, NewLogEntry};
use crate::pipeline::events::PipelineEvent;
use crate::pipeline::registry::{
    StageContext, StageDefinition, StageExecutor, StageOutcome, StageRegistry,
};
use crate::pipeline::runner::PipelineRunner;
use crate::pipeline::status::StatusStore;
use crate::storage::memory::{InMemoryJobStore, InMemoryLogStore};
use crate::storage::{JobStore, LogStore};

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    Fail,
    Error(&'static str),
    Panic,
    Hang,
    Sleep(u64),
    RequireArtifacts(&'static [&'static str]),
}

pub struct ScriptedStage {
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl StageExecutor for ScriptedStage {
    async fn run(&self, job: &Job, ctx: &StageContext) -> Result<StageOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed => {}
            Behavior::Fail => return Ok(StageOutcome::failed(json!({ "reason": "scripted" }))),
            Behavior::Error(message) => return Err(anyhow!(message)),
            Behavior::Panic => panic!("scripted panic"),
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Sleep(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            Behavior::RequireArtifacts(keys) => {
                if let Some(missing) = keys.iter().find(|k| job.artifact(k).is_none()) {
                    return Ok(StageOutcome::failed(json!({ "missing": missing })));
                }
            }
        }
        ctx.put_artifact(ctx.stage(), format!("{} output", ctx.stage()))
            .await?;
        Ok(StageOutcome::ok(json!({ "stage": ctx.stage() })))
    }
}

pub const STAGE_NAMES: [&str; 5] = ["script", "images", "audio", "subtitles", "video"];

pub fn all_succeed() -> [Behavior; 5] {
    [Behavior::Succeed; 5]
}

/// Registry shaped like the production one: weights 20/25/20/15/20.
pub fn registry(behaviors: [Behavior; 5]) -> (StageRegistry, Vec<Arc<AtomicUsize>>) {
    let statuses = [
        JobStatus::GeneratingScript,
        JobStatus::GeneratingImages,
        JobStatus::GeneratingAudio,
        JobStatus::AddingSubtitles,
        JobStatus::ComposingVideo,
    ];
    let weights = [20u8, 25, 20, 15, 20];

    let mut calls = Vec::new();
    let mut stages = Vec::new();
    for i in 0..5 {
        let counter = Arc::new(AtomicUsize::new(0));
        calls.push(Arc::clone(&counter));
        stages.push(StageDefinition::new(
            STAGE_NAMES[i],
            format!("Running {}...", STAGE_NAMES[i]),
            statuses[i],
            weights[i],
            Arc::new(ScriptedStage {
                behavior: behaviors[i],
                calls: counter,
            }),
        ));
    }
    (StageRegistry::new(stages).expect("valid registry"), calls)
}

/// Job store that remembers every (status, progress) it was asked to write.
#[derive(Default)]
pub struct RecordingJobStore {
    inner: InMemoryJobStore,
    updates: Mutex<HashMap<Uuid, Vec<(JobStatus, u8)>>>,
}

impl RecordingJobStore {
    pub async fn progress_updates(&self, id: Uuid) -> Vec<(JobStatus, u8)> {
        self.updates
            .lock()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    async fn record(&self, id: Uuid, status: JobStatus, progress: u8) {
        self.updates
            .lock()
            .await
            .entry(id)
            .or_default()
            .push((status, progress));
    }
}

#[async_trait]
impl JobStore for RecordingJobStore {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.inner.list_jobs().await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn create_job(&self, new: NewJob) -> Result<Job> {
        self.inner.create_job(new).await
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        progress: u8,
        message: Option<String>,
    ) -> Result<Job> {
        let job = self.inner.update_status(id, status, progress, message).await?;
        self.record(id, job.status, job.progress).await;
        Ok(job)
    }

    async fn begin_run(
        &self,
        id: Uuid,
        regenerate: bool,
        first_status: JobStatus,
        message: String,
    ) -> Result<Job> {
        let job = self
            .inner
            .begin_run(id, regenerate, first_status, message)
            .await?;
        self.record(id, job.status, job.progress).await;
        Ok(job)
    }

    async fn set_artifact(&self, id: Uuid, stage: &str, key: &str, value: String) -> Result<Job> {
        self.inner.set_artifact(id, stage, key, value).await
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        self.inner.delete_job(id).await
    }
}

/// Log store whose appends fail for one task type.
pub struct FailingLogStore {
    inner: InMemoryLogStore,
    fail_task: String,
}

#[async_trait]
impl LogStore for FailingLogStore {
    async fn append_log(&self, entry: NewLogEntry) -> Result<LogEntry> {
        if entry.task_type == self.fail_task {
            return Err(anyhow!("disk full"));
        }
        self.inner.append_log(entry).await
    }

    async fn append_logs(&self, entries: Vec<NewLogEntry>) -> Result<Vec<LogEntry>> {
        if entries.iter().any(|e| e.task_type == self.fail_task) {
            return Err(anyhow!("disk full"));
        }
        self.inner.append_logs(entries).await
    }

    async fn logs_for_job(&self, job_id: Uuid) -> Result<Vec<LogEntry>> {
        self.inner.logs_for_job(job_id).await
    }

    async fn delete_logs(&self, job_id: Uuid) -> Result<()> {
        self.inner.delete_logs(job_id).await
    }
}

pub struct Harness {
    pub registry: Arc<StageRegistry>,
    pub status: StatusStore,
    pub jobs: Arc<RecordingJobStore>,
    pub event_tx: broadcast::Sender<PipelineEvent>,
    pub runner: Arc<PipelineRunner>,
    calls: Vec<Arc<AtomicUsize>>,
}

impl Harness {
    pub async fn create_job(&self, title: &str) -> Job {
        self.status
            .create_job(NewJob {
                title: title.to_string(),
                episode_number: 1,
                script: None,
            })
            .await
            .expect("create job")
    }

    /// How many times stage `index` was invoked.
    pub fn calls(&self, index: usize) -> usize {
        self.calls[index].load(Ordering::SeqCst)
    }

    pub async fn wait_for_status(&self, id: Uuid, status: JobStatus) -> Job {
        for _ in 0..500 {
            let job = self.status.get_job(id).await.expect("job");
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }
}

fn build(
    behaviors: [Behavior; 5],
    logs: Arc<dyn LogStore>,
    timeout: Option<Duration>,
) -> Harness {
    let (registry, calls) = registry(behaviors);
    let registry = Arc::new(registry);
    let jobs = Arc::new(RecordingJobStore::default());
    let status = StatusStore::new(jobs.clone(), logs);
    let (event_tx, _) = broadcast::channel(256);
    let runner = Arc::new(
        PipelineRunner::new(Arc::clone(&registry), status.clone(), event_tx.clone())
            .with_stage_timeout(timeout),
    );
    Harness {
        registry,
        status,
        jobs,
        event_tx,
        runner,
        calls,
    }
}

pub fn harness(behaviors: [Behavior; 5]) -> Harness {
    build(behaviors, Arc::new(InMemoryLogStore::new()), None)
}

pub fn harness_with_timeout(behaviors: [Behavior; 5], timeout: Duration) -> Harness {
    build(behaviors, Arc::new(InMemoryLogStore::new()), Some(timeout))
}

pub fn harness_with_failing_log(behaviors: [Behavior; 5], fail_task: &str) -> Harness {
    let logs = Arc::new(FailingLogStore {
        inner: InMemoryLogStore::new(),
        fail_task: fail_task.to_string(),
    });
    build(behaviors, logs, None)
}
