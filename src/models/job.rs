use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::PipelineError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    GeneratingScript,
    GeneratingImages,
    GeneratingAudio,
    AddingSubtitles,
    ComposingVideo,
    Completed,
    Failed,
}

impl JobStatus {
    /// True for every status a run passes through between start and finish.
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            JobStatus::GeneratingScript
                | JobStatus::GeneratingImages
                | JobStatus::GeneratingAudio
                | JobStatus::AddingSubtitles
                | JobStatus::ComposingVideo
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::GeneratingScript => "generating_script",
            JobStatus::GeneratingImages => "generating_images",
            JobStatus::GeneratingAudio => "generating_audio",
            JobStatus::AddingSubtitles => "adding_subtitles",
            JobStatus::ComposingVideo => "composing_video",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| PipelineError::Validation(format!("Unknown job status '{}'", s)))
    }
}

/// A value produced by a stage, tagged with the stage that owns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub value: String,
    pub stage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub title: String,
    pub episode_number: u32,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(default)]
    pub message: Option<String>,
    /// Script supplied at creation. Survives every rerun.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Artifact value by key, if some stage has produced it.
    pub fn artifact(&self, key: &str) -> Option<&str> {
        self.artifacts.get(key).map(|a| a.value.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub title: String,
    pub episode_number: u32,
    /// Optional pre-written script, stored as the script stage's artifact.
    #[serde(default)]
    pub script: Option<String>,
}

/// Validate a NewJob before creation.
pub fn validate_new_job(job: &NewJob) -> Result<(), PipelineError> {
    if job.title.trim().is_empty() {
        return Err(PipelineError::Validation(
            "Job title cannot be empty".to_string(),
        ));
    }

    if job.episode_number == 0 {
        return Err(PipelineError::Validation(
            "Episode number must be at least 1".to_string(),
        ));
    }

    Ok(())
}
