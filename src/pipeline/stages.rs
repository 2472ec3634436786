//! The five built-in stages. They stand in for external generation services:
//! each waits for the configured delay, then writes placeholder files under
//! the media root and records where it put them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::errors::PipelineError;
use crate::models::{Job, JobStatus};
use crate::pipeline::registry::{
    StageContext, StageDefinition, StageExecutor, StageOutcome, StageRegistry,
};

pub const STAGE_SCRIPT: &str = "generate_script";
pub const STAGE_IMAGES: &str = "generate_images";
pub const STAGE_AUDIO: &str = "generate_audio";
pub const STAGE_SUBTITLES: &str = "add_subtitles";
pub const STAGE_VIDEO: &str = "compose_video";

pub const ARTIFACT_SCRIPT: &str = "script";
pub const ARTIFACT_IMAGES_DIR: &str = "images_dir";
pub const ARTIFACT_AUDIO: &str = "audio";
pub const ARTIFACT_SUBTITLES: &str = "subtitles";
pub const ARTIFACT_VIDEO: &str = "video";
pub const ARTIFACT_THUMBNAIL: &str = "thumbnail";

const DEFAULT_SCRIPT: &str = "Scene 1: Introduction
Character A: Welcome to our animated story.
Character B: Today we'll embark on an exciting journey.

Scene 2: Development
Character A: Every frame tells a story.
Character B: And every story has its own magic.

Scene 3: Conclusion
Character A: What an amazing adventure we had!
Character B: Until our next creative journey!";

const SUBTITLE_LINES: [&str; 6] = [
    "Welcome to our animated story.",
    "Today we'll embark on an exciting journey.",
    "Every frame tells a story.",
    "And every story has its own magic.",
    "What an amazing adventure we had!",
    "Until our next creative journey!",
];

const SOUND_EFFECTS: [&str; 3] = ["intro_sound.mp3", "transition.mp3", "outro.mp3"];

const VIDEO_DURATION_SECS: u64 = 18;

/// Where the built-in stages write and how long each pretends to work.
#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub root: PathBuf,
    pub delay: Duration,
}

impl MediaSettings {
    pub fn new(root: PathBuf, delay: Duration) -> Self {
        Self { root, delay }
    }

    fn job_dir(&self, kind: &str, job: &Job) -> PathBuf {
        self.root.join(kind).join(job.id.to_string())
    }

    async fn simulate_work(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

async fn write_file(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {:?}", path))
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Scene headings in a script, e.g. "Scene 2: Development" yields "development".
fn scene_names(script: &str) -> Vec<String> {
    let scenes: Vec<String> = script
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Scene "))
        .map(|rest| {
            rest.split_once(':')
                .map(|(_, title)| title.trim())
                .filter(|title| !title.is_empty())
                .unwrap_or(rest.trim())
                .to_lowercase()
        })
        .collect();
    if scenes.is_empty() {
        vec!["main".to_string()]
    } else {
        scenes
    }
}

fn srt_timestamp(secs: u64) -> String {
    format!("{:02}:{:02}:{:02},000", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn render_srt(lines: &[&str], seconds_per_line: u64) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let start = i as u64 * seconds_per_line;
            format!(
                "{}\n{} --> {}\n{}\n",
                i + 1,
                srt_timestamp(start),
                srt_timestamp(start + seconds_per_line),
                text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct ScriptStage {
    media: MediaSettings,
}

#[async_trait]
impl StageExecutor for ScriptStage {
    async fn run(&self, job: &Job, ctx: &StageContext) -> Result<StageOutcome> {
        self.media.simulate_work().await;

        let provided = job.script.is_some();
        let script = job
            .artifact(ARTIFACT_SCRIPT)
            .unwrap_or(DEFAULT_SCRIPT)
            .to_string();

        let path = self.media.job_dir("scripts", job).join("script.txt");
        write_file(&path, &script).await?;
        if !provided {
            ctx.put_artifact(ARTIFACT_SCRIPT, script.clone()).await?;
        }

        Ok(StageOutcome::ok(json!({
            "script_length": script.len(),
            "scenes": scene_names(&script).len(),
            "script_path": display(&path),
            "provided": provided,
        })))
    }
}

pub struct ImageStage {
    media: MediaSettings,
}

#[async_trait]
impl StageExecutor for ImageStage {
    async fn run(&self, job: &Job, ctx: &StageContext) -> Result<StageOutcome> {
        let script = job.artifact(ARTIFACT_SCRIPT).unwrap_or(DEFAULT_SCRIPT);
        let image_dir = self.media.job_dir("images", job);

        let mut images = Vec::new();
        for (i, scene) in scene_names(script).iter().enumerate() {
            self.media.simulate_work().await;
            let path = image_dir.join(format!("scene_{}.jpg", i + 1));
            write_file(&path, format!("Placeholder for {}", scene)).await?;
            images.push(json!({
                "scene": scene,
                "path": display(&path),
                "size": "1920x1080",
            }));
        }

        ctx.put_artifact(ARTIFACT_IMAGES_DIR, display(&image_dir))
            .await?;

        Ok(StageOutcome::ok(json!({
            "images_generated": images.len(),
            "image_dir": display(&image_dir),
            "images": images,
        })))
    }
}

pub struct AudioStage {
    media: MediaSettings,
}

#[async_trait]
impl StageExecutor for AudioStage {
    async fn run(&self, job: &Job, ctx: &StageContext) -> Result<StageOutcome> {
        self.media.simulate_work().await;

        let audio_dir = self.media.job_dir("audio", job);
        let narration = audio_dir.join("narration.mp3");
        write_file(&narration, "Placeholder audio content").await?;
        for sfx in SOUND_EFFECTS {
            write_file(&audio_dir.join(sfx), format!("Placeholder for {}", sfx)).await?;
        }

        ctx.put_artifact(ARTIFACT_AUDIO, display(&narration)).await?;

        Ok(StageOutcome::ok(json!({
            "audio_generated": true,
            "audio_dir": display(&audio_dir),
            "main_audio": display(&narration),
            "sound_effects": SOUND_EFFECTS.len(),
        })))
    }
}

pub struct SubtitleStage {
    media: MediaSettings,
}

#[async_trait]
impl StageExecutor for SubtitleStage {
    async fn run(&self, job: &Job, ctx: &StageContext) -> Result<StageOutcome> {
        self.media.simulate_work().await;

        let subtitle_dir = self.media.job_dir("subtitles", job);
        let srt_path = subtitle_dir.join("subtitles.srt");
        write_file(&srt_path, render_srt(&SUBTITLE_LINES, 3)).await?;

        let style = json!({
            "font": "Arial",
            "size": 24,
            "color": "#FFFFFF",
            "background": "#00000080",
            "position": "bottom",
        });
        let style_path = subtitle_dir.join("style.json");
        write_file(&style_path, serde_json::to_vec_pretty(&style)?).await?;

        ctx.put_artifact(ARTIFACT_SUBTITLES, display(&srt_path))
            .await?;

        Ok(StageOutcome::ok(json!({
            "subtitles_generated": true,
            "subtitle_dir": display(&subtitle_dir),
            "subtitle_file": display(&srt_path),
            "subtitle_count": SUBTITLE_LINES.len(),
            "style_config": style,
        })))
    }
}

pub struct VideoStage {
    media: MediaSettings,
}

#[async_trait]
impl StageExecutor for VideoStage {
    async fn run(&self, job: &Job, ctx: &StageContext) -> Result<StageOutcome> {
        let missing: Vec<&str> = [ARTIFACT_AUDIO, ARTIFACT_IMAGES_DIR]
            .into_iter()
            .filter(|key| job.artifact(key).is_none())
            .collect();
        if !missing.is_empty() {
            return Ok(StageOutcome::failed(json!({
                "error": "missing inputs for composition",
                "missing": missing,
            })));
        }

        self.media.simulate_work().await;

        let video_dir = self.media.root.join("videos");
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let video_path = video_dir.join(format!("episode_{}_{}.mp4", job.id, timestamp));
        write_file(
            &video_path,
            format!("Video content for episode {} of '{}'", job.episode_number, job.title),
        )
        .await?;

        let thumbnail_path = video_dir.join(format!("thumb_{}.jpg", job.id));
        write_file(&thumbnail_path, "Thumbnail placeholder").await?;

        ctx.put_artifact(ARTIFACT_VIDEO, display(&video_path)).await?;
        ctx.put_artifact(ARTIFACT_THUMBNAIL, display(&thumbnail_path))
            .await?;

        Ok(StageOutcome::ok(json!({
            "video_composed": true,
            "video_path": display(&video_path),
            "thumbnail_path": display(&thumbnail_path),
            "duration_seconds": VIDEO_DURATION_SECS,
            "resolution": "1920x1080",
            "format": "mp4",
        })))
    }
}

/// The production pipeline: script, images, audio, subtitles, video.
pub fn standard_registry(media: MediaSettings) -> Result<StageRegistry, PipelineError> {
    StageRegistry::new(vec![
        StageDefinition::new(
            STAGE_SCRIPT,
            "Generating script...",
            JobStatus::GeneratingScript,
            20,
            Arc::new(ScriptStage {
                media: media.clone(),
            }),
        ),
        StageDefinition::new(
            STAGE_IMAGES,
            "Generating images...",
            JobStatus::GeneratingImages,
            25,
            Arc::new(ImageStage {
                media: media.clone(),
            }),
        ),
        StageDefinition::new(
            STAGE_AUDIO,
            "Generating audio...",
            JobStatus::GeneratingAudio,
            20,
            Arc::new(AudioStage {
                media: media.clone(),
            }),
        ),
        StageDefinition::new(
            STAGE_SUBTITLES,
            "Adding subtitles...",
            JobStatus::AddingSubtitles,
            15,
            Arc::new(SubtitleStage {
                media: media.clone(),
            }),
        ),
        StageDefinition::new(
            STAGE_VIDEO,
            "Composing video...",
            JobStatus::ComposingVideo,
            20,
            Arc::new(VideoStage { media }),
        ),
    ])
}
