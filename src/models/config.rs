use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Root for stage outputs. Defaults to `<data_dir>/media`.
    #[serde(default)]
    pub media_dir: Option<PathBuf>,
    #[serde(default = "default_stage_delay_ms")]
    pub stage_delay_ms: u64,
    /// Per-stage timeout; 0 disables it.
    #[serde(default)]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8390
}

fn default_stage_delay_ms() -> u64 {
    500
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl ServiceConfig {
    /// Resolve the media root, falling back to `<data_dir>/media`.
    pub fn media_root(&self, data_dir: &std::path::Path) -> PathBuf {
        self.media_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("media"))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
            media_dir: None,
            stage_delay_ms: default_stage_delay_ms(),
            stage_timeout_secs: 0,
            broadcast_capacity: default_broadcast_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}
