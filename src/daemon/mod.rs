// Service bootstrap: config, data directory, PID guard, tracing, recovery
// and graceful shutdown around the HTTP server.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;

use crate::models::ServiceConfig;
use crate::pipeline::stages::{standard_registry, MediaSettings};
use crate::server::{self, AppState};
use crate::storage::jobs::JsonJobStore;
use crate::storage::logs::JsonlLogStore;
use crate::storage::memory::{InMemoryJobStore, InMemoryLogStore};
use crate::storage::{JobStore, LogStore};

const APP_DIR: &str = "episode-pipeline";
const PID_FILE_NAME: &str = "epl.pid";
const SERVICE_LOG_NAME: &str = "service.log";

// ---------------------------------------------------------------------------
// PidFile
// ---------------------------------------------------------------------------

/// Guards a data directory against a second service instance.
///
/// The file is created with `create_new`, so two processes racing for the
/// same directory cannot both win. A file naming a dead process is stale and
/// gets replaced.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn acquire(&self) -> Result<()> {
        if self.path.exists() {
            let content =
                std::fs::read_to_string(&self.path).context("Failed to read existing PID file")?;
            let existing_pid: u32 = content
                .trim()
                .parse()
                .context("Failed to parse PID from PID file")?;

            if is_process_alive(existing_pid) {
                return Err(anyhow::anyhow!(
                    "Service is already running (PID {existing_pid}). PID file: {}",
                    self.path.display()
                ));
            }

            tracing::warn!(
                "Removing stale PID file (PID {} is no longer running)",
                existing_pid
            );
            std::fs::remove_file(&self.path).context("Failed to remove stale PID file")?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .context("Failed to create PID file")?;

        let pid = std::process::id();
        write!(file, "{}", pid).context("Failed to write PID file")?;
        file.flush().context("Failed to flush PID file")?;

        tracing::info!("PID file acquired: {} (PID {})", self.path.display(), pid);
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove PID file")?;
            tracing::info!("PID file released: {}", self.path.display());
        }
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| content.trim().parse::<u32>().ok())
            .is_some_and(is_process_alive)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether a process with `pid` exists.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // signal 0 only checks for existence
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        // Without a cheap liveness check, only our own PID is known to be alive.
        pid == std::process::id()
    }
}

// ---------------------------------------------------------------------------
// Config and data directory
// ---------------------------------------------------------------------------

fn read_config(path: &Path) -> Result<ServiceConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: ServiceConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Load the service config. The first existing file wins:
///   1. `config_path` (an error if given but missing)
///   2. `$EPL_CONFIG_DIR/config.json`
///   3. platform config dir `episode-pipeline/config.json`
///   4. `<data_dir>/config.json`
///
/// With none present the defaults apply.
pub fn load_config(config_path: Option<&Path>) -> Result<ServiceConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            return read_config(path);
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    let mut candidates = Vec::new();
    if let Ok(dir) = std::env::var("EPL_CONFIG_DIR") {
        candidates.push(PathBuf::from(dir).join("config.json"));
    }
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join(APP_DIR).join("config.json"));
    }
    candidates.push(resolve_data_dir(None).join("config.json"));

    for path in candidates {
        if path.exists() {
            return read_config(&path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(ServiceConfig::default())
}

/// Resolve the data directory: `override_dir`, then `$EPL_DATA_DIR`, then
/// the platform data dir.
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Ok(d) = std::env::var("EPL_DATA_DIR") {
        return PathBuf::from(d);
    }

    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Create `data_dir` with its `logs/` subdirectory and the media root.
pub async fn create_data_dirs(data_dir: &Path, media_root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(data_dir.join("logs"))
        .await
        .context("Failed to create logs directory")?;
    tokio::fs::create_dir_all(media_root)
        .await
        .context("Failed to create media directory")?;
    tracing::debug!("Data directories ensured at: {}", data_dir.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Install the global subscriber: stderr always, plus `service.log` in the
/// data directory when it can be opened. The returned guard flushes the file
/// writer on drop and must outlive the service.
pub fn init_tracing(data_dir: &Path) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_path = data_dir.join(SERVICE_LOG_NAME);
    let file = std::fs::create_dir_all(data_dir).and_then(|_| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
    });

    match file {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);

            if tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
                .is_ok()
            {
                tracing::info!("Logging to stderr and {}", log_path.display());
            }
            Some(guard)
        }
        Err(e) => {
            if tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .try_init()
                .is_ok()
            {
                tracing::warn!(
                    "Could not open log file {}: {}. Logging to stderr only.",
                    log_path.display(),
                    e
                );
            }
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Service lifecycle
// ---------------------------------------------------------------------------

/// Build stores, registry and shared state for a resolved config.
pub async fn build_state(
    config: ServiceConfig,
    data_dir: &Path,
    in_memory: bool,
) -> Result<Arc<AppState>> {
    let (job_store, log_store): (Arc<dyn JobStore>, Arc<dyn LogStore>) = if in_memory {
        tracing::warn!("Using in-memory stores; nothing will survive a restart");
        (
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryLogStore::new()),
        )
    } else {
        (
            Arc::new(JsonJobStore::new(data_dir.to_path_buf()).await?),
            Arc::new(JsonlLogStore::new(data_dir.to_path_buf()).await?),
        )
    };

    let media = MediaSettings::new(
        config.media_root(data_dir),
        Duration::from_millis(config.stage_delay_ms),
    );
    let registry = standard_registry(media)?;

    let state_dir = (!in_memory).then(|| data_dir.to_path_buf());
    let state = AppState::build(job_store, log_store, registry, config, state_dir);

    let recovered = state.dispatcher.recover_interrupted().await?;
    if !recovered.is_empty() {
        tracing::warn!("Recovered {} interrupted job(s)", recovered.len());
    }
    Ok(state)
}

/// Serve `state` on `listener` until `shutdown` resolves, then stop taking
/// requests and give in-flight runs the configured grace period.
pub async fn serve_until<F>(
    state: Arc<AppState>,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = server::create_router(Arc::clone(&state));
    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(());

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                stop_rx.changed().await.ok();
                tracing::info!("HTTP server received shutdown signal");
            })
            .await
    });

    shutdown.await;
    let _ = stop_tx.send(());

    let grace = Duration::from_secs(state.config.shutdown_grace_secs);
    state.dispatcher.shutdown(grace).await;
    // Event streams stay open until the runs have reported their final events.
    state.close_streams();

    server_handle
        .await
        .context("HTTP server task panicked")?
        .context("HTTP server failed")?;
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C signal"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Received Ctrl+C signal");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C signal");
    }
}

/// Run the service in the foreground until a shutdown signal arrives.
pub async fn start_service(
    config_path: Option<&Path>,
    data_dir_override: Option<&Path>,
    host_override: Option<&str>,
    port_override: Option<u16>,
    in_memory: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(h) = host_override {
        config.host = h.to_string();
    }
    if let Some(p) = port_override {
        config.port = p;
    }

    let data_dir = match (data_dir_override, config.data_dir.as_deref()) {
        (Some(d), _) => d.to_path_buf(),
        (None, Some(d)) => d.to_path_buf(),
        (None, None) => resolve_data_dir(None),
    };
    config.data_dir = Some(data_dir.clone());

    let _log_guard = init_tracing(&data_dir);
    tracing::info!("Data directory: {}", data_dir.display());

    create_data_dirs(&data_dir, &config.media_root(&data_dir)).await?;

    let pid_file = PidFile::new(data_dir.join(PID_FILE_NAME));
    pid_file.acquire()?;

    let result = run_service(config, &data_dir, in_memory).await;

    if let Err(e) = pid_file.release() {
        tracing::warn!("{:#}", e);
    }
    result
}

async fn run_service(config: ServiceConfig, data_dir: &Path, in_memory: bool) -> Result<()> {
    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = build_state(config, data_dir, in_memory).await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    tracing::info!("Service listening on http://{}. Press Ctrl+C to stop.", bind_addr);

    serve_until(state, listener, shutdown_signal()).await?;
    tracing::info!("Service exited cleanly.");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, NewJob};
    use tempfile::TempDir;

    fn fast_config() -> ServiceConfig {
        ServiceConfig {
            stage_delay_ms: 0,
            shutdown_grace_secs: 1,
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn test_pidfile_acquire_creates_file() {
        let tmp = TempDir::new().unwrap();
        let pid = PidFile::new(tmp.path().join(PID_FILE_NAME));

        pid.acquire().unwrap();
        let content = std::fs::read_to_string(pid.path()).unwrap();
        assert_eq!(content, std::process::id().to_string());
        assert!(pid.is_alive());
    }

    #[test]
    fn test_pidfile_acquire_fails_if_held_by_live_process() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(PID_FILE_NAME);
        std::fs::write(&path, std::process::id().to_string()).unwrap();

        let err = PidFile::new(path).acquire().unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[cfg(unix)]
    #[test]
    fn test_pidfile_acquire_replaces_stale_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(PID_FILE_NAME);
        // Far above any default pid_max.
        std::fs::write(&path, "99999999").unwrap();

        let pid = PidFile::new(path);
        pid.acquire().unwrap();
        assert!(pid.is_alive());
    }

    #[test]
    fn test_pidfile_release_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pid = PidFile::new(tmp.path().join(PID_FILE_NAME));
        pid.acquire().unwrap();

        pid.release().unwrap();
        assert!(!pid.path().exists());
        assert!(!pid.is_alive());
        pid.release().unwrap();
    }

    #[test]
    fn test_config_loading_from_explicit_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"port": 9100, "stage_delay_ms": 5}"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.stage_delay_ms, 5);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_config_loading_nonexistent_explicit_path_fails() {
        let tmp = TempDir::new().unwrap();
        let err = load_config(Some(&tmp.path().join("missing.json"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_config_loading_invalid_json_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_resolve_data_dir_with_override() {
        let dir = resolve_data_dir(Some(Path::new("/tmp/epl-data")));
        assert_eq!(dir, PathBuf::from("/tmp/epl-data"));
    }

    #[tokio::test]
    async fn test_data_directory_creation_idempotent() {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("data");
        let media = data_dir.join("media");

        create_data_dirs(&data_dir, &media).await.unwrap();
        create_data_dirs(&data_dir, &media).await.unwrap();
        assert!(data_dir.join("logs").is_dir());
        assert!(media.is_dir());
    }

    #[tokio::test]
    async fn test_build_state_recovers_interrupted_jobs() {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().to_path_buf();

        // A previous process left a job mid-pipeline.
        let stuck_id = {
            let store = JsonJobStore::new(data_dir.clone()).await.unwrap();
            let job = store
                .create_job(NewJob {
                    title: "Stuck".to_string(),
                    episode_number: 1,
                    script: None,
                })
                .await
                .unwrap();
            store
                .begin_run(
                    job.id,
                    false,
                    JobStatus::GeneratingScript,
                    "Generating script".to_string(),
                )
                .await
                .unwrap();
            job.id
        };

        let state = build_state(fast_config(), &data_dir, false).await.unwrap();
        let (job, logs) = state.status.job_with_logs(stuck_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            logs.last().map(|l| l.task_type.as_str()),
            Some("pipeline_interrupted")
        );

        // The recovered job can be started again.
        state.dispatcher.start(stuck_id, false).await.unwrap();
        assert!(state.dispatcher.wait_idle(Duration::from_secs(5)).await);
        let job = state.status.get_job(stuck_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_build_state_in_memory_leaves_no_store_files() {
        let tmp = TempDir::new().unwrap();
        let state = build_state(fast_config(), tmp.path(), true).await.unwrap();
        assert!(state.data_dir.is_none());
        assert!(!tmp.path().join("jobs.json").exists());
    }

    #[tokio::test]
    async fn test_serve_until_stops_on_signal() {
        let tmp = TempDir::new().unwrap();
        let state = build_state(fast_config(), tmp.path(), true).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(serve_until(state, listener, async move {
            let _ = rx.await;
        }));

        let resp = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
        assert_eq!(resp.status(), 200);

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server should stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_serve_until_closes_open_event_streams() {
        use futures_util::StreamExt;

        let tmp = TempDir::new().unwrap();
        let state = build_state(fast_config(), tmp.path(), true).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(serve_until(state, listener, async move {
            let _ = rx.await;
        }));

        let resp = reqwest::get(format!("http://{}/api/events", addr)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let mut events = resp.bytes_stream();

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server should stop while a client is subscribed")
            .unwrap();
        assert!(result.is_ok());

        // The subscriber sees its stream end rather than hang.
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(Ok(_)) = events.next().await {}
        })
        .await;
        assert!(drained.is_ok());
    }
}
