pub mod health;
pub mod routes;
pub mod sse;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::{broadcast, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::models::ServiceConfig;
use crate::pipeline::{JobDispatcher, PipelineEvent, PipelineRunner, StageRegistry, StatusStore};
use crate::storage::{JobStore, LogStore};

/// Shared application state for the Axum server.
pub struct AppState {
    pub status: StatusStore,
    pub dispatcher: Arc<JobDispatcher>,
    pub event_tx: broadcast::Sender<PipelineEvent>,
    pub config: Arc<ServiceConfig>,
    pub data_dir: Option<PathBuf>,
    pub start_time: Instant,
    /// Flipped to true when long-lived responses must end.
    streams_closed: watch::Sender<bool>,
}

impl AppState {
    /// Wire stores, registry and config into a dispatcher and the state the
    /// handlers share.
    pub fn build(
        job_store: Arc<dyn JobStore>,
        log_store: Arc<dyn LogStore>,
        registry: StageRegistry,
        config: ServiceConfig,
        data_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel::<PipelineEvent>(config.broadcast_capacity.max(1));
        let status = StatusStore::new(job_store, log_store);

        let stage_timeout = match config.stage_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let runner = Arc::new(
            PipelineRunner::new(Arc::new(registry), status.clone(), event_tx.clone())
                .with_stage_timeout(stage_timeout),
        );
        let dispatcher = Arc::new(JobDispatcher::new(
            status.clone(),
            runner,
            event_tx.clone(),
        ));

        Arc::new(Self {
            status,
            dispatcher,
            event_tx,
            config: Arc::new(config),
            data_dir,
            start_time: Instant::now(),
            streams_closed: watch::Sender::new(false),
        })
    }

    /// End every open event stream so connections can drain.
    pub fn close_streams(&self) {
        self.streams_closed.send_replace(true);
    }

    /// Resolves once `close_streams` has been called.
    pub fn streams_closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.streams_closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }
}

/// Create the Axum router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/jobs", get(routes::list_jobs).post(routes::create_job))
        .route(
            "/api/jobs/{id}",
            get(routes::get_job).delete(routes::delete_job),
        )
        .route("/api/jobs/{id}/generate", post(routes::generate))
        .route("/api/jobs/{id}/logs", get(routes::list_logs))
        .route("/api/jobs/{id}/logs/statistics", get(routes::log_statistics))
        .route("/api/events", get(sse::sse_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}
