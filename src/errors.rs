use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already completed: {0}")]
    AlreadyCompleted(String),

    #[error("Already running: {0}")]
    AlreadyRunning(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Service is shutting down: {0}")]
    ShuttingDown(String),
}

impl PipelineError {
    /// Recover a typed error from an `anyhow::Error` returned by a store.
    /// Anything that was not already a `PipelineError` is treated as the
    /// store being unavailable.
    pub fn from_store(err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(typed) => typed,
            Err(other) => PipelineError::StoreUnavailable(format!("{:#}", other)),
        }
    }

    /// The start rejection this error represents, if any.
    pub fn rejection(&self) -> Option<StartRejection> {
        match self {
            PipelineError::NotFound(_) => Some(StartRejection::NotFound),
            PipelineError::AlreadyCompleted(_) => Some(StartRejection::AlreadyCompleted),
            PipelineError::AlreadyRunning(_) => Some(StartRejection::AlreadyRunning),
            _ => None,
        }
    }
}

/// Why a start request was refused before any run was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartRejection {
    NotFound,
    AlreadyCompleted,
    AlreadyRunning,
}

impl StartRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            StartRejection::NotFound => "not_found",
            StartRejection::AlreadyCompleted => "already_completed",
            StartRejection::AlreadyRunning => "already_running",
        }
    }
}

impl std::fmt::Display for StartRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::StoreUnavailable(err.to_string())
    }
}

impl From<uuid::Error> for PipelineError {
    fn from(err: uuid::Error) -> Self {
        PipelineError::Validation(err.to_string())
    }
}
