pub mod config;
pub mod job;
pub mod log;

pub use config::ServiceConfig;
pub use job::{Artifact, Job, JobStatus, NewJob};
pub use log::{LogEntry, LogOutcome, NewLogEntry, TaskStatistics};
