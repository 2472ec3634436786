//! The job pipeline: a validated stage registry, a runner that walks it for
//! one job, and a dispatcher that admits at most one run per job.

pub mod dispatcher;
pub mod events;
pub mod registry;
pub mod runner;
pub mod stages;
pub mod status;

#[cfg(test)]
mod testing;

pub use dispatcher::{Accepted, JobDispatcher, RunHandle};
pub use events::PipelineEvent;
pub use registry::{StageContext, StageDefinition, StageExecutor, StageOutcome, StageRegistry};
pub use runner::{PipelineRunner, RunOutcome};
pub use status::StatusStore;
