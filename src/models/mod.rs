pub mod config;
pub mod job;
pub mod run;

pub use config::{ServiceConfig, SupervisorConfig};
pub use job::{ExecutionType, JobConfig, JobDefinition};
pub use run::{AttemptOutcome, RunRecord, RunStatus};
