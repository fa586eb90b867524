pub mod config;
pub mod executor;
pub mod output;
pub mod worker;

pub use config::WorkerConfig;
pub use executor::{CommandExecutor, ExecutionFailure, ExecutionOutcome, ShellExecutor};
pub use output::OutputLog;
pub use worker::{PollOutcome, Worker, WorkerStats};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Store error: {0}")]
    Persistence(#[from] job_queue_persistence::PersistenceError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
