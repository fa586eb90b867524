mod config_store;
mod liveness;
mod lock;
mod store;

pub use config_store::ConfigStore;
pub use liveness::{FixedProbe, ProcessProbe, SignalProbe};
pub use lock::StoreLock;
pub use store::{JobStore, JobStoreConfig, WorkerRecord};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Job error: {0}")]
    JobError(#[from] job_queue_core::JobError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Corrupt store file {path:?}: {source}")]
    CorruptFile {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to lock {path:?}: {reason}")]
    LockError { path: PathBuf, reason: String },

    #[error("Job {job_id} is no longer locked by worker {worker_id}")]
    LockLost { job_id: String, worker_id: String },
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
