mod defaults;
mod error;
mod job;
mod priority;

pub use defaults::{display_key, normalize_key, QueueDefaults, CONFIG_KEYS};
pub use error::{JobError, Result};
pub use job::{
    backoff_delay, Job, JobBuilder, JobId, JobOutput, JobRequest, JobState,
    DEFAULT_ROTATE_COUNT, MAX_BACKOFF_MS,
};
pub use priority::Priority;
