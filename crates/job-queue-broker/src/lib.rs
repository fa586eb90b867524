pub mod queue;
pub mod worker_registry;

pub use queue::{JobQueue, QueueStats};
pub use worker_registry::WorkerRegistry;
