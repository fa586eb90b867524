use job_queue_persistence::{JobStore, Result, WorkerRecord};
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of running workers, shared by every process through the store.
///
/// A registration is removed on graceful stop, or pruned by any process that
/// lists the registry once its owning PID is gone.
#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<JobStore>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<JobStore>) -> Self {
        WorkerRegistry { store }
    }

    /// Register a worker living in this process
    pub fn register(&self, worker_id: &str) -> Result<WorkerRecord> {
        let record = WorkerRecord::current_process(worker_id);
        self.store.add_worker(record.clone())?;
        info!("Registered worker {} (pid {})", record.id, record.pid);
        Ok(record)
    }

    /// Deregister a worker
    pub fn deregister(&self, worker_id: &str) -> Result<bool> {
        let removed = self.store.remove_worker(worker_id)?;
        if removed {
            info!("Deregistered worker {}", worker_id);
        }
        Ok(removed)
    }

    /// Whether `worker_id` still has a registration. Workers poll this to
    /// learn they have been asked to stop.
    pub fn is_registered(&self, worker_id: &str) -> Result<bool> {
        Ok(self.store.load_workers()?.iter().any(|w| w.id == worker_id))
    }

    /// Live workers; stale registrations are dropped from the store
    pub fn list(&self) -> Result<Vec<WorkerRecord>> {
        self.store.prune_dead_workers()
    }

    pub fn count_alive(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    /// Remove every registration, which asks all workers to stop
    pub fn clear(&self) -> Result<usize> {
        let count = self.store.clear_workers()?;
        debug!("Cleared {} worker registration(s)", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use job_queue_persistence::{FixedProbe, JobStoreConfig};
    use tempfile::TempDir;

    fn open_registry(temp_dir: &TempDir, alive: impl IntoIterator<Item = u32>) -> WorkerRegistry {
        let store = JobStore::open_with_probe(
            JobStoreConfig::new(temp_dir.path()),
            Arc::new(FixedProbe::new(alive)),
        )
        .unwrap();
        WorkerRegistry::new(Arc::new(store))
    }

    #[test]
    fn test_register_and_deregister() {
        let temp_dir = TempDir::new().unwrap();
        let registry = open_registry(&temp_dir, [std::process::id()]);

        let record = registry.register("worker-1").unwrap();
        assert_eq!(record.pid, std::process::id());
        assert!(registry.is_registered("worker-1").unwrap());
        assert_eq!(registry.count_alive().unwrap(), 1);

        assert!(registry.deregister("worker-1").unwrap());
        assert!(!registry.is_registered("worker-1").unwrap());
        assert!(!registry.deregister("worker-1").unwrap());
    }

    #[test]
    fn test_list_prunes_dead_workers() {
        let temp_dir = TempDir::new().unwrap();
        let registry = open_registry(&temp_dir, [std::process::id()]);

        registry.register("alive").unwrap();
        registry
            .store
            .add_worker(WorkerRecord {
                id: "ghost".to_string(),
                started_at: Utc::now(),
                pid: 999_999,
            })
            .unwrap();

        let workers = registry.list().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].id, "alive");
        assert!(!registry.is_registered("ghost").unwrap());
    }

    #[test]
    fn test_clear_stops_everyone() {
        let temp_dir = TempDir::new().unwrap();
        let registry = open_registry(&temp_dir, [std::process::id()]);

        registry.register("a").unwrap();
        registry.register("b").unwrap();
        assert_eq!(registry.clear().unwrap(), 2);
        assert!(!registry.is_registered("a").unwrap());
        assert!(!registry.is_registered("b").unwrap());
    }
}
