use crate::{PersistenceError, ProcessProbe, Result, SignalProbe, StoreLock};
use chrono::{DateTime, Utc};
use job_queue_core::{Job, JobError, JobState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

const JOBS_FILE: &str = "jobs.json";
const WORKERS_FILE: &str = "workers.json";
const LOCK_FILE: &str = "store.lock";
const OUTPUTS_DIR: &str = "outputs";

/// Configuration for job store
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    pub data_dir: PathBuf,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        JobStoreConfig {
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl JobStoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        JobStoreConfig {
            data_dir: data_dir.into(),
        }
    }
}

/// A running worker as recorded in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
}

impl WorkerRecord {
    /// Registration for a worker living in the current process
    pub fn current_process(id: impl Into<String>) -> Self {
        WorkerRecord {
            id: id.into(),
            started_at: Utc::now(),
            pid: std::process::id(),
        }
    }
}

/// Result of a closure run inside a store transaction
enum Txn<T> {
    /// Persist the modified collection
    Commit(T),
    /// Leave the file untouched
    Abort(T),
}

/// Durable store for jobs and worker registrations.
///
/// Both collections are JSON arrays kept in insertion order. Every mutation
/// holds the exclusive store lock across its read-modify-write and replaces
/// the file atomically, so readers never see a partially written collection
/// and concurrent writers never lose each other's updates.
pub struct JobStore {
    config: JobStoreConfig,
    probe: Arc<dyn ProcessProbe>,
}

impl JobStore {
    /// Open or create the store, then recover locks held by dead workers
    pub fn open(config: JobStoreConfig) -> Result<Self> {
        Self::open_with_probe(config, Arc::new(SignalProbe))
    }

    pub fn open_with_probe(config: JobStoreConfig, probe: Arc<dyn ProcessProbe>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let store = JobStore { config, probe };
        {
            let _lock = store.lock()?;
            if !store.jobs_path().exists() {
                write_atomic(&store.jobs_path(), b"[]")?;
            }
            if !store.workers_path().exists() {
                write_atomic(&store.workers_path(), b"[]")?;
            }
        }

        match store.cleanup_stale_locks() {
            Ok(0) => {}
            Ok(count) => info!("Recovered {} job(s) locked by workers that are gone", count),
            Err(e) => warn!("Failed to clean up stale locks: {}", e),
        }

        debug!("Opened job store at {:?}", store.config.data_dir);
        Ok(store)
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Default location of a job's output log
    pub fn default_output_file(&self, job_id: &str) -> PathBuf {
        self.config.data_dir.join(OUTPUTS_DIR).join(format!("{job_id}.log"))
    }

    pub fn probe(&self) -> Arc<dyn ProcessProbe> {
        self.probe.clone()
    }

    /// Append a new job
    pub fn add_job(&self, job: Job) -> Result<()> {
        let id = job.id.clone();
        self.mutate_jobs(|jobs| {
            if jobs.iter().any(|j| j.id == job.id) {
                return Err(JobError::AlreadyExists(job.id).into());
            }
            jobs.push(job);
            Ok(Txn::Commit(()))
        })?;

        debug!("Added job {} to store", id);
        Ok(())
    }

    /// Get a job by ID
    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.load_jobs()?.into_iter().find(|j| j.id == job_id))
    }

    /// All jobs in insertion order
    pub fn load_jobs(&self) -> Result<Vec<Job>> {
        read_collection(&self.jobs_path())
    }

    /// Jobs in `state`, or every job when `state` is `None`
    pub fn jobs_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let jobs = self.load_jobs()?;
        Ok(match state {
            Some(state) => jobs.into_iter().filter(|j| j.state == state).collect(),
            None => jobs,
        })
    }

    /// Replace a job with `update(job)`, stamping `updated_at`
    pub fn update_job<F>(&self, job_id: &str, update: F) -> Result<Job>
    where
        F: FnOnce(Job) -> job_queue_core::Result<Job>,
    {
        self.mutate_jobs(|jobs| {
            let index = position(jobs, job_id)?;
            let mut updated = update(jobs[index].clone())?;
            updated.id = jobs[index].id.clone();
            updated.updated_at = Utc::now();
            jobs[index] = updated.clone();
            Ok(Txn::Commit(updated))
        })
    }

    /// Claim a job for `worker_id`.
    ///
    /// Succeeds only if the job exists, is unlocked, and is `pending` or
    /// `failed`; the check and the write happen under one store lock.
    pub fn acquire_lock(&self, job_id: &str, worker_id: &str) -> Result<bool> {
        let now = Utc::now();
        let acquired = self.mutate_jobs(|jobs| {
            let Some(index) = jobs.iter().position(|j| j.id == job_id) else {
                return Ok(Txn::Abort(false));
            };
            match jobs[index].clone().lock(worker_id, now) {
                Ok(locked) => {
                    jobs[index] = locked;
                    Ok(Txn::Commit(true))
                }
                Err(_) => Ok(Txn::Abort(false)),
            }
        })?;

        if acquired {
            debug!("Worker {} locked job {}", worker_id, job_id);
        }
        Ok(acquired)
    }

    /// Clear a job's lock, returning an unfinished job to `pending`
    pub fn release_lock(&self, job_id: &str) -> Result<bool> {
        let now = Utc::now();
        self.mutate_jobs(|jobs| {
            let Some(index) = jobs.iter().position(|j| j.id == job_id) else {
                return Ok(Txn::Abort(false));
            };
            jobs[index] = jobs[index].clone().unlock(now);
            Ok(Txn::Commit(true))
        })
    }

    /// Persist the outcome of an execution and release its lock in one write.
    ///
    /// A record that was unlocked behind the worker's back (stale-lock
    /// recovery after the registry was cleared) still takes the outcome.
    /// Fails with [`PersistenceError::LockLost`] only if another worker now
    /// holds the lock.
    pub fn finish_job(&self, job: &Job, worker_id: &str) -> Result<Job> {
        let now = Utc::now();
        self.mutate_jobs(|jobs| {
            let index = position(jobs, &job.id)?;
            let owner = jobs[index].locked_by.as_deref();
            if owner.is_some_and(|owner| owner != worker_id) {
                return Err(PersistenceError::LockLost {
                    job_id: job.id.clone(),
                    worker_id: worker_id.to_string(),
                });
            }
            let finished = job.clone().unlock(now);
            jobs[index] = finished.clone();
            Ok(Txn::Commit(finished))
        })
    }

    /// Move a dead job back to `pending`. Any other state is rejected untouched.
    pub fn retry_dead_job(&self, job_id: &str) -> Result<Job> {
        let now = Utc::now();
        let job = self.mutate_jobs(|jobs| {
            let index = position(jobs, job_id)?;
            let reset = jobs[index].clone().reset(now)?;
            jobs[index] = reset.clone();
            Ok(Txn::Commit(reset))
        })?;

        info!("Job {} moved from the dead letter queue back to pending", job_id);
        Ok(job)
    }

    /// Unlock every job whose owner is not a live registered worker
    pub fn cleanup_stale_locks(&self) -> Result<usize> {
        let _lock = self.lock()?;

        let workers: Vec<WorkerRecord> = read_collection(&self.workers_path())?;
        let alive: HashSet<String> = workers
            .into_iter()
            .filter(|w| self.probe.is_alive(w.pid))
            .map(|w| w.id)
            .collect();

        let mut jobs: Vec<Job> = read_collection(&self.jobs_path())?;
        let now = Utc::now();
        let mut recovered = 0;

        for job in jobs.iter_mut() {
            let stale = job
                .locked_by
                .as_ref()
                .is_some_and(|owner| !alive.contains(owner));
            if stale {
                warn!(
                    "Recovering job {} locked by {:?} (worker is gone)",
                    job.id, job.locked_by
                );
                *job = job.clone().unlock(now);
                recovered += 1;
            }
        }

        if recovered > 0 {
            write_collection(&self.jobs_path(), &jobs)?;
        }
        Ok(recovered)
    }

    /// All worker registrations, including stale ones
    pub fn load_workers(&self) -> Result<Vec<WorkerRecord>> {
        read_collection(&self.workers_path())
    }

    /// Register a worker, replacing any previous record with the same ID
    pub fn add_worker(&self, record: WorkerRecord) -> Result<()> {
        self.mutate_workers(|workers| {
            workers.retain(|w| w.id != record.id);
            workers.push(record);
            Ok(Txn::Commit(()))
        })
    }

    pub fn remove_worker(&self, worker_id: &str) -> Result<bool> {
        self.mutate_workers(|workers| {
            let before = workers.len();
            workers.retain(|w| w.id != worker_id);
            if workers.len() == before {
                Ok(Txn::Abort(false))
            } else {
                Ok(Txn::Commit(true))
            }
        })
    }

    /// Remove every registration, returning how many there were
    pub fn clear_workers(&self) -> Result<usize> {
        self.mutate_workers(|workers| {
            let count = workers.len();
            workers.clear();
            Ok(Txn::Commit(count))
        })
    }

    /// Drop registrations whose process is gone and return the live ones
    pub fn prune_dead_workers(&self) -> Result<Vec<WorkerRecord>> {
        let probe = self.probe.clone();
        self.mutate_workers(|workers| {
            let before = workers.len();
            workers.retain(|w| {
                let alive = probe.is_alive(w.pid);
                if !alive {
                    debug!("Pruning stale worker {} (pid {})", w.id, w.pid);
                }
                alive
            });
            if workers.len() == before {
                Ok(Txn::Abort(workers.clone()))
            } else {
                Ok(Txn::Commit(workers.clone()))
            }
        })
    }

    fn jobs_path(&self) -> PathBuf {
        self.config.data_dir.join(JOBS_FILE)
    }

    fn workers_path(&self) -> PathBuf {
        self.config.data_dir.join(WORKERS_FILE)
    }

    fn lock(&self) -> Result<StoreLock> {
        StoreLock::acquire(&self.config.data_dir.join(LOCK_FILE))
    }

    fn mutate_jobs<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Job>) -> Result<Txn<T>>,
    {
        self.mutate(&self.jobs_path(), f)
    }

    fn mutate_workers<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<WorkerRecord>) -> Result<Txn<T>>,
    {
        self.mutate(&self.workers_path(), f)
    }

    fn mutate<R, T, F>(&self, path: &Path, f: F) -> Result<T>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<R>) -> Result<Txn<T>>,
    {
        let _lock = self.lock()?;
        let mut records = read_collection(path)?;
        match f(&mut records)? {
            Txn::Commit(value) => {
                write_collection(path, &records)?;
                Ok(value)
            }
            Txn::Abort(value) => Ok(value),
        }
    }
}

fn position(jobs: &[Job], job_id: &str) -> Result<usize> {
    jobs.iter()
        .position(|j| j.id == job_id)
        .ok_or_else(|| JobError::NotFound(job_id.to_string()).into())
}

fn read_collection<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data).map_err(|source| PersistenceError::CorruptFile {
        path: path.to_path_buf(),
        source,
    })
}

fn write_collection<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let data = serde_json::to_vec_pretty(records)?;
    write_atomic(path, &data)
}

/// Write `data` to a temp file beside `path`, sync it, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| PersistenceError::IoError(e.error))?;
    Ok(())
}
