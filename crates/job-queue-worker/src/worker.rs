use crate::executor::CommandExecutor;
use crate::output::OutputLog;
use crate::Result;
use job_queue_broker::{JobQueue, WorkerRegistry};
use job_queue_core::{Job, JobOutput, JobState};
use job_queue_persistence::PersistenceError;

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Running totals for one worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

impl WorkerStats {
    fn record(&mut self, job: &Job) {
        self.processed += 1;
        match job.state {
            JobState::Completed => self.succeeded += 1,
            JobState::Dead => {
                self.failed += 1;
                self.dead_lettered += 1;
            }
            _ => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &WorkerStats) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
    }
}

/// What a single poll cycle did
#[derive(Debug)]
pub enum PollOutcome {
    /// Ran one job; holds the record as persisted
    Processed(Job),
    /// Nothing eligible, or lost the race for the top candidate
    Idle,
    /// The registration is gone; the worker should exit
    Deregistered,
}

/// A worker polling the shared store and running one job per cycle
pub struct Worker {
    worker_id: String,
    queue: JobQueue,
    registry: WorkerRegistry,
    executor: Arc<dyn CommandExecutor>,
    poll_interval: Duration,
    stats: Arc<RwLock<WorkerStats>>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        queue: JobQueue,
        registry: WorkerRegistry,
        executor: Arc<dyn CommandExecutor>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Worker {
            worker_id: worker_id.into(),
            queue,
            registry,
            executor,
            poll_interval,
            stats: Arc::new(RwLock::new(WorkerStats::default())),
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.worker_id
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.read()
    }

    /// Shared handle for reporting while the worker runs
    pub fn stats_handle(&self) -> Arc<RwLock<WorkerStats>> {
        self.stats.clone()
    }

    /// Register, then poll until stopped.
    ///
    /// Every cycle, busy or idle, is followed by `poll_interval` of sleep.
    /// The worker stops when the shutdown token is cancelled or when its
    /// registration disappears. A job already running is always finished
    /// first. Errors inside a cycle are logged and polling continues.
    pub async fn run(&self) -> Result<()> {
        self.registry.register(&self.worker_id)?;
        info!(
            "Worker {} started (poll interval {:?})",
            self.worker_id, self.poll_interval
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.poll_once().await {
                Ok(PollOutcome::Processed(_) | PollOutcome::Idle) => {}
                Ok(PollOutcome::Deregistered) => {
                    info!("Worker {} is no longer registered, stopping", self.worker_id);
                    break;
                }
                Err(e) => error!("Worker {} poll failed: {}", self.worker_id, e),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        if let Err(e) = self.registry.deregister(&self.worker_id) {
            warn!("Failed to deregister worker {}: {}", self.worker_id, e);
        }
        let stats = self.stats();
        info!(
            "Worker {} stopped after {} job(s) ({} succeeded, {} failed)",
            self.worker_id, stats.processed, stats.succeeded, stats.failed
        );
        Ok(())
    }

    /// One poll cycle: check registration, take a job, run it, record it
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        if !self.registry.is_registered(&self.worker_id)? {
            return Ok(PollOutcome::Deregistered);
        }

        let Some(job) = self.queue.next_job(&self.worker_id)? else {
            return Ok(PollOutcome::Idle);
        };

        let job = self.process(job).await?;
        self.stats.write().record(&job);
        Ok(PollOutcome::Processed(job))
    }

    async fn process(&self, job: Job) -> Result<Job> {
        info!(
            "Worker {} picked up job {} (attempt {}): {}",
            self.worker_id,
            job.id,
            job.attempts + 1,
            job.command
        );

        let limit = Duration::from_millis(job.job_timeout);
        let outcome = self.executor.execute(&job.command, limit).await;
        let now = Utc::now();

        let output = JobOutput::new(Some(outcome.stdout), Some(outcome.stderr));
        let stored_output = if job.save_output || output.is_empty() {
            None
        } else {
            Some(output.clone())
        };

        let updated = match &outcome.failure {
            None => job.mark_completed(stored_output, now),
            Some(failure) => job
                .mark_failed(failure.to_string(), now)
                .with_output(stored_output),
        };

        let saved = match self.queue.finish(&updated, &self.worker_id) {
            Ok(saved) => saved,
            Err(e @ PersistenceError::LockLost { .. }) => return Err(e.into()),
            Err(e) => {
                // hand the job back so another cycle can pick it up
                if let Err(release) = self.queue.release_lock(&updated.id) {
                    warn!("Failed to release lock on job {}: {}", updated.id, release);
                }
                return Err(e.into());
            }
        };

        match saved.state {
            JobState::Completed => info!("Job {} completed", saved.id),
            JobState::Failed => warn!(
                "Job {} failed (attempt {}/{}), retry at {:?}: {}",
                saved.id,
                saved.attempts,
                saved.max_retries,
                saved.next_retry_at,
                saved.error.as_deref().unwrap_or_default()
            ),
            JobState::Dead => error!(
                "Job {} moved to the dead letter queue after {} attempt(s): {}",
                saved.id,
                saved.attempts,
                saved.error.as_deref().unwrap_or_default()
            ),
            state => debug!("Job {} finished in unexpected state {}", saved.id, state),
        }

        if saved.save_output {
            let default_path = self.queue.store().default_output_file(&saved.id);
            let log = OutputLog::for_job(&saved, default_path);
            if let Err(e) = log.append(outcome.failure.is_none(), &output, now) {
                warn!("Failed to write output log {:?}: {}", log.path(), e);
            }
        }

        Ok(saved)
    }
}
