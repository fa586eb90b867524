use chrono::{DateTime, Utc};
use job_queue_core::{Job, JobRequest, JobState, QueueDefaults};
use job_queue_persistence::{JobStore, Result};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// A job wrapper ordering candidates for dispatch
struct Candidate<'a> {
    job: &'a Job,
}

impl PartialEq for Candidate<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate<'_> {}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first
        match self.job.priority.cmp(&other.job.priority) {
            Ordering::Equal => {
                // Within same priority, earlier created_at first (FIFO)
                other.job.created_at.cmp(&self.job.created_at)
            }
            ordering => ordering,
        }
    }
}

/// Pick the job a worker should run at `now`, without locking it.
///
/// Ties on both priority and creation time go to the job stored first.
pub fn select_next(jobs: &[Job], now: DateTime<Utc>) -> Option<&Job> {
    jobs.iter()
        .filter(|job| job.is_eligible(now))
        .map(|job| Candidate { job })
        .reduce(|best, candidate| if candidate > best { candidate } else { best })
        .map(|candidate| candidate.job)
}

/// Job counts per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
}

impl QueueStats {
    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut stats = QueueStats {
            total: jobs.len(),
            ..Default::default()
        };
        for job in jobs {
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Processing => stats.processing += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Dead => stats.dead += 1,
            }
        }
        stats
    }

    pub fn count(&self, state: JobState) -> usize {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }
}

/// The queue as seen by clients and workers: submission, dispatch and the
/// dead letter queue, all backed by the shared [`JobStore`].
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<JobStore>,
}

impl JobQueue {
    pub fn new(store: Arc<JobStore>) -> Self {
        JobQueue { store }
    }

    pub fn store(&self) -> Arc<JobStore> {
        self.store.clone()
    }

    /// Validate a submission against the queue defaults and store it
    pub fn enqueue(&self, request: JobRequest, defaults: &QueueDefaults) -> Result<Job> {
        let job = request.into_job(defaults)?;
        self.enqueue_job(job)
    }

    /// Store an already built job
    pub fn enqueue_job(&self, job: Job) -> Result<Job> {
        self.store.add_job(job.clone())?;
        info!("Enqueued job {} (priority {})", job.id, job.priority);
        Ok(job)
    }

    /// Lock and return the highest ranked eligible job for `worker_id`.
    ///
    /// Only the top candidate is tried. Losing the race for it yields `None`
    /// and the caller polls again on its next cycle.
    pub fn next_job(&self, worker_id: &str) -> Result<Option<Job>> {
        let jobs = self.store.load_jobs()?;
        let Some(candidate) = select_next(&jobs, Utc::now()) else {
            return Ok(None);
        };

        if !self.store.acquire_lock(&candidate.id, worker_id)? {
            debug!("Worker {} lost the race for job {}", worker_id, candidate.id);
            return Ok(None);
        }

        self.store.get_job(&candidate.id)
    }

    /// Persist an executed job and release its lock
    pub fn finish(&self, job: &Job, worker_id: &str) -> Result<Job> {
        self.store.finish_job(job, worker_id)
    }

    pub fn release_lock(&self, job_id: &str) -> Result<bool> {
        self.store.release_lock(job_id)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.store.get_job(job_id)
    }

    /// Jobs in insertion order, optionally restricted to one state
    pub fn list(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        self.store.jobs_by_state(state)
    }

    /// Jobs in the dead letter queue
    pub fn dead_jobs(&self) -> Result<Vec<Job>> {
        self.list(Some(JobState::Dead))
    }

    /// Send a dead job back to `pending`; any other state is an error
    pub fn retry_dead_job(&self, job_id: &str) -> Result<Job> {
        self.store.retry_dead_job(job_id)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats::from_jobs(&self.store.load_jobs()?))
    }
}
