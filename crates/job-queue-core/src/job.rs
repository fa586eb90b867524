use crate::{JobError, Priority, QueueDefaults, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a job
pub type JobId = String;

/// Rotated generations kept when a job does not say otherwise
pub const DEFAULT_ROTATE_COUNT: u32 = 1;

/// Upper bound on a single backoff delay (10 years)
pub const MAX_BACKOFF_MS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be picked up by a worker
    Pending,
    /// Locked and being executed by a worker
    Processing,
    /// Finished successfully
    Completed,
    /// Failed, waiting for its retry time
    Failed,
    /// Retries exhausted, parked in the dead letter queue
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// States a worker may lock a job from
    pub fn is_lockable(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| {
                JobError::Validation(format!(
                    "invalid state '{s}', must be one of: pending, processing, completed, failed, dead"
                ))
            })
    }
}

/// Captured output of one execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl JobOutput {
    /// Build from raw streams. Streams are trimmed and blank ones are stored
    /// as absent.
    pub fn new(stdout: Option<String>, stderr: Option<String>) -> Self {
        let keep = |s: Option<String>| {
            s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        };
        JobOutput {
            stdout: keep(stdout),
            stderr: keep(stderr),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_none() && self.stderr.is_none()
    }
}

fn default_rotate_count() -> u32 {
    DEFAULT_ROTATE_COUNT
}

/// A persisted unit of work: one shell command plus its retry and output policy.
///
/// Transitions consume the job and return the updated record; callers persist
/// the result through the store. `locked_by`/`locked_at` are only present while
/// the job is `processing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Shell command line, run through `/bin/sh -c`
    pub command: String,

    /// Current lifecycle state
    pub state: JobState,

    /// Failed executions so far
    pub attempts: u32,

    /// Failures tolerated before the job is dead-lettered
    pub max_retries: u32,

    /// Exponential backoff base, in seconds
    pub backoff_base: f64,

    /// Execution timeout in milliseconds
    pub job_timeout: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Earliest time a failed job may be retried
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Earliest time the job may run at all
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub priority: Priority,

    /// Last failure message
    #[serde(default)]
    pub error: Option<String>,

    /// Captured output, absent when routed to `output_file`
    #[serde(default)]
    pub output: Option<JobOutput>,

    #[serde(default)]
    pub save_output: bool,

    #[serde(default)]
    pub output_file: Option<PathBuf>,

    /// Rotate the output file once it grows beyond this many bytes
    #[serde(default)]
    pub rotate_size: Option<u64>,

    /// Rotated generations to keep
    #[serde(default = "default_rotate_count")]
    pub rotate_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job for `command` using the queue defaults
    pub fn new(command: impl Into<String>, defaults: &QueueDefaults) -> Result<Self> {
        JobBuilder::new(command).build(defaults)
    }

    /// Create a new job builder
    pub fn builder(command: impl Into<String>) -> JobBuilder {
        JobBuilder::new(command)
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// Whether the dispatcher may hand this job out at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if self.run_at.is_some_and(|run_at| run_at > now) {
            return false;
        }
        if self.is_locked() {
            return false;
        }
        match self.state {
            JobState::Pending => true,
            JobState::Failed => self.next_retry_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }

    /// Retries are allowed up to and including `max_retries` failures
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// Backoff for the current attempt count: `backoff_base ^ attempts` seconds
    pub fn calculate_backoff(&self) -> Duration {
        backoff_delay(self.backoff_base, self.attempts)
    }

    /// Claim the job for `worker_id`
    pub fn lock(mut self, worker_id: impl Into<String>, now: DateTime<Utc>) -> Result<Self> {
        if self.is_locked() || !self.state.is_lockable() {
            return Err(JobError::InvalidState {
                id: self.id,
                expected: "unlocked pending or failed".to_string(),
                actual: self.state.to_string(),
            });
        }
        self.state = JobState::Processing;
        self.locked_by = Some(worker_id.into());
        self.locked_at = Some(now);
        self.updated_at = now;
        Ok(self)
    }

    /// Drop the lock; a job still `processing` goes back to `pending`
    pub fn unlock(mut self, now: DateTime<Utc>) -> Self {
        self.locked_by = None;
        self.locked_at = None;
        if self.state == JobState::Processing {
            self.state = JobState::Pending;
        }
        self.updated_at = now;
        self
    }

    /// Record a failed execution, scheduling a retry or dead-lettering the job
    pub fn mark_failed(mut self, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        self.attempts += 1;
        self.error = Some(error.into());
        self.updated_at = now;

        if self.can_retry() {
            self.state = JobState::Failed;
            self.next_retry_at = Some(now + chrono_delay(self.calculate_backoff()));
        } else {
            self.state = JobState::Dead;
            self.next_retry_at = None;
        }
        self
    }

    /// Record a successful execution
    pub fn mark_completed(mut self, output: Option<JobOutput>, now: DateTime<Utc>) -> Self {
        self.state = JobState::Completed;
        self.output = output;
        self.error = None;
        self.next_retry_at = None;
        self.updated_at = now;
        self
    }

    /// Attach captured output without changing state
    pub fn with_output(mut self, output: Option<JobOutput>) -> Self {
        self.output = output;
        self
    }

    /// Return a dead job to `pending` with a clean retry budget
    pub fn reset(mut self, now: DateTime<Utc>) -> Result<Self> {
        if self.state != JobState::Dead {
            return Err(JobError::InvalidState {
                id: self.id,
                expected: JobState::Dead.to_string(),
                actual: self.state.to_string(),
            });
        }
        self.state = JobState::Pending;
        self.attempts = 0;
        self.error = None;
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(self)
    }
}

/// `base ^ attempts` seconds, expressed with millisecond precision and capped
/// at [`MAX_BACKOFF_MS`].
pub fn backoff_delay(base: f64, attempts: u32) -> Duration {
    let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
    let millis = base.powi(exponent) * 1000.0;
    let millis = if millis.is_finite() && millis >= 0.0 {
        (millis.round() as u64).min(MAX_BACKOFF_MS)
    } else {
        MAX_BACKOFF_MS
    };
    Duration::from_millis(millis)
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
}

fn validate_command(command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(JobError::Validation("job must have a non-empty command".to_string()));
    }
    Ok(())
}

/// Builder for creating jobs with per-job overrides
#[derive(Debug, Clone, Default)]
pub struct JobBuilder {
    id: Option<JobId>,
    command: String,
    max_retries: Option<u32>,
    backoff_base: Option<f64>,
    job_timeout: Option<u64>,
    run_at: Option<DateTime<Utc>>,
    priority: Priority,
    save_output: bool,
    output_file: Option<PathBuf>,
    rotate_size: Option<u64>,
    rotate_count: Option<u32>,
}

impl JobBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        JobBuilder {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn backoff_base(mut self, backoff_base: f64) -> Self {
        self.backoff_base = Some(backoff_base);
        self
    }

    pub fn job_timeout(mut self, job_timeout_ms: u64) -> Self {
        self.job_timeout = Some(job_timeout_ms);
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn save_output(mut self, save_output: bool) -> Self {
        self.save_output = save_output;
        self
    }

    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn rotate_size(mut self, bytes: u64) -> Self {
        self.rotate_size = Some(bytes);
        self
    }

    pub fn rotate_count(mut self, count: u32) -> Self {
        self.rotate_count = Some(count);
        self
    }

    pub fn build(self, defaults: &QueueDefaults) -> Result<Job> {
        validate_command(&self.command)?;

        let backoff_base = self.backoff_base.unwrap_or(defaults.backoff_base);
        if !backoff_base.is_finite() || backoff_base <= 0.0 {
            return Err(JobError::Validation(
                "backoff_base must be a positive number".to_string(),
            ));
        }

        let job_timeout = self.job_timeout.unwrap_or(defaults.job_timeout);
        if job_timeout == 0 {
            return Err(JobError::Validation(
                "job_timeout must be a positive number of milliseconds".to_string(),
            ));
        }

        if self.rotate_size == Some(0) {
            return Err(JobError::Validation("rotate_size must be positive".to_string()));
        }

        let id = match self.id {
            Some(id) if id.trim().is_empty() => {
                return Err(JobError::Validation("job id must not be blank".to_string()))
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let now = Utc::now();
        Ok(Job {
            id,
            command: self.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            backoff_base,
            job_timeout,
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            run_at: self.run_at,
            priority: self.priority,
            error: None,
            output: None,
            save_output: self.save_output,
            output_file: self.output_file,
            rotate_size: self.rotate_size,
            rotate_count: self.rotate_count.unwrap_or(DEFAULT_ROTATE_COUNT),
            locked_by: None,
            locked_at: None,
        })
    }
}

/// Job submission as received from a client. Only `command` is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: Option<JobId>,
    pub command: Option<String>,
    pub max_retries: Option<u32>,
    pub backoff_base: Option<f64>,
    pub job_timeout: Option<u64>,
    pub run_at: Option<DateTime<Utc>>,
    pub priority: Option<i32>,
    pub save_output: Option<bool>,
    pub output_file: Option<PathBuf>,
    pub rotate_size: Option<u64>,
    pub rotate_count: Option<u32>,
}

impl JobRequest {
    /// Strict JSON parsing of a submission
    pub fn from_json(input: &str) -> Result<Self> {
        serde_json::from_str(input)
            .map_err(|e| JobError::Validation(format!("invalid job data: {e}")))
    }

    pub fn into_builder(self) -> Result<JobBuilder> {
        let command = match self.command {
            Some(command) => command,
            None => return Err(JobError::Validation("job must have a command".to_string())),
        };

        let mut builder = JobBuilder::new(command);
        builder.id = self.id;
        builder.max_retries = self.max_retries;
        builder.backoff_base = self.backoff_base;
        builder.job_timeout = self.job_timeout;
        builder.run_at = self.run_at;
        builder.priority = self.priority.map(Priority::new).unwrap_or_default();
        builder.save_output = self.save_output.unwrap_or(false);
        builder.output_file = self.output_file;
        builder.rotate_size = self.rotate_size;
        builder.rotate_count = self.rotate_count;
        Ok(builder)
    }

    pub fn into_job(self, defaults: &QueueDefaults) -> Result<Job> {
        self.into_builder()?.build(defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn defaults() -> QueueDefaults {
        QueueDefaults::default()
    }

    #[test]
    fn test_job_creation() {
        let job = Job::new("echo test", &defaults()).unwrap();

        assert!(!job.id.is_empty());
        assert_eq!(job.command, "echo test");
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.backoff_base, 2.0);
        assert_eq!(job.job_timeout, 300_000);
        assert_eq!(job.priority, Priority::DEFAULT);
        assert_eq!(job.rotate_count, DEFAULT_ROTATE_COUNT);
        assert!(!job.is_locked());
    }

    #[test]
    fn test_command_is_required() {
        assert!(matches!(
            Job::new("   ", &defaults()),
            Err(JobError::Validation(_))
        ));

        let request = JobRequest::from_json("{}").unwrap();
        match request.into_job(&defaults()) {
            Err(JobError::Validation(msg)) => assert!(msg.contains("command")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_request_overrides_defaults() {
        let request = JobRequest::from_json(
            r#"{"id":"job-1","command":"echo hi","max_retries":2,"backoff_base":3,"priority":5}"#,
        )
        .unwrap();
        let job = request.into_job(&defaults()).unwrap();

        assert_eq!(job.id, "job-1");
        assert_eq!(job.max_retries, 2);
        assert_eq!(job.backoff_base, 3.0);
        assert_eq!(job.priority.value(), 5);
        assert_eq!(job.job_timeout, 300_000);
    }

    #[test]
    fn test_builder_rejects_bad_overrides() {
        assert!(Job::builder("true").backoff_base(0.0).build(&defaults()).is_err());
        assert!(Job::builder("true").job_timeout(0).build(&defaults()).is_err());
        assert!(Job::builder("true").rotate_size(0).build(&defaults()).is_err());
        assert!(Job::builder("true").id(" ").build(&defaults()).is_err());
    }

    #[test]
    fn test_retry_then_dead_scenario() {
        let job = Job::builder("echo hi")
            .max_retries(2)
            .backoff_base(2.0)
            .build(&defaults())
            .unwrap();
        let now = Utc::now();

        let job = job.mark_failed("boom", now);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.next_retry_at, Some(now + chrono::Duration::seconds(2)));

        let job = job.mark_failed("boom", now);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.next_retry_at, Some(now + chrono::Duration::seconds(4)));

        let job = job.mark_failed("boom again", now);
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.next_retry_at, None);
        assert_eq!(job.error.as_deref(), Some("boom again"));
    }

    #[test]
    fn test_backoff_values() {
        let mut job = Job::new("true", &defaults()).unwrap();
        job.attempts = 0;
        assert_eq!(job.calculate_backoff(), Duration::from_millis(1000));
        job.attempts = 1;
        assert_eq!(job.calculate_backoff(), Duration::from_millis(2000));
        job.attempts = 2;
        assert_eq!(job.calculate_backoff(), Duration::from_millis(4000));

        assert_eq!(backoff_delay(1.5, 3), Duration::from_millis(3375));
        assert_eq!(backoff_delay(10.0, 100), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[test]
    fn test_completion_clears_error_and_retry_time() {
        let now = Utc::now();
        let job = Job::new("true", &defaults()).unwrap().mark_failed("first", now);
        let output = JobOutput::new(Some("hi".to_string()), Some(String::new()));
        let job = job.mark_completed(Some(output), now);

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.error, None);
        assert_eq!(job.next_retry_at, None);
        let output = job.output.unwrap();
        assert_eq!(output.stdout.as_deref(), Some("hi"));
        assert_eq!(output.stderr, None);
    }

    #[test]
    fn test_output_streams_are_trimmed() {
        let output = JobOutput::new(
            Some("  line one\nline two\n".to_string()),
            Some("\n \n".to_string()),
        );
        assert_eq!(output.stdout.as_deref(), Some("line one\nline two"));
        assert_eq!(output.stderr, None);
        assert!(JobOutput::new(Some("\n".to_string()), None).is_empty());
    }

    #[test]
    fn test_reset_only_from_dead() {
        let now = Utc::now();
        let pending = Job::new("true", &defaults()).unwrap();
        assert!(matches!(
            pending.clone().reset(now),
            Err(JobError::InvalidState { .. })
        ));

        let dead = Job::builder("false")
            .max_retries(0)
            .build(&defaults())
            .unwrap()
            .mark_failed("nope", now);
        assert_eq!(dead.state, JobState::Dead);

        let revived = dead.reset(now).unwrap();
        assert_eq!(revived.state, JobState::Pending);
        assert_eq!(revived.attempts, 0);
        assert_eq!(revived.error, None);
        assert_eq!(revived.next_retry_at, None);
    }

    #[test]
    fn test_lock_and_unlock() {
        let now = Utc::now();
        let job = Job::new("true", &defaults()).unwrap().lock("w1", now).unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.locked_by.as_deref(), Some("w1"));
        assert!(job.clone().lock("w2", now).is_err());

        let job = job.unlock(now);
        assert_eq!(job.state, JobState::Pending);
        assert!(!job.is_locked());
        assert_eq!(job.locked_at, None);

        let done = job.mark_completed(None, now);
        assert!(done.lock("w1", now).is_err());
    }

    #[test]
    fn test_eligibility() {
        let now = Utc::now();
        let job = Job::new("true", &defaults()).unwrap();
        assert!(job.is_eligible(now));

        let scheduled = Job::builder("true")
            .run_at(now + chrono::Duration::hours(1))
            .build(&defaults())
            .unwrap();
        assert!(!scheduled.is_eligible(now));
        assert!(scheduled.is_eligible(now + chrono::Duration::hours(2)));

        let failed = job.clone().mark_failed("x", now);
        assert!(!failed.is_eligible(now));
        assert!(failed.is_eligible(now + chrono::Duration::seconds(2)));

        let locked = job.lock("w1", now).unwrap();
        assert!(!locked.is_eligible(now));
    }

    #[test]
    fn test_serialized_field_names() {
        let job = Job::new("echo hi", &defaults()).unwrap();
        let value = serde_json::to_value(&job).unwrap();
        let object = value.as_object().unwrap();

        for key in [
            "id", "command", "state", "attempts", "max_retries", "backoff_base",
            "job_timeout", "created_at", "updated_at", "next_retry_at", "run_at",
            "priority", "error", "output", "save_output", "output_file",
            "rotate_size", "rotate_count",
        ] {
            assert!(object.contains_key(key), "missing key {key}");
        }
        assert!(!object.contains_key("locked_by"));
        assert_eq!(object["state"], "pending");

        let locked = job.lock("w1", Utc::now()).unwrap();
        let value = serde_json::to_value(&locked).unwrap();
        assert_eq!(value["locked_by"], "w1");
        assert_eq!(value["state"], "processing");
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!("dead".parse::<JobState>().unwrap(), JobState::Dead);
        assert!("running".parse::<JobState>().is_err());
    }

    proptest! {
        #[test]
        fn prop_backoff_is_base_pow_attempts_in_millis(base in 1u32..=10, attempts in 0u32..=8) {
            let expected = u64::from(base).pow(attempts) * 1000;
            prop_assert_eq!(backoff_delay(f64::from(base), attempts), Duration::from_millis(expected));
        }

        #[test]
        fn prop_dead_exactly_on_failure_after_max_retries(max_retries in 0u32..8) {
            let now = Utc::now();
            let mut job = Job::builder("false")
                .max_retries(max_retries)
                .backoff_base(1.0)
                .build(&QueueDefaults::default())
                .unwrap();

            for failure in 1..=max_retries {
                job = job.mark_failed("err", now);
                prop_assert_eq!(job.state, JobState::Failed);
                prop_assert_eq!(job.attempts, failure);
                prop_assert!(job.next_retry_at.is_some());
            }

            job = job.mark_failed("err", now);
            prop_assert_eq!(job.state, JobState::Dead);
            prop_assert_eq!(job.attempts, max_retries + 1);
            prop_assert!(job.next_retry_at.is_none());
        }
    }
}
