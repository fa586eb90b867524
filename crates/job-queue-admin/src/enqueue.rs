use crate::lenient;
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::Args;
use job_queue_core::JobRequest;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Rotation threshold applied when output is saved without `--rotate-size`
pub const DEFAULT_ROTATE_SIZE: u64 = 1_000_000;

#[derive(Args, Debug, Default)]
pub struct EnqueueOptions {
    /// Job as JSON, or @path to read it from a file
    pub payload: Option<String>,

    /// Read the job JSON from a file
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Repair JSON whose quotes were stripped by the shell
    #[arg(long)]
    pub lenient: bool,

    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Backoff base in seconds
    #[arg(long)]
    pub backoff_base: Option<f64>,

    /// Execution timeout in milliseconds
    #[arg(long)]
    pub job_timeout: Option<u64>,

    /// Earliest start time (RFC 3339)
    #[arg(long, conflicts_with = "delay")]
    pub run_at: Option<DateTime<Utc>>,

    /// Delay the first run by this many seconds
    #[arg(long)]
    pub delay: Option<u64>,

    #[arg(short, long, allow_negative_numbers = true)]
    pub priority: Option<i32>,

    /// Append each run's output to a log file instead of the job record
    #[arg(long)]
    pub save_output: bool,

    /// Directory for the output log (defaults to <data-dir>/outputs)
    #[arg(long, requires = "save_output")]
    pub output_dir: Option<PathBuf>,

    /// Rotate the output log past this many bytes
    #[arg(long, requires = "save_output")]
    pub rotate_size: Option<u64>,

    /// Rotated logs to keep
    #[arg(long, requires = "save_output")]
    pub rotate_count: Option<u32>,
}

impl EnqueueOptions {
    /// Turn the payload and flags into a job submission. Relative paths are
    /// resolved against `cwd`.
    pub fn into_request(self, cwd: &Path) -> anyhow::Result<JobRequest> {
        let raw = self.read_payload(cwd)?;
        let mut request = parse_payload(&raw, self.lenient)?;

        if let Some(max_retries) = self.max_retries {
            request.max_retries = Some(max_retries);
        }
        if let Some(backoff_base) = self.backoff_base {
            if !backoff_base.is_finite() || backoff_base <= 0.0 {
                bail!("--backoff-base must be a positive number");
            }
            request.backoff_base = Some(backoff_base);
        }
        if let Some(job_timeout) = self.job_timeout {
            if job_timeout == 0 {
                bail!("--job-timeout must be a positive integer representing milliseconds");
            }
            request.job_timeout = Some(job_timeout);
        }
        if let Some(run_at) = self.run_at {
            request.run_at = Some(run_at);
        } else if let Some(delay) = self.delay {
            let delay = i64::try_from(delay).context("--delay is too large")?;
            request.run_at = Some(Utc::now() + chrono::Duration::seconds(delay));
        }
        if let Some(priority) = self.priority {
            request.priority = Some(priority);
        }

        if self.save_output {
            request.save_output = Some(true);
            if let Some(dir) = self.output_dir {
                let id = request
                    .id
                    .get_or_insert_with(|| Uuid::new_v4().to_string())
                    .clone();
                request.output_file = Some(resolve(cwd, &dir).join(format!("{id}.log")));
            }
            request.rotate_size = Some(
                self.rotate_size
                    .or(request.rotate_size)
                    .unwrap_or(DEFAULT_ROTATE_SIZE),
            );
            if let Some(count) = self.rotate_count {
                request.rotate_count = Some(count);
            }
        }

        Ok(request)
    }

    fn read_payload(&self, cwd: &Path) -> anyhow::Result<String> {
        if let Some(file) = &self.file {
            return read_file(&resolve(cwd, file));
        }
        match self.payload.as_deref() {
            Some(payload) => match payload.strip_prefix('@') {
                Some(path) => read_file(&resolve(cwd, Path::new(path))),
                None => Ok(payload.to_string()),
            },
            None => bail!("provide the job as an argument, as @path, or with --file"),
        }
    }
}

/// Strict JSON first; the lenient repair only when enabled
pub fn parse_payload(raw: &str, lenient: bool) -> anyhow::Result<JobRequest> {
    let strict = match JobRequest::from_json(raw) {
        Ok(request) => return Ok(request),
        Err(e) => e,
    };
    if !lenient {
        bail!(
            "{strict}. Quote the JSON for your shell, use --file, or pass --lenient"
        );
    }

    let repaired = lenient::normalize(raw)?;
    JobRequest::from_json(&repaired)
        .with_context(|| format!("failed to parse job data even after repair: {repaired}"))
}

fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("File not found: {}", path.display()))
}

fn resolve(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(payload: &str) -> EnqueueOptions {
        EnqueueOptions {
            payload: Some(payload.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_strict_payload() {
        let request = options(r#"{"command":"echo hi","max_retries":2}"#)
            .into_request(Path::new("/"))
            .unwrap();
        assert_eq!(request.command.as_deref(), Some("echo hi"));
        assert_eq!(request.max_retries, Some(2));
    }

    #[test]
    fn test_mangled_payload_needs_lenient() {
        assert!(options("{command:echo hi}").into_request(Path::new("/")).is_err());

        let mut opts = options("{command:echo hi}");
        opts.lenient = true;
        let request = opts.into_request(Path::new("/")).unwrap();
        assert_eq!(request.command.as_deref(), Some("echo hi"));
    }

    #[test]
    fn test_at_file_and_file_flag() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("job.json"), r#"{"command":"ls"}"#).unwrap();

        let request = options("@job.json").into_request(temp_dir.path()).unwrap();
        assert_eq!(request.command.as_deref(), Some("ls"));

        let opts = EnqueueOptions {
            file: Some(PathBuf::from("job.json")),
            ..Default::default()
        };
        assert_eq!(
            opts.into_request(temp_dir.path()).unwrap().command.as_deref(),
            Some("ls")
        );

        assert!(options("@missing.json").into_request(temp_dir.path()).is_err());
    }

    #[test]
    fn test_flags_override_payload() {
        let mut opts = options(r#"{"command":"true","priority":1,"max_retries":5}"#);
        opts.priority = Some(-3);
        opts.max_retries = Some(0);
        opts.delay = Some(60);
        let before = Utc::now();
        let request = opts.into_request(Path::new("/")).unwrap();

        assert_eq!(request.priority, Some(-3));
        assert_eq!(request.max_retries, Some(0));
        assert!(request.run_at.unwrap() >= before + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_rejects_bad_overrides() {
        let mut opts = options(r#"{"command":"true"}"#);
        opts.backoff_base = Some(0.0);
        assert!(opts.into_request(Path::new("/")).is_err());

        let mut opts = options(r#"{"command":"true"}"#);
        opts.job_timeout = Some(0);
        assert!(opts.into_request(Path::new("/")).is_err());
    }

    #[test]
    fn test_save_output_defaults() {
        let mut opts = options(r#"{"command":"true"}"#);
        opts.save_output = true;
        let request = opts.into_request(Path::new("/")).unwrap();
        assert_eq!(request.save_output, Some(true));
        assert_eq!(request.rotate_size, Some(DEFAULT_ROTATE_SIZE));
        assert!(request.output_file.is_none());

        let mut opts = options(r#"{"id":"job-7","command":"true"}"#);
        opts.save_output = true;
        opts.output_dir = Some(PathBuf::from("logs"));
        opts.rotate_count = Some(3);
        let request = opts.into_request(Path::new("/work")).unwrap();
        assert_eq!(request.output_file, Some(PathBuf::from("/work/logs/job-7.log")));
        assert_eq!(request.rotate_count, Some(3));
    }
}
