mod enqueue;
mod lenient;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use enqueue::EnqueueOptions;
use job_queue_broker::{JobQueue, QueueStats, WorkerRegistry};
use job_queue_core::{display_key, Job, JobState};
use job_queue_persistence::{ConfigStore, JobStore, JobStoreConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bytes of the output log shown by `job show`
const SHOW_TAIL_BYTES: usize = 4000;
/// Bytes of the output log printed by `job tail`
const TAIL_BYTES: usize = 1000;

#[derive(Parser, Debug)]
#[command(name = "jobqctl")]
#[command(about = "Job Queue Admin CLI", long_about = None)]
struct Args {
    /// Data directory of the job store
    #[arg(long, env = "JOBQ_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Output format (json, table, yaml)
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a new job
    Enqueue(EnqueueOptions),

    /// Show job counts and running workers
    Status,

    /// List jobs
    List {
        /// Filter by state
        #[arg(short, long)]
        state: Option<String>,
    },

    /// Inspect a single job
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Dead letter queue
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Queue defaults for new jobs
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Running workers
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Print queue metrics
    Metrics,
}

#[derive(Subcommand, Debug)]
enum JobCommands {
    /// Show job details and recent output
    Show { job_id: String },
    /// Print the end of the job's output log
    Tail { job_id: String },
}

#[derive(Subcommand, Debug)]
enum DlqCommands {
    /// List dead jobs
    List,
    /// Move a dead job back to pending
    Retry { job_id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show one key, or all of them
    Get { key: Option<String> },
    /// Set a key (max-retries, backoff-base, job-timeout)
    Set { key: String, value: String },
}

#[derive(Subcommand, Debug)]
enum WorkerCommands {
    /// List live workers
    List,
    /// Ask every worker to stop after its current job
    Stop,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing; stdout is reserved for command output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let ctx = Admin::open(&args.data_dir, args.format)?;

    match args.command {
        Commands::Enqueue(options) => ctx.enqueue(options),
        Commands::Status => ctx.status(),
        Commands::List { state } => ctx.list(state.as_deref()),
        Commands::Job { command } => match command {
            JobCommands::Show { job_id } => ctx.show_job(&job_id),
            JobCommands::Tail { job_id } => ctx.tail_job(&job_id),
        },
        Commands::Dlq { command } => match command {
            DlqCommands::List => ctx.dlq_list(),
            DlqCommands::Retry { job_id } => ctx.dlq_retry(&job_id),
        },
        Commands::Config { command } => match command {
            ConfigCommands::Get { key } => ctx.config_get(key.as_deref()),
            ConfigCommands::Set { key, value } => ctx.config_set(&key, &value),
        },
        Commands::Worker { command } => match command {
            WorkerCommands::List => ctx.worker_list(),
            WorkerCommands::Stop => ctx.worker_stop(),
        },
        Commands::Metrics => ctx.metrics(),
    }
}

struct Admin {
    format: String,
    store: Arc<JobStore>,
    queue: JobQueue,
    registry: WorkerRegistry,
    data_dir: PathBuf,
}

impl Admin {
    fn open(data_dir: &Path, format: String) -> anyhow::Result<Self> {
        let store = Arc::new(
            JobStore::open(JobStoreConfig::new(data_dir))
                .with_context(|| format!("failed to open job store in {}", data_dir.display()))?,
        );
        Ok(Admin {
            format,
            queue: JobQueue::new(store.clone()),
            registry: WorkerRegistry::new(store.clone()),
            store,
            data_dir: data_dir.to_path_buf(),
        })
    }

    fn emit<T: Serialize>(&self, value: &T, table: impl FnOnce() -> String) -> anyhow::Result<()> {
        match self.format.as_str() {
            "json" => println!("{}", serde_json::to_string_pretty(value)?),
            "yaml" => print!("{}", serde_yaml::to_string(value)?),
            _ => println!("{}", table()),
        }
        Ok(())
    }

    fn enqueue(&self, options: EnqueueOptions) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let request = options.into_request(&cwd)?;
        let defaults = ConfigStore::open(&self.data_dir)?.defaults();
        let job = self
            .queue
            .enqueue(request, &defaults)
            .context("Failed to enqueue job")?;

        self.emit(&job, || {
            let mut table = new_table(vec!["Field", "Value"]);
            table.add_row(vec!["ID", job.id.as_str()]);
            table.add_row(vec!["Command", job.command.as_str()]);
            table.add_row(vec!["State", job.state.as_str()]);
            table.add_row(vec!["Max Retries", &job.max_retries.to_string()]);
            format!("Job enqueued successfully!\n{table}")
        })
    }

    fn status(&self) -> anyhow::Result<()> {
        let stats = self.queue.stats()?;
        let workers = self.registry.list()?;

        let value = serde_json::json!({ "jobs": stats, "workers": workers });
        self.emit(&value, || {
            let mut out = stats_table(&stats).to_string();
            out.push_str("\n\nActive Workers\n");
            if workers.is_empty() {
                out.push_str("No workers currently running");
            } else {
                let mut table = new_table(vec!["Worker ID", "Started At", "PID"]);
                for worker in &workers {
                    table.add_row(vec![
                        worker.id.clone(),
                        worker.started_at.to_rfc3339(),
                        worker.pid.to_string(),
                    ]);
                }
                out.push_str(&table.to_string());
            }
            out
        })
    }

    fn list(&self, state: Option<&str>) -> anyhow::Result<()> {
        let state = state.map(str::parse::<JobState>).transpose()?;
        let jobs = self.queue.list(state)?;

        self.emit(&jobs, || {
            if jobs.is_empty() {
                return match state {
                    Some(state) => format!("No jobs in \"{state}\" state"),
                    None => "No jobs found".to_string(),
                };
            }
            let mut table =
                new_table(vec!["ID", "Command", "State", "Attempts", "Priority", "Created At"]);
            for job in &jobs {
                table.add_row(vec![
                    job.id.clone(),
                    shorten(&job.command, 40),
                    job.state.to_string(),
                    format!("{}/{}", job.attempts, job.max_retries),
                    job.priority.to_string(),
                    job.created_at.to_rfc3339(),
                ]);
            }
            format!("Jobs ({})\n{table}", jobs.len())
        })
    }

    fn show_job(&self, job_id: &str) -> anyhow::Result<()> {
        let job = self.find_job(job_id)?;
        let log_path = self.output_path(&job);
        let tail = log_path
            .as_deref()
            .filter(|path| path.exists())
            .map(|path| read_tail(path, SHOW_TAIL_BYTES))
            .transpose()?;

        #[derive(Serialize)]
        struct JobDetails<'a> {
            #[serde(flatten)]
            job: &'a Job,
            output_tail: Option<&'a str>,
        }
        let details = JobDetails {
            job: &job,
            output_tail: tail.as_deref(),
        };

        self.emit(&details, || {
            let mut table = new_table(vec!["Field", "Value"]);
            table.add_row(vec!["ID".to_string(), job.id.clone()]);
            table.add_row(vec!["Command".to_string(), job.command.clone()]);
            table.add_row(vec!["State".to_string(), job.state.to_string()]);
            table.add_row(vec![
                "Attempts".to_string(),
                format!("{}/{}", job.attempts, job.max_retries),
            ]);
            table.add_row(vec!["Priority".to_string(), job.priority.to_string()]);
            if let Some(run_at) = job.run_at {
                table.add_row(vec!["Run At".to_string(), run_at.to_rfc3339()]);
            }
            if let Some(next) = job.next_retry_at {
                table.add_row(vec!["Next Retry".to_string(), next.to_rfc3339()]);
            }
            if let Some(worker) = &job.locked_by {
                table.add_row(vec!["Worker".to_string(), worker.clone()]);
            }
            if let Some(error) = &job.error {
                table.add_row(vec!["Error".to_string(), error.clone()]);
            }
            table.add_row(vec!["Created At".to_string(), job.created_at.to_rfc3339()]);
            table.add_row(vec!["Updated At".to_string(), job.updated_at.to_rfc3339()]);

            let mut out = format!("{table}\n\nOutput\n");
            match (&log_path, &tail) {
                (Some(path), Some(tail)) => {
                    out.push_str(&format!(
                        "Output file: {}\n--- FILE TAIL ---\n{}\n--- END ---",
                        path.display(),
                        tail
                    ));
                }
                _ => {
                    let output = job.output.clone().unwrap_or_default();
                    out.push_str(&format!(
                        "Stdout:\n{}\n\nStderr:\n{}",
                        output.stdout.as_deref().unwrap_or("[no stdout]"),
                        output.stderr.as_deref().unwrap_or("[no stderr]")
                    ));
                }
            }
            out
        })
    }

    fn tail_job(&self, job_id: &str) -> anyhow::Result<()> {
        let job = self.find_job(job_id)?;
        let path = job
            .output_file
            .clone()
            .unwrap_or_else(|| self.store.default_output_file(&job.id));
        if !path.exists() {
            bail!("Output file not found: {}", path.display());
        }
        println!("{}", read_tail(&path, TAIL_BYTES)?);
        Ok(())
    }

    fn dlq_list(&self) -> anyhow::Result<()> {
        let jobs = self.queue.dead_jobs()?;

        self.emit(&jobs, || {
            if jobs.is_empty() {
                return "Dead Letter Queue is empty".to_string();
            }
            let mut table =
                new_table(vec!["ID", "Command", "Attempts", "Last Error", "Updated At"]);
            for job in &jobs {
                table.add_row(vec![
                    job.id.clone(),
                    shorten(&job.command, 30),
                    job.attempts.to_string(),
                    shorten(job.error.as_deref().unwrap_or("Unknown error"), 40),
                    job.updated_at.to_rfc3339(),
                ]);
            }
            format!(
                "Dead Letter Queue: {} job(s)\n{table}\nUse `jobqctl dlq retry <job-id>` to retry a job",
                jobs.len()
            )
        })
    }

    fn dlq_retry(&self, job_id: &str) -> anyhow::Result<()> {
        let job = self
            .queue
            .retry_dead_job(job_id)
            .with_context(|| format!("Failed to retry job {job_id}"))?;

        self.emit(&job, || {
            format!(
                "Job {} moved from the DLQ back to pending (attempts reset to {})",
                job.id, job.attempts
            )
        })
    }

    fn config_get(&self, key: Option<&str>) -> anyhow::Result<()> {
        let config = ConfigStore::open(&self.data_dir)?;

        match key {
            Some(key) => {
                let Some(value) = config.get(key) else {
                    bail!(
                        "Unknown config key '{key}'. \
                         Valid keys: max-retries, backoff-base, job-timeout"
                    );
                };
                self.emit(&value, || value.to_string())
            }
            None => {
                let entries: serde_json::Map<String, serde_json::Value> = config
                    .all()
                    .into_iter()
                    .map(|(key, value)| (key.to_string(), value))
                    .collect();
                self.emit(&entries, || {
                    let mut table = new_table(vec!["Key", "Value"]);
                    for (key, value) in &entries {
                        table.add_row(vec![display_key(key), value.to_string()]);
                    }
                    table.to_string()
                })
            }
        }
    }

    fn config_set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut config = ConfigStore::open(&self.data_dir)?;
        config.set(key, value)?;
        let stored = config.get(key).unwrap_or_default();

        self.emit(&serde_json::json!({ key: stored.clone() }), || {
            format!("Set {} = {}", display_key(&job_queue_core::normalize_key(key)), stored)
        })
    }

    fn worker_list(&self) -> anyhow::Result<()> {
        let workers = self.registry.list()?;

        self.emit(&workers, || {
            if workers.is_empty() {
                return "No workers currently running".to_string();
            }
            let mut table = new_table(vec!["Worker ID", "Started At", "PID"]);
            for worker in &workers {
                table.add_row(vec![
                    worker.id.clone(),
                    worker.started_at.to_rfc3339(),
                    worker.pid.to_string(),
                ]);
            }
            table.to_string()
        })
    }

    fn worker_stop(&self) -> anyhow::Result<()> {
        let count = self.registry.clear()?;

        self.emit(&serde_json::json!({ "stopped": count }), || {
            if count == 0 {
                "No workers currently running".to_string()
            } else {
                format!("Signalled {count} worker(s) to stop after their current job")
            }
        })
    }

    fn metrics(&self) -> anyhow::Result<()> {
        let stats = self.queue.stats()?;
        let active_workers = self.registry.count_alive()?;

        let value = serde_json::json!({ "jobs": stats, "active_workers": active_workers });
        self.emit(&value, || {
            let mut table = stats_table(&stats);
            table.add_row(vec!["Active Workers".to_string(), active_workers.to_string()]);
            format!("Queue Metrics\n{table}")
        })
    }

    fn find_job(&self, job_id: &str) -> anyhow::Result<Job> {
        match self.queue.get_job(job_id)? {
            Some(job) => Ok(job),
            None => bail!("Job not found: {job_id}"),
        }
    }

    /// Where the job's output log lives, if it keeps one
    fn output_path(&self, job: &Job) -> Option<PathBuf> {
        match &job.output_file {
            Some(path) => Some(path.clone()),
            None if job.save_output => Some(self.store.default_output_file(&job.id)),
            None => None,
        }
    }
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(header);
    table
}

fn stats_table(stats: &QueueStats) -> Table {
    let mut table = new_table(vec!["Metric", "Count"]);
    table.add_row(vec!["Total Jobs".to_string(), stats.total.to_string()]);
    for state in JobState::ALL {
        let label = match state {
            JobState::Dead => "Dead (DLQ)".to_string(),
            state => capitalize(state.as_str()),
        };
        table.add_row(vec![label, stats.count(state).to_string()]);
    }
    table
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn shorten(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{cut}...")
}

/// The last `max_bytes` of a file, decoded lossily
fn read_tail(path: &Path, max_bytes: usize) -> anyhow::Result<String> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read output file {}", path.display()))?;
    let start = data.len().saturating_sub(max_bytes);
    let tail = String::from_utf8_lossy(&data[start..]);
    // a cut through a multi-byte character decodes as replacement chars
    Ok(tail.trim_start_matches('\u{FFFD}').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shorten() {
        assert_eq!(shorten("short", 10), "short");
        assert_eq!(shorten("a much longer command line", 10), "a much ...");
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("pending"), "Pending");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn test_read_tail() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tail.log");
        std::fs::write(&path, "0123456789").unwrap();
        assert_eq!(read_tail(&path, 4).unwrap(), "6789");
        assert_eq!(read_tail(&path, 100).unwrap(), "0123456789");

        std::fs::write(&path, "ab\u{e9}").unwrap();
        assert_eq!(read_tail(&path, 1).unwrap(), "");
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "jobqctl", "--data-dir", "/tmp/q", "enqueue", r#"{"command":"ls"}"#,
            "--priority", "-2", "--save-output", "--rotate-count", "2",
        ])
        .unwrap();
        assert_eq!(args.data_dir, PathBuf::from("/tmp/q"));
        match args.command {
            Commands::Enqueue(options) => {
                assert_eq!(options.priority, Some(-2));
                assert!(options.save_output);
                assert_eq!(options.rotate_count, Some(2));
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Args::try_parse_from(["jobqctl", "enqueue", "x", "--rotate-size", "5"]).is_err());
    }

    #[test]
    fn test_context_commands_run_against_store() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = Admin::open(temp_dir.path(), "json".to_string()).unwrap();

        let options = EnqueueOptions {
            payload: Some(r#"{"id":"cli-1","command":"echo hi"}"#.to_string()),
            ..Default::default()
        };
        ctx.enqueue(options).unwrap();
        assert!(ctx.queue.get_job("cli-1").unwrap().is_some());

        ctx.list(Some("pending")).unwrap();
        assert!(ctx.list(Some("running")).is_err());
        ctx.show_job("cli-1").unwrap();
        assert!(ctx.show_job("missing").is_err());
        assert!(ctx.tail_job("cli-1").is_err());
        assert!(ctx.dlq_retry("cli-1").is_err());

        ctx.config_set("max-retries", "7").unwrap();
        assert!(ctx.config_set("colour", "blue").is_err());
        assert_eq!(
            ConfigStore::open(temp_dir.path()).unwrap().defaults().max_retries,
            7
        );
        ctx.status().unwrap();
        ctx.metrics().unwrap();
        ctx.worker_stop().unwrap();
    }
}
