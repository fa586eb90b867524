use chrono::{DateTime, Utc};
use job_queue_core::{Job, JobOutput};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Append-only log of a job's executions, rotated by size.
///
/// Rotated generations sit beside the live file as `<file>.1` (newest) up to
/// `<file>.<rotate_count>`. The log outlives the job record.
#[derive(Debug, Clone)]
pub struct OutputLog {
    path: PathBuf,
    rotate_size: Option<u64>,
    rotate_count: u32,
}

impl OutputLog {
    pub fn new(path: impl Into<PathBuf>, rotate_size: Option<u64>, rotate_count: u32) -> Self {
        OutputLog {
            path: path.into(),
            rotate_size,
            rotate_count,
        }
    }

    /// The log for `job`, falling back to `default_path` when it names none
    pub fn for_job(job: &Job, default_path: PathBuf) -> Self {
        let path = job.output_file.clone().unwrap_or(default_path);
        Self::new(path, job.rotate_size, job.rotate_count)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of rotated generation `n`
    pub fn generation(&self, n: u32) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    /// Append one execution block, then rotate if the file grew too large
    pub fn append(&self, success: bool, output: &JobOutput, at: DateTime<Utc>) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(format_block(success, output, at).as_bytes())?;
        file.flush()?;
        drop(file);

        self.rotate_if_needed(at)
    }

    /// Rotate when the live file exceeds `rotate_size`
    pub fn rotate_if_needed(&self, at: DateTime<Utc>) -> io::Result<()> {
        let Some(limit) = self.rotate_size else {
            return Ok(());
        };
        if fs::metadata(&self.path)?.len() > limit {
            self.rotate(at)?;
        }
        Ok(())
    }

    /// Shift every generation up by one, dropping the oldest, and restart the
    /// live file with a rotation header.
    pub fn rotate(&self, at: DateTime<Utc>) -> io::Result<()> {
        let keep = self.rotate_count.max(1);

        remove_if_exists(&self.generation(keep))?;
        for n in (1..keep).rev() {
            rename_if_exists(&self.generation(n), &self.generation(n + 1))?;
        }
        fs::rename(&self.path, self.generation(1))?;
        fs::write(&self.path, format!("Rotated at {}\n", at.to_rfc3339()))?;

        info!("Rotated output log {:?}", self.path);
        Ok(())
    }
}

fn format_block(success: bool, output: &JobOutput, at: DateTime<Utc>) -> String {
    let tag = if success { "SUCCESS" } else { "FAIL" };
    let mut block = format!("\n=== {} | {} ===\n", at.to_rfc3339(), tag);
    if let Some(stdout) = &output.stdout {
        block.push_str(&format!("STDOUT:\n{stdout}\n"));
    }
    if let Some(stderr) = &output.stderr {
        block.push_str(&format!("STDERR:\n{stderr}\n"));
    }
    block
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

fn rename_if_exists(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}
