use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Directory holding the shared job store
    pub data_dir: PathBuf,
    pub worker_id: Option<String>,
    /// Workers to run in this process
    pub count: usize,
    pub poll_interval_ms: u64,
    /// Seconds between progress summaries in the log
    pub summary_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            data_dir: PathBuf::from("./data"),
            worker_id: None,
            count: 1,
            poll_interval_ms: 2000,
            summary_interval_secs: 60,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// ID for the `index`-th worker of this process
    pub fn worker_id_for(&self, base: &str, index: usize) -> String {
        if self.count > 1 {
            format!("{}-{}", base, index + 1)
        } else {
            base.to_string()
        }
    }

    pub fn generate_worker_id(&self) -> String {
        use std::process;
        use uuid::Uuid;

        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = process::id();
        let uuid = Uuid::new_v4().to_string();
        let random = uuid.split('-').next().unwrap_or_default();

        format!("{}-{}-{}", hostname, pid, random)
    }
}
