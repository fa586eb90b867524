use crate::store::write_atomic;
use crate::{PersistenceError, Result, StoreLock};
use job_queue_core::QueueDefaults;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

const CONFIG_FILE: &str = "config.json";
const LOCK_FILE: &str = "store.lock";

/// Queue defaults persisted as `config.json` in the data directory
pub struct ConfigStore {
    path: PathBuf,
    lock_path: PathBuf,
    values: QueueDefaults,
}

impl ConfigStore {
    /// Load the config; a missing file means every key has its default
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(CONFIG_FILE);
        let values = read_defaults(&path)?;
        Ok(ConfigStore {
            path,
            lock_path: data_dir.join(LOCK_FILE),
            values,
        })
    }

    /// Defaults to stamp onto newly enqueued jobs
    pub fn defaults(&self) -> QueueDefaults {
        self.values
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key)
    }

    pub fn all(&self) -> Vec<(&'static str, Value)> {
        self.values.entries()
    }

    /// Validate and persist a single key.
    ///
    /// The file is re-read under the store lock so concurrent `set`s of
    /// different keys do not overwrite each other.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let _lock = StoreLock::acquire(&self.lock_path)?;

        let mut values = read_defaults(&self.path)?;
        values.set(key, value)?;

        let data = serde_json::to_vec_pretty(&values)?;
        write_atomic(&self.path, &data)?;

        self.values = values;
        info!("Config {} set to {}", key, value.trim());
        Ok(())
    }
}

fn read_defaults(path: &Path) -> Result<QueueDefaults> {
    match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).map_err(|source| PersistenceError::CorruptFile {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(QueueDefaults::default()),
        Err(e) => Err(e.into()),
    }
}
