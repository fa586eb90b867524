use crate::{JobError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recognized configuration keys, in display order.
pub const CONFIG_KEYS: [&str; 3] = ["maxRetries", "backoffBase", "jobTimeout"];

/// Queue-wide defaults applied to a job when it is created.
///
/// Jobs copy these values at creation time and never consult them again,
/// so changing a default only affects jobs enqueued afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueDefaults {
    /// Failures tolerated before a job is dead-lettered
    pub max_retries: u32,

    /// Base of the exponential backoff, in seconds
    pub backoff_base: f64,

    /// Wall-clock limit for a single execution, in milliseconds
    pub job_timeout: u64,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        QueueDefaults {
            max_retries: 3,
            backoff_base: 2.0,
            job_timeout: 300_000, // 5 minutes
        }
    }
}

impl QueueDefaults {
    /// Look up a value by key. Accepts `camelCase` or `kebab-case`.
    pub fn get(&self, key: &str) -> Option<Value> {
        match normalize_key(key).as_str() {
            "maxRetries" => Some(Value::from(self.max_retries)),
            "backoffBase" => Some(Value::from(self.backoff_base)),
            "jobTimeout" => Some(Value::from(self.job_timeout)),
            _ => None,
        }
    }

    /// Parse and validate `value`, then assign it to `key`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match normalize_key(key).as_str() {
            "maxRetries" => {
                self.max_retries = value.parse::<u32>().map_err(|_| {
                    JobError::InvalidConfig(format!("{key} must be a non-negative integer"))
                })?;
            }
            "backoffBase" => {
                let base = value.parse::<f64>().ok().filter(|b| b.is_finite() && *b > 0.0);
                self.backoff_base = base.ok_or_else(|| {
                    JobError::InvalidConfig(format!("{key} must be a positive number"))
                })?;
            }
            "jobTimeout" => {
                let timeout = value.parse::<u64>().ok().filter(|t| *t > 0);
                self.job_timeout = timeout.ok_or_else(|| {
                    JobError::InvalidConfig(format!(
                        "{key} must be a positive integer (milliseconds)"
                    ))
                })?;
            }
            _ => {
                return Err(JobError::InvalidConfig(format!(
                    "unknown key '{key}', valid keys: max-retries, backoff-base, job-timeout"
                )))
            }
        }
        Ok(())
    }

    /// All keys with their current values
    pub fn entries(&self) -> Vec<(&'static str, Value)> {
        CONFIG_KEYS
            .iter()
            .filter_map(|key| self.get(key).map(|value| (*key, value)))
            .collect()
    }
}

/// Convert `kebab-case` keys to the `camelCase` form used on disk.
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for c in key.trim().chars() {
        if c == '-' || c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Convert an on-disk `camelCase` key to `kebab-case` for display.
pub fn display_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 2);
    for c in key.chars() {
        if c.is_uppercase() {
            out.push('-');
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
