use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Dispatch priority of a job.
/// Higher values are dispatched first; the default is 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(i32);

impl Priority {
    pub const DEFAULT: Priority = Priority(0);

    /// Create a new priority value
    pub fn new(value: i32) -> Self {
        Priority(value)
    }

    /// Get the raw priority value
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Priority(value)
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::new(10) > Priority::new(5));
        assert!(Priority::new(0) > Priority::new(-3));
        assert_eq!(Priority::default(), Priority::DEFAULT);
    }

    #[test]
    fn test_priority_serializes_as_plain_integer() {
        let json = serde_json::to_string(&Priority::new(7)).unwrap();
        assert_eq!(json, "7");

        let parsed: Priority = serde_json::from_str("-2").unwrap();
        assert_eq!(parsed.value(), -2);
    }
}
