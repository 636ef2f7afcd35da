//! Externally visible install progress.
//!
//! A [`ProgressRecord`] is written by exactly one install run and read by any
//! number of status pollers through a shared [`ProgressCache`].

mod cache;
mod reporter;

pub use cache::{MemoryProgressCache, ProgressCache, RedisProgressCache};
pub use reporter::Reporter;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl InstallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallStatus::Pending => "PENDING",
            InstallStatus::Running => "RUNNING",
            InstallStatus::Completed => "COMPLETED",
            InstallStatus::Failed => "FAILED",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalizedText {
    pub lang: String,
    pub value: String,
}

/// Machine-readable failure payload attached to a record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressMessage {
    pub code: String,
    pub message: LocalizedText,
}

impl ProgressMessage {
    pub fn new(code: &str, value: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: LocalizedText {
                lang: "en".to_string(),
                value: value.into(),
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
    pub box_id: Uuid,
    pub cell: String,
    pub box_name: String,
    pub schema: Option<String>,
    pub status: InstallStatus,
    pub processed: u64,
    pub total: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message: Option<ProgressMessage>,
}

impl ProgressRecord {
    pub fn new(box_id: Uuid, cell: &str, box_name: &str, total: u64) -> Self {
        Self {
            box_id,
            cell: cell.to_string(),
            box_name: box_name.to_string(),
            schema: None,
            status: InstallStatus::Pending,
            processed: 0,
            total,
            started_at: None,
            ended_at: None,
            message: None,
        }
    }

    pub fn cache_key(&self) -> String {
        cache_key(self.box_id)
    }

    /// Share of processed entries, capped at 100.
    pub fn percent(&self) -> u64 {
        if self.status == InstallStatus::Completed {
            return 100;
        }
        if self.total == 0 {
            return 0;
        }
        (self.processed * 100 / self.total).min(100)
    }
}

/// Cache key under which a box's progress record is stored.
pub fn cache_key(box_id: Uuid) -> String {
    format!("box-{}", box_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_is_capped() {
        let mut record = ProgressRecord::new(Uuid::new_v4(), "cell", "box", 4);
        record.processed = 1;
        assert_eq!(record.percent(), 25);
        record.processed = 9;
        assert_eq!(record.percent(), 100);
        record.total = 0;
        assert_eq!(record.percent(), 0);
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_value(InstallStatus::Running).unwrap();
        assert_eq!(json, "RUNNING");
        assert_eq!(cache_key(Uuid::nil()), format!("box-{}", Uuid::nil()));
    }
}
