use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EXIT_CONFIGURATION;

/// Exit status used when the supervisor itself was interrupted by a signal.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Terminal outcome of one supervisor invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Exhausted,
    SkippedLocked,
    ConfigurationError,
    Interrupted,
}

impl RunStatus {
    /// Status reported to the scheduler that invoked us.
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Succeeded | RunStatus::SkippedLocked => 0,
            RunStatus::Exhausted => 1,
            RunStatus::ConfigurationError => EXIT_CONFIGURATION,
            RunStatus::Interrupted => EXIT_INTERRUPTED,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptOutcome {
    pub attempt: u32,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AttemptOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// In-memory view of a finished run. The log file is the persisted copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub attempts: Vec<AttemptOutcome>,
    /// Exit status of the last attempt, if any attempt was made.
    pub final_exit_code: Option<i32>,
    pub log_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(RunStatus::Succeeded.exit_code(), 0);
        assert_eq!(RunStatus::SkippedLocked.exit_code(), 0);
        assert_eq!(RunStatus::Exhausted.exit_code(), 1);
        assert_eq!(RunStatus::ConfigurationError.exit_code(), 2);
        assert_eq!(RunStatus::Interrupted.exit_code(), 130);
    }

    #[test]
    fn test_run_status_serde() {
        let json = serde_json::to_string(&RunStatus::SkippedLocked).expect("serialize");
        assert_eq!(json, "\"SkippedLocked\"");
    }

    #[test]
    fn test_run_record_without_error_omits_field() {
        let now = Utc::now();
        let record = RunRecord {
            job: "deals".to_string(),
            started_at: now,
            finished_at: now,
            status: RunStatus::Succeeded,
            attempts: vec![AttemptOutcome {
                attempt: 1,
                exit_code: 0,
                started_at: now,
                finished_at: now,
            }],
            final_exit_code: Some(0),
            log_path: PathBuf::from("/tmp/deals_20250101_000000.log"),
            error: None,
        };
        let json = serde_json::to_string(&record).expect("serialize");
        assert!(!json.contains("\"error\""));
        let back: RunRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, record);
        assert!(back.attempts[0].succeeded());
    }
}
