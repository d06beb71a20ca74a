pub mod logs;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

/// One run log file found on disk.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunLogEntry {
    pub job: String,
    /// Local start time, as embedded in the file name.
    pub started_at: NaiveDateTime,
    /// 1 for the first run in that second, then 2, 3, ...
    pub sequence: u32,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Result of a retention sweep.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Create a new run log for `job` started at `started_at`. Never reuses
    /// the file of an earlier run.
    async fn open_run(&self, job: &str, started_at: DateTime<Utc>) -> Result<PathBuf>;
    async fn append_line(&self, log_path: &Path, line: &str) -> Result<()>;
    /// Append-mode handle suitable for a child's stdout/stderr.
    fn output_handle(&self, log_path: &Path) -> Result<std::fs::File>;
    /// Runs of `job`, newest first.
    async fn list_runs(&self, job: &str, limit: usize) -> Result<Vec<RunLogEntry>>;
    async fn read_log(&self, log_path: &Path, tail: Option<usize>) -> Result<String>;
    /// Delete run logs last modified more than `retention` before `now`.
    /// Service output files are left alone.
    async fn sweep(&self, retention: chrono::Duration, now: DateTime<Utc>) -> Result<SweepReport>;
}
