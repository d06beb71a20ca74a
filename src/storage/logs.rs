use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::errors::SupervisorError;
use crate::storage::{LogStore, RunLogEntry, SweepReport};

const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Output file of a detached service, `<instance>.out.log`. Not a run log.
pub const SERVICE_OUTPUT_SUFFIX: &str = ".out.log";

/// Runs of one job started within the same second.
const MAX_RUNS_PER_SECOND: u32 = 1000;

/// Name of the `sequence`-th run of `job` within one second, local time:
/// `<job>_<YYYYMMDD_HHMMSS>.log`, then `<job>_<YYYYMMDD_HHMMSS>-2.log` and
/// so on.
pub fn run_log_file_name(job: &str, started_at: DateTime<Utc>, sequence: u32) -> String {
    let stamp = started_at
        .with_timezone(&Local)
        .format(FILE_TIMESTAMP_FORMAT);
    if sequence <= 1 {
        format!("{}_{}.log", job, stamp)
    } else {
        format!("{}_{}-{}.log", job, stamp, sequence)
    }
}

/// Extract the start time and same-second sequence from a run log name
/// belonging to `job`.
///
/// The suffix must parse as a timestamp, so `deals` never claims the logs
/// of a job called `deals_full`.
pub fn parse_log_file_name(job: &str, file_name: &str) -> Option<(NaiveDateTime, u32)> {
    let stamp = file_name
        .strip_prefix(job)?
        .strip_prefix('_')?
        .strip_suffix(".log")?;
    let (stamp, sequence) = match stamp.split_once('-') {
        Some((stamp, n)) => (stamp, n.parse::<u32>().ok().filter(|n| *n > 1)?),
        None => (stamp, 1),
    };
    let started_at = NaiveDateTime::parse_from_str(stamp, FILE_TIMESTAMP_FORMAT).ok()?;
    Some((started_at, sequence))
}

pub struct FsLogStore {
    logs_dir: PathBuf,
}

impl FsLogStore {
    /// Create a store rooted at `logs_dir`, creating the directory if needed.
    ///
    /// An unusable directory is a configuration problem, not a job failure.
    pub async fn new(logs_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&logs_dir).await.map_err(|e| {
            SupervisorError::Configuration(format!(
                "Log directory {} is not accessible: {}",
                logs_dir.display(),
                e
            ))
        })?;
        Ok(Self { logs_dir })
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }
}

#[async_trait]
impl LogStore for FsLogStore {
    async fn open_run(&self, job: &str, started_at: DateTime<Utc>) -> Result<PathBuf> {
        for sequence in 1..=MAX_RUNS_PER_SECOND {
            let path = self
                .logs_dir
                .join(run_log_file_name(job, started_at, sequence));
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(path),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(SupervisorError::Configuration(format!(
                        "Cannot create log file {}: {}",
                        path.display(),
                        e
                    ))
                    .into())
                }
            }
        }
        Err(SupervisorError::Configuration(format!(
            "Too many runs of '{}' within one second in {}",
            job,
            self.logs_dir.display()
        ))
        .into())
    }

    async fn append_line(&self, log_path: &Path, line: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await
            .context("Failed to open log file for appending")?;

        let mut data = line.to_string();
        if !data.ends_with('\n') {
            data.push('\n');
        }
        file.write_all(data.as_bytes())
            .await
            .context("Failed to append to log file")?;
        file.flush().await.context("Failed to flush log file")?;
        Ok(())
    }

    fn output_handle(&self, log_path: &Path) -> Result<std::fs::File> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .context("Failed to open log file for command output")
    }

    async fn list_runs(&self, job: &str, limit: usize) -> Result<Vec<RunLogEntry>> {
        if !self.logs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.logs_dir)
            .await
            .context("Failed to read log directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((started_at, sequence)) = parse_log_file_name(job, name) {
                let size_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                runs.push(RunLogEntry {
                    job: job.to_string(),
                    started_at,
                    sequence,
                    path,
                    size_bytes,
                });
            }
        }

        runs.sort_by(|a, b| {
            (b.started_at, b.sequence).cmp(&(a.started_at, a.sequence))
        });
        runs.truncate(limit);
        Ok(runs)
    }

    async fn read_log(&self, log_path: &Path, tail: Option<usize>) -> Result<String> {
        if !log_path.exists() {
            return Ok(String::new());
        }

        let bytes = tokio::fs::read(log_path)
            .await
            .context("Failed to read log file")?;
        // Child output is opaque bytes; do not fail on invalid UTF-8.
        let content = String::from_utf8_lossy(&bytes).into_owned();

        match tail {
            Some(n) => {
                let lines: Vec<&str> = content.lines().collect();
                let start = lines.len().saturating_sub(n);
                Ok(lines[start..].join("\n"))
            }
            None => Ok(content),
        }
    }

    async fn sweep(&self, retention: chrono::Duration, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        if !self.logs_dir.exists() {
            return Ok(report);
        }

        let cutoff = now - retention;
        let mut entries = tokio::fs::read_dir(&self.logs_dir)
            .await
            .context("Failed to read log directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Service output belongs to a process that may still be writing it.
            if !name.ends_with(".log") || name.ends_with(SERVICE_OUTPUT_SUFFIX) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let modified: DateTime<Utc> = match metadata.modified() {
                Ok(t) => t.into(),
                Err(e) => {
                    tracing::warn!("No modification time for {}: {}", path.display(), e);
                    report.kept += 1;
                    continue;
                }
            };

            if modified < cutoff {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        tracing::info!("Removed expired log {}", path.display());
                        report.removed.push(path);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to remove expired log {}: {}", path.display(), e);
                        report.kept += 1;
                    }
                }
            } else {
                report.kept += 1;
            }
        }

        report.removed.sort();
        Ok(report)
    }
}
