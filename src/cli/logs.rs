// CLI log commands: logs, sweep

use std::io::{self, Write};

use chrono::Utc;

use super::Environment;
use crate::models::job::validate_job_name;
use crate::storage::logs::FsLogStore;
use crate::storage::LogStore;

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// supervisor logs
pub async fn cmd_logs(
    env: &Environment,
    job: &str,
    last: Option<usize>,
    tail: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    validate_job_name(job)?;
    let store = FsLogStore::new(env.log_dir()).await?;

    if tail.is_some() {
        // Show the newest run's log
        let runs = store.list_runs(job, 1).await?;
        let Some(run) = runs.first() else {
            println!("No runs found for job '{}'.", job);
            return Ok(());
        };
        let content = store.read_log(&run.path, tail).await?;
        if json {
            let body = serde_json::json!({
                "path": run.path,
                "started_at": run.started_at,
                "content": content,
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
        } else {
            print!("{}", content);
            io::stdout().flush()?;
        }
        return Ok(());
    }

    let limit = last.unwrap_or(20);
    let runs = store.list_runs(job, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs found for job '{}'.", job);
        return Ok(());
    }

    println!("Showing {} run(s) for job '{}':\n", runs.len(), job);
    println!("{:<22}{:<12}PATH", "STARTED", "SIZE");
    for run in &runs {
        println!(
            "{:<22}{:<12}{}",
            run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            format_size(run.size_bytes),
            run.path.display()
        );
    }
    Ok(())
}

/// supervisor sweep
pub async fn cmd_sweep(env: &Environment, days: Option<u64>, json: bool) -> anyhow::Result<()> {
    let days = days.unwrap_or(env.config.log_retention_days);
    // chrono::Duration::days panics far beyond any sensible retention.
    let retention = chrono::Duration::days(days.min(1_000_000) as i64);
    let store = FsLogStore::new(env.log_dir()).await?;

    let report = store.sweep(retention, Utc::now()).await?;
    tracing::info!(
        removed = report.removed.len(),
        kept = report.kept,
        "Log sweep finished"
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for path in &report.removed {
        println!("Removed {}", path.display());
    }
    println!(
        "Removed {} log file(s) older than {} days, kept {}.",
        report.removed.len(),
        days,
        report.kept
    );
    Ok(())
}
