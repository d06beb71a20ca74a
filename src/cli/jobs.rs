// CLI job commands: run, jobs, unlock

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{parse_env_vars, Environment, RunArgs};
use crate::errors::SupervisorError;
use crate::interpreter::InterpreterResolver;
use crate::models::{ExecutionType, JobDefinition, RunRecord, RunStatus, SupervisorConfig};
use crate::runner::ProcessRunner;
use crate::storage::logs::FsLogStore;
use crate::supervisor::lock::JobLock;
use crate::supervisor::{Supervisor, SupervisorSettings};

/// Format a relative time string like "2 minutes ago".
pub(crate) fn format_relative_time(dt: &DateTime<Utc>) -> String {
    let secs = Utc::now().signed_duration_since(*dt).num_seconds().max(0);
    if secs < 60 {
        format!("{} seconds ago", secs)
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86400 {
        format!("{} hours ago", secs / 3600)
    } else {
        format!("{} days ago", secs / 86400)
    }
}

/// Combine the config entry for `args.job` (if any) with the command-line
/// overrides.
pub fn resolve_job(args: &RunArgs, config: &SupervisorConfig) -> anyhow::Result<JobDefinition> {
    let configured = config.jobs.get(&args.job);

    let execution = match (&args.command, &args.script, configured) {
        (Some(program), _, _) => ExecutionType::Program {
            program: program.clone(),
            args: args.args.clone(),
        },
        (None, Some(script), _) => ExecutionType::Script {
            script: script.clone(),
            args: args.args.clone(),
        },
        (None, None, Some(job)) => {
            let mut execution = job.execution.clone();
            if !args.args.is_empty() {
                match &mut execution {
                    ExecutionType::Program { args: a, .. }
                    | ExecutionType::Script { args: a, .. } => *a = args.args.clone(),
                }
            }
            execution
        }
        (None, None, None) => {
            return Err(SupervisorError::Configuration(format!(
                "Job '{}' is not defined in the config and no --command or --script was given",
                args.job
            ))
            .into())
        }
    };

    let mut job = match configured {
        Some(entry) => JobDefinition::from_config(&args.job, entry, config),
        None => JobDefinition {
            name: args.job.clone(),
            execution: execution.clone(),
            max_attempts: config.max_attempts,
            retry_delay_secs: config.retry_delay_secs,
            working_dir: None,
            env_vars: None,
        },
    };
    job.execution = execution;

    if let Some(max_attempts) = args.max_attempts {
        job.max_attempts = max_attempts;
    }
    if let Some(delay) = args.retry_delay {
        job.retry_delay_secs = delay;
    }
    if let Some(ref dir) = args.working_dir {
        job.working_dir = Some(dir.clone());
    }
    if !args.env.is_empty() {
        let overrides = parse_env_vars(&args.env).map_err(SupervisorError::Validation)?;
        job.env_vars.get_or_insert_with(Default::default).extend(overrides);
    }

    Ok(job)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if result.is_err() {
                            sigterm.recv().await;
                        }
                        tracing::info!("Received Ctrl+C signal");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM signal");
                    }
                }
                return;
            }
            Err(e) => tracing::warn!("Could not install SIGTERM handler: {}", e),
        }
    }

    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C signal");
}

fn print_record(record: &RunRecord) {
    let summary = match record.status {
        RunStatus::Succeeded => format!("succeeded after {} attempt(s)", record.attempts.len()),
        RunStatus::Exhausted => format!(
            "failed after {} attempt(s), last exit {}",
            record.attempts.len(),
            record.final_exit_code.unwrap_or(-1)
        ),
        RunStatus::SkippedLocked => "skipped, another run holds the lock".to_string(),
        RunStatus::ConfigurationError => format!(
            "configuration error: {}",
            record.error.as_deref().unwrap_or("unknown")
        ),
        RunStatus::Interrupted => "interrupted".to_string(),
    };
    println!("{}: {}", record.job, summary);
    println!("  Log: {}", record.log_path.display());
}

/// supervisor run
pub async fn cmd_run(env: &Environment, args: &RunArgs) -> anyhow::Result<i32> {
    let mut config = env.config.clone();
    if let Some(ref dir) = args.log_dir {
        config.log_dir = Some(dir.clone());
    }
    let job = resolve_job(args, &config)?;

    let log_store = Arc::new(FsLogStore::new(config.log_dir(&env.data_dir)).await?);
    let supervisor = Supervisor::new(
        SupervisorSettings {
            project_dir: config.project_dir(),
            state_dir: config.state_dir(&env.data_dir),
            lock_stale_after: config.lock_stale_after_secs.map(Duration::from_secs),
        },
        log_store,
        Arc::new(ProcessRunner),
        Arc::new(InterpreterResolver::from_config(&config)),
    );

    let shutdown = supervisor.shutdown_handle();
    let signals = tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.notify_one();
    });

    let result = supervisor.run(&job).await;
    signals.abort();
    let record = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record(&record);
    }
    Ok(record.exit_code())
}

#[derive(Debug, Serialize)]
struct JobSummary<'a> {
    name: &'a str,
    command: String,
    max_attempts: u32,
    retry_delay_secs: u64,
}

/// supervisor jobs
pub fn cmd_jobs(env: &Environment, json: bool) -> anyhow::Result<()> {
    let jobs: Vec<JobSummary> = env
        .config
        .jobs
        .iter()
        .map(|(name, entry)| {
            let job = JobDefinition::from_config(name, entry, &env.config);
            JobSummary {
                name,
                command: job.execution.display(),
                max_attempts: job.max_attempts,
                retry_delay_secs: job.retry_delay_secs,
            }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs configured.");
        return Ok(());
    }

    println!("{:<20}{:<10}{:<8}COMMAND", "NAME", "ATTEMPTS", "DELAY");
    for job in &jobs {
        println!(
            "{:<20}{:<10}{:<8}{}",
            job.name,
            job.max_attempts,
            format!("{}s", job.retry_delay_secs),
            job.command
        );
    }
    Ok(())
}

/// supervisor unlock
pub fn cmd_unlock(env: &Environment, job: &str) -> anyhow::Result<()> {
    crate::models::job::validate_job_name(job)?;
    let lock = JobLock::for_job(&env.state_dir(), job);
    let age = lock.age();
    if lock.force_release()? {
        match age {
            Some(age) => println!(
                "Removed {} (held for {}s).",
                lock.path().display(),
                age.as_secs()
            ),
            None => println!("Removed {}.", lock.path().display()),
        }
        tracing::warn!("Lock for job '{}' removed manually", job);
    } else {
        println!("Job '{}' is not locked.", job);
    }
    Ok(())
}
