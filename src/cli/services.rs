// CLI service and diagnostics commands: start, stop, status, interpreter

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Serialize;

use super::jobs::format_relative_time;
use super::Environment;
use crate::errors::SupervisorError;
use crate::interpreter::InterpreterResolver;
use crate::services::{ServiceRegistry, ServiceStatus, StopOutcome};
use crate::storage::logs::FsLogStore;
use crate::storage::LogStore;
use crate::supervisor::lock::JobLock;

fn registry(env: &Environment) -> ServiceRegistry {
    ServiceRegistry::new(env.state_dir(), env.log_dir())
}

/// Format a duration in seconds into a human-readable string.
fn format_age(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// supervisor start
pub fn cmd_start(env: &Environment, name: &str, alias: Option<&str>) -> anyhow::Result<()> {
    let config = env.config.services.get(name).ok_or_else(|| {
        SupervisorError::Configuration(format!("Service '{}' is not defined in the config", name))
    })?;
    let interpreter = InterpreterResolver::from_config(&env.config);
    let reg = registry(env);

    let pid = reg.start(name, config, alias, &env.config.project_dir(), &interpreter)?;
    let instance = crate::services::instance_name(name, alias)?;
    println!("Started {} (PID {}).", instance, pid);
    println!("  Output: {}", reg.output_log(&instance).display());
    Ok(())
}

/// supervisor stop
pub fn cmd_stop(
    env: &Environment,
    name: &str,
    alias: Option<&str>,
    force: bool,
) -> anyhow::Result<()> {
    let instance = crate::services::instance_name(name, alias)?;
    match registry(env).stop(name, alias, force)? {
        StopOutcome::NotRunning => println!("{} is not running.", instance),
        StopOutcome::StaleRemoved { pid } => println!(
            "{} was not running (stale PID {}); removed PID file.",
            instance, pid
        ),
        StopOutcome::Signalled { pid } => {
            let how = if force { "Killed" } else { "Stopped" };
            println!("{} {} (PID {}).", how, instance, pid);
        }
    }
    Ok(())
}

/// supervisor interpreter
pub fn cmd_interpreter(env: &Environment) -> anyhow::Result<i32> {
    let resolver = InterpreterResolver::from_config(&env.config);

    println!("Project dir: {}", env.config.project_dir().display());
    for (candidate, found) in resolver.probe_all() {
        match found {
            Some(path) => println!("  [found]   {} -> {}", candidate, path.display()),
            None => println!("  [missing] {}", candidate),
        }
    }

    let path = resolver.resolve()?;
    println!("Using: {}", path.display());
    Ok(0)
}

#[derive(Debug, Serialize)]
struct JobState {
    name: String,
    locked: bool,
    lock_age_secs: Option<u64>,
    last_log: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    log_dir: PathBuf,
    state_dir: PathBuf,
    jobs: Vec<JobState>,
    services: Vec<ServiceStatus>,
}

/// Job names from the config plus any job with a lock file on disk.
fn known_jobs(env: &Environment) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = env.config.jobs.keys().cloned().collect();
    if let Ok(entries) = std::fs::read_dir(env.state_dir()) {
        for entry in entries.flatten() {
            if let Some(name) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(".lock"))
            {
                names.insert(name.to_string());
            }
        }
    }
    names
}

/// supervisor status
pub async fn cmd_status(env: &Environment, json: bool) -> anyhow::Result<()> {
    let store = FsLogStore::new(env.log_dir()).await?;
    let state_dir = env.state_dir();

    let mut jobs = Vec::new();
    for name in known_jobs(env) {
        let lock = JobLock::for_job(&state_dir, &name);
        let last_log = store
            .list_runs(&name, 1)
            .await?
            .into_iter()
            .next()
            .map(|run| run.path);
        jobs.push(JobState {
            locked: lock.is_held(),
            lock_age_secs: lock.age().map(|a| a.as_secs()),
            name,
            last_log,
        });
    }

    let mut services = registry(env).status()?;
    for name in env.config.services.keys() {
        if !services.iter().any(|s| {
            s.instance == *name || s.instance.starts_with(&format!("{}@", name))
        }) {
            services.push(ServiceStatus {
                instance: name.clone(),
                pid: None,
                running: false,
                pid_file: registry(env).pid_file(name).path().to_path_buf(),
            });
        }
    }
    services.sort_by(|a, b| a.instance.cmp(&b.instance));

    let report = StatusReport {
        log_dir: env.log_dir(),
        state_dir,
        jobs,
        services,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Log Dir:   {}", report.log_dir.display());
    println!("State Dir: {}", report.state_dir.display());

    println!("\nJobs:");
    if report.jobs.is_empty() {
        println!("  (none)");
    }
    for job in &report.jobs {
        let state = match (job.locked, job.lock_age_secs) {
            (true, Some(age)) => format!("locked ({})", format_age(age)),
            (true, None) => "locked".to_string(),
            (false, _) => "idle".to_string(),
        };
        let last = match &job.last_log {
            Some(path) => {
                let modified = std::fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .map(|t| format_relative_time(&t.into()));
                format!(
                    "{} ({})",
                    path.display(),
                    modified.unwrap_or_else(|| "-".to_string())
                )
            }
            None => "-".to_string(),
        };
        println!("  {:<20}{:<20}{}", job.name, state, last);
    }

    println!("\nServices:");
    if report.services.is_empty() {
        println!("  (none)");
    }
    for service in &report.services {
        let state = match (service.running, service.pid) {
            (true, Some(pid)) => format!("running (PID {})", pid),
            (false, Some(pid)) => format!("stopped (stale PID {})", pid),
            _ => "stopped".to_string(),
        };
        println!("  {:<20}{}", service.instance, state);
    }
    Ok(())
}
