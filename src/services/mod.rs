// Services module
// Long-running companion processes (tunnel, worker) started detached and
// tracked through PID files in the state directory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::errors::SupervisorError;
use crate::interpreter::InterpreterResolver;
use crate::models::job::validate_job_name;
use crate::models::ServiceConfig;
use crate::runner::resolve::build_invocation;
use crate::storage::logs::SERVICE_OUTPUT_SUFFIX;

// ---------------------------------------------------------------------------
// PidFile
// ---------------------------------------------------------------------------

/// What a PID file records: the PID and the start time of that process.
///
/// The start time tells a recorded service apart from an unrelated process
/// that later reused its PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: u32,
    /// Seconds since the epoch, as reported by the OS.
    pub started_at: Option<u64>,
}

impl PidRecord {
    /// Record for a live process, capturing its start time now.
    pub fn for_process(pid: u32) -> Self {
        Self {
            pid,
            started_at: process_start_time(pid),
        }
    }

    /// Whether the recorded process is still the one running under `pid`.
    ///
    /// A record without a start time cannot be matched and never counts.
    pub fn is_running(&self) -> bool {
        match (self.started_at, process_start_time(self.pid)) {
            (Some(recorded), Some(current)) => recorded == current,
            _ => false,
        }
    }

    fn parse(content: &str) -> Option<Self> {
        let mut lines = content.lines().map(str::trim);
        let pid = lines.next()?.parse::<u32>().ok()?;
        let started_at = match lines.next() {
            Some(line) if !line.is_empty() => Some(line.parse::<u64>().ok()?),
            _ => None,
        };
        Some(Self { pid, started_at })
    }
}

/// PID file for one service instance.
///
/// Created exclusively so two concurrent `start` calls cannot both record
/// a process. A file whose process is gone, or was replaced, is stale.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The recorded PID and start time, if the file exists.
    pub fn read(&self) -> Result<Option<PidRecord>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let record = PidRecord::parse(&content).with_context(|| {
                    format!("Failed to parse PID from {}", self.path.display())
                })?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read PID file {}", self.path.display())),
        }
    }

    /// Store `record`. Fails if a PID file is already present.
    pub fn write(&self, record: PidRecord) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .with_context(|| {
                format!(
                    "Failed to create PID file {} (exclusive create)",
                    self.path.display()
                )
            })?;
        writeln!(file, "{}", record.pid).context("Failed to write PID to PID file")?;
        if let Some(started_at) = record.started_at {
            writeln!(file, "{}", started_at).context("Failed to write PID file")?;
        }
        file.flush().context("Failed to flush PID file")?;
        Ok(())
    }

    /// Remove the file. Returns whether it existed.
    pub fn remove(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove PID file {}", self.path.display())),
        }
    }

    /// Whether the file exists and its process is still running.
    pub fn is_alive(&self) -> bool {
        matches!(self.read(), Ok(Some(record)) if record.is_running())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Start time of a running process, or `None` when there is no such
/// process (zombies included).
pub fn process_start_time(pid: u32) -> Option<u64> {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut sys = sysinfo::System::new();
    sys.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&[pid]),
        true,
        sysinfo::ProcessRefreshKind::nothing(),
    );
    let process = sys.process(pid)?;
    if process.status() == sysinfo::ProcessStatus::Zombie {
        return None;
    }
    Some(process.start_time())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// `name` or `name@alias`. Both parts must be usable in file names.
pub fn instance_name(name: &str, alias: Option<&str>) -> Result<String, SupervisorError> {
    validate_job_name(name)?;
    match alias {
        Some(alias) => {
            validate_job_name(alias)?;
            Ok(format!("{}@{}", name, alias))
        }
        None => Ok(name.to_string()),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServiceStatus {
    pub instance: String,
    pub pid: Option<u32>,
    pub running: bool,
    pub pid_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No PID file was recorded.
    NotRunning,
    /// The recorded process was already gone; the PID file was removed.
    StaleRemoved { pid: u32 },
    Signalled { pid: u32 },
}

pub struct ServiceRegistry {
    state_dir: PathBuf,
    log_dir: PathBuf,
}

impl ServiceRegistry {
    pub fn new(state_dir: PathBuf, log_dir: PathBuf) -> Self {
        Self { state_dir, log_dir }
    }

    pub fn pid_file(&self, instance: &str) -> PidFile {
        PidFile::new(self.state_dir.join(format!("{}.pid", instance)))
    }

    pub fn output_log(&self, instance: &str) -> PathBuf {
        self.log_dir
            .join(format!("{}{}", instance, SERVICE_OUTPUT_SUFFIX))
    }

    /// Spawn the service detached and record its PID.
    pub fn start(
        &self,
        name: &str,
        config: &ServiceConfig,
        alias: Option<&str>,
        project_dir: &Path,
        interpreter: &InterpreterResolver,
    ) -> Result<u32> {
        let instance = instance_name(name, alias)?;
        std::fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("Failed to create {}", self.state_dir.display()))?;
        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create {}", self.log_dir.display()))?;

        let pid_file = self.pid_file(&instance);
        if let Some(record) = pid_file.read()? {
            if record.is_running() {
                return Err(SupervisorError::Service(format!(
                    "{} is already running (PID {})",
                    instance, record.pid
                ))
                .into());
            }
            tracing::warn!(
                "Removing stale PID file for {} (PID {} is no longer our process)",
                instance,
                record.pid
            );
            pid_file.remove()?;
        }

        let invocation = build_invocation(
            &config.execution,
            config.working_dir.as_deref(),
            config.env_vars.as_ref(),
            project_dir,
            interpreter,
        )?;

        let out_path = self.output_log(&instance);
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&out_path)
            .with_context(|| format!("Failed to open {}", out_path.display()))?;
        let stderr = stdout
            .try_clone()
            .context("Failed to duplicate output handle")?;

        let mut command = std::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(ref dir) = invocation.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &invocation.env_vars {
            command.env(key, value);
        }
        if let Some(alias) = alias {
            command.env(&config.alias_env, alias);
        }

        // Own process group, so a Ctrl+C in the launching terminal does not reach it.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|e| {
            SupervisorError::Configuration(format!(
                "Failed to start '{}': {}",
                invocation.display(),
                e
            ))
        })?;
        let pid = child.id();
        pid_file.write(PidRecord::for_process(pid))?;

        tracing::info!(
            "Started {} (PID {}), output in {}",
            instance,
            pid,
            out_path.display()
        );
        Ok(pid)
    }

    /// Signal the recorded process and remove its PID file.
    pub fn stop(&self, name: &str, alias: Option<&str>, force: bool) -> Result<StopOutcome> {
        let instance = instance_name(name, alias)?;
        let pid_file = self.pid_file(&instance);

        let Some(record) = pid_file.read()? else {
            return Ok(StopOutcome::NotRunning);
        };
        let pid = record.pid;

        // A PID that was reused by another process must not be signalled.
        if !record.is_running() {
            pid_file.remove()?;
            return Ok(StopOutcome::StaleRemoved { pid });
        }

        terminate(pid, force)?;
        pid_file.remove()?;
        tracing::info!("Stopped {} (PID {})", instance, pid);
        Ok(StopOutcome::Signalled { pid })
    }

    /// Every instance with a PID file, sorted by instance name.
    pub fn status(&self) -> Result<Vec<ServiceStatus>> {
        let entries = match std::fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.state_dir.display()))
            }
        };

        let mut statuses = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(instance) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".pid"))
                .map(str::to_string)
            else {
                continue;
            };

            let pid_file = PidFile::new(path.clone());
            let record = match pid_file.read() {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("Ignoring unreadable PID file {}: {:#}", path.display(), e);
                    None
                }
            };
            statuses.push(ServiceStatus {
                instance,
                pid: record.map(|r| r.pid),
                running: record.is_some_and(|r| r.is_running()),
                pid_file: path,
            });
        }
        statuses.sort_by(|a, b| a.instance.cmp(&b.instance));
        Ok(statuses)
    }
}

fn terminate(pid: u32, force: bool) -> Result<()> {
    #[cfg(unix)]
    {
        let raw = i32::try_from(pid)
            .ok()
            .filter(|raw| *raw > 1)
            .ok_or_else(|| SupervisorError::Service(format!("Invalid PID {}", pid)))?;
        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Services lead their own process group.
        let mut result = unsafe { libc::kill(-raw, signal) };
        if result != 0 {
            tracing::debug!(
                "Signalling process group {} failed ({}), signalling the process",
                pid,
                std::io::Error::last_os_error()
            );
            result = unsafe { libc::kill(raw, signal) };
        }
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                tracing::debug!("Process {} already exited", pid);
            } else {
                return Err(SupervisorError::Service(format!(
                    "Failed to signal process {}: {}",
                    pid, err
                ))
                .into());
            }
        }
    }

    #[cfg(windows)]
    {
        let pid_arg = pid.to_string();
        let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
        if force {
            args.push("/F");
        }
        let status = std::process::Command::new("taskkill")
            .args(&args)
            .status()
            .context("Failed to execute taskkill")?;
        if !status.success() {
            tracing::warn!(
                "taskkill exited with code {:?} (process may already be dead)",
                status.code()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionType;
    use std::time::Duration;
    use tempfile::TempDir;

    fn registry(tmp: &TempDir) -> ServiceRegistry {
        ServiceRegistry::new(tmp.path().join("state"), tmp.path().join("logs"))
    }

    fn resolver(tmp: &TempDir) -> InterpreterResolver {
        InterpreterResolver::new(tmp.path().to_path_buf(), vec![])
    }

    #[test]
    fn test_instance_name() {
        assert_eq!(instance_name("tunnel", None).unwrap(), "tunnel");
        assert_eq!(
            instance_name("worker", Some("cobranzas")).unwrap(),
            "worker@cobranzas"
        );
        assert!(instance_name("worker", Some("../x")).is_err());
        assert!(instance_name("", None).is_err());
    }

    #[test]
    fn test_pidfile_write_read_remove() {
        let tmp = TempDir::new().unwrap();
        let pid_file = PidFile::new(tmp.path().join("tunnel.pid"));
        assert_eq!(pid_file.read().unwrap(), None);

        let record = PidRecord::for_process(std::process::id());
        assert!(record.started_at.is_some());
        pid_file.write(record).unwrap();
        assert_eq!(pid_file.read().unwrap(), Some(record));
        assert!(pid_file.is_alive());

        // Exclusive create
        assert!(pid_file.write(record).is_err());

        assert!(pid_file.remove().unwrap());
        assert!(!pid_file.remove().unwrap());
        assert!(!pid_file.is_alive());
    }

    #[test]
    fn test_pidfile_garbage_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tunnel.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        let pid_file = PidFile::new(path.clone());
        assert!(pid_file.read().is_err());
        assert!(!pid_file.is_alive());

        std::fs::write(&path, "42\nyesterday\n").unwrap();
        assert!(pid_file.read().is_err());
    }

    #[test]
    fn test_record_requires_matching_start_time() {
        let current = PidRecord::for_process(std::process::id());
        assert!(current.is_running());

        let bare = PidRecord {
            pid: std::process::id(),
            started_at: None,
        };
        assert!(!bare.is_running());

        let other_start = PidRecord {
            pid: std::process::id(),
            started_at: current.started_at.map(|t| t.saturating_sub(3600)),
        };
        assert!(!other_start.is_running());
    }

    #[test]
    fn test_current_process_has_start_time() {
        assert!(process_start_time(std::process::id()).is_some());
        assert!(process_start_time(99_999_999).is_none());
    }

    #[test]
    fn test_stop_without_pid_file() {
        let tmp = TempDir::new().unwrap();
        let outcome = registry(&tmp).stop("tunnel", None, false).unwrap();
        assert_eq!(outcome, StopOutcome::NotRunning);
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_removes_stale_pid_file() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        std::fs::create_dir_all(tmp.path().join("state")).unwrap();
        // Far above any pid_max, so never a live process.
        reg.pid_file("tunnel")
            .write(PidRecord {
                pid: 99_999_999,
                started_at: Some(1),
            })
            .unwrap();

        let outcome = reg.stop("tunnel", None, false).unwrap();
        assert_eq!(outcome, StopOutcome::StaleRemoved { pid: 99_999_999 });
        assert!(!reg.pid_file("tunnel").path().exists());
    }

    #[test]
    fn test_status_lists_pid_files() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        assert!(reg.status().unwrap().is_empty());

        std::fs::create_dir_all(tmp.path().join("state")).unwrap();
        reg.pid_file("worker@cobranzas")
            .write(PidRecord::for_process(std::process::id()))
            .unwrap();
        std::fs::write(tmp.path().join("state/contacts.lock"), b"").unwrap();

        let statuses = reg.status().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].instance, "worker@cobranzas");
        assert_eq!(statuses[0].pid, Some(std::process::id()));
        assert!(statuses[0].running);
    }

    #[test]
    fn test_start_missing_program_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let config = ServiceConfig {
            execution: ExecutionType::Program {
                program: "/nonexistent/ngrok".to_string(),
                args: vec![],
            },
            working_dir: None,
            env_vars: None,
            alias_env: "SUPERVISOR_ALIAS".to_string(),
        };
        let err = reg
            .start("tunnel", &config, None, tmp.path(), &resolver(&tmp))
            .unwrap_err();
        assert_eq!(crate::errors::exit_code_for(&err), 2);
        assert!(!reg.pid_file("tunnel").path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_start_refuses_second_instance_and_stop() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let config = ServiceConfig {
            execution: ExecutionType::Program {
                program: "/bin/sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    "echo \"alias=$COBRANZAS_ALIAS\"; sleep 30".to_string(),
                ],
            },
            working_dir: None,
            env_vars: None,
            alias_env: "COBRANZAS_ALIAS".to_string(),
        };

        let pid = reg
            .start("worker", &config, Some("norte"), tmp.path(), &resolver(&tmp))
            .unwrap();
        let record = reg.pid_file("worker@norte").read().unwrap().unwrap();
        assert_eq!(record.pid, pid);
        assert!(record.is_running());

        let err = reg
            .start("worker", &config, Some("norte"), tmp.path(), &resolver(&tmp))
            .unwrap_err();
        assert!(err.to_string().contains("already running"));

        let out_log = reg.output_log("worker@norte");
        let mut seen = String::new();
        for _ in 0..50 {
            seen = std::fs::read_to_string(&out_log).unwrap_or_default();
            if seen.contains("alias=norte") {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(seen.contains("alias=norte"), "output was: {}", seen);

        let outcome = reg.stop("worker", Some("norte"), true).unwrap();
        assert_eq!(outcome, StopOutcome::Signalled { pid });
        assert!(!reg.pid_file("worker@norte").path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_leaves_unrelated_process_alone() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        std::fs::create_dir_all(tmp.path().join("state")).unwrap();

        let mut unrelated = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        // A leftover file from an older release that only held the PID.
        std::fs::write(reg.pid_file("tunnel").path(), unrelated.id().to_string()).unwrap();

        let outcome = reg.stop("tunnel", None, false).unwrap();
        assert_eq!(
            outcome,
            StopOutcome::StaleRemoved {
                pid: unrelated.id()
            }
        );
        assert!(!reg.pid_file("tunnel").path().exists());
        std::thread::sleep(Duration::from_millis(100));
        assert!(unrelated.try_wait().unwrap().is_none());

        // Same PID, but recorded for a process that started at another time.
        reg.pid_file("tunnel")
            .write(PidRecord {
                pid: unrelated.id(),
                started_at: Some(1),
            })
            .unwrap();
        let outcome = reg.stop("tunnel", None, true).unwrap();
        assert!(matches!(outcome, StopOutcome::StaleRemoved { .. }));
        std::thread::sleep(Duration::from_millis(100));
        assert!(unrelated.try_wait().unwrap().is_none());

        unrelated.kill().unwrap();
        unrelated.wait().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_start_replaces_pid_file_of_unrelated_process() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        std::fs::create_dir_all(tmp.path().join("state")).unwrap();
        reg.pid_file("tunnel")
            .write(PidRecord {
                pid: std::process::id(),
                started_at: None,
            })
            .unwrap();

        let config = ServiceConfig {
            execution: ExecutionType::Program {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "sleep 30".to_string()],
            },
            working_dir: None,
            env_vars: None,
            alias_env: "SUPERVISOR_ALIAS".to_string(),
        };
        let pid = reg
            .start("tunnel", &config, None, tmp.path(), &resolver(&tmp))
            .unwrap();
        assert_ne!(pid, std::process::id());
        assert_eq!(reg.pid_file("tunnel").read().unwrap().unwrap().pid, pid);

        let outcome = reg.stop("tunnel", None, true).unwrap();
        assert_eq!(outcome, StopOutcome::Signalled { pid });
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_kills_whole_process_group() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let marker = tmp.path().join("grandchild.pid");
        let config = ServiceConfig {
            execution: ExecutionType::Program {
                program: "/bin/sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    format!("sleep 30 & echo $! > '{}'; wait", marker.display()),
                ],
            },
            working_dir: None,
            env_vars: None,
            alias_env: "SUPERVISOR_ALIAS".to_string(),
        };

        reg.start("tunnel", &config, None, tmp.path(), &resolver(&tmp))
            .unwrap();

        let mut grandchild = None;
        for _ in 0..100 {
            if let Ok(content) = std::fs::read_to_string(&marker) {
                if let Ok(pid) = content.trim().parse::<u32>() {
                    grandchild = Some(pid);
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let grandchild = grandchild.expect("grandchild PID never written");
        assert!(process_start_time(grandchild).is_some());

        let outcome = reg.stop("tunnel", None, true).unwrap();
        assert!(matches!(outcome, StopOutcome::Signalled { .. }));

        let mut gone = false;
        for _ in 0..100 {
            if process_start_time(grandchild).is_none() {
                gone = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(gone, "grandchild {} survived a forced stop", grandchild);
    }
}
