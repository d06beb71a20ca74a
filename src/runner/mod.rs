// Runner module
// Process abstraction for job attempts with real and scripted implementations.

pub mod resolve;

use std::io::Write;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;

use crate::errors::SupervisorError;

/// A fully resolved command line, ready to spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env_vars: Vec<(String, String)>,
}

impl Invocation {
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Trait for running one attempt of a job.
///
/// The child's stdout and stderr go to `output` (the run log, opened for
/// append). An `Err` means the process could not be started at all; a
/// process that ran and failed is an `Ok` with a non-zero status.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation, output: std::fs::File) -> anyhow::Result<i32>;
}

// --- Real implementation using tokio::process ---

pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation, output: std::fs::File) -> anyhow::Result<i32> {
        let stderr = output
            .try_clone()
            .context("Failed to duplicate log file handle")?;

        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output))
            .stderr(Stdio::from(stderr))
            // An interrupted supervisor must not leave the attempt running.
            .kill_on_drop(true);

        if let Some(ref dir) = invocation.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &invocation.env_vars {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            SupervisorError::Configuration(format!(
                "Failed to start '{}': {}",
                invocation.program.display(),
                e
            ))
        })?;

        tracing::debug!("Spawned '{}' (pid {:?})", invocation.display(), child.id());

        let status = child
            .wait()
            .await
            .context("Failed to wait for child process")?;
        Ok(exit_code_of(status))
    }
}

/// Numeric status of a finished process. Signal deaths on unix map to
/// 128 + signal, the way shells report them.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}

// --- Scripted implementation for testing ---

/// Configuration for a ScriptedRunner.
#[derive(Clone, Default)]
pub struct ScriptedRunnerConfig {
    /// Exit status per attempt; the last one repeats once exhausted.
    pub exit_codes: Vec<i32>,
    /// Bytes written to the log on every attempt.
    pub output: Vec<u8>,
    /// Whether every spawn should fail with this error
    pub spawn_error: Option<String>,
}

/// Runner that never starts a process and records what it was asked to run.
pub struct ScriptedRunner {
    config: ScriptedRunnerConfig,
    invocations: Arc<Mutex<Vec<Invocation>>>,
}

impl ScriptedRunner {
    pub fn new(config: ScriptedRunnerConfig) -> Self {
        Self {
            config,
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_exit_codes(exit_codes: Vec<i32>) -> Self {
        Self::new(ScriptedRunnerConfig {
            exit_codes,
            ..Default::default()
        })
    }

    pub fn with_spawn_error(error: &str) -> Self {
        Self::new(ScriptedRunnerConfig {
            spawn_error: Some(error.to_string()),
            ..Default::default()
        })
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation, mut output: std::fs::File) -> anyhow::Result<i32> {
        if let Some(ref error) = self.config.spawn_error {
            return Err(SupervisorError::Configuration(error.clone()).into());
        }

        let index = {
            let mut calls = self.invocations.lock().unwrap_or_else(|e| e.into_inner());
            calls.push(invocation.clone());
            calls.len() - 1
        };

        if !self.config.output.is_empty() {
            output
                .write_all(&self.config.output)
                .context("Failed to write scripted output")?;
        }

        let code = self
            .config
            .exit_codes
            .get(index)
            .or(self.config.exit_codes.last())
            .copied()
            .unwrap_or(0);
        Ok(code)
    }
}
