// Supervisor module
// Single-instance lock, run log and bounded retry around one external command.

pub mod clock;
pub mod lock;
pub mod markers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::errors::SupervisorError;
use crate::interpreter::InterpreterResolver;
use crate::models::job::validate_job;
use crate::models::{AttemptOutcome, JobDefinition, RunRecord, RunStatus};
use crate::runner::resolve::build_invocation;
use crate::runner::CommandRunner;
use crate::storage::LogStore;
use clock::{Clock, Sleeper, SystemClock, TokioSleeper};
use lock::{JobLock, LockAttempt};

/// Lifecycle of one supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    LockAcquired,
    Running { attempt: u32 },
    Retrying { attempt: u32 },
    Success,
    ExhaustedFailure,
    SkippedLocked,
}

impl RunState {
    /// Next state once attempt `attempt` of `max_attempts` exited with `exit_code`.
    pub fn after_attempt(attempt: u32, max_attempts: u32, exit_code: i32) -> Self {
        if exit_code == 0 {
            RunState::Success
        } else if attempt < max_attempts {
            RunState::Retrying { attempt }
        } else {
            RunState::ExhaustedFailure
        }
    }
}

fn transition(job: &str, from: RunState, to: RunState) -> RunState {
    tracing::debug!(job, ?from, ?to, "State transition");
    to
}

/// Text for an error headed into the run log, without the category prefix.
fn error_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<SupervisorError>() {
        Some(e) => e.message().to_string(),
        None => format!("{:#}", err),
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub project_dir: PathBuf,
    /// Directory holding `<job>.lock` files.
    pub state_dir: PathBuf,
    /// Locks older than this are considered abandoned. `None` never expires them.
    pub lock_stale_after: Option<Duration>,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    log_store: Arc<dyn LogStore>,
    runner: Arc<dyn CommandRunner>,
    interpreter: Arc<InterpreterResolver>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    shutdown: Arc<Notify>,
}

/// Bookkeeping shared by every exit path of a run.
struct RunContext<'a> {
    log_store: &'a dyn LogStore,
    clock: &'a dyn Clock,
    job: String,
    log_path: PathBuf,
    started_at: DateTime<Utc>,
    attempts: Vec<AttemptOutcome>,
}

impl RunContext<'_> {
    /// Append a marker line. A failed write does not change the outcome of
    /// the run; it is reported through tracing instead.
    async fn note(&self, message: &str) {
        let line = markers::line(self.clock.now(), message);
        if let Err(e) = self.log_store.append_line(&self.log_path, &line).await {
            tracing::warn!(
                job = %self.job,
                log = %self.log_path.display(),
                "Could not write to run log: {:#}",
                e
            );
        }
    }

    async fn fail_configuration(self, message: String) -> RunRecord {
        tracing::error!(job = %self.job, "Configuration error: {}", message);
        self.note(&markers::configuration_error(&message)).await;
        self.finish(RunStatus::ConfigurationError, Some(message))
            .await
    }

    async fn finish(self, status: RunStatus, error: Option<String>) -> RunRecord {
        let final_exit_code = self.attempts.last().map(|a| a.exit_code);
        self.note(&markers::finish(&self.job, status, final_exit_code))
            .await;
        let finished_at = self.clock.now();
        tracing::info!(
            job = %self.job,
            ?status,
            attempts = self.attempts.len(),
            "Run finished"
        );
        RunRecord {
            job: self.job,
            started_at: self.started_at,
            finished_at,
            status,
            attempts: self.attempts,
            final_exit_code,
            log_path: self.log_path,
            error,
        }
    }
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        log_store: Arc<dyn LogStore>,
        runner: Arc<dyn CommandRunner>,
        interpreter: Arc<InterpreterResolver>,
    ) -> Self {
        Self {
            settings,
            log_store,
            runner,
            interpreter,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Notifying this handle aborts the current attempt or retry wait. The
    /// run is then logged as interrupted and its lock released.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Run `job` to a terminal state.
    ///
    /// Returns `Err` only when nothing could be recorded: an invalid job
    /// definition or an unusable log directory. Every other outcome,
    /// including configuration problems found later, comes back as a
    /// [`RunRecord`] whose status carries the exit code. Marker lines that
    /// cannot be written once the log exists are warned about and skipped.
    pub async fn run(&self, job: &JobDefinition) -> Result<RunRecord> {
        validate_job(job)?;

        let started_at = self.clock.now();
        let log_path = self.log_store.open_run(&job.name, started_at).await?;
        let mut ctx = RunContext {
            log_store: self.log_store.as_ref(),
            clock: self.clock.as_ref(),
            job: job.name.clone(),
            log_path,
            started_at,
            attempts: Vec::new(),
        };
        ctx.note(&markers::start(&job.name)).await;
        tracing::info!(job = %job.name, log = %ctx.log_path.display(), "Run started");

        let mut state = RunState::Idle;

        let invocation = match build_invocation(
            &job.execution,
            job.working_dir.as_deref(),
            job.env_vars.as_ref(),
            &self.settings.project_dir,
            &self.interpreter,
        ) {
            Ok(invocation) => invocation,
            Err(e) => return Ok(ctx.fail_configuration(e.message().to_string()).await),
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.settings.state_dir).await {
            return Ok(ctx
                .fail_configuration(format!(
                    "State directory {} is not accessible: {}",
                    self.settings.state_dir.display(),
                    e
                ))
                .await);
        }

        let lock = JobLock::for_job(&self.settings.state_dir, &job.name);
        let guard = match lock.try_acquire(self.settings.lock_stale_after) {
            Ok(LockAttempt::Acquired(guard)) => guard,
            Ok(LockAttempt::Held { age }) => {
                transition(&job.name, state, RunState::SkippedLocked);
                tracing::info!(job = %job.name, "Another run holds {}, skipping", lock.path().display());
                ctx.note(&markers::skipped(lock.path(), age)).await;
                return Ok(ctx.finish(RunStatus::SkippedLocked, None).await);
            }
            Err(e) => return Ok(ctx.fail_configuration(format!("{:#}", e)).await),
        };
        state = transition(&job.name, state, RunState::LockAcquired);

        ctx.note(&markers::command(&invocation.display())).await;

        let max_attempts = job.max_attempts;
        let delay = job.retry_delay();
        let mut attempt = 1;

        let (status, error) = loop {
            state = transition(&job.name, state, RunState::Running { attempt });
            ctx.note(&markers::attempt_started(attempt, max_attempts))
                .await;
            let output = match self.log_store.output_handle(&ctx.log_path) {
                Ok(output) => output,
                Err(e) => {
                    let message = format!("Cannot capture command output: {:#}", e);
                    tracing::error!(job = %job.name, "{}", message);
                    ctx.note(&markers::configuration_error(&message)).await;
                    break (RunStatus::ConfigurationError, Some(message));
                }
            };
            let attempt_started = self.clock.now();

            let result = tokio::select! {
                biased;
                result = self.runner.run(&invocation, output) => result,
                _ = self.shutdown.notified() => {
                    tracing::warn!(job = %job.name, attempt, "Interrupted during attempt");
                    ctx.note(&markers::interrupted()).await;
                    break (RunStatus::Interrupted, Some("interrupted by signal".to_string()));
                }
            };

            let exit_code = match result {
                Ok(code) => code,
                Err(e) => {
                    let message = error_message(&e);
                    tracing::error!(job = %job.name, "Could not start command: {}", message);
                    ctx.note(&markers::configuration_error(&message)).await;
                    break (RunStatus::ConfigurationError, Some(message));
                }
            };

            ctx.attempts.push(AttemptOutcome {
                attempt,
                exit_code,
                started_at: attempt_started,
                finished_at: self.clock.now(),
            });

            state = transition(
                &job.name,
                state,
                RunState::after_attempt(attempt, max_attempts, exit_code),
            );
            match state {
                RunState::Success => {
                    ctx.note(&markers::attempt_succeeded(attempt, max_attempts))
                        .await;
                    break (RunStatus::Succeeded, None);
                }
                RunState::Retrying { .. } => {
                    tracing::warn!(
                        job = %job.name,
                        attempt,
                        exit_code,
                        "Attempt failed, retrying in {}s",
                        delay.as_secs()
                    );
                    ctx.note(&markers::attempt_failed(attempt, max_attempts, exit_code))
                        .await;
                    ctx.note(&markers::retrying(delay)).await;
                    tokio::select! {
                        _ = self.sleeper.sleep(delay) => {}
                        _ = self.shutdown.notified() => {
                            tracing::warn!(job = %job.name, "Interrupted while waiting to retry");
                            ctx.note(&markers::interrupted()).await;
                            break (RunStatus::Interrupted, Some("interrupted by signal".to_string()));
                        }
                    }
                    attempt += 1;
                }
                _ => {
                    tracing::warn!(job = %job.name, attempt, exit_code, "Attempts exhausted");
                    ctx.note(&markers::attempt_failed(attempt, max_attempts, exit_code))
                        .await;
                    break (
                        RunStatus::Exhausted,
                        Some(format!("exit status {} after {} attempts", exit_code, attempt)),
                    );
                }
            }
        };

        drop(guard);
        Ok(ctx.finish(status, error).await)
    }
}
