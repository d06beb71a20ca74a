// Operator-facing lines written into each run log. Operators grep for
// these words, so keep them stable.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};

use crate::models::RunStatus;

pub const START: &str = "Inicio";
pub const FAILURE: &str = "Fallo";
pub const SKIPPED: &str = "Omitido";
pub const CONFIGURATION_ERROR: &str = "Error de configuración";
pub const INTERRUPTED: &str = "Interrumpido";
pub const FINISH: &str = "Fin";

/// Prefix a message with a local, second-resolution timestamp.
pub fn line(at: DateTime<Utc>, message: &str) -> String {
    format!(
        "[{}] {}",
        at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
        message
    )
}

pub fn start(job: &str) -> String {
    format!("{} job={}", START, job)
}

pub fn command(display: &str) -> String {
    format!("Comando: {}", display)
}

pub fn attempt_started(attempt: u32, max_attempts: u32) -> String {
    format!("Intento {}/{}", attempt, max_attempts)
}

pub fn attempt_succeeded(attempt: u32, max_attempts: u32) -> String {
    format!("Intento {}/{}: OK", attempt, max_attempts)
}

pub fn attempt_failed(attempt: u32, max_attempts: u32, exit_code: i32) -> String {
    format!(
        "Intento {}/{}: {} (exit={})",
        attempt, max_attempts, FAILURE, exit_code
    )
}

pub fn retrying(delay: Duration) -> String {
    format!("Reintentando en {}s", delay.as_secs())
}

pub fn skipped(lock_path: &Path, age: Option<Duration>) -> String {
    match age {
        Some(age) => format!(
            "{}: lock {} presente hace {}s, otra ejecución en curso",
            SKIPPED,
            lock_path.display(),
            age.as_secs()
        ),
        None => format!(
            "{}: lock {} presente, otra ejecución en curso",
            SKIPPED,
            lock_path.display()
        ),
    }
}

pub fn configuration_error(message: &str) -> String {
    format!("{}: {}", CONFIGURATION_ERROR, message)
}

pub fn interrupted() -> String {
    format!("{} por señal, intento abortado", INTERRUPTED)
}

pub fn finish(job: &str, status: RunStatus, final_exit_code: Option<i32>) -> String {
    let outcome = match status {
        RunStatus::Succeeded => "OK".to_string(),
        RunStatus::Exhausted => match final_exit_code {
            Some(code) => format!("reintentos agotados, último exit={}", code),
            None => "reintentos agotados".to_string(),
        },
        RunStatus::SkippedLocked => "omitido".to_string(),
        RunStatus::ConfigurationError => "error de configuración".to_string(),
        RunStatus::Interrupted => "interrumpido".to_string(),
    };
    format!(
        "{} job={} estado={} ({})",
        FINISH,
        job,
        status.exit_code(),
        outcome
    )
}
