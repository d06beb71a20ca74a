use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::SupervisorError;
use crate::models::SupervisorConfig;

/// What a job or service actually launches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionType {
    /// An executable (absolute, project-relative, or looked up on PATH).
    Program {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A script file run through the resolved interpreter.
    Script {
        script: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl ExecutionType {
    /// Human-readable command line for log headers.
    pub fn display(&self) -> String {
        let (head, args) = match self {
            ExecutionType::Program { program, args } => (program.clone(), args),
            ExecutionType::Script { script, args } => (format!("[script] {}", script), args),
        };
        if args.is_empty() {
            head
        } else {
            format!("{} {}", head, args.join(" "))
        }
    }
}

/// Job entry as written in the config file. Unset fields fall back to the
/// top-level defaults of [`SupervisorConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    pub execution: ExecutionType,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env_vars: Option<HashMap<String, String>>,
}

/// A fully resolved job, ready to hand to the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDefinition {
    pub name: String,
    pub execution: ExecutionType,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub working_dir: Option<PathBuf>,
    pub env_vars: Option<HashMap<String, String>>,
}

impl JobDefinition {
    /// Build a definition from a config entry, filling in the global defaults.
    pub fn from_config(name: &str, job: &JobConfig, config: &SupervisorConfig) -> Self {
        Self {
            name: name.to_string(),
            execution: job.execution.clone(),
            max_attempts: job.max_attempts.unwrap_or(config.max_attempts),
            retry_delay_secs: job.retry_delay_secs.unwrap_or(config.retry_delay_secs),
            working_dir: job.working_dir.clone(),
            env_vars: job.env_vars.clone(),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Job names end up in lock and log file names, so only a conservative
/// character set is accepted.
pub fn validate_job_name(name: &str) -> Result<(), SupervisorError> {
    if name.trim().is_empty() {
        return Err(SupervisorError::Validation(
            "Job name cannot be empty".to_string(),
        ));
    }

    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(SupervisorError::Validation(format!(
            "Job name '{}' contains invalid character '{}'",
            name, bad
        )));
    }

    if name.starts_with('.') {
        return Err(SupervisorError::Validation(format!(
            "Job name '{}' cannot start with '.'",
            name
        )));
    }

    Ok(())
}

/// Validate a JobDefinition before running it.
pub fn validate_job(job: &JobDefinition) -> Result<(), SupervisorError> {
    validate_job_name(&job.name)?;

    if job.max_attempts == 0 {
        return Err(SupervisorError::Validation(
            "max attempts must be at least 1".to_string(),
        ));
    }

    let target = match &job.execution {
        ExecutionType::Program { program, .. } => program,
        ExecutionType::Script { script, .. } => script,
    };
    if target.trim().is_empty() {
        return Err(SupervisorError::Validation(format!(
            "Job '{}' has an empty command",
            job.name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job() -> JobDefinition {
        JobDefinition {
            name: "contacts".to_string(),
            execution: ExecutionType::Script {
                script: "sync/sync_contacts_incremental.py".to_string(),
                args: vec![],
            },
            max_attempts: 2,
            retry_delay_secs: 60,
            working_dir: None,
            env_vars: None,
        }
    }

    #[test]
    fn test_valid_job_passes() {
        assert!(validate_job(&make_job()).is_ok());
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut job = make_job();
        job.name = "  ".to_string();
        match validate_job(&job).unwrap_err() {
            SupervisorError::Validation(msg) => assert!(msg.contains("empty")),
            other => panic!("Expected Validation, got: {:?}", other),
        }
    }

    #[test]
    fn test_path_separator_in_name_rejected() {
        assert!(validate_job_name("../etc").is_err());
        assert!(validate_job_name("a/b").is_err());
        assert!(validate_job_name("a b").is_err());
    }

    #[test]
    fn test_dot_prefixed_name_rejected() {
        assert!(validate_job_name(".hidden").is_err());
    }

    #[test]
    fn test_allowed_name_characters() {
        assert!(validate_job_name("deals_incremental-v2.1").is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut job = make_job();
        job.max_attempts = 0;
        assert!(validate_job(&job).is_err());
    }

    #[test]
    fn test_empty_program_rejected() {
        let mut job = make_job();
        job.execution = ExecutionType::Program {
            program: "".to_string(),
            args: vec![],
        };
        assert!(validate_job(&job).is_err());
    }

    #[test]
    fn test_execution_type_tagged_json() {
        let json = r#"{"type":"script","script":"sync/sync_deals_incremental.py"}"#;
        let exec: ExecutionType = serde_json::from_str(json).expect("deserialize");
        assert_eq!(
            exec,
            ExecutionType::Script {
                script: "sync/sync_deals_incremental.py".to_string(),
                args: vec![],
            }
        );

        let json = r#"{"type":"program","program":"/bin/echo","args":["hi"]}"#;
        let exec: ExecutionType = serde_json::from_str(json).expect("deserialize");
        assert_eq!(exec.display(), "/bin/echo hi");
    }

    #[test]
    fn test_script_display_marks_script() {
        let job = make_job();
        assert_eq!(
            job.execution.display(),
            "[script] sync/sync_contacts_incremental.py"
        );
    }

    #[test]
    fn test_from_config_uses_defaults() {
        let config = SupervisorConfig::default();
        let entry = JobConfig {
            execution: ExecutionType::Program {
                program: "true".to_string(),
                args: vec![],
            },
            max_attempts: None,
            retry_delay_secs: Some(5),
            working_dir: None,
            env_vars: None,
        };
        let job = JobDefinition::from_config("accounts", &entry, &config);
        assert_eq!(job.name, "accounts");
        assert_eq!(job.max_attempts, config.max_attempts);
        assert_eq!(job.retry_delay(), Duration::from_secs(5));
    }
}
