use thiserror::Error;

/// Exit status reported when the environment has to be fixed before a job can run.
pub const EXIT_CONFIGURATION: i32 = 2;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Service error: {0}")]
    Service(String),
}

impl SupervisorError {
    /// The message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            SupervisorError::Configuration(m)
            | SupervisorError::Validation(m)
            | SupervisorError::Service(m) => m,
        }
    }

    /// Process exit status used when this error reaches the binary boundary.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::Configuration(_) | SupervisorError::Validation(_) => {
                EXIT_CONFIGURATION
            }
            SupervisorError::Service(_) => 1,
        }
    }
}

/// Pick the exit status for an error coming out of a CLI command.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SupervisorError>())
        .map(SupervisorError::exit_code)
        .unwrap_or(1)
}
