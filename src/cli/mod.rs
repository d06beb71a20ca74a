pub mod jobs;
pub mod logs;
pub mod services;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::models::config::{load_config, resolve_data_dir};
use crate::models::SupervisorConfig;

/// Sync Supervisor - lock, log and retry wrapper for scheduled sync jobs
#[derive(Parser, Debug)]
#[command(
    name = "supervisor",
    version,
    about = "Sync Supervisor - lock, log and retry wrapper for scheduled sync jobs"
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory path
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job once under the lock, with retries
    Run(RunArgs),

    /// List jobs defined in the configuration
    Jobs {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove a job's lock file left behind by a killed run
    Unlock {
        /// Job name
        job: String,
    },

    /// View run logs of a job
    Logs {
        /// Job name
        job: String,

        /// Show last N runs
        #[arg(long)]
        last: Option<usize>,

        /// Show last N lines of the newest run log
        #[arg(long)]
        tail: Option<usize>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete run logs older than the retention period
    Sweep {
        /// Retention in days (overrides config)
        #[arg(long)]
        days: Option<u64>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show which interpreter script jobs would use
    Interpreter,

    /// Show job locks and service processes
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start a configured service in the background
    Start {
        /// Service name
        name: String,

        /// Configuration variant passed to the service
        #[arg(long)]
        alias: Option<String>,
    },

    /// Stop a running service
    Stop {
        /// Service name
        name: String,

        /// Configuration variant the service was started with
        #[arg(long)]
        alias: Option<String>,

        /// Kill instead of asking the process to terminate
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Job name (also names the lock and log files)
    #[arg(short = 'j', long)]
    pub job: String,

    /// Program to execute
    #[arg(long, conflicts_with = "script")]
    pub command: Option<String>,

    /// Script to execute through the resolved interpreter
    #[arg(long, conflicts_with = "command")]
    pub script: Option<String>,

    /// Directory for run logs and lock files
    #[arg(long = "log-dir")]
    pub log_dir: Option<PathBuf>,

    /// Total number of attempts
    #[arg(long = "max-attempts")]
    pub max_attempts: Option<u32>,

    /// Seconds to wait between attempts
    #[arg(long = "retry-delay")]
    pub retry_delay: Option<u64>,

    /// Working directory for the command
    #[arg(long = "working-dir")]
    pub working_dir: Option<PathBuf>,

    /// Environment variables (KEY=VALUE)
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Print the run record as JSON
    #[arg(long)]
    pub json: bool,

    /// Arguments passed to the command
    #[arg(last = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Configuration and directories shared by every command.
pub struct Environment {
    pub data_dir: PathBuf,
    pub config: SupervisorConfig,
}

impl Environment {
    pub fn load(config_path: Option<&Path>, data_dir: Option<&Path>) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir(data_dir);
        let config = load_config(config_path, &data_dir)?;
        Ok(Self { data_dir, config })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.config.log_dir(&self.data_dir)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.config.state_dir(&self.data_dir)
    }
}

/// Parse environment variable arguments from "KEY=VALUE" format into a HashMap.
pub fn parse_env_vars(env_args: &[String]) -> Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    for arg in env_args {
        if let Some((key, value)) = arg.split_once('=') {
            if key.is_empty() {
                return Err(format!("Invalid environment variable: '{}'", arg));
            }
            map.insert(key.to_string(), value.to_string());
        } else {
            return Err(format!(
                "Invalid environment variable format: '{}'. Expected KEY=VALUE",
                arg
            ));
        }
    }
    Ok(map)
}

/// Dispatch the CLI command to the appropriate handler. Returns the
/// process exit status.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<i32> {
    let Some(command) = &cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(0);
    };

    let env = Environment::load(cli.config.as_deref(), cli.data_dir.as_deref())?;

    match command {
        Commands::Run(args) => jobs::cmd_run(&env, args).await,
        Commands::Jobs { json } => jobs::cmd_jobs(&env, *json).map(|_| 0),
        Commands::Unlock { job } => jobs::cmd_unlock(&env, job).map(|_| 0),
        Commands::Logs {
            job,
            last,
            tail,
            json,
        } => logs::cmd_logs(&env, job, *last, *tail, *json)
            .await
            .map(|_| 0),
        Commands::Sweep { days, json } => logs::cmd_sweep(&env, *days, *json).await.map(|_| 0),
        Commands::Interpreter => services::cmd_interpreter(&env),
        Commands::Status { json } => services::cmd_status(&env, *json).await.map(|_| 0),
        Commands::Start { name, alias } => {
            services::cmd_start(&env, name, alias.as_deref()).map(|_| 0)
        }
        Commands::Stop { name, alias, force } => {
            services::cmd_stop(&env, name, alias.as_deref(), *force).map(|_| 0)
        }
    }
}
