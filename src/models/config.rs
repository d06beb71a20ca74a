use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::errors::SupervisorError;
use crate::models::{ExecutionType, JobConfig};

const APP_DIR_NAME: &str = "sync-supervisor";

/// A long-running process the operator starts and stops (tunnel, worker).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub execution: ExecutionType,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env_vars: Option<HashMap<String, String>>,
    /// Environment variable that receives the `--alias` value.
    #[serde(default = "default_alias_env")]
    pub alias_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub project_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u64,
    #[serde(default)]
    pub lock_stale_after_secs: Option<u64>,
    #[serde(default = "default_interpreter_candidates")]
    pub interpreter_candidates: Vec<String>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_retry_delay_secs() -> u64 {
    60
}

fn default_log_retention_days() -> u64 {
    30
}

fn default_alias_env() -> String {
    "SUPERVISOR_ALIAS".to_string()
}

fn default_interpreter_candidates() -> Vec<String> {
    [
        "venv/bin/python",
        ".venv/bin/python",
        "venv/Scripts/python.exe",
        ".venv/Scripts/python.exe",
        "python3",
        "python",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            project_dir: None,
            log_dir: None,
            state_dir: None,
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            log_retention_days: default_log_retention_days(),
            lock_stale_after_secs: None,
            interpreter_candidates: default_interpreter_candidates(),
            jobs: BTreeMap::new(),
            services: BTreeMap::new(),
        }
    }
}

impl SupervisorConfig {
    /// Directory scripts and relative programs are resolved against.
    pub fn project_dir(&self) -> PathBuf {
        self.project_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn log_dir(&self, data_dir: &Path) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("logs"))
    }

    /// Where lock and PID files live. Shares the log directory unless set.
    pub fn state_dir(&self, data_dir: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.log_dir(data_dir))
    }
}

fn read_config(path: &Path) -> Result<SupervisorConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SupervisorError::Configuration(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    let config: SupervisorConfig = serde_json::from_str(&content).map_err(|e| {
        SupervisorError::Configuration(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Load the SupervisorConfig, first match wins:
///   1. --config CLI flag (passed as config_path)
///   2. SUPERVISOR_CONFIG_DIR environment variable
///   3. Platform config dir (dirs::config_dir()/sync-supervisor/config.json)
///   4. {data_dir}/config.json
///   5. SupervisorConfig::default()
pub fn load_config(config_path: Option<&Path>, data_dir: &Path) -> Result<SupervisorConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            return read_config(path);
        }
        return Err(SupervisorError::Configuration(format!(
            "Config file not found: {}",
            path.display()
        ))
        .into());
    }

    if let Ok(config_dir) = std::env::var("SUPERVISOR_CONFIG_DIR") {
        let path = PathBuf::from(config_dir).join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join(APP_DIR_NAME).join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    let path = data_dir.join("config.json");
    if path.exists() {
        return read_config(&path);
    }

    tracing::debug!("No config file found, using defaults");
    Ok(SupervisorConfig::default())
}

/// Resolve the data directory: explicit override, then SUPERVISOR_DATA_DIR,
/// then the platform data dir.
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Ok(d) = std::env::var("SUPERVISOR_DATA_DIR") {
        return PathBuf::from(d);
    }

    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}
