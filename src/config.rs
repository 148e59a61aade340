//! Process-wide configuration snapshot.
//!
//! Loaded once at startup and passed to both pools via Arc; neither pool
//! reads module-level state.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scratch directory for workspaces, inventories and key files
    pub tmp_path: PathBuf,
    /// Global cap on concurrently running tasks; 0 means unlimited
    pub max_parallel_tasks: usize,
    /// When set, submitted tasks are dispatched to remote runners
    pub use_remote_runner: bool,
    /// The automation tool invoked for each playbook run
    pub playbook_command: String,
    pub runner: RunnerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmp_path: PathBuf::from("/tmp/stagehand"),
            max_parallel_tasks: 0,
            use_remote_runner: false,
            playbook_command: "ansible-playbook".to_string(),
            runner: RunnerSettings::default(),
        }
    }
}

/// Settings consumed by the runner-side job pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Base URL of the controller API, e.g. "https://controller/api"
    pub api_url: String,
    /// Path of the on-disk credentials file written at registration
    pub config_file: PathBuf,
    /// One-time token exchanged for runner credentials
    pub registration_token: String,
    /// Process at most one job, then exit
    pub one_off: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000/api".to_string(),
            config_file: PathBuf::from("/etc/stagehand/runner.json"),
            registration_token: String::new(),
            one_off: false,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Effective global concurrency limit; 0 in the file means unlimited.
    pub fn max_parallel_tasks(&self) -> usize {
        if self.max_parallel_tasks == 0 {
            usize::MAX
        } else {
            self.max_parallel_tasks
        }
    }
}
