//! Wire types for the runner HTTP protocol.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{AccessKey, Environment, Inventory, Repository, Task, TaskStatus, Template};

/// Body of `POST /runners`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerRegistration {
    pub registration_token: String,
}

/// Identity handed out at registration; also the on-disk config file format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerCredentials {
    pub runner_id: i64,
    pub token: String,
}

/// A job assignment: the task row plus its denormalized dependency graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobData {
    #[serde(default)]
    pub username: String,
    pub incoming_version: Option<String>,
    pub task: Task,
    pub template: Template,
    pub inventory: Inventory,
    pub repository: Repository,
    pub environment: Environment,
}

/// Response of `GET /runners/{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerState {
    #[serde(default)]
    pub current_jobs: Vec<JobState>,
    #[serde(default)]
    pub new_jobs: Vec<JobData>,
    #[serde(default)]
    pub access_keys: HashMap<i64, AccessKey>,
}

/// Controller's view of a job already held by this runner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobState {
    pub id: i64,
    pub status: TaskStatus,
}

/// One captured output line on its way upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub time: DateTime<Utc>,
    pub message: String,
}

/// Body of `PUT /runners/{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerProgress {
    pub jobs: Vec<JobProgress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub id: i64,
    pub status: TaskStatus,
    pub log_records: Vec<LogRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_state_defaults_for_missing_fields() {
        let state: RunnerState = serde_json::from_str("{}").unwrap();
        assert!(state.current_jobs.is_empty());
        assert!(state.new_jobs.is_empty());
        assert!(state.access_keys.is_empty());
    }

    #[test]
    fn test_access_keys_map_uses_numeric_ids() {
        let state: RunnerState = serde_json::from_str(
            r#"{"access_keys": {"5": {"id": 5, "type": "ssh"}}}"#,
        )
        .unwrap();
        assert_eq!(state.access_keys[&5].id, 5);
    }

    #[test]
    fn test_credentials_round_trip() {
        let creds = RunnerCredentials {
            runner_id: 7,
            token: "secret".to_string(),
        };
        let json = serde_json::to_string(&creds).unwrap();
        assert!(json.contains("\"runner_id\":7"));
        let parsed: RunnerCredentials = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, creds);
    }

    #[test]
    fn test_progress_serializes_statuses_snake_case() {
        let progress = RunnerProgress {
            jobs: vec![JobProgress {
                id: 1,
                status: TaskStatus::Running,
                log_records: vec![],
            }],
        };
        let json = serde_json::to_string(&progress).unwrap();
        assert!(json.contains("\"status\":\"running\""));
    }
}
