//! Persisted entities and the task status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StagehandError};

/// Status of a task as it moves through the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Waiting,
    ConfirmationWaiting,
    Starting,
    Running,
    Stopping,
    Stopped,
    Success,
    Fail,
}

impl TaskStatus {
    /// Terminal statuses; a finished task absorbs all further writes.
    pub fn is_finished(self) -> bool {
        matches!(self, TaskStatus::Stopped | TaskStatus::Success | TaskStatus::Fail)
    }

    /// Whether the status graph allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Waiting => matches!(to, ConfirmationWaiting | Starting | Fail | Stopped),
            ConfirmationWaiting => matches!(to, Starting | Stopped | Fail),
            Starting => matches!(to, Running | Fail | Stopping),
            Running => matches!(to, Stopping | Success | Fail),
            Stopping => matches!(to, Stopped | Fail),
            Stopped | Success | Fail => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::ConfirmationWaiting => "confirmation_waiting",
            TaskStatus::Starting => "starting",
            TaskStatus::Running => "running",
            TaskStatus::Stopping => "stopping",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Success => "success",
            TaskStatus::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// One persisted execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Task {
    pub id: i64,
    pub template_id: i64,
    pub project_id: i64,
    pub user_id: Option<i64>,
    pub status: TaskStatus,
    #[serde(default = "epoch")]
    pub created: DateTime<Utc>,
    /// Extra CLI arguments, JSON array string
    pub arguments: Option<String>,
    /// JSON object merged over the template's environment; task keys win
    #[serde(default)]
    pub environment: String,
    /// Assigned for Build templates at submission
    pub version: Option<String>,
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub message: String,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl Task {
    /// Validate a submission against the template it references.
    pub fn validate_new(&self, template: &Template) -> Result<()> {
        if self.template_id != template.id {
            return Err(StagehandError::Validation("template id mismatch".to_string()));
        }
        if self.project_id != template.project_id {
            return Err(StagehandError::Validation(
                "task project does not match template project".to_string(),
            ));
        }
        if template.kind == TemplateType::Build
            && template.start_version.as_deref().unwrap_or("").is_empty()
        {
            return Err(StagehandError::Validation(
                "build template has no start version".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a template produces when a task runs from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TemplateType {
    #[default]
    Job,
    Build,
    Deploy,
}

/// Reusable task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Template {
    pub id: i64,
    pub project_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: TemplateType,
    /// Playbook filename, relative to the repository checkout
    #[serde(default)]
    pub playbook: String,
    pub inventory_id: i64,
    pub repository_id: i64,
    pub environment_id: Option<i64>,
    pub vault_key_id: Option<i64>,
    /// Version pattern for Build templates, e.g. "v0.0.1"
    pub start_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InventoryType {
    /// Inventory content is stored inline and materialized to a file per run
    #[default]
    Static,
    /// Inventory is a path inside the repository checkout
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Inventory {
    pub id: i64,
    pub project_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: InventoryType,
    /// Inline content for Static, checkout-relative path for File
    #[serde(default)]
    pub inventory: String,
    pub ssh_key_id: Option<i64>,
    pub become_key_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Repository {
    pub id: i64,
    pub project_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub git_url: String,
    #[serde(default)]
    pub git_branch: String,
    pub ssh_key_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Environment {
    pub id: i64,
    pub project_id: i64,
    #[serde(default)]
    pub name: String,
    /// JSON object of extra variables
    #[serde(default)]
    pub json: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessKeyType {
    #[default]
    None,
    Ssh,
    LoginPassword,
    Vault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SshKey {
    #[serde(default)]
    pub login: String,
    pub passphrase: Option<String>,
    #[serde(default)]
    pub private_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LoginPassword {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
}

/// Credential material referenced by inventories, repositories and templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AccessKey {
    pub id: i64,
    pub project_id: Option<i64>,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: AccessKeyType,
    pub ssh: Option<SshKey>,
    pub login_password: Option<LoginPassword>,
    pub vault_password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Project {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    /// Per-project cap on concurrently running tasks; 0 means no limit
    #[serde(default)]
    pub max_parallel_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
}

/// A registered worker process, identified by id plus bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Runner {
    pub id: i64,
    #[serde(default)]
    pub token: String,
}

/// One captured line of task output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: i64,
    pub time: DateTime<Utc>,
    pub output: String,
}

/// Audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Event {
    pub user_id: Option<i64>,
    pub project_id: Option<i64>,
    pub object_type: Option<String>,
    pub object_id: Option<i64>,
    pub description: Option<String>,
    #[serde(default = "epoch")]
    pub created: DateTime<Utc>,
}

pub const EVENT_TYPE_TASK: &str = "task";

/// Pagination for list queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetrieveQueryParams {
    pub offset: usize,
    /// 0 means no limit
    pub count: usize,
}

/// Merge two JSON object strings key by key; keys from `overlay` win.
///
/// Empty strings are treated as empty objects. The result is serialized with
/// sorted keys (serde_json map ordering).
pub fn merge_environment(base: &str, overlay: &str) -> Result<String> {
    let mut merged: serde_json::Map<String, serde_json::Value> = if base.trim().is_empty() {
        serde_json::Map::new()
    } else {
        serde_json::from_str(base)?
    };

    if !overlay.trim().is_empty() {
        let overlay: serde_json::Map<String, serde_json::Value> = serde_json::from_str(overlay)?;
        for (key, value) in overlay {
            merged.insert(key, value);
        }
    }

    Ok(serde_json::Value::Object(merged).to_string())
}
