//! Seams between the pool and the executable shape of a task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::store::{AccessKey, Environment, Inventory, Repository, Task, TaskStatus, Template};

/// Logging and status capability injected into jobs.
///
/// Jobs report through this trait instead of holding their TaskRunner, so no
/// structural cycle exists between the two.
#[async_trait]
pub trait JobLogger: Send + Sync {
    async fn log(&self, message: String) {
        self.log_at(message, Utc::now()).await;
    }

    async fn log_at(&self, message: String, time: DateTime<Utc>);

    async fn set_status(&self, status: TaskStatus);
}

/// The executable shape of a task.
#[async_trait]
pub trait Job: Send + Sync {
    /// Execute the task to completion. A non-error return means the playbook
    /// exited cleanly.
    async fn run(&self, username: String, incoming_version: Option<String>) -> Result<()>;

    /// Request termination of the underlying work.
    async fn kill(&self);
}

/// Everything a job needs to execute one task: the task row plus its fully
/// resolved dependency graph.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub task: Task,
    pub template: Template,
    pub inventory: Inventory,
    pub repository: Repository,
    pub environment: Environment,
    /// Key referenced by the inventory for host access
    pub ssh_key: Option<AccessKey>,
    /// Key referenced by the inventory for privilege escalation
    pub become_key: Option<AccessKey>,
    /// Key referenced by the template for vault decryption
    pub vault_key: Option<AccessKey>,
    /// Key referenced by the repository for checkout
    pub repository_key: Option<AccessKey>,
}
