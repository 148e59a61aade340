//! In-memory envelope around one live task.
//!
//! A TaskRunner carries the task row plus its fully resolved dependency
//! graph, owns every status transition, and forwards log output into the
//! pool's logger channel.

use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use tokio::sync::watch;

use crate::error::Result;
use crate::store::{
    merge_environment, store_session, AccessKey, Environment, Event, Inventory, Repository, Store,
    Task, TaskStatus, Template, EVENT_TYPE_TASK,
};
use crate::tasks::job::{Job, JobContext, JobLogger};
use crate::tasks::pool::{LockMessage, LogRecord, PoolContext};

/// The resolved dependency graph of one task, immutable within a run.
#[derive(Debug)]
pub(crate) struct TaskDetails {
    pub template: Template,
    pub inventory: Inventory,
    pub repository: Repository,
    pub environment: Environment,
    pub ssh_key: Option<AccessKey>,
    pub become_key: Option<AccessKey>,
    pub vault_key: Option<AccessKey>,
    pub repository_key: Option<AccessKey>,
    pub username: String,
}

impl TaskDetails {
    /// Hydrate everything the task references, merging the task's environment
    /// override into the template's environment (task keys win).
    pub fn resolve(store: &dyn Store, task: &Task) -> Result<Self> {
        let template = store.get_template(task.project_id, task.template_id)?;
        let inventory = store.get_inventory(task.project_id, template.inventory_id)?;
        let repository = store.get_repository(task.project_id, template.repository_id)?;

        let mut environment = match template.environment_id {
            Some(id) => store.get_environment(task.project_id, id)?,
            None => Environment::default(),
        };
        environment.json = merge_environment(&environment.json, &task.environment)?;

        let project_id = Some(task.project_id);
        let ssh_key = inventory
            .ssh_key_id
            .map(|id| store.get_access_key(project_id, id))
            .transpose()?;
        let become_key = inventory
            .become_key_id
            .map(|id| store.get_access_key(project_id, id))
            .transpose()?;
        let vault_key = template
            .vault_key_id
            .map(|id| store.get_access_key(project_id, id))
            .transpose()?;
        let repository_key = if repository.ssh_key_id != 0 {
            Some(store.get_access_key(project_id, repository.ssh_key_id)?)
        } else {
            None
        };

        let username = match task.user_id {
            Some(id) => store.get_user(id)?.username,
            None => String::new(),
        };

        Ok(Self {
            template,
            inventory,
            repository,
            environment,
            ssh_key,
            become_key,
            vault_key,
            repository_key,
            username,
        })
    }
}

pub struct TaskRunner {
    task: RwLock<Task>,
    pub template: Template,
    pub inventory: Inventory,
    pub repository: Repository,
    pub environment: Environment,
    pub username: String,
    ssh_key: Option<AccessKey>,
    become_key: Option<AccessKey>,
    vault_key: Option<AccessKey>,
    repository_key: Option<AccessKey>,
    incoming_version: Option<String>,
    job: OnceLock<Arc<dyn Job>>,
    status_tx: watch::Sender<TaskStatus>,
    ctx: PoolContext,
}

impl TaskRunner {
    pub(crate) fn new(task: Task, details: TaskDetails, ctx: PoolContext) -> Self {
        let (status_tx, _) = watch::channel(task.status);
        Self {
            task: RwLock::new(task),
            template: details.template,
            inventory: details.inventory,
            repository: details.repository,
            environment: details.environment,
            username: details.username,
            ssh_key: details.ssh_key,
            become_key: details.become_key,
            vault_key: details.vault_key,
            repository_key: details.repository_key,
            incoming_version: None,
            job: OnceLock::new(),
            status_tx,
            ctx,
        }
    }

    pub fn id(&self) -> i64 {
        self.task.read().map(|t| t.id).unwrap_or_default()
    }

    pub fn project_id(&self) -> i64 {
        self.task.read().map(|t| t.project_id).unwrap_or_default()
    }

    pub fn status(&self) -> TaskStatus {
        self.task.read().map(|t| t.status).unwrap_or_default()
    }

    /// Snapshot of the task row.
    pub fn task(&self) -> Task {
        self.task.read().map(|t| t.clone()).unwrap_or_default()
    }

    pub(crate) fn attach_job(&self, job: Arc<dyn Job>) {
        let _ = self.job.set(job);
    }

    /// Watch feed of status transitions; a RemoteJob blocks on this until the
    /// progress protocol drives the task to a terminal state.
    pub(crate) fn status_watch(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    /// The resolved data a job needs to execute this task.
    pub(crate) fn job_context(&self) -> JobContext {
        JobContext {
            task: self.task(),
            template: self.template.clone(),
            inventory: self.inventory.clone(),
            repository: self.repository.clone(),
            environment: self.environment.clone(),
            ssh_key: self.ssh_key.clone(),
            become_key: self.become_key.clone(),
            vault_key: self.vault_key.clone(),
            repository_key: self.repository_key.clone(),
        }
    }

    /// Transition through the status graph. Writes through to the store,
    /// records a task event, and releases the resource lock when the new
    /// status is terminal. Illegal transitions are ignored; a finished task
    /// absorbs every further write.
    pub async fn set_status(&self, status: TaskStatus) {
        let snapshot = {
            let Ok(mut task) = self.task.write() else { return };
            let current = task.status;

            if current == status {
                return;
            }
            if current.is_finished() {
                debug!("task {} already finished, ignoring {}", task.id, status);
                return;
            }
            if !current.can_transition_to(status) {
                warn!(
                    "illegal status transition {} -> {} for task {}",
                    current, status, task.id
                );
                return;
            }

            task.status = status;
            task.clone()
        };

        self.save();
        self.create_task_event(format!("Task ID {} status {}", snapshot.id, status));

        let _ = self.status_tx.send(status);

        if status.is_finished() {
            let _ = self.ctx.locker_tx.send(LockMessage::Unlock {
                project_id: snapshot.project_id,
                task_id: snapshot.id,
            });
        }
    }

    /// Persist the current task row; store failures are logged and swallowed.
    pub(crate) fn save(&self) {
        let snapshot = self.task();
        let store = &self.ctx.store;
        store_session(store.as_ref(), "update task", || {
            if let Err(e) = store.update_task(&snapshot) {
                error!("failed to save task {}: {}", snapshot.id, e);
            }
        });
    }

    pub async fn log(&self, message: String) {
        self.log_at(message, Utc::now()).await;
    }

    /// Enqueue a log record for persistence. The channel is bounded; when the
    /// buffer is saturated this blocks the producer rather than drop lines.
    pub async fn log_at(&self, message: String, time: DateTime<Utc>) {
        let record = LogRecord {
            task_id: self.id(),
            output: message,
            time,
        };
        if self.ctx.logger_tx.send(record).await.is_err() {
            error!("log channel closed; dropping output of task {}", self.id());
        }
    }

    /// Execute the attached job and translate its result into the final
    /// status transition. The resource lock is released by the terminal
    /// `set_status`.
    pub(crate) async fn run(self: Arc<Self>) {
        self.set_status(TaskStatus::Starting).await;
        self.log(format!("Started: {}", self.id())).await;

        let Some(job) = self.job.get().map(Arc::clone) else {
            self.log("no job attached".to_string()).await;
            self.set_status(TaskStatus::Fail).await;
            return;
        };

        let result = job
            .run(self.username.clone(), self.incoming_version.clone())
            .await;

        match result {
            Ok(()) => {
                if self.status() == TaskStatus::Stopping {
                    self.set_status(TaskStatus::Stopped).await;
                } else {
                    self.set_status(TaskStatus::Success).await;
                }
            }
            Err(err) => {
                self.log(format!("Run failed: {}", err)).await;
                if self.status() == TaskStatus::Stopping {
                    self.set_status(TaskStatus::Stopped).await;
                } else {
                    self.set_status(TaskStatus::Fail).await;
                }
            }
        }
    }

    pub(crate) async fn kill(&self) {
        if let Some(job) = self.job.get() {
            job.kill().await;
        }
    }

    fn create_task_event(&self, description: String) {
        let snapshot = self.task();
        let store = &self.ctx.store;
        store_session(store.as_ref(), "task event", || {
            if let Err(e) = store.create_event(Event {
                user_id: snapshot.user_id,
                project_id: Some(snapshot.project_id),
                object_type: Some(EVENT_TYPE_TASK.to_string()),
                object_id: Some(snapshot.id),
                description: Some(description.clone()),
                created: Utc::now(),
            }) {
                error!("failed to record event for task {}: {}", snapshot.id, e);
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn force_status(&self, status: TaskStatus) {
        if let Ok(mut task) = self.task.write() {
            task.status = status;
        }
        let _ = self.status_tx.send(status);
    }
}

#[async_trait]
impl JobLogger for TaskRunner {
    async fn log_at(&self, message: String, time: DateTime<Utc>) {
        TaskRunner::log_at(self, message, time).await;
    }

    async fn set_status(&self, status: TaskStatus) {
        TaskRunner::set_status(self, status).await;
    }
}
