//! In-process execution of one task.
//!
//! A LocalJob prepares a per-task workspace (repository checkout, inventory
//! file, credential files) and drives the automation tool subprocess through
//! a `CommandRunner`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{Result, StagehandError};
use crate::store::{AccessKey, AccessKeyType, InventoryType, TaskStatus};
use crate::tasks::job::{Job, JobContext, JobLogger};
use crate::tasks::playbook::CommandRunner;

pub struct LocalJob {
    pub context: JobContext,
    logger: Arc<dyn JobLogger>,
    runner: CommandRunner,
    config: Arc<Config>,
}

impl LocalJob {
    pub fn new(context: JobContext, logger: Arc<dyn JobLogger>, config: Arc<Config>) -> Self {
        let runner = CommandRunner::new(Arc::clone(&logger));
        Self {
            context,
            logger,
            runner,
            config,
        }
    }

    /// Per-task scratch directory holding the repository checkout.
    pub fn workspace(&self) -> PathBuf {
        self.config.tmp_path.join(format!(
            "repository_{}_{}",
            self.context.template.id, self.context.task.id
        ))
    }

    /// Playbook filename relative to the checkout root; a leading `/` is
    /// stripped so absolute-looking paths stay inside the workspace.
    fn playbook_name(&self) -> &str {
        self.context.template.playbook.trim_start_matches('/')
    }

    /// Directory containing the playbook inside the workspace.
    pub fn playbook_dir(&self) -> PathBuf {
        match Path::new(self.playbook_name()).parent() {
            Some(parent) if parent != Path::new("") => self.workspace().join(parent),
            _ => self.workspace(),
        }
    }

    fn inventory_path(&self) -> PathBuf {
        match self.context.inventory.kind {
            InventoryType::Static => self
                .config
                .tmp_path
                .join(format!("inventory_{}", self.context.inventory.id)),
            InventoryType::File => self
                .workspace()
                .join(self.context.inventory.inventory.trim_start_matches('/')),
        }
    }

    fn access_key_path(&self, key: &AccessKey) -> PathBuf {
        self.config.tmp_path.join(format!("access_key_{}", key.id))
    }

    fn install_inventory(&self) -> Result<()> {
        if self.context.inventory.kind == InventoryType::Static {
            fs::write(self.inventory_path(), &self.context.inventory.inventory)?;
        }
        Ok(())
    }

    fn install_access_keys(&self) -> Result<()> {
        if let Some(key) = &self.context.ssh_key {
            match key.kind {
                AccessKeyType::Ssh => {
                    let ssh = key.ssh.as_ref().ok_or_else(|| {
                        StagehandError::Validation(format!("ssh key {} has no material", key.id))
                    })?;
                    self.write_secret(&self.access_key_path(key), ssh.private_key.as_bytes())?;
                }
                AccessKeyType::LoginPassword => {
                    let creds = key.login_password.as_ref().ok_or_else(|| {
                        StagehandError::Validation(format!("login key {} has no material", key.id))
                    })?;
                    let vars = json!({
                        "ansible_user": creds.login,
                        "ansible_password": creds.password,
                    });
                    self.write_secret(&self.access_key_path(key), vars.to_string().as_bytes())?;
                }
                _ => {}
            }
        }

        if let Some(key) = &self.context.become_key {
            if key.kind == AccessKeyType::LoginPassword {
                let creds = key.login_password.as_ref().ok_or_else(|| {
                    StagehandError::Validation(format!("become key {} has no material", key.id))
                })?;
                let vars = json!({
                    "ansible_become_user": creds.login,
                    "ansible_become_password": creds.password,
                });
                self.write_secret(&self.access_key_path(key), vars.to_string().as_bytes())?;
            }
        }

        if let Some(key) = &self.context.vault_key {
            if key.kind == AccessKeyType::Vault {
                let password = key.vault_password.as_deref().ok_or_else(|| {
                    StagehandError::Validation(format!("vault key {} has no material", key.id))
                })?;
                self.write_secret(&self.access_key_path(key), password.as_bytes())?;
            }
        }

        Ok(())
    }

    fn write_secret(&self, path: &Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    async fn checkout_repository(&self) -> Result<()> {
        let workspace = self.workspace();
        let repository = &self.context.repository;
        let branch = repository.git_branch.clone();

        if workspace.join(".git").exists() {
            self.logger
                .log(format!("Updating repository {}", repository.git_url))
                .await;
            let mut args = vec!["pull".to_string()];
            if !branch.is_empty() {
                args.push("origin".to_string());
                args.push(branch.clone());
            }
            self.runner.run("git", &args, &workspace).await?;
        } else {
            self.logger
                .log(format!("Cloning repository {}", repository.git_url))
                .await;
            let mut args = vec!["clone".to_string(), "--recursive".to_string()];
            if !branch.is_empty() {
                args.push("--branch".to_string());
                args.push(branch.clone());
            }
            args.push(repository.git_url.clone());
            args.push(workspace.display().to_string());
            self.runner.run("git", &args, &self.config.tmp_path).await?;
        }

        if let Some(hash) = &self.context.task.commit_hash {
            self.logger.log(format!("Checking out {}", hash)).await;
            self.runner
                .run("git", &["checkout".to_string(), hash.clone()], &workspace)
                .await?;
        }

        Ok(())
    }

    /// The merged extra-vars payload passed on the command line.
    fn extra_vars(&self, username: &str, incoming_version: Option<&str>) -> Result<String> {
        let environment = &self.context.environment.json;
        let mut vars: serde_json::Map<String, Value> = if environment.trim().is_empty() {
            serde_json::Map::new()
        } else {
            serde_json::from_str(environment)?
        };

        let mut details = serde_json::Map::new();
        details.insert("id".to_string(), json!(self.context.task.id));
        if let Some(version) = &self.context.task.version {
            details.insert("version".to_string(), json!(version));
        }
        if let Some(incoming) = incoming_version {
            details.insert("incoming_version".to_string(), json!(incoming));
        }
        details.insert("username".to_string(), json!(username));

        vars.insert("semaphore_vars".to_string(), json!({ "task_details": details }));
        Ok(Value::Object(vars).to_string())
    }

    /// Argument vector for the automation tool: inventory first, credentials,
    /// extra vars, any per-task arguments, playbook positional last.
    pub fn playbook_args(&self, username: &str, incoming_version: Option<&str>) -> Result<Vec<String>> {
        let mut args = vec![
            "-i".to_string(),
            self.inventory_path().display().to_string(),
        ];

        if let Some(key) = &self.context.ssh_key {
            match key.kind {
                AccessKeyType::Ssh => {
                    args.push(format!(
                        "--private-key={}",
                        self.access_key_path(key).display()
                    ));
                }
                AccessKeyType::LoginPassword => {
                    args.push(format!("--extra-vars=@{}", self.access_key_path(key).display()));
                }
                _ => {}
            }
        }

        if let Some(key) = &self.context.become_key {
            if key.kind == AccessKeyType::LoginPassword {
                args.push(format!("--extra-vars=@{}", self.access_key_path(key).display()));
            }
        }

        if let Some(key) = &self.context.vault_key {
            if key.kind == AccessKeyType::Vault {
                args.push(format!(
                    "--vault-password-file={}",
                    self.access_key_path(key).display()
                ));
            }
        }

        args.push("--extra-vars".to_string());
        args.push(self.extra_vars(username, incoming_version)?);

        if let Some(raw) = &self.context.task.arguments {
            if !raw.trim().is_empty() {
                let extra: Vec<String> = serde_json::from_str(raw).map_err(|e| {
                    StagehandError::Validation(format!("could not parse task arguments: {}", e))
                })?;
                args.extend(extra);
            }
        }

        args.push(self.playbook_name().to_string());
        Ok(args)
    }
}

#[async_trait]
impl Job for LocalJob {
    async fn run(&self, username: String, incoming_version: Option<String>) -> Result<()> {
        self.logger
            .log(format!("Preparing: {}", self.context.task.id))
            .await;

        fs::create_dir_all(&self.config.tmp_path)?;
        self.checkout_repository().await?;
        self.install_inventory()?;
        self.install_access_keys()?;

        let args = self.playbook_args(&username, incoming_version.as_deref())?;

        self.logger.set_status(TaskStatus::Running).await;
        self.runner
            .run(&self.config.playbook_command, &args, &self.workspace())
            .await
    }

    async fn kill(&self) {
        self.runner.kill();
    }
}
