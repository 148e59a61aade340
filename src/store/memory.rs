//! In-memory store backend.
//!
//! Backs the test suite and the demo binary. Modeled as a non-permanent-
//! connection backend so `store_session` is exercised the same way it would
//! be against a single-connection database.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Result, StagehandError};

use super::models::*;
use super::Store;

#[derive(Default)]
struct Tables {
    next_id: i64,
    projects: HashMap<i64, Project>,
    templates: HashMap<i64, Template>,
    inventories: HashMap<i64, Inventory>,
    repositories: HashMap<i64, Repository>,
    environments: HashMap<i64, Environment>,
    access_keys: HashMap<i64, AccessKey>,
    users: HashMap<i64, User>,
    tasks: HashMap<i64, Task>,
    task_insert_order: Vec<i64>,
    task_outputs: Vec<TaskOutput>,
    events: Vec<Event>,
    runners: HashMap<i64, Runner>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Thread-safe in-memory implementation of [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far; test hook.
    pub fn events(&self) -> Vec<Event> {
        self.read(|t| t.events.clone())
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let guard = match self.tables.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&guard)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut guard = match self.tables.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl Store for MemoryStore {
    fn permanent_connection(&self) -> bool {
        false
    }

    fn connect(&self, _token: &str) {}

    fn close(&self, _token: &str) {}

    fn get_project(&self, project_id: i64) -> Result<Project> {
        self.read(|t| t.projects.get(&project_id).cloned())
            .ok_or(StagehandError::NotFound("project"))
    }

    fn create_project(&self, mut project: Project) -> Result<Project> {
        self.write(|t| {
            project.id = t.next_id();
            t.projects.insert(project.id, project.clone());
            Ok(project)
        })
    }

    fn get_template(&self, project_id: i64, template_id: i64) -> Result<Template> {
        self.read(|t| {
            t.templates
                .get(&template_id)
                .filter(|tpl| tpl.project_id == project_id)
                .cloned()
        })
        .ok_or(StagehandError::NotFound("template"))
    }

    fn create_template(&self, mut template: Template) -> Result<Template> {
        self.write(|t| {
            template.id = t.next_id();
            t.templates.insert(template.id, template.clone());
            Ok(template)
        })
    }

    fn get_inventory(&self, project_id: i64, inventory_id: i64) -> Result<Inventory> {
        self.read(|t| {
            t.inventories
                .get(&inventory_id)
                .filter(|inv| inv.project_id == project_id)
                .cloned()
        })
        .ok_or(StagehandError::NotFound("inventory"))
    }

    fn create_inventory(&self, mut inventory: Inventory) -> Result<Inventory> {
        self.write(|t| {
            inventory.id = t.next_id();
            t.inventories.insert(inventory.id, inventory.clone());
            Ok(inventory)
        })
    }

    fn get_repository(&self, project_id: i64, repository_id: i64) -> Result<Repository> {
        self.read(|t| {
            t.repositories
                .get(&repository_id)
                .filter(|repo| repo.project_id == project_id)
                .cloned()
        })
        .ok_or(StagehandError::NotFound("repository"))
    }

    fn create_repository(&self, mut repository: Repository) -> Result<Repository> {
        self.write(|t| {
            repository.id = t.next_id();
            t.repositories.insert(repository.id, repository.clone());
            Ok(repository)
        })
    }

    fn get_environment(&self, project_id: i64, environment_id: i64) -> Result<Environment> {
        self.read(|t| {
            t.environments
                .get(&environment_id)
                .filter(|env| env.project_id == project_id)
                .cloned()
        })
        .ok_or(StagehandError::NotFound("environment"))
    }

    fn create_environment(&self, mut environment: Environment) -> Result<Environment> {
        self.write(|t| {
            environment.id = t.next_id();
            t.environments.insert(environment.id, environment.clone());
            Ok(environment)
        })
    }

    fn get_access_key(&self, project_id: Option<i64>, key_id: i64) -> Result<AccessKey> {
        self.read(|t| {
            t.access_keys
                .get(&key_id)
                .filter(|key| project_id.is_none() || key.project_id == project_id)
                .cloned()
        })
        .ok_or(StagehandError::NotFound("access key"))
    }

    fn create_access_key(&self, mut key: AccessKey) -> Result<AccessKey> {
        self.write(|t| {
            key.id = t.next_id();
            t.access_keys.insert(key.id, key.clone());
            Ok(key)
        })
    }

    fn get_user(&self, user_id: i64) -> Result<User> {
        self.read(|t| t.users.get(&user_id).cloned())
            .ok_or(StagehandError::NotFound("user"))
    }

    fn create_user(&self, mut user: User) -> Result<User> {
        self.write(|t| {
            user.id = t.next_id();
            t.users.insert(user.id, user.clone());
            Ok(user)
        })
    }

    fn create_task(&self, mut task: Task) -> Result<Task> {
        self.write(|t| {
            task.id = t.next_id();
            t.tasks.insert(task.id, task.clone());
            t.task_insert_order.push(task.id);
            Ok(task)
        })
    }

    fn update_task(&self, task: &Task) -> Result<()> {
        self.write(|t| match t.tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(StagehandError::NotFound("task")),
        })
    }

    fn get_task(&self, project_id: i64, task_id: i64) -> Result<Task> {
        self.read(|t| {
            t.tasks
                .get(&task_id)
                .filter(|task| task.project_id == project_id)
                .cloned()
        })
        .ok_or(StagehandError::NotFound("task"))
    }

    fn get_template_tasks(
        &self,
        project_id: i64,
        template_id: i64,
        params: RetrieveQueryParams,
    ) -> Result<Vec<Task>> {
        self.read(|t| {
            let mut tasks: Vec<Task> = t
                .task_insert_order
                .iter()
                .rev()
                .filter_map(|id| t.tasks.get(id))
                .filter(|task| task.project_id == project_id && task.template_id == template_id)
                .cloned()
                .collect();

            if params.offset > 0 {
                tasks = tasks.split_off(params.offset.min(tasks.len()));
            }
            if params.count > 0 {
                tasks.truncate(params.count);
            }
            Ok(tasks)
        })
    }

    fn create_task_output(&self, output: TaskOutput) -> Result<TaskOutput> {
        self.write(|t| {
            t.task_outputs.push(output.clone());
            Ok(output)
        })
    }

    fn get_task_outputs(&self, task_id: i64) -> Result<Vec<TaskOutput>> {
        self.read(|t| {
            Ok(t.task_outputs
                .iter()
                .filter(|o| o.task_id == task_id)
                .cloned()
                .collect())
        })
    }

    fn create_event(&self, event: Event) -> Result<Event> {
        self.write(|t| {
            t.events.push(event.clone());
            Ok(event)
        })
    }

    fn get_runner(&self, runner_id: i64) -> Result<Runner> {
        self.read(|t| t.runners.get(&runner_id).cloned())
            .ok_or(StagehandError::NotFound("runner"))
    }

    fn create_runner(&self, mut runner: Runner) -> Result<Runner> {
        self.write(|t| {
            runner.id = t.next_id();
            t.runners.insert(runner.id, runner.clone());
            Ok(runner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_create_assigns_ids() {
        let store = MemoryStore::new();
        let p1 = store.create_project(Project::default()).unwrap();
        let p2 = store.create_project(Project::default()).unwrap();
        assert_ne!(p1.id, p2.id);
    }

    #[test]
    fn test_get_missing_returns_not_found() {
        let store = MemoryStore::new();
        let err = store.get_project(99).unwrap_err();
        assert!(err.is_not_found());
        let err = store.get_template(1, 99).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_template_scoped_by_project() {
        let store = MemoryStore::new();
        let project = store.create_project(Project::default()).unwrap();
        let template = store
            .create_template(Template {
                project_id: project.id,
                ..Default::default()
            })
            .unwrap();

        assert!(store.get_template(project.id, template.id).is_ok());
        assert!(store.get_template(project.id + 1, template.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_update_task() {
        let store = MemoryStore::new();
        let mut task = store.create_task(Task::default()).unwrap();
        task.status = TaskStatus::Running;
        store.update_task(&task).unwrap();
        assert_eq!(store.get_task(0, task.id).unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn test_template_tasks_newest_first() {
        let store = MemoryStore::new();
        let t1 = store
            .create_task(Task {
                template_id: 7,
                version: Some("v1".to_string()),
                ..Default::default()
            })
            .unwrap();
        let t2 = store
            .create_task(Task {
                template_id: 7,
                version: Some("v2".to_string()),
                ..Default::default()
            })
            .unwrap();

        let tasks = store
            .get_template_tasks(0, 7, RetrieveQueryParams { offset: 0, count: 1 })
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, t2.id);

        let all = store
            .get_template_tasks(0, 7, RetrieveQueryParams::default())
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].id, t1.id);
    }

    #[test]
    fn test_task_outputs_preserve_order() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .create_task_output(TaskOutput {
                    task_id: 1,
                    time: Utc::now(),
                    output: format!("line {}", i),
                })
                .unwrap();
        }

        let outputs = store.get_task_outputs(1).unwrap();
        assert_eq!(outputs.len(), 5);
        for (i, output) in outputs.iter().enumerate() {
            assert_eq!(output.output, format!("line {}", i));
        }
    }

    #[test]
    fn test_runner_round_trip() {
        let store = MemoryStore::new();
        let runner = store
            .create_runner(Runner {
                token: "bearer".to_string(),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(store.get_runner(runner.id).unwrap().token, "bearer");
        assert!(store.get_runner(runner.id + 1).unwrap_err().is_not_found());
    }

    #[test]
    fn test_access_key_global_lookup() {
        let store = MemoryStore::new();
        let key = store
            .create_access_key(AccessKey {
                project_id: Some(3),
                kind: AccessKeyType::Ssh,
                ..Default::default()
            })
            .unwrap();

        // project-scoped and global lookups both find it
        assert!(store.get_access_key(Some(3), key.id).is_ok());
        assert!(store.get_access_key(None, key.id).is_ok());
        assert!(store.get_access_key(Some(4), key.id).unwrap_err().is_not_found());
    }
}
