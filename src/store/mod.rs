//! Persistence boundary: entity models, the `Store` capability set, and an
//! in-memory reference backend.
//!
//! The core never talks to a database directly; everything goes through the
//! `Store` trait so the persistence layer stays an external collaborator.

pub mod memory;
pub mod models;

pub use memory::MemoryStore;
pub use models::*;

use crate::error::Result;

/// Capability set the scheduling core consumes.
///
/// Implementations must distinguish absence (`StagehandError::NotFound`) from
/// failure so callers can branch on the sentinel.
pub trait Store: Send + Sync {
    /// True if the backend keeps one connection for the process lifetime.
    /// Backends that only support a single connection at a time return false
    /// and get a connect/close pair around each unit of work.
    fn permanent_connection(&self) -> bool;

    /// Open a connection. `token` identifies the session for debugging.
    fn connect(&self, token: &str);
    fn close(&self, token: &str);

    fn get_project(&self, project_id: i64) -> Result<Project>;
    fn create_project(&self, project: Project) -> Result<Project>;

    fn get_template(&self, project_id: i64, template_id: i64) -> Result<Template>;
    fn create_template(&self, template: Template) -> Result<Template>;

    fn get_inventory(&self, project_id: i64, inventory_id: i64) -> Result<Inventory>;
    fn create_inventory(&self, inventory: Inventory) -> Result<Inventory>;

    fn get_repository(&self, project_id: i64, repository_id: i64) -> Result<Repository>;
    fn create_repository(&self, repository: Repository) -> Result<Repository>;

    fn get_environment(&self, project_id: i64, environment_id: i64) -> Result<Environment>;
    fn create_environment(&self, environment: Environment) -> Result<Environment>;

    fn get_access_key(&self, project_id: Option<i64>, key_id: i64) -> Result<AccessKey>;
    fn create_access_key(&self, key: AccessKey) -> Result<AccessKey>;

    fn get_user(&self, user_id: i64) -> Result<User>;
    fn create_user(&self, user: User) -> Result<User>;

    /// Persist a new task; the store assigns the id.
    fn create_task(&self, task: Task) -> Result<Task>;
    fn update_task(&self, task: &Task) -> Result<()>;
    fn get_task(&self, project_id: i64, task_id: i64) -> Result<Task>;
    /// Tasks of one template, newest first.
    fn get_template_tasks(
        &self,
        project_id: i64,
        template_id: i64,
        params: RetrieveQueryParams,
    ) -> Result<Vec<Task>>;

    fn create_task_output(&self, output: TaskOutput) -> Result<TaskOutput>;
    fn get_task_outputs(&self, task_id: i64) -> Result<Vec<TaskOutput>>;

    fn create_event(&self, event: Event) -> Result<Event>;

    fn get_runner(&self, runner_id: i64) -> Result<Runner>;
    fn create_runner(&self, runner: Runner) -> Result<Runner>;
}

/// Run a unit of work against the store, opening and closing a connection
/// around it when the backend does not hold a permanent one.
pub fn store_session<R>(store: &dyn Store, token: &str, f: impl FnOnce() -> R) -> R {
    if !store.permanent_connection() {
        store.connect(token);
    }
    let result = f();
    if !store.permanent_connection() {
        store.close(token);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_session_returns_closure_result() {
        let store = MemoryStore::new();
        let out = store_session(&store, "test", || 7);
        assert_eq!(out, 7);
    }

    #[test]
    fn test_store_session_usable_inside_closure() {
        let store = MemoryStore::new();
        let project = store_session(&store, "test", || {
            store.create_project(Project::default())
        })
        .unwrap();
        assert!(store.get_project(project.id).is_ok());
    }
}
