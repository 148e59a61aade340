//! Submission flow against the public API: validation, build versioning,
//! lookups and stop semantics, all over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use stagehand::config::Config;
use stagehand::store::{
    AccessKey, AccessKeyType, Environment, Inventory, MemoryStore, Project, Repository, Store,
    Task, TaskStatus, Template, TemplateType,
};
use stagehand::tasks::TaskPool;
use stagehand::StagehandError;

struct Fixture {
    store: Arc<MemoryStore>,
    pool: Arc<TaskPool>,
    project_id: i64,
    inventory_id: i64,
    repository_id: i64,
}

impl Fixture {
    /// Registration goes through the control loop; wait for the task to show
    /// up in the pool.
    async fn wait_until_queued(&self, task_id: i64) -> Arc<stagehand::tasks::TaskRunner> {
        for _ in 0..200 {
            if let Some(runner) = self.pool.get_task(task_id) {
                return runner;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never entered the queue", task_id);
    }
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());

    let project = store.create_project(Project::default()).unwrap();
    let key = store
        .create_access_key(AccessKey {
            project_id: Some(project.id),
            kind: AccessKeyType::None,
            ..Default::default()
        })
        .unwrap();
    let repository = store
        .create_repository(Repository {
            project_id: project.id,
            git_url: "git@example.com:test/test".to_string(),
            git_branch: "master".to_string(),
            ssh_key_id: key.id,
            ..Default::default()
        })
        .unwrap();
    let inventory = store
        .create_inventory(Inventory {
            project_id: project.id,
            ..Default::default()
        })
        .unwrap();

    let pool = Arc::new(TaskPool::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(Config::default()),
    ));

    {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.run().await });
    }

    Fixture {
        store,
        pool,
        project_id: project.id,
        inventory_id: inventory.id,
        repository_id: repository.id,
    }
}

fn template(fixture: &Fixture, kind: TemplateType, start_version: Option<&str>) -> Template {
    fixture
        .store
        .create_template(Template {
            project_id: fixture.project_id,
            name: "Test".to_string(),
            kind,
            playbook: "test.yml".to_string(),
            inventory_id: fixture.inventory_id,
            repository_id: fixture.repository_id,
            start_version: start_version.map(String::from),
            ..Default::default()
        })
        .unwrap()
}

#[tokio::test]
async fn submitted_task_is_persisted_and_discoverable() {
    let fixture = fixture();
    let template = template(&fixture, TemplateType::Job, None);

    let task = fixture
        .pool
        .add_task(
            Task {
                template_id: template.id,
                ..Default::default()
            },
            None,
            fixture.project_id,
        )
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Waiting);
    assert!(task.id > 0);

    // visible through the pool while queued
    let runner = fixture.wait_until_queued(task.id).await;
    assert_eq!(runner.status(), TaskStatus::Waiting);

    // the queue event reached the store
    assert!(fixture
        .store
        .events()
        .iter()
        .any(|e| e.object_id == Some(task.id)));
}

#[tokio::test]
async fn build_submission_derives_next_version() {
    let fixture = fixture();
    let template = template(&fixture, TemplateType::Build, Some("v0.0.1"));

    // most recent build for the template
    fixture
        .store
        .create_task(Task {
            template_id: template.id,
            project_id: fixture.project_id,
            version: Some("v0.0.9".to_string()),
            ..Default::default()
        })
        .unwrap();

    let task = fixture
        .pool
        .add_task(
            Task {
                template_id: template.id,
                ..Default::default()
            },
            None,
            fixture.project_id,
        )
        .await
        .unwrap();

    assert_eq!(task.version.as_deref(), Some("v0.0.10"));
}

#[tokio::test]
async fn environment_override_merges_into_template_environment() {
    let fixture = fixture();
    let environment = fixture
        .store
        .create_environment(Environment {
            project_id: fixture.project_id,
            json: r#"{"author": "Denis", "comment": "Hello, World!"}"#.to_string(),
            ..Default::default()
        })
        .unwrap();
    let template = fixture
        .store
        .create_template(Template {
            project_id: fixture.project_id,
            playbook: "test.yml".to_string(),
            inventory_id: fixture.inventory_id,
            repository_id: fixture.repository_id,
            environment_id: Some(environment.id),
            ..Default::default()
        })
        .unwrap();

    let task = fixture
        .pool
        .add_task(
            Task {
                template_id: template.id,
                environment: r#"{"comment": "Just do it!", "time": "2021-11-02"}"#.to_string(),
                ..Default::default()
            },
            None,
            fixture.project_id,
        )
        .await
        .unwrap();

    let runner = fixture.wait_until_queued(task.id).await;
    assert_eq!(
        runner.environment.json,
        r#"{"author":"Denis","comment":"Just do it!","time":"2021-11-02"}"#
    );
}

#[tokio::test]
async fn unknown_template_is_rejected() {
    let fixture = fixture();

    let err = fixture
        .pool
        .add_task(
            Task {
                template_id: 999,
                ..Default::default()
            },
            None,
            fixture.project_id,
        )
        .await
        .unwrap_err();

    assert!(err.is_not_found());
}

#[tokio::test]
async fn build_template_without_start_version_is_rejected() {
    let fixture = fixture();
    let template = template(&fixture, TemplateType::Build, None);

    let err = fixture
        .pool
        .add_task(
            Task {
                template_id: template.id,
                ..Default::default()
            },
            None,
            fixture.project_id,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, StagehandError::Validation(_)));
}

#[tokio::test]
async fn stopping_an_inactive_task_marks_it_stopped() {
    let fixture = fixture();

    let task = fixture
        .store
        .create_task(Task {
            project_id: fixture.project_id,
            ..Default::default()
        })
        .unwrap();

    fixture.pool.stop_task(&task, false).await.unwrap();

    let stored = fixture
        .store
        .get_task(fixture.project_id, task.id)
        .unwrap();
    assert_eq!(stored.status, TaskStatus::Stopped);
    assert!(fixture
        .store
        .events()
        .iter()
        .any(|e| e.object_id == Some(task.id)));
}

#[tokio::test]
async fn stopping_a_queued_task_is_idempotent() {
    let fixture = fixture();
    let template = template(&fixture, TemplateType::Job, None);

    let task = fixture
        .pool
        .add_task(
            Task {
                template_id: template.id,
                ..Default::default()
            },
            None,
            fixture.project_id,
        )
        .await
        .unwrap();

    let runner = fixture.wait_until_queued(task.id).await;

    fixture.pool.stop_task(&task, false).await.unwrap();
    fixture.pool.stop_task(&task, false).await.unwrap();

    assert_eq!(runner.status(), TaskStatus::Stopped);
}
