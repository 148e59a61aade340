//! Controller-side task pool.
//!
//! Accepts submissions, enforces admission policy (global cap, per-project
//! cap, one active task per template), dispatches eligible tasks and funnels
//! log records back to the store. All admission-map mutation goes through a
//! single resource-locker task; the control loop itself only reads.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{Result, StagehandError};
use crate::store::{
    store_session, Event, Store, Task, TaskOutput, TaskStatus, TemplateType, RetrieveQueryParams,
    EVENT_TYPE_TASK,
};
use crate::tasks::job::Job;
use crate::tasks::local_job::LocalJob;
use crate::tasks::remote_job::RemoteJob;
use crate::tasks::task_runner::{TaskDetails, TaskRunner};
use crate::tasks::version::next_build_version;

/// Capacity of the log channel; producers block once it is full, throttling
/// noisy playbooks instead of growing without bound.
pub(crate) const LOG_CHANNEL_CAPACITY: usize = 10_000;

const REGISTER_CHANNEL_CAPACITY: usize = 16;
const QUEUE_TICK: Duration = Duration::from_secs(5);

/// One pending log line on its way to the store.
pub(crate) struct LogRecord {
    pub task_id: i64,
    pub output: String,
    pub time: DateTime<Utc>,
}

/// Messages consumed by the resource-locker task.
pub(crate) enum LockMessage {
    Lock(Arc<TaskRunner>),
    Unlock { project_id: i64, task_id: i64 },
}

/// Shared handles a TaskRunner needs to reach back into the pool.
#[derive(Clone)]
pub(crate) struct PoolContext {
    pub store: Arc<dyn Store>,
    pub config: Arc<Config>,
    pub logger_tx: mpsc::Sender<LogRecord>,
    pub locker_tx: mpsc::UnboundedSender<LockMessage>,
}

#[derive(Default)]
struct PoolState {
    /// Tasks waiting for admission, FIFO
    queue: VecDeque<Arc<TaskRunner>>,
    /// Active tasks per project, keyed project id -> task id
    active_proj: HashMap<i64, HashMap<i64, Arc<TaskRunner>>>,
    /// All tasks currently holding a resource lock
    running_tasks: HashMap<i64, Arc<TaskRunner>>,
}

impl PoolState {
    fn lock_task(&mut self, runner: Arc<TaskRunner>) {
        let task_id = runner.id();
        let project_id = runner.project_id();

        if self.running_tasks.contains_key(&task_id) {
            panic!("trying to lock an already locked resource");
        }

        self.active_proj
            .entry(project_id)
            .or_default()
            .insert(task_id, Arc::clone(&runner));
        self.running_tasks.insert(task_id, runner);
    }

    fn unlock_task(&mut self, project_id: i64, task_id: i64) {
        if let Some(project_tasks) = self.active_proj.get_mut(&project_id) {
            project_tasks.remove(&task_id);
            if project_tasks.is_empty() {
                self.active_proj.remove(&project_id);
            }
        }
        self.running_tasks.remove(&task_id);
    }
}

struct PoolReceivers {
    logger_rx: mpsc::Receiver<LogRecord>,
    register_rx: mpsc::Receiver<Arc<TaskRunner>>,
    locker_rx: mpsc::UnboundedReceiver<LockMessage>,
}

/// Controller-side scheduler; create once, `run()` once.
pub struct TaskPool {
    state: Arc<RwLock<PoolState>>,
    ctx: PoolContext,
    register_tx: mpsc::Sender<Arc<TaskRunner>>,
    receivers: StdMutex<Option<PoolReceivers>>,
    queue_tick: Duration,
}

impl TaskPool {
    pub fn new(store: Arc<dyn Store>, config: Arc<Config>) -> Self {
        let (logger_tx, logger_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let (register_tx, register_rx) = mpsc::channel(REGISTER_CHANNEL_CAPACITY);
        let (locker_tx, locker_rx) = mpsc::unbounded_channel();

        Self {
            state: Arc::new(RwLock::new(PoolState::default())),
            ctx: PoolContext {
                store,
                config,
                logger_tx,
                locker_tx,
            },
            register_tx,
            receivers: StdMutex::new(Some(PoolReceivers {
                logger_rx,
                register_rx,
                locker_rx,
            })),
            queue_tick: QUEUE_TICK,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_queue_tick(mut self, tick: Duration) -> Self {
        self.queue_tick = tick;
        self
    }

    /// Long-lived control loop; call exactly once per process.
    ///
    /// Multiplexes pending log records, newly registered tasks and the
    /// admission ticker. The resource-locker runs as its own task so every
    /// admission-map mutation is serialized through one consumer.
    pub async fn run(&self) {
        let receivers = match self.receivers.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(PoolReceivers {
            mut logger_rx,
            mut register_rx,
            mut locker_rx,
        }) = receivers
        else {
            error!("TaskPool::run called more than once");
            return;
        };

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(message) = locker_rx.recv().await {
                let Ok(mut state) = state.write() else { return };
                match message {
                    LockMessage::Lock(runner) => state.lock_task(runner),
                    LockMessage::Unlock { project_id, task_id } => {
                        state.unlock_task(project_id, task_id)
                    }
                }
            }
        });

        let mut ticker = tokio::time::interval(self.queue_tick);

        loop {
            tokio::select! {
                Some(record) = logger_rx.recv() => self.persist_log_record(record),
                Some(runner) = register_rx.recv() => self.register_task(runner).await,
                _ = ticker.tick() => self.admit_from_queue(),
            }
        }
    }

    /// Validate a submission, persist it, resolve its dependencies and hand
    /// it to the control loop.
    pub async fn add_task(
        &self,
        mut task: Task,
        user_id: Option<i64>,
        project_id: i64,
    ) -> Result<Task> {
        task.created = Utc::now();
        task.status = TaskStatus::Waiting;
        task.user_id = user_id;
        task.project_id = project_id;

        let store = &self.ctx.store;

        let template = store_session(store.as_ref(), "add task", || {
            store.get_template(project_id, task.template_id)
        })?;
        task.validate_new(&template)?;

        if template.kind == TemplateType::Build {
            let builds = store_session(store.as_ref(), "add task", || {
                store.get_template_tasks(
                    project_id,
                    template.id,
                    RetrieveQueryParams { offset: 0, count: 1 },
                )
            })?;
            let start = template.start_version.clone().unwrap_or_default();
            task.version = match builds.first().and_then(|b| b.version.clone()) {
                Some(current) => Some(next_build_version(&start, &current)),
                None => Some(start),
            };
        }

        let new_task = store_session(store.as_ref(), "add task", || store.create_task(task))?;

        let details = store_session(store.as_ref(), "add task", || {
            TaskDetails::resolve(store.as_ref(), &new_task)
        });
        let details = match details {
            Ok(details) => details,
            Err(err) => {
                // the runner never enters the queue; record the failure
                let record = LogRecord {
                    task_id: new_task.id,
                    output: format!("Error: {}", err),
                    time: Utc::now(),
                };
                let _ = self.ctx.logger_tx.send(record).await;

                let mut failed = new_task;
                failed.status = TaskStatus::Fail;
                store_session(store.as_ref(), "add task", || {
                    if let Err(e) = store.update_task(&failed) {
                        error!("failed to persist failed task {}: {}", failed.id, e);
                    }
                });
                return Err(err);
            }
        };

        let runner = Arc::new(TaskRunner::new(new_task.clone(), details, self.ctx.clone()));

        let job: Arc<dyn Job> = if self.ctx.config.use_remote_runner {
            Arc::new(RemoteJob::new(runner.status_watch()))
        } else {
            Arc::new(LocalJob::new(
                runner.job_context(),
                Arc::clone(&runner) as _,
                Arc::clone(&self.ctx.config),
            ))
        };
        runner.attach_job(job);

        if self.register_tx.send(Arc::clone(&runner)).await.is_err() {
            return Err(StagehandError::Store("register channel closed".to_string()));
        }

        let description = format!("Task ID {} queued for running", new_task.id);
        store_session(store.as_ref(), "add task", || {
            if let Err(e) = store.create_event(Event {
                user_id,
                project_id: Some(project_id),
                object_type: Some(EVENT_TYPE_TASK.to_string()),
                object_id: Some(new_task.id),
                description: Some(description),
                created: Utc::now(),
            }) {
                error!("failed to record queue event for task {}: {}", new_task.id, e);
            }
        });

        Ok(new_task)
    }

    /// Stop a task. Idempotent: finished tasks absorb the request.
    ///
    /// A task that is not holding resources (unknown to the pool, or still
    /// queued) goes straight to `Stopped`; a running task transitions through
    /// `Stopping` and, when forced, on to `Stopped`.
    pub async fn stop_task(&self, task: &Task, force_stop: bool) -> Result<()> {
        let Some(runner) = self.get_task(task.id) else {
            // not active, but exists in the store
            let mut stopped = task.clone();
            stopped.status = TaskStatus::Stopped;
            let store = &self.ctx.store;
            store_session(store.as_ref(), "stop task", || store.update_task(&stopped))?;
            store_session(store.as_ref(), "stop task", || {
                if let Err(e) = store.create_event(Event {
                    user_id: task.user_id,
                    project_id: Some(task.project_id),
                    object_type: Some(EVENT_TYPE_TASK.to_string()),
                    object_id: Some(task.id),
                    description: Some(format!("Task ID {} stopped", task.id)),
                    created: Utc::now(),
                }) {
                    error!("failed to record stop event for task {}: {}", task.id, e);
                }
            });
            return Ok(());
        };

        let running = match self.state.read() {
            Ok(state) => state.running_tasks.contains_key(&task.id),
            Err(_) => false,
        };
        let previous = runner.status();

        if !running {
            // queued; the admission pass will drop the finished head
            runner.set_status(TaskStatus::Stopped).await;
            return Ok(());
        }

        runner.set_status(TaskStatus::Stopping).await;
        if force_stop {
            runner.set_status(TaskStatus::Stopped).await;
        }
        if previous == TaskStatus::Running {
            runner.kill().await;
        }

        Ok(())
    }

    /// Linear lookup in the queue, then in the running map.
    pub fn get_task(&self, task_id: i64) -> Option<Arc<TaskRunner>> {
        let state = self.state.read().ok()?;
        state
            .queue
            .iter()
            .find(|runner| runner.id() == task_id)
            .cloned()
            .or_else(|| state.running_tasks.get(&task_id).cloned())
    }

    pub fn get_running_tasks(&self) -> Vec<Arc<TaskRunner>> {
        match self.state.read() {
            Ok(state) => state.running_tasks.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn persist_log_record(&self, record: LogRecord) {
        let store = &self.ctx.store;
        store_session(store.as_ref(), "logger", || {
            // log loss is preferred over blocking the control loop
            if let Err(e) = store.create_task_output(TaskOutput {
                task_id: record.task_id,
                time: record.time,
                output: record.output,
            }) {
                error!("failed to write output of task {}: {}", record.task_id, e);
            }
        });
    }

    async fn register_task(&self, runner: Arc<TaskRunner>) {
        match self.state.write() {
            Ok(mut state) => state.queue.push_back(Arc::clone(&runner)),
            Err(_) => return,
        }

        let message = format!("Task {} added to queue", runner.id());
        runner.log(message.clone()).await;
        info!("{}", message);

        runner.save();
    }

    /// One admission pass; examines the queue head only.
    fn admit_from_queue(&self) {
        let head = match self.state.read() {
            Ok(state) => state.queue.front().cloned(),
            Err(_) => return,
        };
        let Some(runner) = head else { return };

        if runner.status().is_finished() {
            // pre-aborted or stopped while queued
            if let Ok(mut state) = self.state.write() {
                state.queue.pop_front();
            }
            info!("Task {} removed from queue", runner.id());
            return;
        }

        if self.blocks(&runner) {
            // blocked head loses its place; re-examined next tick
            if let Ok(mut state) = self.state.write() {
                if let Some(rotated) = state.queue.pop_front() {
                    state.queue.push_back(rotated);
                }
            }
            return;
        }

        info!("Locking resources for task {}", runner.id());
        let _ = self.ctx.locker_tx.send(LockMessage::Lock(Arc::clone(&runner)));

        tokio::spawn(Arc::clone(&runner).run());

        if let Ok(mut state) = self.state.write() {
            state.queue.pop_front();
        }
        info!("Task {} removed from queue", runner.id());
    }

    /// True when the task cannot be admitted right now.
    fn blocks(&self, runner: &TaskRunner) -> bool {
        let (project_active, template_conflict) = {
            let Ok(state) = self.state.read() else { return true };

            if state.running_tasks.len() >= self.ctx.config.max_parallel_tasks() {
                return true;
            }

            let Some(project_tasks) = state.active_proj.get(&runner.project_id()) else {
                return false;
            };
            if project_tasks.is_empty() {
                return false;
            }

            let conflict = project_tasks
                .values()
                .any(|active| active.template.id == runner.template.id);
            (project_tasks.len(), conflict)
        };

        if template_conflict {
            return true;
        }

        let store = &self.ctx.store;
        let project = store_session(store.as_ref(), "project limit", || {
            store.get_project(runner.project_id())
        });
        match project {
            Ok(project) => {
                project.max_parallel_tasks > 0 && project_active >= project.max_parallel_tasks
            }
            Err(e) => {
                error!("failed to load project {}: {}", runner.project_id(), e);
                false
            }
        }
    }
}

#[cfg(test)]
impl TaskPool {
    /// Harness sharing this pool's channels and store, for tests that drive
    /// the pool directly.
    pub(crate) fn test_harness(
        &self,
        store: Arc<crate::store::MemoryStore>,
    ) -> crate::tasks::task_runner::test_support::TestHarness {
        crate::tasks::task_runner::test_support::TestHarness::for_pool(
            store,
            self.ctx.clone(),
            self.register_tx.clone(),
        )
    }
}
