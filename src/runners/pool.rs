//! Runner-side job pool.
//!
//! Pulls assigned jobs from the controller, supervises their local execution
//! and pushes accumulated log records and statuses back upstream. In one-off
//! mode the pool drains a single job and exits.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};

use crate::config::Config;
use crate::error::{Result, StagehandError};
use crate::store::TaskStatus;
use crate::tasks::{Job, JobContext, JobLogger, LocalJob};

use super::api::RunnerApiClient;
use super::types::{JobData, JobProgress, LogRecord, RunnerProgress, RunnerState};

const QUEUE_TICK: Duration = Duration::from_secs(5);
const REQUEST_TICK: Duration = Duration::from_secs(1);

/// Shared status and log buffer of one supervised job.
///
/// The subprocess reader appends; the progress uploader snapshots and resets.
/// Both sides go through the mutexes, so the copy-then-clear step is atomic
/// relative to appends.
struct JobSink {
    task_id: i64,
    status: Mutex<TaskStatus>,
    log_records: Mutex<Vec<LogRecord>>,
}

impl JobSink {
    fn new(task_id: i64) -> Self {
        Self {
            task_id,
            status: Mutex::new(TaskStatus::Waiting),
            log_records: Mutex::new(Vec::new()),
        }
    }

    fn status(&self) -> TaskStatus {
        self.status.lock().map(|s| *s).unwrap_or_default()
    }

    fn set_status(&self, status: TaskStatus) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status;
        }
    }

    fn push_record(&self, message: String, time: DateTime<Utc>) {
        if let Ok(mut guard) = self.log_records.lock() {
            guard.push(LogRecord { time, message });
        }
    }

    /// Snapshot the buffered records, leaving an empty buffer behind; lines
    /// appended during the upload land in the next cycle.
    fn drain(&self) -> (TaskStatus, Vec<LogRecord>) {
        let records = self
            .log_records
            .lock()
            .map(|mut guard| mem::take(&mut *guard))
            .unwrap_or_default();
        (self.status(), records)
    }
}

#[async_trait]
impl JobLogger for JobSink {
    async fn log_at(&self, message: String, time: DateTime<Utc>) {
        self.push_record(message, time);
    }

    async fn set_status(&self, status: TaskStatus) {
        JobSink::set_status(self, status);
    }
}

/// A pulled assignment waiting for the queue ticker.
struct QueuedJob {
    username: String,
    incoming_version: Option<String>,
    status: TaskStatus,
    context: JobContext,
}

struct RunningJob {
    sink: Arc<JobSink>,
    job: Arc<LocalJob>,
}

#[derive(Default)]
struct PoolInner {
    queue: VecDeque<QueuedJob>,
    /// Entries are kept after completion so the progress upload reports the
    /// terminal status; in one-off mode they also gate the exit check.
    running: HashMap<i64, RunningJob>,
}

/// Runner-side pull loop; create once, `run()` once.
pub struct JobPool {
    inner: Arc<Mutex<PoolInner>>,
    api: Arc<RunnerApiClient>,
    config: Arc<Config>,
    queue_tick: Duration,
    request_tick: Duration,
}

impl JobPool {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let api = Arc::new(RunnerApiClient::new(Arc::clone(&config))?);
        Ok(Self {
            inner: Arc::new(Mutex::new(PoolInner::default())),
            api,
            config,
            queue_tick: QUEUE_TICK,
            request_tick: REQUEST_TICK,
        })
    }

    /// Long-lived pull loop. Returns only on a fatal bootstrap problem or,
    /// in one-off mode, after the single job has finished.
    pub async fn run(&self) -> Result<()> {
        if !self.config.runner.config_file.exists()
            && self.config.runner.registration_token.is_empty()
        {
            return Err(StagehandError::Protocol(
                "registration token cannot be empty".to_string(),
            ));
        }

        let mut queue_ticker = tokio::time::interval(self.queue_tick);
        let mut request_ticker = tokio::time::interval(self.request_tick);

        loop {
            tokio::select! {
                _ = queue_ticker.tick() => self.dispatch_queued(),
                _ = request_ticker.tick() => {
                    {
                        let api = Arc::clone(&self.api);
                        let inner = Arc::clone(&self.inner);
                        tokio::spawn(async move {
                            Self::send_progress_cycle(api, inner).await;
                        });
                    }

                    if self.config.runner.one_off && self.finished_one_off() {
                        // final upload so the terminal status is not lost
                        Self::send_progress_cycle(Arc::clone(&self.api), Arc::clone(&self.inner))
                            .await;
                        info!("one-off runner finished, exiting");
                        return Ok(());
                    }

                    {
                        let api = Arc::clone(&self.api);
                        let inner = Arc::clone(&self.inner);
                        let config = Arc::clone(&self.config);
                        tokio::spawn(async move {
                            Self::poll_jobs_cycle(api, inner, config).await;
                        });
                    }
                }
            }
        }
    }

    /// One queue pass: take the head and start executing it.
    fn dispatch_queued(&self) {
        let Ok(mut inner) = self.inner.lock() else { return };
        let Some(head) = inner.queue.front() else { return };

        if head.status.is_finished() {
            // pre-aborted before it ever ran; keep a failed entry around so
            // the next progress upload reports it
            let Some(item) = inner.queue.pop_front() else { return };
            let task_id = item.context.task.id;
            let sink = Arc::new(JobSink::new(task_id));
            sink.set_status(TaskStatus::Fail);
            sink.push_record("job aborted before it started".to_string(), Utc::now());
            let job = Arc::new(LocalJob::new(
                item.context,
                Arc::clone(&sink) as Arc<dyn JobLogger>,
                Arc::clone(&self.config),
            ));
            inner.running.insert(task_id, RunningJob { sink, job });
            info!("Task {} removed from queue", task_id);
            return;
        }

        let Some(item) = inner.queue.pop_front() else { return };
        let QueuedJob {
            username,
            incoming_version,
            context,
            status: _,
        } = item;
        let task_id = context.task.id;

        let sink = Arc::new(JobSink::new(task_id));
        let job = Arc::new(LocalJob::new(
            context,
            Arc::clone(&sink) as Arc<dyn JobLogger>,
            Arc::clone(&self.config),
        ));
        inner.running.insert(
            task_id,
            RunningJob {
                sink: Arc::clone(&sink),
                job: Arc::clone(&job),
            },
        );
        drop(inner);

        tokio::spawn(async move {
            sink.set_status(TaskStatus::Running);

            let result = job.run(username, incoming_version).await;

            let status = sink.status();
            if status.is_finished() {
                return;
            }
            let final_status = if status == TaskStatus::Stopping {
                TaskStatus::Stopped
            } else if result.is_ok() {
                TaskStatus::Success
            } else {
                TaskStatus::Fail
            };
            if let Err(err) = result {
                sink.push_record(format!("Run failed: {}", err), Utc::now());
            }
            sink.set_status(final_status);
        });

        info!("Task {} removed from queue", task_id);
    }

    /// One-off exit condition: jobs existed, none still active.
    fn finished_one_off(&self) -> bool {
        let Ok(inner) = self.inner.lock() else { return false };
        !inner.running.is_empty()
            && inner
                .running
                .values()
                .all(|job| job.sink.status().is_finished())
    }

    async fn send_progress_cycle(api: Arc<RunnerApiClient>, inner: Arc<Mutex<PoolInner>>) {
        match api.ensure_registered().await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!("runner registration: {}", e);
                return;
            }
        }

        let progress = {
            let Ok(inner) = inner.lock() else { return };
            RunnerProgress {
                jobs: inner
                    .running
                    .values()
                    .map(|job| {
                        let (status, log_records) = job.sink.drain();
                        JobProgress {
                            id: job.sink.task_id,
                            status,
                            log_records,
                        }
                    })
                    .collect(),
            }
        };

        if let Err(e) = api.send_progress(&progress).await {
            warn!("progress upload failed: {}", e);
        }
    }

    async fn poll_jobs_cycle(
        api: Arc<RunnerApiClient>,
        inner: Arc<Mutex<PoolInner>>,
        config: Arc<Config>,
    ) {
        match api.ensure_registered().await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!("runner registration: {}", e);
                return;
            }
        }

        let state = match api.fetch_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("job poll failed: {}", e);
                return;
            }
        };

        Self::apply_state(&inner, &config, state).await;
    }

    /// Apply one poll response: overwrite current-job statuses (delivering
    /// kills), then enqueue new assignments with their access keys inlined.
    async fn apply_state(inner: &Mutex<PoolInner>, config: &Config, state: RunnerState) {
        let mut to_kill: Vec<Arc<LocalJob>> = Vec::new();
        {
            let Ok(guard) = inner.lock() else { return };
            for current in &state.current_jobs {
                let Some(job) = guard.running.get(&current.id) else {
                    continue;
                };
                // terminals have no outgoing edges; a stale controller
                // snapshot must not resurrect a finished job
                if job.sink.status().is_finished() {
                    continue;
                }
                job.sink.set_status(current.status);
                if matches!(current.status, TaskStatus::Stopping | TaskStatus::Stopped) {
                    to_kill.push(Arc::clone(&job.job));
                }
            }
        }
        for job in to_kill {
            job.kill().await;
        }

        let Ok(mut guard) = inner.lock() else { return };

        if config.runner.one_off && (!guard.queue.is_empty() || !guard.running.is_empty()) {
            return;
        }

        for new_job in state.new_jobs {
            let task_id = new_job.task.id;
            if guard.running.contains_key(&task_id) {
                continue;
            }
            if guard.queue.iter().any(|queued| queued.context.task.id == task_id) {
                continue;
            }

            guard.queue.push_back(Self::denormalize(new_job, &state.access_keys));
            info!("Task {} added to queue", task_id);
        }
    }

    /// Inline the referenced access keys from the response map into the job's
    /// execution context.
    fn denormalize(
        data: JobData,
        keys: &HashMap<i64, crate::store::AccessKey>,
    ) -> QueuedJob {
        let lookup = |id: Option<i64>| id.and_then(|id| keys.get(&id).cloned());

        QueuedJob {
            username: data.username,
            incoming_version: data.incoming_version,
            status: TaskStatus::Waiting,
            context: JobContext {
                ssh_key: lookup(data.inventory.ssh_key_id),
                become_key: lookup(data.inventory.become_key_id),
                vault_key: lookup(data.template.vault_key_id),
                repository_key: keys.get(&data.repository.ssh_key_id).cloned(),
                task: data.task,
                template: data.template,
                inventory: data.inventory,
                repository: data.repository,
                environment: data.environment,
            },
        }
    }
}
