//! Deferred execution shell for tasks assigned to remote runners.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::debug;
use tokio::sync::watch;

use crate::error::{Result, StagehandError};
use crate::store::TaskStatus;
use crate::tasks::job::Job;

/// Controller-side stand-in for a job that a runner executes elsewhere.
///
/// `run` performs no local work; the task's status is driven by the runner
/// progress protocol, and this job simply waits until it goes terminal.
pub struct RemoteJob {
    status_rx: watch::Receiver<TaskStatus>,
    stop_requested: AtomicBool,
}

impl RemoteJob {
    pub fn new(status_rx: watch::Receiver<TaskStatus>) -> Self {
        Self {
            status_rx,
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Set when a stop was requested; the poll endpoint delivers it to the
    /// runner in the next `current_jobs` response.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Job for RemoteJob {
    async fn run(&self, _username: String, _incoming_version: Option<String>) -> Result<()> {
        let mut status_rx = self.status_rx.clone();

        loop {
            let status = *status_rx.borrow_and_update();
            if status.is_finished() {
                return match status {
                    TaskStatus::Success => Ok(()),
                    other => Err(StagehandError::Subprocess(format!(
                        "remote job finished with status {}",
                        other
                    ))),
                };
            }

            if status_rx.changed().await.is_err() {
                return Err(StagehandError::Protocol(
                    "status feed closed before the remote job finished".to_string(),
                ));
            }
        }
    }

    async fn kill(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        debug!("stop flagged for delivery on the next progress cycle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_waits_for_terminal_status() {
        let (tx, rx) = watch::channel(TaskStatus::Waiting);
        let job = RemoteJob::new(rx);

        let handle = tokio::spawn(async move { job.run(String::new(), None).await });

        tx.send(TaskStatus::Running).unwrap();
        tx.send(TaskStatus::Success).unwrap();

        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_run_maps_fail_to_error() {
        let (tx, rx) = watch::channel(TaskStatus::Running);
        let job = RemoteJob::new(rx);

        let handle = tokio::spawn(async move { job.run(String::new(), None).await });
        tx.send(TaskStatus::Fail).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, StagehandError::Subprocess(_)));
    }

    #[tokio::test]
    async fn test_run_returns_immediately_when_already_finished() {
        let (_tx, rx) = watch::channel(TaskStatus::Success);
        let job = RemoteJob::new(rx);

        assert!(job.run(String::new(), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_kill_flags_pending_stop() {
        let (_tx, rx) = watch::channel(TaskStatus::Running);
        let job = RemoteJob::new(rx);

        assert!(!job.stop_requested());
        job.kill().await;
        assert!(job.stop_requested());
    }
}
