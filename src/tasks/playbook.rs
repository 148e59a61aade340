//! Subprocess supervision for playbook and git invocations.
//!
//! One `CommandRunner` drives one external process at a time: stdout and
//! stderr are piped and every line is pushed to the injected logger as it
//! arrives; the child's pid is kept so a stop request can be delivered.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::error::{Result, StagehandError};
use crate::tasks::job::JobLogger;

pub struct CommandRunner {
    logger: Arc<dyn JobLogger>,
    pid: Mutex<Option<u32>>,
}

impl CommandRunner {
    pub fn new(logger: Arc<dyn JobLogger>) -> Self {
        Self {
            logger,
            pid: Mutex::new(None),
        }
    }

    /// Spawn `program` in `cwd`, stream its output to the logger and wait for
    /// it to exit. Non-zero exit becomes a `Subprocess` error.
    pub async fn run(&self, program: &str, args: &[String], cwd: &Path) -> Result<()> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| StagehandError::Subprocess(format!("spawning {}: {}", program, e)))?;

        self.set_pid(child.id());

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pipe_lines(stdout, Arc::clone(&self.logger))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pipe_lines(stderr, Arc::clone(&self.logger))));
        }

        let status = child
            .wait()
            .await
            .map_err(|e| StagehandError::Subprocess(format!("waiting for {}: {}", program, e)))?;

        // join the readers so trailing lines land before the status does
        for reader in readers {
            let _ = reader.await;
        }

        self.set_pid(None);

        if status.success() {
            Ok(())
        } else {
            Err(StagehandError::Subprocess(format!(
                "{} exited with code {}",
                program,
                status.code().unwrap_or(-1)
            )))
        }
    }

    /// Deliver SIGTERM to the running child, if any.
    pub fn kill(&self) {
        if let Ok(guard) = self.pid.lock() {
            if let Some(pid) = *guard {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
    }

    fn set_pid(&self, pid: Option<u32>) {
        if let Ok(mut guard) = self.pid.lock() {
            *guard = pid;
        }
    }
}

async fn pipe_lines<R: AsyncRead + Unpin>(reader: R, logger: Arc<dyn JobLogger>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        logger.log(line).await;
    }
}
