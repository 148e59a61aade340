//! Controller-side scheduling and execution.
//!
//! `TaskPool` admits submitted tasks under concurrency policy and funnels
//! their output to the store; `TaskRunner` owns one live task's status
//! transitions; the `Job` trait is the seam between the pool and the
//! executable shape of a task (local subprocess or remote runner).

pub mod job;
pub mod local_job;
pub mod playbook;
pub mod pool;
pub mod remote_job;
pub mod task_runner;
pub mod version;

pub use job::{Job, JobContext, JobLogger};
pub use local_job::LocalJob;
pub use pool::TaskPool;
pub use remote_job::RemoteJob;
pub use task_runner::TaskRunner;
pub use version::next_build_version;
