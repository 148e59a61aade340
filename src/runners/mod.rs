//! Runner-side agent.
//!
//! A runner is a separate worker process that registers with the controller,
//! pulls assigned jobs, executes them locally and streams log records and
//! status transitions back upstream.

pub mod api;
pub mod pool;
pub mod types;

pub use api::RunnerApiClient;
pub use pool::JobPool;
pub use types::*;
