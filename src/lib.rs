//! The `grid_dispatch` client runtime.
//!
//! This crate submits large numbers of small tasks to a remote compute grid and
//! correlates their results asynchronously. Submissions are grouped into chunks
//! by an adaptive batcher, every remote call runs under a jittered retry policy
//! over pooled connections, and a background loop settles each task exactly once
//! through its result handler.

pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod grid;
pub mod handler;
pub mod pool;
pub mod registry;
pub mod results;
pub mod retry;
pub mod session;
pub mod submit;
pub mod telemetry;

pub use client::GridClient;
pub use config::ClientConfig;
pub use error::{GridError, Result, ServiceInvocationError};
pub use handler::{handler_fn, ResultHandler};
pub use session::GridSession;
pub use submit::{PendingTask, TaskRequest};
