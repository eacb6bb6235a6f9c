//! Worker side: message handling and the background runtime.

pub mod handler;
pub mod runtime;

pub use handler::{BatchReport, Disposition, MessageReport, Outcome, WorkerHandler};
pub use runtime::{WorkerRuntime, WorkerRuntimeHandle, WorkerStats};
