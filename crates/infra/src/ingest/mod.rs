//! Ingest path: idempotent record creation, enqueue, and the bounded wait loop.

mod service;

pub use service::{IngestError, IngestOutcome, IngestRequest, IngestService};
