//! Infrastructure layer: request store, work queue, downstream client, and the
//! ingest/worker pipeline that ties them together.

pub mod config;
pub mod downstream;
pub mod grants;
pub mod ingest;
pub mod queue;
pub mod request_store;
pub mod worker;

mod integration_tests;
