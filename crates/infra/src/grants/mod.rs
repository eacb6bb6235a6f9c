//! The grant domain: operations, permanent receipts, and their execution.

pub mod error;
pub mod executor;
pub mod operation;
pub mod store;

pub use error::{ExecutionError, PrecheckError, user_facing};
pub use executor::{GrantExecutor, precheck};
pub use operation::GrantOperation;
pub use store::{GrantReceipt, GrantStore, GrantStoreError, InMemoryGrantStore};
