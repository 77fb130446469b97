//! Simple in-memory implementation of [`eventflow_shared::kv::DurableStore`].
//!
//! Every successful write bumps a store-wide revision which becomes the version of the written
//! key, so versions of a key strictly increase and are never reused. Failures and latency can
//! be injected per operation to test retry and fail-safe paths.
//!
//! # Example
//! ```ignore
//! use eventflow_testing::simplekvstore::SimpleKVStore;
//! use eventflow_shared::kv::{CasOutcome, DurableStore};
//! use bytes::Bytes;
//!
//! let store = SimpleKVStore::new("leases");
//! let outcome = store.compare_and_swap("a", None, Bytes::from("v1")).await?;
//! assert!(matches!(outcome, CasOutcome::Swapped(_)));
//!
//! // the next get fails
//! store.error_injector().fail_gets(1);
//! assert!(store.get("a").await.is_err());
//! ```

/// Error types for the simple KV store.
mod error;
/// Error injection controller.
mod error_injector;
/// Core store implementation.
mod store;

pub use error::{Result, SimpleKVStoreError};
pub use error_injector::KVErrorInjector;
pub use store::SimpleKVStore;
