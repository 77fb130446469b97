//! Versioned key-value store abstraction.
//!
//! Every write to a key bumps its version, and writes are conditional on the version the writer
//! last read. There is no unconditional put: a writer that lost a race learns about it through
//! [`CasOutcome::VersionConflict`] instead of silently overwriting the winner.
//!
//! The trait uses `async_trait` so it can be shared as `Arc<dyn DurableStore>`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Version token of a stored value. Strictly increases with every write to the same key.
pub type Version = u64;

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Bytes,
    pub version: Version,
}

/// A key returned by [`DurableStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVEntry {
    pub key: String,
    pub value: Bytes,
    pub version: Version,
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write happened, the key is now at this version.
    Swapped(Version),
    /// The key was not at the expected version. `current` is `None` if the key does not exist.
    VersionConflict { current: Option<Version> },
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Reads the value and its version.
    ///
    /// # Returns
    /// * `Ok(Some(value))` - If the key exists
    /// * `Ok(None)` - If the key does not exist
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Writes `value` only if the key is currently at `expected`. An `expected` of `None` means
    /// the key must not exist yet.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Version>,
        value: Bytes,
    ) -> Result<CasOutcome>;

    /// Lists every key starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<KVEntry>>;

    /// Name of the store, typically the bucket or container.
    fn name(&self) -> &str;
}
