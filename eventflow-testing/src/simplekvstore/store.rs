use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::trace;

use eventflow_shared::error::Result;
use eventflow_shared::kv::{CasOutcome, DurableStore, KVEntry, Version, VersionedValue};

use super::error::SimpleKVStoreError;
use super::error_injector::KVErrorInjector;

#[derive(Debug, Default)]
struct KVState {
    data: BTreeMap<String, VersionedValue>,
    /// Incremented on every write, the new value is the version of the written key.
    revision: u64,
}

/// In-memory versioned KV store. Clones share the same data.
#[derive(Clone)]
pub struct SimpleKVStore {
    state: Arc<RwLock<KVState>>,
    name: String,
    error_injector: Arc<KVErrorInjector>,
}

impl std::fmt::Debug for SimpleKVStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleKVStore")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}

impl SimpleKVStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(RwLock::new(KVState::default())),
            name: name.into(),
            error_injector: Arc::new(KVErrorInjector::new()),
        }
    }

    pub fn error_injector(&self) -> &Arc<KVErrorInjector> {
        &self.error_injector
    }

    /// Latest revision handed out by the store.
    pub fn revision(&self) -> u64 {
        self.state.read().revision
    }

    pub fn len(&self) -> usize {
        self.state.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().data.is_empty()
    }

    /// Writes `value` regardless of the current version, like an operator editing the store by
    /// hand. Returns the new version.
    pub fn force_put(&self, key: &str, value: Bytes) -> Version {
        let mut state = self.state.write();
        state.revision += 1;
        let version = state.revision;
        state
            .data
            .insert(key.to_string(), VersionedValue { value, version });
        version
    }

    /// Copy of all data, for assertions.
    pub fn snapshot(&self) -> BTreeMap<String, VersionedValue> {
        self.state.read().data.clone()
    }
}

#[async_trait]
impl DurableStore for SimpleKVStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        self.error_injector.apply_get_latency().await;

        if self.error_injector.should_fail_get() {
            return Err(SimpleKVStoreError::Get("injected failure".to_string()).into());
        }

        Ok(self.state.read().data.get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Version>,
        value: Bytes,
    ) -> Result<CasOutcome> {
        self.error_injector.apply_cas_latency().await;

        if self.error_injector.should_fail_cas() {
            return Err(SimpleKVStoreError::Cas("injected failure".to_string()).into());
        }

        let outcome = {
            let mut state = self.state.write();
            let current = state.data.get(key).map(|v| v.version);
            if current != expected {
                trace!(key, ?expected, ?current, "Version conflict");
                CasOutcome::VersionConflict { current }
            } else {
                state.revision += 1;
                let version = state.revision;
                state
                    .data
                    .insert(key.to_string(), VersionedValue { value, version });
                CasOutcome::Swapped(version)
            }
        };

        if matches!(outcome, CasOutcome::Swapped(_))
            && self.error_injector.should_lose_cas_response()
        {
            return Err(SimpleKVStoreError::Cas("injected lost response".to_string()).into());
        }

        Ok(outcome)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KVEntry>> {
        self.error_injector.apply_list_latency().await;

        if self.error_injector.should_fail_list() {
            return Err(SimpleKVStoreError::List("injected failure".to_string()).into());
        }

        Ok(self
            .state
            .read()
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, v)| KVEntry {
                key: key.clone(),
                value: v.value.clone(),
                version: v.version,
            })
            .collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
