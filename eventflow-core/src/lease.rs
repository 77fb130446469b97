//! Partition ownership.
//!
//! A lease is a record in the durable store naming the owning instance and the time the
//! ownership ends unless renewed. Every change goes through compare-and-swap on the version the
//! writer last read, so of two instances racing for a partition exactly one wins, and a renewal
//! fails if anybody else touched the lease in the meantime.
//!
//! Leases are never deleted. Releasing writes an ownerless, already expired record so the
//! version keeps increasing and an old version can never become valid again.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use eventflow_shared::kv::{CasOutcome, DurableStore, Version, VersionedValue};
use eventflow_shared::stream::StreamPartition;

use crate::config::{ProcessorConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::keys::Keyspace;
use crate::retry::with_retry;

/// How many times presence registration re-reads after losing a race with itself.
const PRESENCE_CONFLICT_RETRIES: usize = 3;

/// Ownership record of one partition as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLease {
    pub partition: StreamPartition,
    /// Empty when the lease was released.
    pub owner_id: String,
    pub expires_at: DateTime<Utc>,
    /// Store version this lease was read or written at.
    pub version: Version,
}

impl PartitionLease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.owner_id.is_empty() || self.expires_at <= now
    }

    pub fn is_owned_by(&self, instance_id: &str) -> bool {
        self.owner_id == instance_id
    }

    /// Owned by someone and not expired at `now`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired_at(now)
    }
}

/// Outcome of [`LeaseStore::try_acquire`] and [`LeaseStore::renew`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Granted(PartitionLease),
    Denied(Denial),
}

/// Why a lease was not granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// Another instance holds an unexpired lease.
    Owned {
        owner_id: String,
        expires_at: DateTime<Utc>,
    },
    /// Another instance changed the lease between our read and our write.
    Conflict,
    /// The lease being renewed is not ours anymore.
    Lost,
    /// The store could not be reached within the retry budget.
    StoreUnavailable(String),
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Denial::Owned {
                owner_id,
                expires_at,
            } => write!(f, "owned by {owner_id} until {}", expires_at.to_rfc3339()),
            Denial::Conflict => write!(f, "concurrent modification"),
            Denial::Lost => write!(f, "lease taken over by another instance"),
            Denial::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

/// Heartbeat of a processor instance, so the balancer counts instances that own nothing yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePresence {
    pub instance_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    partition: StreamPartition,
    owner_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PresenceRecord {
    instance_id: String,
    expires_at: DateTime<Utc>,
}

/// Durable partition ownership for one consumer group and stream.
#[derive(Clone)]
pub struct LeaseStore {
    store: Arc<dyn DurableStore>,
    keys: Keyspace,
    stream_id: String,
    lease_duration: Duration,
    retry: RetryConfig,
}

impl LeaseStore {
    pub fn new(
        store: Arc<dyn DurableStore>,
        consumer_group: &str,
        stream_id: &str,
        lease_duration: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            keys: Keyspace::new(consumer_group, stream_id),
            stream_id: stream_id.to_string(),
            lease_duration,
            retry,
        }
    }

    pub(crate) fn from_config(store: Arc<dyn DurableStore>, config: &ProcessorConfig) -> Self {
        Self::new(
            store,
            &config.consumer_group,
            &config.stream_id,
            config.lease_duration,
            config.store_retry.clone(),
        )
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease_duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Claims `partition` for `instance_id`. Succeeds if nobody holds an unexpired lease, or if
    /// the caller holds it already (which also extends it).
    pub async fn try_acquire(&self, partition: &StreamPartition, instance_id: &str) -> Acquire {
        let key = self.keys.ownership(partition);

        let current = match with_retry(&self.retry, "lease get", || self.store.get(&key)).await {
            Ok(current) => current,
            Err(e) => return Acquire::Denied(Denial::StoreUnavailable(e.to_string())),
        };

        let now = Utc::now();
        let expected = match current {
            None => None,
            Some(stored) => {
                if let Some(existing) = self.decode_lease(&key, &stored)
                    && existing.is_live_at(now)
                    && !existing.is_owned_by(instance_id)
                {
                    return Acquire::Denied(Denial::Owned {
                        owner_id: existing.owner_id,
                        expires_at: existing.expires_at,
                    });
                }
                Some(stored.version)
            }
        };

        let record = LeaseRecord {
            partition: partition.clone(),
            owner_id: instance_id.to_string(),
            expires_at: self.expiry_from(now),
        };
        match self.swap(&key, expected, &record).await {
            Ok(CasOutcome::Swapped(version)) => {
                info!(%partition, owner = instance_id, version, "Acquired lease");
                Acquire::Granted(PartitionLease {
                    partition: partition.clone(),
                    owner_id: record.owner_id,
                    expires_at: record.expires_at,
                    version,
                })
            }
            Ok(CasOutcome::VersionConflict { current }) => {
                debug!(%partition, owner = instance_id, ?current, "Lost the race for lease");
                Acquire::Denied(Denial::Conflict)
            }
            Err(e) => Acquire::Denied(Denial::StoreUnavailable(e.to_string())),
        }
    }

    /// Extends a lease held by the caller. [`Denial::Lost`] means the lease was changed by
    /// someone else since `lease` was written and the caller must stop working on the partition.
    pub async fn renew(&self, lease: &PartitionLease) -> Acquire {
        if lease.owner_id.is_empty() {
            return Acquire::Denied(Denial::Lost);
        }
        let key = self.keys.ownership(&lease.partition);
        let record = LeaseRecord {
            partition: lease.partition.clone(),
            owner_id: lease.owner_id.clone(),
            expires_at: self.expiry_from(Utc::now()),
        };

        match self.swap(&key, Some(lease.version), &record).await {
            Ok(CasOutcome::Swapped(version)) => {
                debug!(partition = %lease.partition, version, "Renewed lease");
                Acquire::Granted(PartitionLease {
                    partition: lease.partition.clone(),
                    owner_id: record.owner_id,
                    expires_at: record.expires_at,
                    version,
                })
            }
            Ok(CasOutcome::VersionConflict { current }) => {
                warn!(
                    partition = %lease.partition,
                    expected = lease.version,
                    ?current,
                    "Lease was modified by another instance"
                );
                Acquire::Denied(Denial::Lost)
            }
            Err(e) => Acquire::Denied(Denial::StoreUnavailable(e.to_string())),
        }
    }

    /// Gives up a lease. A lease that changed in the meantime is not ours to release anymore,
    /// which is acknowledged the same way.
    pub async fn release(&self, lease: &PartitionLease) -> Result<()> {
        let key = self.keys.ownership(&lease.partition);
        let record = LeaseRecord {
            partition: lease.partition.clone(),
            owner_id: String::new(),
            expires_at: Utc::now(),
        };

        match self.swap(&key, Some(lease.version), &record).await? {
            CasOutcome::Swapped(version) => {
                info!(partition = %lease.partition, owner = %lease.owner_id, version, "Released lease");
            }
            CasOutcome::VersionConflict { current } => {
                debug!(partition = %lease.partition, ?current, "Lease already changed, nothing to release");
            }
        }
        Ok(())
    }

    /// Every lease record of the stream, including expired and released ones.
    pub async fn list_all(&self) -> Result<Vec<PartitionLease>> {
        let prefix = self.keys.ownership_prefix();
        let entries = with_retry(&self.retry, "lease list", || self.store.list(&prefix)).await?;

        let mut leases: Vec<PartitionLease> = entries
            .into_iter()
            .filter_map(|entry| {
                self.decode_lease(
                    &entry.key,
                    &VersionedValue {
                        value: entry.value,
                        version: entry.version,
                    },
                )
            })
            .collect();
        leases.sort_by(|a, b| a.partition.cmp(&b.partition));
        Ok(leases)
    }

    /// Publishes or refreshes the presence of `instance_id` for one lease duration.
    pub async fn register_presence(&self, instance_id: &str) -> Result<()> {
        let expires_at = self.expiry_from(Utc::now());
        self.write_presence(instance_id, expires_at).await
    }

    /// Marks `instance_id` as gone.
    pub async fn remove_presence(&self, instance_id: &str) -> Result<()> {
        self.write_presence(instance_id, Utc::now()).await
    }

    async fn write_presence(&self, instance_id: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let key = self.keys.presence(instance_id);
        let record = PresenceRecord {
            instance_id: instance_id.to_string(),
            expires_at,
        };

        for _ in 0..PRESENCE_CONFLICT_RETRIES {
            let expected = with_retry(&self.retry, "presence get", || self.store.get(&key))
                .await?
                .map(|v| v.version);
            match self.swap(&key, expected, &record).await? {
                CasOutcome::Swapped(_) => return Ok(()),
                CasOutcome::VersionConflict { .. } => continue,
            }
        }
        Err(Error::Lease(format!(
            "Presence of {instance_id} kept changing concurrently"
        )))
    }

    /// Instances whose presence has not expired at `now`.
    pub async fn list_presence(&self, now: DateTime<Utc>) -> Result<Vec<InstancePresence>> {
        let prefix = self.keys.presence_prefix();
        let entries =
            with_retry(&self.retry, "presence list", || self.store.list(&prefix)).await?;

        let mut instances = Vec::new();
        for entry in entries {
            match serde_json::from_slice::<PresenceRecord>(&entry.value) {
                Ok(record) if record.expires_at > now => instances.push(InstancePresence {
                    instance_id: record.instance_id,
                    expires_at: record.expires_at,
                }),
                Ok(_) => {}
                Err(e) => warn!(key = %entry.key, error = %e, "Skipping undecodable presence record"),
            }
        }
        Ok(instances)
    }

    async fn swap<T: Serialize>(
        &self,
        key: &str,
        expected: Option<Version>,
        record: &T,
    ) -> Result<CasOutcome> {
        let value = Bytes::from(serde_json::to_vec(record)?);
        Ok(with_retry(&self.retry, "lease cas", || {
            self.store
                .compare_and_swap(key, expected, value.clone())
        })
        .await?)
    }

    /// An undecodable record is treated as free, so a corrupted lease cannot block a partition.
    fn decode_lease(&self, key: &str, stored: &VersionedValue) -> Option<PartitionLease> {
        match serde_json::from_slice::<LeaseRecord>(&stored.value) {
            Ok(record) if record.partition.stream_id == self.stream_id => Some(PartitionLease {
                partition: record.partition,
                owner_id: record.owner_id,
                expires_at: record.expires_at,
                version: stored.version,
            }),
            Ok(record) => {
                warn!(key, stream = %record.partition.stream_id, "Lease record of another stream");
                None
            }
            Err(e) => {
                warn!(key, error = %e, "Undecodable lease record");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use eventflow_testing::simplekvstore::SimpleKVStore;

    use super::*;

    fn partition(id: &str) -> StreamPartition {
        StreamPartition::new("orders", id)
    }

    fn lease_store(store: &SimpleKVStore, lease_duration: Duration) -> LeaseStore {
        LeaseStore::new(
            Arc::new(store.clone()),
            "$Default",
            "orders",
            lease_duration,
            RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    fn granted(outcome: Acquire) -> PartitionLease {
        match outcome {
            Acquire::Granted(lease) => lease,
            Acquire::Denied(denial) => panic!("expected a granted lease, got {denial:?}"),
        }
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let store = SimpleKVStore::new("leases");
        let leases = lease_store(&store, Duration::from_secs(30));

        let lease = granted(leases.try_acquire(&partition("0"), "a").await);
        assert_eq!(lease.owner_id, "a");
        assert!(lease.expires_at > Utc::now());

        match leases.try_acquire(&partition("0"), "b").await {
            Acquire::Denied(Denial::Owned { owner_id, .. }) => assert_eq!(owner_id, "a"),
            other => panic!("expected Owned denial, got {other:?}"),
        }

        // the owner can acquire again, which extends the lease
        let again = granted(leases.try_acquire(&partition("0"), "a").await);
        assert!(again.version > lease.version);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_have_one_winner() {
        let store = SimpleKVStore::new("leases");
        store.error_injector().set_cas_latency(5);

        let mut handles = Vec::new();
        for i in 0..8 {
            let leases = lease_store(&store, Duration::from_secs(30));
            handles.push(tokio::spawn(async move {
                leases
                    .try_acquire(&partition("0"), &format!("instance-{i}"))
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if let Acquire::Granted(_) = handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_at_most_one_live_owner_per_partition() {
        let store = SimpleKVStore::new("leases");
        let partitions: Vec<StreamPartition> = (0..6).map(|i| partition(&i.to_string())).collect();

        let mut handles = Vec::new();
        for i in 0..4 {
            let leases = lease_store(&store, Duration::from_secs(30));
            let partitions = partitions.clone();
            handles.push(tokio::spawn(async move {
                let instance = format!("instance-{i}");
                let mut owned = Vec::new();
                for p in &partitions {
                    if let Acquire::Granted(lease) = leases.try_acquire(p, &instance).await {
                        owned.push(lease);
                    }
                }
                owned
            }));
        }

        let mut owners: HashMap<StreamPartition, Vec<String>> = HashMap::new();
        for handle in handles {
            for lease in handle.await.unwrap() {
                owners
                    .entry(lease.partition)
                    .or_default()
                    .push(lease.owner_id);
            }
        }
        for p in &partitions {
            assert_eq!(owners.get(p).map(Vec::len), Some(1), "partition {p}");
        }

        let now = Utc::now();
        let listed = lease_store(&store, Duration::from_secs(30))
            .list_all()
            .await
            .unwrap();
        assert_eq!(listed.len(), partitions.len());
        for lease in listed {
            assert!(lease.is_live_at(now));
            assert_eq!(owners[&lease.partition], vec![lease.owner_id.clone()]);
        }
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = SimpleKVStore::new("leases");
        let leases = lease_store(&store, Duration::from_millis(100));

        let old = granted(leases.try_acquire(&partition("0"), "a").await);
        assert!(matches!(
            leases.try_acquire(&partition("0"), "b").await,
            Acquire::Denied(Denial::Owned { .. })
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let new = granted(leases.try_acquire(&partition("0"), "b").await);
        assert_eq!(new.owner_id, "b");

        // the previous owner finds out on renewal
        assert_eq!(leases.renew(&old).await, Acquire::Denied(Denial::Lost));
    }

    #[tokio::test]
    async fn test_renewal_keeps_others_out() {
        let store = SimpleKVStore::new("leases");
        let leases = lease_store(&store, Duration::from_millis(150));

        let mut lease = granted(leases.try_acquire(&partition("0"), "a").await);
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            lease = granted(leases.renew(&lease).await);
            assert!(matches!(
                leases.try_acquire(&partition("0"), "b").await,
                Acquire::Denied(Denial::Owned { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_release_frees_partition_without_reusing_versions() {
        let store = SimpleKVStore::new("leases");
        let leases = lease_store(&store, Duration::from_secs(30));

        let lease = granted(leases.try_acquire(&partition("0"), "a").await);
        leases.release(&lease).await.unwrap();

        let listed = leases.list_all().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_expired_at(Utc::now()));
        assert!(listed[0].version > lease.version);

        let taken = granted(leases.try_acquire(&partition("0"), "b").await);
        assert_eq!(taken.owner_id, "b");

        // releasing a stale lease is acknowledged and leaves the new owner alone
        leases.release(&lease).await.unwrap();
        assert_eq!(granted(leases.renew(&taken).await).owner_id, "b");

        // a released lease cannot be renewed
        assert_eq!(leases.renew(&lease).await, Acquire::Denied(Denial::Lost));
    }

    #[tokio::test]
    async fn test_transient_store_errors_are_retried() {
        let store = SimpleKVStore::new("leases");
        let leases = lease_store(&store, Duration::from_secs(30));

        store.error_injector().fail_gets(2);
        store.error_injector().fail_cas(2);
        let lease = granted(leases.try_acquire(&partition("0"), "a").await);
        assert_eq!(lease.owner_id, "a");
    }

    #[tokio::test]
    async fn test_persistent_store_failure_denies() {
        let store = SimpleKVStore::new("leases");
        let leases = lease_store(&store, Duration::from_secs(30));

        store.error_injector().fail_gets(100);
        assert!(matches!(
            leases.try_acquire(&partition("0"), "a").await,
            Acquire::Denied(Denial::StoreUnavailable(_))
        ));
        store.error_injector().reset();

        let lease = granted(leases.try_acquire(&partition("0"), "a").await);
        store.error_injector().fail_cas(100);
        assert!(matches!(
            leases.renew(&lease).await,
            Acquire::Denied(Denial::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_lost_acquire_response_fails_safe() {
        let store = SimpleKVStore::new("leases");
        let leases = lease_store(&store, Duration::from_secs(30));

        // the write lands but the caller never hears about it, the retry then conflicts
        store.error_injector().lose_cas_responses(1);
        assert_eq!(
            leases.try_acquire(&partition("0"), "a").await,
            Acquire::Denied(Denial::Conflict)
        );

        // the store says "a" owns it, so "a" can pick it up again
        let listed = leases.list_all().await.unwrap();
        assert!(listed[0].is_owned_by("a"));
        assert!(matches!(
            leases.try_acquire(&partition("0"), "a").await,
            Acquire::Granted(_)
        ));
    }

    #[tokio::test]
    async fn test_corrupted_record_is_treated_as_free() {
        let store = SimpleKVStore::new("leases");
        let leases = lease_store(&store, Duration::from_secs(30));
        store.force_put("$Default/orders/ownership/0", Bytes::from_static(b"garbage"));

        assert!(leases.list_all().await.unwrap().is_empty());
        assert!(matches!(
            leases.try_acquire(&partition("0"), "a").await,
            Acquire::Granted(_)
        ));
    }

    #[tokio::test]
    async fn test_presence() {
        let store = SimpleKVStore::new("leases");
        let leases = lease_store(&store, Duration::from_millis(100));

        leases.register_presence("a").await.unwrap();
        leases.register_presence("b").await.unwrap();
        leases.register_presence("a").await.unwrap();

        let mut ids: Vec<String> = leases
            .list_presence(Utc::now())
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.instance_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        leases.remove_presence("b").await.unwrap();
        let ids: Vec<String> = leases
            .list_presence(Utc::now())
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.instance_id)
            .collect();
        assert_eq!(ids, vec!["a"]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(leases.list_presence(Utc::now()).await.unwrap().is_empty());
    }
}
