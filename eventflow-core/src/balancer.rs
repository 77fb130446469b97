//! Distribution of partitions across the active instances of a consumer group.
//!
//! Balancing is cooperative: an instance only ever acquires partitions nobody holds (or whose
//! lease expired) and gives up its own excess, it never takes a live lease from someone else.
//! Each instance plans independently from a snapshot of the store, and the plans of all instances
//! converge on an even spread.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use eventflow_shared::stream::{StreamPartition, StreamSource};

use crate::error::Result;
use crate::lease::{Acquire, Denial, LeaseStore, PartitionLease};

/// Ownership as seen by one instance at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipSnapshot {
    /// Every partition of the stream, ascending.
    pub partitions: Vec<StreamPartition>,
    /// Latest lease record per partition, including expired and released ones.
    pub leases: BTreeMap<StreamPartition, PartitionLease>,
    /// Owners of live leases, instances with a live presence record, and the planning instance.
    pub active_instances: BTreeSet<String>,
    pub now: DateTime<Utc>,
}

impl OwnershipSnapshot {
    fn live_owner(&self, partition: &StreamPartition) -> Option<&str> {
        self.leases
            .get(partition)
            .filter(|lease| lease.is_live_at(self.now))
            .map(|lease| lease.owner_id.as_str())
    }

    /// Partitions each active instance holds a live lease for.
    pub fn load(&self) -> BTreeMap<&str, Vec<&StreamPartition>> {
        let mut load: BTreeMap<&str, Vec<&StreamPartition>> = self
            .active_instances
            .iter()
            .map(|id| (id.as_str(), Vec::new()))
            .collect();
        for partition in &self.partitions {
            if let Some(owner) = self.live_owner(partition) {
                load.entry(owner).or_default().push(partition);
            }
        }
        load
    }
}

/// What one instance should change about its ownership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalancePlan {
    /// Partitions to try to acquire, in order of preference.
    pub acquire: Vec<StreamPartition>,
    /// Owned partitions to give up.
    pub release: Vec<StreamPartition>,
}

impl BalancePlan {
    pub fn is_empty(&self) -> bool {
        self.acquire.is_empty() && self.release.is_empty()
    }
}

/// Decides how an instance's ownership should change. Implementations must be pure functions of
/// the snapshot so all instances reach compatible decisions.
pub trait BalanceStrategy: Send + Sync + 'static {
    fn plan(&self, instance_id: &str, snapshot: &OwnershipSnapshot) -> BalancePlan;
}

/// Targets `ceil(partitions / active instances)` partitions per instance.
///
/// - Below target, acquire unowned partitions first and expired ones next, lowest ids first.
///   An instance already at `floor` stops there while another instance is below `floor`.
/// - Above target while another instance is below it, release the highest ids.
/// - When partitions do not divide evenly only the first `total % active` instances, by id, may
///   stay at `ceil` while another instance is below `floor`. The others give one back.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyBalancer;

impl BalanceStrategy for GreedyBalancer {
    fn plan(&self, instance_id: &str, snapshot: &OwnershipSnapshot) -> BalancePlan {
        let total = snapshot.partitions.len();
        if total == 0 {
            return BalancePlan::default();
        }

        let mut load = snapshot.load();
        load.entry(instance_id).or_default();
        let active = load.len();
        let floor = total / active;
        let remainder = total % active;
        let expected = floor + usize::from(remainder != 0);

        let mine = load.get(instance_id).map_or(0, Vec::len);
        let others_below = |limit: usize| {
            load.iter()
                .any(|(id, owned)| *id != instance_id && owned.len() < limit)
        };

        let mut plan = BalancePlan::default();

        if mine < expected {
            let target = if mine >= floor && others_below(floor) {
                floor
            } else {
                expected
            };
            let (mut unowned, mut expired): (Vec<_>, Vec<_>) = snapshot
                .partitions
                .iter()
                .filter(|p| snapshot.live_owner(p).is_none())
                .partition(|p| !snapshot.leases.contains_key(*p));
            unowned.sort();
            expired.sort();
            plan.acquire = unowned
                .into_iter()
                .chain(expired)
                .take(target.saturating_sub(mine))
                .cloned()
                .collect();
        } else if mine > expected && others_below(expected) {
            plan.release = highest(&load, instance_id, mine - expected);
        } else if mine == expected && remainder != 0 && others_below(floor) {
            let rank = load
                .iter()
                .filter(|(_, owned)| owned.len() == expected)
                .position(|(id, _)| *id == instance_id)
                .unwrap_or(0);
            if rank >= remainder {
                plan.release = highest(&load, instance_id, 1);
            }
        }

        plan
    }
}

fn highest(
    load: &BTreeMap<&str, Vec<&StreamPartition>>,
    instance_id: &str,
    count: usize,
) -> Vec<StreamPartition> {
    let mut owned: Vec<StreamPartition> = load
        .get(instance_id)
        .map(|owned| owned.iter().map(|p| (*p).clone()).collect())
        .unwrap_or_default();
    owned.sort();
    owned.into_iter().rev().take(count).collect()
}

/// Result of one reconciliation round.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Leases acquired in this round.
    pub acquired: Vec<PartitionLease>,
    /// Live leases the store attributes to this instance that it is not working on.
    pub adopted: Vec<PartitionLease>,
    /// Partitions this instance should stop and release.
    pub release: Vec<StreamPartition>,
}

/// Reads ownership from the store and applies a [`BalanceStrategy`] for one instance.
#[derive(Clone)]
pub struct LoadBalancer {
    stream_id: String,
    instance_id: String,
    source: Arc<dyn StreamSource>,
    leases: LeaseStore,
    strategy: Arc<dyn BalanceStrategy>,
}

impl LoadBalancer {
    pub fn new(
        stream_id: impl Into<String>,
        instance_id: impl Into<String>,
        source: Arc<dyn StreamSource>,
        leases: LeaseStore,
        strategy: Arc<dyn BalanceStrategy>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            instance_id: instance_id.into(),
            source,
            leases,
            strategy,
        }
    }

    pub async fn snapshot(&self) -> Result<OwnershipSnapshot> {
        let mut partitions: Vec<StreamPartition> = self
            .source
            .list_partitions(&self.stream_id)
            .await?
            .into_iter()
            .map(|id| StreamPartition::new(self.stream_id.clone(), id))
            .collect();
        partitions.sort();

        let leases: BTreeMap<StreamPartition, PartitionLease> = self
            .leases
            .list_all()
            .await?
            .into_iter()
            .map(|lease| (lease.partition.clone(), lease))
            .collect();

        let now = Utc::now();
        let presence = self.leases.list_presence(now).await?;

        let mut active_instances: BTreeSet<String> = leases
            .values()
            .filter(|lease| lease.is_live_at(now))
            .map(|lease| lease.owner_id.clone())
            .collect();
        active_instances.extend(presence.into_iter().map(|p| p.instance_id));
        active_instances.insert(self.instance_id.clone());

        Ok(OwnershipSnapshot {
            partitions,
            leases,
            active_instances,
            now,
        })
    }

    /// Plans against a fresh snapshot and acquires what the plan asks for. `working` are the
    /// partitions this instance is currently processing.
    pub async fn reconcile(&self, working: &BTreeSet<StreamPartition>) -> Result<Reconciliation> {
        let snapshot = self.snapshot().await?;
        let plan = self.strategy.plan(&self.instance_id, &snapshot);
        if !plan.is_empty() {
            debug!(
                instance = %self.instance_id,
                active = snapshot.active_instances.len(),
                partitions = snapshot.partitions.len(),
                ?plan,
                "Rebalancing"
            );
        }

        let adopted = snapshot
            .leases
            .values()
            .filter(|lease| {
                lease.is_owned_by(&self.instance_id)
                    && lease.is_live_at(snapshot.now)
                    && !working.contains(&lease.partition)
                    && !plan.release.contains(&lease.partition)
            })
            .cloned()
            .collect();

        let mut acquired = Vec::new();
        for partition in &plan.acquire {
            match self.leases.try_acquire(partition, &self.instance_id).await {
                Acquire::Granted(lease) => acquired.push(lease),
                Acquire::Denied(Denial::StoreUnavailable(e)) => {
                    info!(%partition, error = %e, "Store unavailable, acquiring later");
                    break;
                }
                Acquire::Denied(denial) => {
                    debug!(%partition, %denial, "Partition not acquired");
                }
            }
        }

        Ok(Reconciliation {
            acquired,
            adopted,
            release: plan
                .release
                .into_iter()
                .filter(|p| working.contains(p))
                .collect(),
        })
    }
}
