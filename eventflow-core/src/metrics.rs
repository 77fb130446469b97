//! Prometheus metrics fed by [`ProcessorEvent`]s.
//!
//! ```ignore
//! let metrics = Arc::new(MetricsObserver::new("orders", "$Default"));
//! let processor = EventProcessor::builder(config, source, store, handler)
//!     .observer(Arc::clone(&metrics) as Arc<dyn Observer>)
//!     .build()?;
//! println!("{}", metrics.encode()?);
//! ```

use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use eventflow_shared::stream::StreamPartition;

use crate::error::{Error, Result};
use crate::observer::{Observer, ProcessorEvent};

const REGISTRY_PREFIX: &str = "eventflow";

const STREAM_LABEL: &str = "stream";
const CONSUMER_GROUP_LABEL: &str = "consumer_group";
const PARTITION_LABEL: &str = "partition";
const OUTCOME_LABEL: &str = "outcome";

type Labels = Vec<(String, String)>;

pub struct MetricsObserver {
    stream_id: String,
    consumer_group: String,
    registry: Mutex<Registry>,
    owned_partitions: Family<Labels, Gauge>,
    lease_acquired_total: Family<Labels, Counter>,
    lease_lost_total: Family<Labels, Counter>,
    lease_released_total: Family<Labels, Counter>,
    lease_abandoned_total: Family<Labels, Counter>,
    partition_faulted_total: Family<Labels, Counter>,
    checkpoint_total: Family<Labels, Counter>,
    checkpoint_sequence_number: Family<Labels, Gauge>,
    handler_failed_total: Family<Labels, Counter>,
    balance_failed_total: Family<Labels, Counter>,
}

impl MetricsObserver {
    pub fn new(stream_id: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        let metrics = Self {
            stream_id: stream_id.into(),
            consumer_group: consumer_group.into(),
            registry: Mutex::new(Registry::default()),
            owned_partitions: Family::<Labels, Gauge>::default(),
            lease_acquired_total: Family::<Labels, Counter>::default(),
            lease_lost_total: Family::<Labels, Counter>::default(),
            lease_released_total: Family::<Labels, Counter>::default(),
            lease_abandoned_total: Family::<Labels, Counter>::default(),
            partition_faulted_total: Family::<Labels, Counter>::default(),
            checkpoint_total: Family::<Labels, Counter>::default(),
            checkpoint_sequence_number: Family::<Labels, Gauge>::default(),
            handler_failed_total: Family::<Labels, Counter>::default(),
            balance_failed_total: Family::<Labels, Counter>::default(),
        };

        {
            let mut registry = metrics.registry.lock();
            let registry = registry.sub_registry_with_prefix(REGISTRY_PREFIX);
            registry.register(
                "owned_partitions",
                "Partitions currently owned by this instance",
                metrics.owned_partitions.clone(),
            );
            registry.register(
                "lease_acquired",
                "Leases acquired",
                metrics.lease_acquired_total.clone(),
            );
            registry.register(
                "lease_lost",
                "Leases lost to another instance or a store outage",
                metrics.lease_lost_total.clone(),
            );
            registry.register(
                "lease_released",
                "Leases given up",
                metrics.lease_released_total.clone(),
            );
            registry.register(
                "lease_abandoned",
                "Leases left to expire after a failed release",
                metrics.lease_abandoned_total.clone(),
            );
            registry.register(
                "partition_faulted",
                "Partitions stopped by persistent read failures",
                metrics.partition_faulted_total.clone(),
            );
            registry.register(
                "checkpoint",
                "Checkpoint writes by outcome",
                metrics.checkpoint_total.clone(),
            );
            registry.register(
                "checkpoint_sequence_number",
                "Sequence number of the last committed checkpoint",
                metrics.checkpoint_sequence_number.clone(),
            );
            registry.register(
                "handler_failed",
                "Batches the handler failed on after all retries",
                metrics.handler_failed_total.clone(),
            );
            registry.register(
                "balance_failed",
                "Failed balancing rounds",
                metrics.balance_failed_total.clone(),
            );
        }
        metrics
    }

    fn labels(&self) -> Labels {
        vec![
            (STREAM_LABEL.to_string(), self.stream_id.clone()),
            (CONSUMER_GROUP_LABEL.to_string(), self.consumer_group.clone()),
        ]
    }

    fn partition_labels(&self, partition: &StreamPartition) -> Labels {
        let mut labels = self.labels();
        labels.push((PARTITION_LABEL.to_string(), partition.partition_id.clone()));
        labels
    }

    /// Metrics in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry.lock())
            .map_err(|e| Error::Processor(format!("Failed to encode metrics: {e}")))?;
        Ok(buffer)
    }
}

impl Observer for MetricsObserver {
    fn on_event(&self, event: &ProcessorEvent) {
        match event {
            ProcessorEvent::LeaseAcquired { partition, .. } => {
                self.lease_acquired_total
                    .get_or_create(&self.partition_labels(partition))
                    .inc();
                self.owned_partitions.get_or_create(&self.labels()).inc();
            }
            ProcessorEvent::LeaseLost { partition, .. } => {
                self.lease_lost_total
                    .get_or_create(&self.partition_labels(partition))
                    .inc();
                self.owned_partitions.get_or_create(&self.labels()).dec();
            }
            ProcessorEvent::LeaseReleased { partition } => {
                self.lease_released_total
                    .get_or_create(&self.partition_labels(partition))
                    .inc();
                self.owned_partitions.get_or_create(&self.labels()).dec();
            }
            ProcessorEvent::LeaseAbandoned { partition, .. } => {
                self.lease_abandoned_total
                    .get_or_create(&self.partition_labels(partition))
                    .inc();
                self.owned_partitions.get_or_create(&self.labels()).dec();
            }
            ProcessorEvent::PartitionFaulted { partition, .. } => {
                self.partition_faulted_total
                    .get_or_create(&self.partition_labels(partition))
                    .inc();
            }
            ProcessorEvent::CheckpointCommitted {
                partition,
                sequence_number,
                ..
            } => {
                let mut labels = self.partition_labels(partition);
                self.checkpoint_sequence_number
                    .get_or_create(&labels)
                    .set(*sequence_number);
                labels.push((OUTCOME_LABEL.to_string(), "committed".to_string()));
                self.checkpoint_total.get_or_create(&labels).inc();
            }
            ProcessorEvent::CheckpointFailed { partition, .. } => {
                let mut labels = self.partition_labels(partition);
                labels.push((OUTCOME_LABEL.to_string(), "failed".to_string()));
                self.checkpoint_total.get_or_create(&labels).inc();
            }
            ProcessorEvent::HandlerFailed {
                partition, skipped, ..
            } => {
                let mut labels = self.partition_labels(partition);
                let outcome = if *skipped { "skipped" } else { "stopped" };
                labels.push((OUTCOME_LABEL.to_string(), outcome.to_string()));
                self.handler_failed_total.get_or_create(&labels).inc();
            }
            ProcessorEvent::BalanceFailed { .. } => {
                self.balance_failed_total
                    .get_or_create(&self.labels())
                    .inc();
            }
        }
    }
}
