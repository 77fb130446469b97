use std::sync::Arc;

use tracing::{error, info, warn};

use eventflow_shared::stream::StreamPartition;

/// Something that happened inside an [`EventProcessor`](crate::processor::EventProcessor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEvent {
    LeaseAcquired {
        partition: StreamPartition,
        instance_id: String,
    },
    /// Ownership was lost without giving it up, processing of the partition stopped.
    LeaseLost {
        partition: StreamPartition,
        reason: String,
    },
    LeaseReleased {
        partition: StreamPartition,
    },
    /// Processing of the partition ended but the lease could not be released, it is left to
    /// expire.
    LeaseAbandoned {
        partition: StreamPartition,
        reason: String,
    },
    /// The partition stopped because of read failures.
    PartitionFaulted {
        partition: StreamPartition,
        reason: String,
    },
    CheckpointCommitted {
        partition: StreamPartition,
        offset: i64,
        sequence_number: i64,
    },
    CheckpointFailed {
        partition: StreamPartition,
        sequence_number: i64,
        reason: String,
    },
    /// The handler failed on a batch after all retries.
    HandlerFailed {
        partition: StreamPartition,
        first_sequence_number: i64,
        last_sequence_number: i64,
        attempts: usize,
        reason: String,
        /// Whether the batch was skipped, otherwise the partition was stopped.
        skipped: bool,
    },
    BalanceFailed {
        reason: String,
    },
}

impl ProcessorEvent {
    pub fn partition(&self) -> Option<&StreamPartition> {
        match self {
            ProcessorEvent::LeaseAcquired { partition, .. }
            | ProcessorEvent::LeaseLost { partition, .. }
            | ProcessorEvent::LeaseReleased { partition }
            | ProcessorEvent::LeaseAbandoned { partition, .. }
            | ProcessorEvent::PartitionFaulted { partition, .. }
            | ProcessorEvent::CheckpointCommitted { partition, .. }
            | ProcessorEvent::CheckpointFailed { partition, .. }
            | ProcessorEvent::HandlerFailed { partition, .. } => Some(partition),
            ProcessorEvent::BalanceFailed { .. } => None,
        }
    }
}

/// Receives [`ProcessorEvent`]s. Called inline from the processor tasks, so implementations
/// must not block.
pub trait Observer: Send + Sync + 'static {
    fn on_event(&self, event: &ProcessorEvent);
}

impl<F> Observer for F
where
    F: Fn(&ProcessorEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &ProcessorEvent) {
        self(event)
    }
}

/// Logs every event with `tracing`. Always installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn on_event(&self, event: &ProcessorEvent) {
        match event {
            ProcessorEvent::LeaseAcquired {
                partition,
                instance_id,
            } => info!(%partition, owner = %instance_id, "Partition acquired"),
            ProcessorEvent::LeaseLost { partition, reason } => {
                warn!(%partition, reason = %reason, "Partition lost")
            }
            ProcessorEvent::LeaseReleased { partition } => info!(%partition, "Partition released"),
            ProcessorEvent::LeaseAbandoned { partition, reason } => {
                warn!(%partition, reason = %reason, "Partition abandoned, lease left to expire")
            }
            ProcessorEvent::PartitionFaulted { partition, reason } => {
                error!(%partition, reason = %reason, "Partition faulted")
            }
            ProcessorEvent::CheckpointCommitted {
                partition,
                offset,
                sequence_number,
            } => tracing::debug!(%partition, offset, sequence_number, "Checkpoint committed"),
            ProcessorEvent::CheckpointFailed {
                partition,
                sequence_number,
                reason,
            } => warn!(%partition, sequence_number, reason = %reason, "Checkpoint failed"),
            ProcessorEvent::HandlerFailed {
                partition,
                first_sequence_number,
                last_sequence_number,
                attempts,
                reason,
                skipped,
            } => error!(
                %partition,
                first_sequence_number,
                last_sequence_number,
                attempts,
                reason = %reason,
                skipped,
                "Handler failed"
            ),
            ProcessorEvent::BalanceFailed { reason } => warn!(reason = %reason, "Balancing failed"),
        }
    }
}

/// Fans an event out to every registered observer.
#[derive(Clone, Default)]
pub(crate) struct Observers {
    observers: Vec<Arc<dyn Observer>>,
}

impl Observers {
    pub(crate) fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self { observers }
    }

    pub(crate) fn notify(&self, event: ProcessorEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }
}
