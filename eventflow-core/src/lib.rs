//! Partitioned event-stream processing with at-least-once delivery.
//!
//! A fleet of [`EventProcessor`]s sharing a consumer group splits the partitions of a stream
//! between them. Ownership of a partition is a time-bounded [`lease::PartitionLease`] guarded by
//! compare-and-swap on the durable store, progress is persisted as a
//! [`checkpoint::Checkpoint`], and the [`balancer::LoadBalancer`] moves partitions around as
//! instances join, leave or die.

pub use self::error::{Error, Result};

/// Error handling for the processor.
mod error;

/// Processor configuration, defaults and environment loading.
pub mod config;

/// Layout of keys in the durable store.
mod keys;

/// Backoff for transient store and source failures.
mod retry;

/// Partition ownership records with optimistic concurrency.
pub mod lease;

/// Durable per-partition progress.
pub mod checkpoint;

/// Ordered reads from a single partition.
pub mod consumer;

/// Distribution of partitions across active instances.
pub mod balancer;

/// User callback invoked with batches of records.
pub mod handler;

/// Notifications about leases, checkpoints and failures.
pub mod observer;

/// Prometheus metrics built on the observer notifications.
pub mod metrics;

/// Top-level coordinator tying everything together.
pub mod processor;

#[cfg(test)]
mod test_utils;

pub use balancer::{BalanceStrategy, GreedyBalancer};
pub use config::ProcessorConfig;
pub use handler::{EventHandler, FailurePolicy, HandlerError};
pub use observer::{Observer, ProcessorEvent};
pub use processor::EventProcessor;
