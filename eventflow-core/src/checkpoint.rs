//! Durable per-partition progress.
//!
//! The stored sequence number of a partition only moves forward. Writing an older position is
//! rejected, writing the same one again is a no-op, so replays after a lost response or a
//! redelivery are harmless.

use std::sync::Arc;

use backoff::strategy::fixed;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use eventflow_shared::kv::{CasOutcome, DurableStore};
use eventflow_shared::stream::{ConsumerRecord, StartPosition, StreamPartition};

use crate::config::{ProcessorConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::keys::Keyspace;
use crate::retry::with_retry;

/// Write attempts before giving up on concurrent modifications.
const MAX_CONFLICT_RETRIES: usize = 5;
const CONFLICT_RETRY_INTERVAL_MS: u64 = 5;

/// Last processed position of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition: StreamPartition,
    pub offset: i64,
    pub sequence_number: i64,
    pub committed_at: DateTime<Utc>,
    /// Instance that wrote the checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

impl Checkpoint {
    /// Checkpoint marking `record` and everything before it as processed.
    pub fn for_record(record: &ConsumerRecord, owner_id: Option<&str>) -> Self {
        Self {
            partition: record.partition.clone(),
            offset: record.offset,
            sequence_number: record.sequence_number,
            committed_at: Utc::now(),
            owner_id: owner_id.map(str::to_string),
        }
    }

    /// Position right after the checkpointed record.
    pub fn resume_position(&self) -> StartPosition {
        StartPosition::SequenceNumber {
            sequence_number: self.sequence_number,
            inclusive: false,
        }
    }
}

/// Outcome of [`CheckpointStore::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointWrite {
    Committed,
    /// The same sequence number was stored already.
    Unchanged,
    /// A higher sequence number is stored, usually written by a newer owner.
    Rejected { current: i64 },
}

#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn DurableStore>,
    keys: Keyspace,
    retry: RetryConfig,
}

impl CheckpointStore {
    pub fn new(
        store: Arc<dyn DurableStore>,
        consumer_group: &str,
        stream_id: &str,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            keys: Keyspace::new(consumer_group, stream_id),
            retry,
        }
    }

    pub(crate) fn from_config(store: Arc<dyn DurableStore>, config: &ProcessorConfig) -> Self {
        Self::new(
            store,
            &config.consumer_group,
            &config.stream_id,
            config.store_retry.clone(),
        )
    }

    pub async fn read(&self, partition: &StreamPartition) -> Result<Option<Checkpoint>> {
        let key = self.keys.checkpoint(partition);
        let stored =
            with_retry(&self.retry, "checkpoint get", || self.store.get(&key)).await?;

        stored
            .map(|v| {
                serde_json::from_slice::<Checkpoint>(&v.value).map_err(|e| {
                    Error::Checkpoint(format!("Undecodable checkpoint at {key}: {e}"))
                })
            })
            .transpose()
    }

    /// Stores `checkpoint` unless an equal or higher sequence number is stored already.
    pub async fn write(&self, checkpoint: &Checkpoint) -> Result<CheckpointWrite> {
        let key = self.keys.checkpoint(&checkpoint.partition);
        let value = Bytes::from(serde_json::to_vec(checkpoint)?);

        let mut conflict_delays =
            fixed::Interval::from_millis(CONFLICT_RETRY_INTERVAL_MS).take(MAX_CONFLICT_RETRIES - 1);
        loop {
            let stored =
                with_retry(&self.retry, "checkpoint get", || self.store.get(&key)).await?;

            let expected = match stored {
                None => None,
                Some(stored) => {
                    match serde_json::from_slice::<Checkpoint>(&stored.value) {
                        Ok(current) if checkpoint.sequence_number < current.sequence_number => {
                            return Ok(CheckpointWrite::Rejected {
                                current: current.sequence_number,
                            });
                        }
                        Ok(current) if checkpoint.sequence_number == current.sequence_number => {
                            return Ok(CheckpointWrite::Unchanged);
                        }
                        Ok(_) => {}
                        Err(e) => warn!(key = %key, error = %e, "Overwriting undecodable checkpoint"),
                    }
                    Some(stored.version)
                }
            };

            let outcome = with_retry(&self.retry, "checkpoint cas", || {
                self.store.compare_and_swap(&key, expected, value.clone())
            })
            .await?;
            match outcome {
                CasOutcome::Swapped(version) => {
                    debug!(
                        partition = %checkpoint.partition,
                        sequence_number = checkpoint.sequence_number,
                        version,
                        "Committed checkpoint"
                    );
                    return Ok(CheckpointWrite::Committed);
                }
                CasOutcome::VersionConflict { .. } => {
                    let Some(delay) = conflict_delays.next() else {
                        return Err(Error::Checkpoint(format!(
                            "Gave up writing {key} after {MAX_CONFLICT_RETRIES} concurrent modifications"
                        )));
                    };
                    debug!(partition = %checkpoint.partition, "Checkpoint changed concurrently, re-reading");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use eventflow_testing::simplekvstore::SimpleKVStore;

    use super::*;

    fn checkpoint_store(store: &SimpleKVStore) -> CheckpointStore {
        CheckpointStore::new(
            Arc::new(store.clone()),
            "$Default",
            "orders",
            RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    fn checkpoint(sequence_number: i64) -> Checkpoint {
        Checkpoint {
            partition: StreamPartition::new("orders", "0"),
            offset: sequence_number * 10,
            sequence_number,
            committed_at: Utc::now(),
            owner_id: Some("a".to_string()),
        }
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let store = SimpleKVStore::new("checkpoints");
        let checkpoints = checkpoint_store(&store);
        let partition = StreamPartition::new("orders", "0");

        assert_eq!(checkpoints.read(&partition).await.unwrap(), None);

        let written = checkpoint(3);
        assert_eq!(
            checkpoints.write(&written).await.unwrap(),
            CheckpointWrite::Committed
        );
        assert_eq!(checkpoints.read(&partition).await.unwrap(), Some(written));
    }

    #[tokio::test]
    async fn test_sequence_number_never_regresses() {
        let store = SimpleKVStore::new("checkpoints");
        let checkpoints = checkpoint_store(&store);
        let partition = StreamPartition::new("orders", "0");

        assert_eq!(
            checkpoints.write(&checkpoint(5)).await.unwrap(),
            CheckpointWrite::Committed
        );
        let revision = store.revision();

        assert_eq!(
            checkpoints.write(&checkpoint(5)).await.unwrap(),
            CheckpointWrite::Unchanged
        );
        assert_eq!(
            checkpoints.write(&checkpoint(4)).await.unwrap(),
            CheckpointWrite::Rejected { current: 5 }
        );
        // neither touched the store
        assert_eq!(store.revision(), revision);

        assert_eq!(
            checkpoints.write(&checkpoint(7)).await.unwrap(),
            CheckpointWrite::Committed
        );
        assert_eq!(
            checkpoints
                .read(&partition)
                .await
                .unwrap()
                .map(|c| c.sequence_number),
            Some(7)
        );
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_the_highest() {
        let store = SimpleKVStore::new("checkpoints");
        store.error_injector().set_cas_latency(2);

        let mut handles = Vec::new();
        for sequence_number in 1..=4 {
            let checkpoints = checkpoint_store(&store);
            handles.push(tokio::spawn(async move {
                checkpoints.write(&checkpoint(sequence_number)).await
            }));
        }
        for handle in handles {
            // every writer either committed, was a no-op, or was rejected by a higher one
            handle.await.unwrap().unwrap();
        }

        let stored = checkpoint_store(&store)
            .read(&StreamPartition::new("orders", "0"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.sequence_number, 4);
    }

    #[tokio::test]
    async fn test_lost_response_is_idempotent() {
        let store = SimpleKVStore::new("checkpoints");
        let checkpoints = checkpoint_store(&store);

        store.error_injector().lose_cas_responses(1);
        assert_eq!(
            checkpoints.write(&checkpoint(2)).await.unwrap(),
            CheckpointWrite::Unchanged
        );
        assert_eq!(
            checkpoints
                .read(&StreamPartition::new("orders", "0"))
                .await
                .unwrap()
                .map(|c| c.sequence_number),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_store_outage_is_an_error() {
        let store = SimpleKVStore::new("checkpoints");
        let checkpoints = checkpoint_store(&store);

        store.error_injector().fail_gets(100);
        assert!(matches!(
            checkpoints.write(&checkpoint(1)).await,
            Err(Error::Store(_))
        ));
    }

    #[test]
    fn test_resume_position_is_exclusive() {
        let record = ConsumerRecord {
            partition: StreamPartition::new("orders", "0"),
            offset: 40,
            sequence_number: 3,
            payload: Bytes::from_static(b"x"),
            enqueued_at: Utc::now(),
            partition_key: None,
            properties: HashMap::new(),
        };
        let checkpoint = Checkpoint::for_record(&record, Some("a"));

        assert_eq!(checkpoint.owner_id.as_deref(), Some("a"));
        assert_eq!(
            checkpoint.resume_position(),
            StartPosition::SequenceNumber {
                sequence_number: 3,
                inclusive: false
            }
        );
        assert!(!checkpoint.resume_position().admits(&record));
    }
}
