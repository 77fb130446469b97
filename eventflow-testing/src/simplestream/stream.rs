use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::debug;

use eventflow_shared::stream::{
    ConsumerRecord, Cursor, CursorItem, StartPosition, StreamPartition, StreamSource,
};

use super::error::{Result, SimpleStreamError};
use super::error_injector::StreamErrorInjector;

#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<ConsumerRecord>,
    /// Offset of the next record, the byte position in the partition.
    next_offset: i64,
    closed: bool,
}

#[derive(Debug)]
struct StreamState {
    partitions: BTreeMap<String, PartitionLog>,
}

/// In-memory partitioned stream. Clones share the same partitions.
#[derive(Clone, Debug)]
pub struct SimpleStream {
    stream_id: String,
    state: Arc<RwLock<StreamState>>,
    /// Woken on every append and close.
    appended: Arc<Notify>,
    error_injector: Arc<StreamErrorInjector>,
}

impl SimpleStream {
    /// Creates a stream with partitions `"0"` to `partition_count - 1`.
    pub fn new(stream_id: impl Into<String>, partition_count: usize) -> Self {
        let partitions = (0..partition_count)
            .map(|i| (i.to_string(), PartitionLog::default()))
            .collect();
        Self {
            stream_id: stream_id.into(),
            state: Arc::new(RwLock::new(StreamState { partitions })),
            appended: Arc::new(Notify::new()),
            error_injector: Arc::new(StreamErrorInjector::new()),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn error_injector(&self) -> &Arc<StreamErrorInjector> {
        &self.error_injector
    }

    pub fn partition(&self, partition_id: &str) -> StreamPartition {
        StreamPartition::new(self.stream_id.clone(), partition_id)
    }

    /// Appends `payload` to a partition. Sequence numbers start at 1.
    pub fn append(&self, partition_id: &str, payload: impl Into<Bytes>) -> Result<ConsumerRecord> {
        self.append_record(partition_id, payload.into(), None, HashMap::new())
    }

    /// Appends `payload` to the partition `partition_key` hashes to, like a producer that only
    /// cares about per-key ordering.
    pub fn append_keyed(
        &self,
        partition_key: &str,
        payload: impl Into<Bytes>,
        properties: HashMap<String, String>,
    ) -> Result<ConsumerRecord> {
        let partition_id = {
            let state = self.state.read();
            let mut hasher = DefaultHasher::new();
            partition_key.hash(&mut hasher);
            let index = (hasher.finish() % state.partitions.len().max(1) as u64) as usize;
            state
                .partitions
                .keys()
                .nth(index)
                .cloned()
                .ok_or_else(|| SimpleStreamError::PartitionNotFound(partition_key.to_string()))?
        };
        self.append_record(
            &partition_id,
            payload.into(),
            Some(partition_key.to_string()),
            properties,
        )
    }

    fn append_record(
        &self,
        partition_id: &str,
        payload: Bytes,
        partition_key: Option<String>,
        properties: HashMap<String, String>,
    ) -> Result<ConsumerRecord> {
        let record = {
            let mut state = self.state.write();
            let log = state
                .partitions
                .get_mut(partition_id)
                .ok_or_else(|| self.partition_not_found(partition_id))?;
            if log.closed {
                return Err(SimpleStreamError::PartitionClosed(format!(
                    "{}/{}",
                    self.stream_id, partition_id
                )));
            }

            let record = ConsumerRecord {
                partition: StreamPartition::new(self.stream_id.clone(), partition_id),
                offset: log.next_offset,
                sequence_number: log.records.len() as i64 + 1,
                enqueued_at: Utc::now(),
                partition_key,
                properties,
                payload,
            };
            log.next_offset += record.payload.len() as i64;
            log.records.push(record.clone());
            record
        };
        self.appended.notify_waiters();
        Ok(record)
    }

    /// Marks the partition as complete. Cursors report end of partition once they read past the
    /// last record.
    pub fn close_partition(&self, partition_id: &str) -> Result<()> {
        {
            let mut state = self.state.write();
            let log = state
                .partitions
                .get_mut(partition_id)
                .ok_or_else(|| self.partition_not_found(partition_id))?;
            log.closed = true;
        }
        self.appended.notify_waiters();
        Ok(())
    }

    /// Number of records appended to the partition.
    pub fn len(&self, partition_id: &str) -> usize {
        self.state
            .read()
            .partitions
            .get(partition_id)
            .map_or(0, |log| log.records.len())
    }

    pub fn is_empty(&self, partition_id: &str) -> bool {
        self.len(partition_id) == 0
    }

    fn partition_not_found(&self, partition_id: &str) -> SimpleStreamError {
        SimpleStreamError::PartitionNotFound(format!("{}/{}", self.stream_id, partition_id))
    }

    /// Opens a cursor without going through the [`StreamSource`] trait.
    pub fn cursor(&self, partition_id: &str, position: &StartPosition) -> Result<SimpleCursor> {
        let state = self.state.read();
        let log = state
            .partitions
            .get(partition_id)
            .ok_or_else(|| self.partition_not_found(partition_id))?;

        let next_index = match position {
            StartPosition::Latest => log.records.len(),
            position => log
                .records
                .iter()
                .position(|r| position.admits(r))
                .unwrap_or(log.records.len()),
        };
        debug!(
            stream = %self.stream_id,
            partition = partition_id,
            %position,
            next_index,
            "Opened cursor"
        );

        Ok(SimpleCursor {
            partition_id: partition_id.to_string(),
            next_index,
            state: Arc::clone(&self.state),
            appended: Arc::clone(&self.appended),
            error_injector: Arc::clone(&self.error_injector),
        })
    }
}

#[async_trait]
impl StreamSource for SimpleStream {
    async fn list_partitions(&self, stream_id: &str) -> eventflow_shared::error::Result<Vec<String>> {
        if self.error_injector.should_fail_list() {
            return Err(SimpleStreamError::ListPartitions("injected failure".to_string()).into());
        }
        if stream_id != self.stream_id {
            return Err(SimpleStreamError::StreamNotFound(stream_id.to_string()).into());
        }
        Ok(self.state.read().partitions.keys().cloned().collect())
    }

    async fn open_cursor(
        &self,
        partition: &StreamPartition,
        position: &StartPosition,
    ) -> eventflow_shared::error::Result<Box<dyn Cursor>> {
        if self.error_injector.should_fail_open() {
            return Err(SimpleStreamError::Open("injected failure".to_string()).into());
        }
        if partition.stream_id != self.stream_id {
            return Err(SimpleStreamError::StreamNotFound(partition.stream_id.clone()).into());
        }
        Ok(Box::new(self.cursor(&partition.partition_id, position)?))
    }
}

/// Read position in one partition of a [`SimpleStream`].
#[derive(Debug)]
pub struct SimpleCursor {
    partition_id: String,
    /// Index of the next record to hand out, only advanced when a record is returned.
    next_index: usize,
    state: Arc<RwLock<StreamState>>,
    appended: Arc<Notify>,
    error_injector: Arc<StreamErrorInjector>,
}

#[async_trait]
impl Cursor for SimpleCursor {
    async fn next(&mut self) -> eventflow_shared::error::Result<CursorItem> {
        self.error_injector.apply_read_latency().await;

        if self.error_injector.should_fail_read() {
            return Err(SimpleStreamError::Read("injected failure".to_string()).into());
        }

        loop {
            // register before looking at the log so an append in between is not missed
            let appended = self.appended.notified();
            {
                let state = self.state.read();
                let log = state.partitions.get(&self.partition_id).ok_or_else(|| {
                    SimpleStreamError::PartitionNotFound(self.partition_id.clone())
                })?;
                if let Some(record) = log.records.get(self.next_index) {
                    self.next_index += 1;
                    return Ok(CursorItem::Record(record.clone()));
                }
                if log.closed {
                    return Ok(CursorItem::EndOfPartition);
                }
            }
            appended.await;
        }
    }
}
