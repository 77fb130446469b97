//! Ordered reads from a single partition.
//!
//! ```text
//! Idle -> Starting -> Streaming -> Draining -> Stopped
//!                         |
//!                         +-----> Faulted --stop--> Stopped
//! ```
//!
//! A [`PartitionConsumer`] opens a cursor at a start position and pushes records into a bounded
//! channel from a background task. The task ends when the partition is closed upstream, when the
//! consumer is stopped, when the receiving side goes away, or when read errors persist beyond the
//! retry window.

use std::sync::Arc;
use std::time::Duration;

use backoff::strategy::exponential::Exponential;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use eventflow_shared::stream::{
    ConsumerRecord, Cursor, CursorItem, StartPosition, StreamPartition, StreamSource,
};

use crate::config::ProcessorConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Starting,
    Streaming,
    /// Stop was requested, no new records are pulled.
    Draining,
    Stopped,
    /// Reads kept failing, the stream has ended. Moves to `Stopped` once acknowledged with
    /// [`PartitionConsumer::stop`].
    Faulted,
}

/// Why the read task ended without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadExit {
    Cancelled,
    /// The partition was closed upstream and fully read.
    EndOfPartition,
    ReceiverDropped,
}

pub struct PartitionConsumer {
    partition: StreamPartition,
    source: Arc<dyn StreamSource>,
    read_timeout: Duration,
    read_backoff: Exponential,
    channel_capacity: usize,
    state: Arc<watch::Sender<ConsumerState>>,
    cancel: CancellationToken,
}

impl PartitionConsumer {
    /// The consumer stops when `parent` is cancelled or [`PartitionConsumer::stop`] is called.
    pub fn new(
        partition: StreamPartition,
        source: Arc<dyn StreamSource>,
        config: &ProcessorConfig,
        parent: &CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            partition,
            source,
            read_timeout: config.read_timeout,
            read_backoff: config.read_backoff(),
            channel_capacity: config.channel_capacity,
            state: Arc::new(state),
            cancel: parent.child_token(),
        }
    }

    pub fn partition(&self) -> &StreamPartition {
        &self.partition
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Opens a cursor at `position` and starts streaming. Records arrive in strictly increasing
    /// sequence-number order. The join handle resolves with the reason the stream ended, or an
    /// error if the consumer faulted.
    pub async fn start(
        &self,
        position: StartPosition,
    ) -> Result<(ReceiverStream<ConsumerRecord>, JoinHandle<Result<ReadExit>>)> {
        let starting = self.state.send_if_modified(|state| {
            if *state == ConsumerState::Idle {
                *state = ConsumerState::Starting;
                true
            } else {
                false
            }
        });
        if !starting {
            return Err(Error::Consumer(format!(
                "Consumer of {} cannot start in state {:?}",
                self.partition,
                self.state()
            )));
        }

        let cursor = match self.open_cursor(&position).await {
            Ok(cursor) => cursor,
            Err(e) => {
                let next = if self.cancel.is_cancelled() {
                    ConsumerState::Stopped
                } else {
                    ConsumerState::Faulted
                };
                self.state.send_replace(next);
                return Err(e);
            }
        };
        info!(partition = %self.partition, %position, "Streaming partition");
        self.state.send_replace(ConsumerState::Streaming);

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let reader = Reader {
            partition: self.partition.clone(),
            cursor,
            tx,
            read_timeout: self.read_timeout,
            backoff: self.read_backoff.clone(),
            cancel: self.cancel.clone(),
        };
        let state = Arc::clone(&self.state);

        let handle = tokio::spawn(async move {
            let outcome = reader.run().await;
            match &outcome {
                Ok(_) => {
                    state.send_replace(ConsumerState::Stopped);
                }
                Err(_) => {
                    // an acknowledged fault stays stopped
                    state.send_if_modified(|s| {
                        if *s == ConsumerState::Stopped {
                            false
                        } else {
                            *s = ConsumerState::Faulted;
                            true
                        }
                    });
                }
            }
            outcome
        });

        Ok((ReceiverStream::new(rx), handle))
    }

    /// Stops pulling records. Also acknowledges a fault.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.state.send_if_modified(|state| {
            let next = match *state {
                ConsumerState::Starting | ConsumerState::Streaming => ConsumerState::Draining,
                ConsumerState::Idle | ConsumerState::Faulted => ConsumerState::Stopped,
                ConsumerState::Draining | ConsumerState::Stopped => return false,
            };
            *state = next;
            true
        });
    }

    async fn open_cursor(&self, position: &StartPosition) -> Result<Box<dyn Cursor>> {
        let mut backoff = self.read_backoff.clone();
        loop {
            let e = match self.source.open_cursor(&self.partition, position).await {
                Ok(cursor) => return Ok(cursor),
                Err(e) => e,
            };
            if !e.is_transient() {
                error!(partition = %self.partition, error = %e, "Failed to open cursor");
                return Err(e.into());
            }
            let Some(delay) = backoff.next() else {
                error!(partition = %self.partition, error = %e, "Giving up opening cursor");
                return Err(Error::Consumer(format!(
                    "Could not open {} within the retry window: {e}",
                    self.partition
                )));
            };
            warn!(partition = %self.partition, error = %e, ?delay, "Failed to open cursor, retrying");
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Consumer(format!(
                        "Cancelled while opening {}", self.partition
                    )));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// State of the background read task.
struct Reader {
    partition: StreamPartition,
    cursor: Box<dyn Cursor>,
    tx: mpsc::Sender<ConsumerRecord>,
    read_timeout: Duration,
    backoff: Exponential,
    cancel: CancellationToken,
}

impl Reader {
    async fn run(mut self) -> Result<ReadExit> {
        let mut last_sequence_number: Option<i64> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(self.exit(ReadExit::Cancelled)),
                next = tokio::time::timeout(self.read_timeout, self.cursor.next()) => next,
            };

            let record = match next {
                // nothing new within the read timeout
                Err(_) => {
                    if self.tx.is_closed() {
                        return Ok(self.exit(ReadExit::ReceiverDropped));
                    }
                    continue;
                }
                Ok(Ok(CursorItem::Record(record))) => record,
                Ok(Ok(CursorItem::EndOfPartition)) => {
                    return Ok(self.exit(ReadExit::EndOfPartition));
                }
                Ok(Err(e)) if e.is_transient() => {
                    let Some(delay) = self.backoff.next() else {
                        error!(
                            partition = %self.partition,
                            error = %e,
                            retried_for = ?self.backoff.elapsed(),
                            "Read retry window exhausted"
                        );
                        return Err(Error::Consumer(format!(
                            "Reads from {} kept failing: {e}",
                            self.partition
                        )));
                    };
                    warn!(partition = %self.partition, error = %e, ?delay, "Read failed, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(self.exit(ReadExit::Cancelled)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                Ok(Err(e)) => {
                    error!(partition = %self.partition, error = %e, "Permanent read failure");
                    return Err(e.into());
                }
            };
            self.backoff.reset();

            if let Some(last) = last_sequence_number
                && record.sequence_number <= last
            {
                warn!(
                    partition = %self.partition,
                    sequence_number = record.sequence_number,
                    last_sequence_number = last,
                    "Dropping record that does not advance the sequence"
                );
                continue;
            }
            last_sequence_number = Some(record.sequence_number);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(self.exit(ReadExit::Cancelled)),
                sent = self.tx.send(record) => {
                    if sent.is_err() {
                        return Ok(self.exit(ReadExit::ReceiverDropped));
                    }
                }
            }
        }
    }

    fn exit(&self, exit: ReadExit) -> ReadExit {
        debug!(partition = %self.partition, ?exit, "Reader finished");
        exit
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use eventflow_testing::simplestream::SimpleStream;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::config::RetryConfig;

    fn config() -> ProcessorConfig {
        let mut config = ProcessorConfig::new("orders")
            .with_read_timeout(Duration::from_millis(20))
            .with_read_retry_window(Duration::from_millis(100));
        config.read_retry = RetryConfig::new(
            u16::MAX,
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        config
    }

    fn consumer(stream: &SimpleStream, cancel: &CancellationToken) -> PartitionConsumer {
        PartitionConsumer::new(
            stream.partition("0"),
            Arc::new(stream.clone()),
            &config(),
            cancel,
        )
    }

    async fn take(records: &mut ReceiverStream<ConsumerRecord>, n: usize) -> Vec<i64> {
        let mut seen = Vec::new();
        while seen.len() < n {
            let record = tokio::time::timeout(Duration::from_secs(2), records.next())
                .await
                .expect("timed out waiting for records")
                .expect("stream ended early");
            seen.push(record.sequence_number);
        }
        seen
    }

    #[tokio::test]
    async fn test_streams_in_order_until_closed() {
        let stream = SimpleStream::new("orders", 1);
        for i in 0..5 {
            stream.append("0", format!("event-{i}")).unwrap();
        }
        let cancel = CancellationToken::new();
        let consumer = consumer(&stream, &cancel);
        let mut states = consumer.watch_state();

        let (mut records, handle) = consumer.start(StartPosition::Earliest).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Streaming);
        assert_eq!(take(&mut records, 5).await, vec![1, 2, 3, 4, 5]);

        stream.append("0", "late").unwrap();
        stream.close_partition("0").unwrap();
        assert_eq!(take(&mut records, 1).await, vec![6]);
        assert!(records.next().await.is_none());

        assert_eq!(handle.await.unwrap(), Ok(ReadExit::EndOfPartition));
        states
            .wait_for(|s| *s == ConsumerState::Stopped)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resumes_after_checkpointed_sequence() {
        let stream = SimpleStream::new("orders", 1);
        for i in 0..5 {
            stream.append("0", format!("event-{i}")).unwrap();
        }
        let cancel = CancellationToken::new();
        let consumer = consumer(&stream, &cancel);

        let (mut records, _handle) = consumer
            .start(StartPosition::SequenceNumber {
                sequence_number: 3,
                inclusive: false,
            })
            .await
            .unwrap();
        assert_eq!(take(&mut records, 2).await, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_latest_skips_existing_records() {
        let stream = SimpleStream::new("orders", 1);
        stream.append("0", "old").unwrap();
        let cancel = CancellationToken::new();
        let consumer = consumer(&stream, &cancel);

        let (mut records, _handle) = consumer.start(StartPosition::Latest).await.unwrap();
        stream.append("0", "new").unwrap();
        assert_eq!(take(&mut records, 1).await, vec![2]);
    }

    #[tokio::test]
    async fn test_stop_drains_and_stops() {
        let stream = SimpleStream::new("orders", 1);
        let cancel = CancellationToken::new();
        let consumer = consumer(&stream, &cancel);
        let mut states = consumer.watch_state();

        let (_records, handle) = consumer.start(StartPosition::Earliest).await.unwrap();
        consumer.stop();
        assert!(matches!(
            consumer.state(),
            ConsumerState::Draining | ConsumerState::Stopped
        ));

        assert_eq!(handle.await.unwrap(), Ok(ReadExit::Cancelled));
        states
            .wait_for(|s| *s == ConsumerState::Stopped)
            .await
            .unwrap();

        // a consumer is single use
        assert!(consumer.start(StartPosition::Earliest).await.is_err());
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_reader() {
        let stream = SimpleStream::new("orders", 1);
        let cancel = CancellationToken::new();
        let consumer = consumer(&stream, &cancel);

        let (_records, handle) = consumer.start(StartPosition::Earliest).await.unwrap();
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Ok(ReadExit::Cancelled));
    }

    #[tokio::test]
    async fn test_transient_read_errors_are_retried() {
        let stream = SimpleStream::new("orders", 1);
        stream.append("0", "x").unwrap();
        stream.append("0", "y").unwrap();
        stream.error_injector().fail_reads(2);

        let cancel = CancellationToken::new();
        let consumer = consumer(&stream, &cancel);
        let (mut records, _handle) = consumer.start(StartPosition::Earliest).await.unwrap();
        assert_eq!(take(&mut records, 2).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_persistent_read_errors_fault() {
        let stream = SimpleStream::new("orders", 1);
        stream.error_injector().fail_reads(usize::MAX);

        let cancel = CancellationToken::new();
        let consumer = consumer(&stream, &cancel);
        let mut states = consumer.watch_state();
        let (mut records, handle) = consumer.start(StartPosition::Earliest).await.unwrap();

        assert!(records.next().await.is_none());
        assert!(matches!(handle.await.unwrap(), Err(Error::Consumer(_))));
        states
            .wait_for(|s| *s == ConsumerState::Faulted)
            .await
            .unwrap();

        consumer.stop();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_open_failure_faults() {
        let stream = SimpleStream::new("orders", 1);
        let cancel = CancellationToken::new();
        let consumer = PartitionConsumer::new(
            stream.partition("9"),
            Arc::new(stream.clone()),
            &config(),
            &cancel,
        );

        assert!(consumer.start(StartPosition::Earliest).await.is_err());
        assert_eq!(consumer.state(), ConsumerState::Faulted);
    }

    /// Replays sequence numbers out of order.
    struct ScriptedSource {
        sequence_numbers: Vec<i64>,
    }

    struct ScriptedCursor {
        sequence_numbers: Vec<i64>,
        position: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Cursor for ScriptedCursor {
        async fn next(&mut self) -> eventflow_shared::error::Result<CursorItem> {
            let index = self.position.fetch_add(1, Ordering::SeqCst);
            Ok(match self.sequence_numbers.get(index) {
                Some(sequence_number) => CursorItem::Record(ConsumerRecord {
                    partition: StreamPartition::new("orders", "0"),
                    offset: sequence_number * 10,
                    sequence_number: *sequence_number,
                    payload: Bytes::new(),
                    enqueued_at: Utc::now(),
                    partition_key: None,
                    properties: HashMap::new(),
                }),
                None => CursorItem::EndOfPartition,
            })
        }
    }

    #[async_trait]
    impl StreamSource for ScriptedSource {
        async fn list_partitions(
            &self,
            _stream_id: &str,
        ) -> eventflow_shared::error::Result<Vec<String>> {
            Ok(vec!["0".to_string()])
        }

        async fn open_cursor(
            &self,
            _partition: &StreamPartition,
            _position: &StartPosition,
        ) -> eventflow_shared::error::Result<Box<dyn Cursor>> {
            Ok(Box::new(ScriptedCursor {
                sequence_numbers: self.sequence_numbers.clone(),
                position: Arc::new(AtomicUsize::new(0)),
            }))
        }
    }

    #[tokio::test]
    async fn test_records_that_do_not_advance_are_dropped() {
        let source = ScriptedSource {
            sequence_numbers: vec![1, 2, 2, 1, 3, 5, 4, 6],
        };
        let cancel = CancellationToken::new();
        let consumer = PartitionConsumer::new(
            StreamPartition::new("orders", "0"),
            Arc::new(source),
            &config(),
            &cancel,
        );

        let (records, handle) = consumer.start(StartPosition::Earliest).await.unwrap();
        let seen: Vec<i64> = records.map(|r| r.sequence_number).collect().await;
        assert_eq!(seen, vec![1, 2, 3, 5, 6]);
        assert_eq!(handle.await.unwrap(), Ok(ReadExit::EndOfPartition));
    }
}
