//! Partitioned stream abstraction.
//!
//! A stream is split into independently ordered partitions. A [`Cursor`] opened on one partition
//! yields its records in strictly increasing sequence-number order, blocking until new records
//! arrive, and reports [`CursorItem::EndOfPartition`] only when the upstream closed the partition.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifies one partition of one stream.
///
/// Partitions are ordered by stream and then by partition id, numerically when both ids are
/// integers (so "2" sorts before "10").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamPartition {
    pub stream_id: String,
    pub partition_id: String,
}

impl StreamPartition {
    pub fn new(stream_id: impl Into<String>, partition_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition_id: partition_id.into(),
        }
    }
}

impl fmt::Display for StreamPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream_id, self.partition_id)
    }
}

impl Ord for StreamPartition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stream_id.cmp(&other.stream_id).then_with(|| {
            match (
                self.partition_id.parse::<u64>(),
                other.partition_id.parse::<u64>(),
            ) {
                (Ok(a), Ok(b)) => a
                    .cmp(&b)
                    .then_with(|| self.partition_id.cmp(&other.partition_id)),
                (Ok(_), Err(_)) => Ordering::Less,
                (Err(_), Ok(_)) => Ordering::Greater,
                (Err(_), Err(_)) => self.partition_id.cmp(&other.partition_id),
            }
        })
    }
}

impl PartialOrd for StreamPartition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A record read from a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub partition: StreamPartition,
    /// Position of the record in the partition log, as assigned by the stream.
    pub offset: i64,
    /// Strictly increasing within a partition.
    pub sequence_number: i64,
    pub payload: Bytes,
    pub enqueued_at: DateTime<Utc>,
    /// Key the producer used to route the record to this partition.
    pub partition_key: Option<String>,
    /// Application and system properties attached by the producer or the stream.
    pub properties: HashMap<String, String>,
}

/// Where a cursor starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    /// The oldest record still retained.
    Earliest,
    /// Only records enqueued after the cursor was opened.
    Latest,
    Offset {
        offset: i64,
        inclusive: bool,
    },
    SequenceNumber {
        sequence_number: i64,
        inclusive: bool,
    },
    /// The first record enqueued at or after the given time.
    EnqueuedTime(DateTime<Utc>),
}

impl StartPosition {
    /// Whether `record` is at or past this position. [`StartPosition::Latest`] depends on what
    /// the partition holds when the cursor opens, so sources resolve it themselves and this
    /// returns `false` for it.
    pub fn admits(&self, record: &ConsumerRecord) -> bool {
        match self {
            StartPosition::Earliest => true,
            StartPosition::Latest => false,
            StartPosition::Offset { offset, inclusive } => {
                record.offset > *offset || (*inclusive && record.offset == *offset)
            }
            StartPosition::SequenceNumber {
                sequence_number,
                inclusive,
            } => {
                record.sequence_number > *sequence_number
                    || (*inclusive && record.sequence_number == *sequence_number)
            }
            StartPosition::EnqueuedTime(at) => record.enqueued_at >= *at,
        }
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPosition::Earliest => write!(f, "earliest"),
            StartPosition::Latest => write!(f, "latest"),
            StartPosition::Offset { offset, inclusive } => {
                write!(f, "offset {} ({})", offset, bound(*inclusive))
            }
            StartPosition::SequenceNumber {
                sequence_number,
                inclusive,
            } => write!(f, "sequence {} ({})", sequence_number, bound(*inclusive)),
            StartPosition::EnqueuedTime(at) => write!(f, "enqueued at {}", at.to_rfc3339()),
        }
    }
}

fn bound(inclusive: bool) -> &'static str {
    if inclusive { "inclusive" } else { "exclusive" }
}

/// Result of advancing a cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorItem {
    Record(ConsumerRecord),
    /// The upstream closed the partition, no record will follow.
    EndOfPartition,
}

/// A read position inside one partition.
#[async_trait]
pub trait Cursor: Send {
    /// Returns the next record, waiting for one to be appended if necessary.
    ///
    /// Must be cancel safe: dropping the returned future before completion must not skip a
    /// record.
    async fn next(&mut self) -> Result<CursorItem>;
}

/// A partitioned stream backend.
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Ids of the partitions of `stream_id`.
    async fn list_partitions(&self, stream_id: &str) -> Result<Vec<String>>;

    /// Opens a cursor on `partition` at `position`.
    async fn open_cursor(
        &self,
        partition: &StreamPartition,
        position: &StartPosition,
    ) -> Result<Box<dyn Cursor>>;
}
