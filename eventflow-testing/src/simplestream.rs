//! Simple in-memory implementation of [`eventflow_shared::stream::StreamSource`].
//!
//! One stream with a fixed set of partitions `"0"..n`. Producers append to a partition, cursors
//! wait for new records and see [`CursorItem::EndOfPartition`](eventflow_shared::stream::CursorItem)
//! once the partition has been closed and fully read.
//!
//! # Example
//! ```ignore
//! use eventflow_testing::simplestream::SimpleStream;
//!
//! let stream = SimpleStream::new("orders", 4);
//! stream.append("0", "hello")?;
//!
//! // the next cursor read fails
//! stream.error_injector().fail_reads(1);
//! ```

/// Error types for the simple stream.
mod error;
/// Error injection controller.
mod error_injector;
/// Partition logs, cursors and the source implementation.
mod stream;

pub use error::{Result, SimpleStreamError};
pub use error_injector::StreamErrorInjector;
pub use stream::{SimpleCursor, SimpleStream};
