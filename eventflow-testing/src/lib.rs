//! In-memory backends for exercising the event processor without external services.

/// Versioned KV store with compare-and-swap.
pub mod simplekvstore;

/// Partitioned append-only stream.
pub mod simplestream;
