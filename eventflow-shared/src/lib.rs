//! Capabilities the event processor consumes from its environment, shared with the pluggable
//! backends that provide them.

/// Error exposed by the shared library.
pub mod error;

/// Versioned key-value store with compare-and-swap, backing leases and checkpoints.
pub mod kv;

/// Partitioned stream source, its cursors and records.
pub mod stream;
