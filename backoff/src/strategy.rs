/// Exponentially growing intervals with jitter, bounded by attempts and by a retry window.
pub mod exponential;

/// Constant intervals.
pub mod fixed;
