use std::fmt;
use std::str::FromStr;

use eventflow_shared::stream::ConsumerRecord;

use crate::error::Error;

/// Failure reported by an [`EventHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for HandlerError {}

/// User code invoked with the records of one partition.
///
/// Invocations for the same partition never overlap and follow the partition order. Returning
/// `Ok` confirms the whole batch, which makes it eligible for checkpointing. A batch may be
/// delivered again after a failure, a crash or an ownership change, so handlers should be
/// idempotent.
#[trait_variant::make(Send)]
pub trait EventHandler: Clone + Send + Sync + 'static {
    async fn process(&self, batch: &[ConsumerRecord]) -> Result<(), HandlerError>;
}

/// What happens to a batch the handler kept failing on after all retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Report the failure, checkpoint past the batch and move on.
    SkipAndCheckpoint,
    /// Report the failure, stop the partition and release its lease. The partition is picked up
    /// again from the last checkpoint.
    #[default]
    StopPartition,
}

impl FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" | "skip_and_checkpoint" => Ok(FailurePolicy::SkipAndCheckpoint),
            "stop" | "stop_partition" => Ok(FailurePolicy::StopPartition),
            other => Err(Error::Config(format!(
                "Invalid failure policy {other}, expected skip or stop"
            ))),
        }
    }
}
