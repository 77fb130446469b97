use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Store Error - {0}")]
    Store(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Stream Not Found - {0}")]
    StreamNotFound(String),

    #[error("Partition Not Found - {0}")]
    PartitionNotFound(String),
}

impl Error {
    /// Transient errors are worth retrying, the rest will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Source(_))
    }
}
