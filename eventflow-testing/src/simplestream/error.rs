use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimpleStreamError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimpleStreamError {
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    #[error("Partition is closed: {0}")]
    PartitionClosed(String),

    #[error("Failed to list partitions: {0}")]
    ListPartitions(String),

    #[error("Failed to open cursor: {0}")]
    Open(String),

    #[error("Failed to read: {0}")]
    Read(String),
}

impl From<SimpleStreamError> for eventflow_shared::error::Error {
    fn from(value: SimpleStreamError) -> Self {
        use eventflow_shared::error::Error;
        match value {
            SimpleStreamError::StreamNotFound(stream) => Error::StreamNotFound(stream),
            SimpleStreamError::PartitionNotFound(partition) => Error::PartitionNotFound(partition),
            other => Error::Source(other.to_string()),
        }
    }
}
