use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Store Error - {0}")]
    Store(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Checkpoint Error - {0}")]
    Checkpoint(String),

    #[error("Lease Error - {0}")]
    Lease(String),

    #[error("Consumer Error - {0}")]
    Consumer(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Processor Error - {0}")]
    Processor(String),

    #[error("Codec Error - {0}")]
    Codec(String),
}

impl From<eventflow_shared::error::Error> for Error {
    fn from(value: eventflow_shared::error::Error) -> Self {
        use eventflow_shared::error::Error as SharedError;
        match value {
            SharedError::Store(e) => Error::Store(e),
            SharedError::Source(e) => Error::Source(e),
            not_found @ (SharedError::StreamNotFound(_) | SharedError::PartitionNotFound(_)) => {
                Error::Source(not_found.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Codec(value.to_string())
    }
}
