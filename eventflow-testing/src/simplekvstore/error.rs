use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimpleKVStoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimpleKVStoreError {
    #[error("Failed to get value: {0}")]
    Get(String),

    #[error("Failed to compare-and-swap value: {0}")]
    Cas(String),

    #[error("Failed to list keys: {0}")]
    List(String),
}

impl From<SimpleKVStoreError> for eventflow_shared::error::Error {
    fn from(value: SimpleKVStoreError) -> Self {
        eventflow_shared::error::Error::Store(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SimpleKVStoreError::Get("timeout".to_string()).to_string(),
            "Failed to get value: timeout"
        );
        assert_eq!(
            SimpleKVStoreError::List("connection lost".to_string()).to_string(),
            "Failed to list keys: connection lost"
        );
    }

    #[test]
    fn test_converts_to_transient_store_error() {
        let err: eventflow_shared::error::Error =
            SimpleKVStoreError::Cas("injected failure".to_string()).into();
        assert!(err.is_transient());
        assert_eq!(
            err.to_string(),
            "Store Error - Failed to compare-and-swap value: injected failure"
        );
    }
}
