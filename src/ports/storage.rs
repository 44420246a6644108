use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid object key: {key}")]
    InvalidKey { key: String },

    #[error("put {bucket}/{key} failed: {reason}")]
    Put {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Durable object storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key` in `bucket`, replacing any existing object.
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError>;
}
