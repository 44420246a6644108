use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("{url} responded with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Retrieves remote media.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Stream `url` into a newly created file at `dest`, buffering at most
    /// `buffer_size` bytes in memory. Returns the number of bytes written.
    async fn fetch(&self, url: &str, dest: &Path, buffer_size: usize) -> Result<u64, FetchError>;
}
