//! Ports - Traits for the external collaborators the pipeline depends on.

pub mod fetch;
pub mod storage;
pub mod transcoder;

pub use fetch::{FetchError, MediaFetcher};
pub use storage::{ObjectStore, StorageError};
pub use transcoder::{TranscodeError, Transcoder};
