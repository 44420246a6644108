//! Local adapters: filesystem store, child-process transcoder, HTTP fetcher
//! and the HTTP front-end.

pub mod fetch;
pub mod fs;
pub mod http;
pub mod process;

pub use fetch::HttpFetcher;
pub use fs::FsObjectStore;
pub use process::ProcessTranscoder;
