//! HTTP inbound adapter.
//!
//! Turns job submissions into `StartJobRequest`s for the orchestrator and
//! answers immediately with the assigned job id.

mod jobs;

pub use jobs::{router, JobAccepted, SubmitJob};
