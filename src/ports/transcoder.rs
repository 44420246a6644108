use crate::domain::hls::TranscodeCommand;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("failed to launch {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("{program} exited with {status}: {stderr}")]
    ExitFailure {
        program: String,
        status: String,
        stderr: String,
    },
}

/// Runs an external transcode command to completion.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Exit code 0 is success; anything else, including failure to start,
    /// is an error carrying the raw error text.
    async fn run(&self, command: &TranscodeCommand) -> Result<(), TranscodeError>;
}
