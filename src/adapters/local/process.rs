use crate::domain::hls::TranscodeCommand;
use crate::ports::transcoder::{TranscodeError, Transcoder};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Bytes of stderr kept for the error message.
const STDERR_TAIL: usize = 4096;

/// Runs transcode commands as child processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessTranscoder;

impl ProcessTranscoder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transcoder for ProcessTranscoder {
    async fn run(&self, command: &TranscodeCommand) -> Result<(), TranscodeError> {
        tracing::debug!(
            program = %command.program,
            args = ?command.args,
            dir = %command.working_dir.display(),
            "launching transcoder"
        );

        let spawn_failed = |e: io::Error| TranscodeError::SpawnFailed {
            program: command.program.clone(),
            reason: e.to_string(),
        };

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // A timed-out worker drops this future; take the child down with it.
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_failed)?;

        let stderr = child.stderr.take();
        let (status, tail) = tokio::join!(child.wait(), async {
            match stderr {
                Some(stderr) => read_tail(stderr, STDERR_TAIL).await,
                None => Ok(Vec::new()),
            }
        });
        let status = status.map_err(spawn_failed)?;

        if status.success() {
            return Ok(());
        }

        let tail = tail.unwrap_or_else(|e| format!("<stderr unreadable: {e}>").into_bytes());
        Err(TranscodeError::ExitFailure {
            program: command.program.clone(),
            status: status.to_string(),
            stderr: String::from_utf8_lossy(&tail).trim().to_string(),
        })
    }
}

/// Drain `reader`, keeping only its last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> io::Result<Vec<u8>> {
    let mut tail = VecDeque::with_capacity(limit);
    let mut chunk = [0u8; 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for &byte in &chunk[..n] {
            if tail.len() == limit {
                tail.pop_front();
            }
            tail.push_back(byte);
        }
    }
    Ok(tail.into())
}
