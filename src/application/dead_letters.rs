//! Dead letters and the fault monitor that logs them.

use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const HUB_CAPACITY: usize = 256;

/// Why a message ended up here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeadLetterReason {
    /// The recipient's mailbox was already closed.
    Undeliverable,
    /// The recipient was alive but could not handle the message in its current state.
    Unhandled { state: String },
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::Undeliverable => f.write_str("undeliverable"),
            DeadLetterReason::Unhandled { state } => write!(f, "unhandled in state {state}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub message_type: &'static str,
    pub sender: String,
    pub recipient: String,
    /// Debug rendering of the message.
    pub message: String,
    pub reason: DeadLetterReason,
}

/// Process-wide stream of dead letters.
#[derive(Debug, Clone)]
pub struct DeadLetters {
    sender: broadcast::Sender<DeadLetter>,
}

impl Default for DeadLetters {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadLetters {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Self { sender }
    }

    /// Publish a dead letter. Having no subscribers is fine.
    pub fn publish(&self, letter: DeadLetter) {
        let _ = self.sender.send(letter);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeadLetter> {
        self.sender.subscribe()
    }
}

/// Observes dead letters and logs them. Never alters control flow.
pub struct FaultMonitor;

impl FaultMonitor {
    pub fn spawn(hub: &DeadLetters) -> JoinHandle<()> {
        let mut rx = hub.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(letter) => tracing::warn!(
                        message_type = letter.message_type,
                        sender = %letter.sender,
                        recipient = %letter.recipient,
                        reason = %letter.reason,
                        message = %letter.message,
                        "dead letter captured"
                    ),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "fault monitor lagged behind dead letters");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
