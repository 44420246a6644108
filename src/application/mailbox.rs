//! Typed mailboxes between actors.
//!
//! Every actor (saga, monitor, pool worker, orchestrator) owns one inbound
//! queue processed strictly in order. Sends never block and never fail from
//! the sender's point of view: a message for a stopped actor is routed to the
//! dead-letter hub.

use super::dead_letters::{DeadLetter, DeadLetterReason, DeadLetters};
use super::pool::WorkerError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Create a mailbox for an actor named `name`.
pub fn mailbox<M>(
    name: impl Into<String>,
    dead_letters: DeadLetters,
) -> (Recipient<M>, mpsc::UnboundedReceiver<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let name: String = name.into();
    let recipient = Recipient {
        name: Arc::from(name),
        tx,
        dead_letters,
    };
    (recipient, rx)
}

/// Sending half of a mailbox.
pub struct Recipient<M> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<M>,
    dead_letters: DeadLetters,
}

impl<M> Clone for Recipient<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            dead_letters: self.dead_letters.clone(),
        }
    }
}

impl<M> fmt::Debug for Recipient<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipient").field("name", &self.name).finish()
    }
}

impl<M: fmt::Debug> Recipient<M> {
    pub fn dead_letters(&self) -> &DeadLetters {
        &self.dead_letters
    }

    /// Fire-and-forget send. Returns `false` if the message became a dead letter.
    pub fn tell(&self, sender: &str, message: M) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(mpsc::error::SendError(message)) => {
                self.dead_letters.publish(DeadLetter {
                    message_type: std::any::type_name::<M>(),
                    sender: sender.to_string(),
                    recipient: self.name.to_string(),
                    message: format!("{message:?}"),
                    reason: DeadLetterReason::Undeliverable,
                });
                false
            }
        }
    }
}

type Deliver<T> = Box<dyn FnOnce(&str, Result<T, WorkerError>) -> bool + Send>;

/// One-shot reply address for a unit of pool work.
pub struct Reply<T> {
    deliver: Deliver<T>,
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reply")
    }
}

impl<T: Send + 'static> Reply<T> {
    /// Reply to `recipient`, wrapping the result into its message type.
    pub fn to<M, F>(recipient: Recipient<M>, wrap: F) -> Self
    where
        M: fmt::Debug + Send + 'static,
        F: FnOnce(Result<T, WorkerError>) -> M + Send + 'static,
    {
        Self {
            deliver: Box::new(move |sender, result| recipient.tell(sender, wrap(result))),
        }
    }

    /// Deliver the result. Returns `false` if it became a dead letter.
    pub fn send(self, sender: &str, result: Result<T, WorkerError>) -> bool {
        (self.deliver)(sender, result)
    }
}
