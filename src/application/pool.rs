//! Fixed-size pools of interchangeable workers.
//!
//! Each worker is its own task with its own queue and processes one item to
//! completion before taking the next. `submit` picks the worker with the
//! fewest pending items (lowest index wins ties) and returns immediately; the
//! outcome is delivered to the item's `Reply`. Every submitted item gets
//! exactly one reply: a panicking or timed-out item is answered with an error
//! and the worker instance is rebuilt from the pool's factory.

use super::mailbox::Reply;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Errors carried in a pool reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("{0}")]
    Failed(String),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("work timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    Download,
    Transcode,
    Upload,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Download => "downloaders",
            Role::Transcode => "transcoders",
            Role::Upload => "uploaders",
        };
        f.write_str(name)
    }
}

/// A unit of execution inside a pool.
#[async_trait]
pub trait Worker: Send + 'static {
    type Work: fmt::Debug + Send + 'static;
    type Output: Send + 'static;

    async fn process(&mut self, work: Self::Work) -> Result<Self::Output, WorkerError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolConfig {
    /// Upper bound on a single item. `None` lets items run indefinitely.
    pub work_timeout: Option<Duration>,
}

struct Envelope<W: Worker> {
    work: W::Work,
    reply: Reply<W::Output>,
}

struct Slot<W: Worker> {
    tx: mpsc::UnboundedSender<Envelope<W>>,
    pending: Arc<AtomicUsize>,
}

/// Handle to a running pool. Cloning shares the same workers.
pub struct WorkerPool<W: Worker> {
    role: Role,
    slots: Arc<[Slot<W>]>,
}

impl<W: Worker> Clone for WorkerPool<W> {
    fn clone(&self) -> Self {
        Self {
            role: self.role,
            slots: self.slots.clone(),
        }
    }
}

impl<W: Worker> fmt::Debug for WorkerPool<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("role", &self.role)
            .field("pending", &self.pending_counts())
            .finish()
    }
}

impl<W: Worker> WorkerPool<W> {
    /// Spawn `size` workers built by `factory(index)`. Must be called within
    /// a tokio runtime.
    pub fn new<F>(role: Role, size: usize, config: PoolConfig, factory: F) -> Self
    where
        F: Fn(usize) -> W + Send + Sync + 'static,
    {
        let size = if size == 0 {
            tracing::warn!(%role, "pool size 0 requested, using 1");
            1
        } else {
            size
        };

        let factory = Arc::new(factory);
        let slots: Vec<Slot<W>> = (0..size)
            .map(|index| {
                let (tx, rx) = mpsc::unbounded_channel();
                let pending = Arc::new(AtomicUsize::new(0));
                tokio::spawn(run_worker(
                    role,
                    index,
                    rx,
                    pending.clone(),
                    config,
                    factory.clone(),
                ));
                Slot { tx, pending }
            })
            .collect();

        tracing::info!(%role, size, "worker pool started");

        Self {
            role,
            slots: slots.into(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Pending items per worker, including the one in progress.
    pub fn pending_counts(&self) -> Vec<usize> {
        self.slots
            .iter()
            .map(|slot| slot.pending.load(Ordering::SeqCst))
            .collect()
    }

    /// Enqueue `work` on the least loaded worker. Never blocks, never fails;
    /// the result goes to `reply`.
    pub fn submit(&self, work: W::Work, reply: Reply<W::Output>) {
        let Some((index, slot)) = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, slot)| slot.pending.load(Ordering::SeqCst))
        else {
            return;
        };

        slot.pending.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(role = %self.role, worker = index, ?work, "dispatching");

        if let Err(mpsc::error::SendError(envelope)) = slot.tx.send(Envelope { work, reply }) {
            slot.pending.fetch_sub(1, Ordering::SeqCst);
            envelope.reply.send(
                &format!("{}/worker-{}", self.role, index),
                Err(WorkerError::Failed(format!("{} worker {index} is gone", self.role))),
            );
        }
    }
}

async fn run_worker<W, F>(
    role: Role,
    index: usize,
    mut rx: mpsc::UnboundedReceiver<Envelope<W>>,
    pending: Arc<AtomicUsize>,
    config: PoolConfig,
    factory: Arc<F>,
) where
    W: Worker,
    F: Fn(usize) -> W + Send + Sync + 'static,
{
    let name = format!("{role}/worker-{index}");
    let mut worker = factory(index);

    while let Some(Envelope { work, reply }) = rx.recv().await {
        tracing::debug!(%role, worker = index, ?work, "processing");

        let result = execute(&mut worker, work, config.work_timeout).await;
        match &result {
            Err(WorkerError::Panicked(reason)) => {
                tracing::error!(%role, worker = index, %reason, "worker panicked, restarting");
                worker = factory(index);
            }
            Err(WorkerError::TimedOut(limit)) => {
                tracing::error!(%role, worker = index, ?limit, "work timed out, restarting");
                worker = factory(index);
            }
            _ => {}
        }

        pending.fetch_sub(1, Ordering::SeqCst);
        reply.send(&name, result);
    }

    tracing::debug!(%role, worker = index, "worker stopped");
}

async fn execute<W: Worker>(
    worker: &mut W,
    work: W::Work,
    timeout: Option<Duration>,
) -> Result<W::Output, WorkerError> {
    let guarded = AssertUnwindSafe(worker.process(work)).catch_unwind();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(WorkerError::TimedOut(limit)),
        },
        None => guarded.await,
    };

    outcome.unwrap_or_else(|panic| Err(WorkerError::Panicked(panic_message(panic.as_ref()))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic")
    }
}
