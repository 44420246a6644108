//! Output directory monitor.
//!
//! Polls a directory tree and reports each file once it has stopped changing
//! for a quiet period. A path is reported at most once per watch; later
//! modifications or deletions are not tracked.

use super::mailbox::Recipient;
use regex::RegexSet;
use serde::Serialize;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// File names never reported: OS metadata and transient writer artifacts.
const IGNORED_PATTERNS: &[&str] = &[
    r"^\.DS_Store$",
    r"^\._",
    r"^Thumbs\.db$",
    r"^desktop\.ini$",
    r"\.tmp$",
];

fn ignored_names() -> &'static RegexSet {
    static IGNORED: OnceLock<RegexSet> = OnceLock::new();
    IGNORED.get_or_init(|| RegexSet::new(IGNORED_PATTERNS).unwrap_or_else(|_| RegexSet::empty()))
}

pub fn is_ignored(name: &OsStr) -> bool {
    ignored_names().is_match(&name.to_string_lossy())
}

/// Regular, non-ignored files under `root` with their modification times.
/// A missing root yields nothing.
pub fn list_files(root: &Path) -> Vec<(PathBuf, SystemTime)> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::trace!(root = %root.display(), error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && !is_ignored(entry.file_name()))
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((entry.into_path(), modified))
        })
        .collect()
}

/// Bookkeeping for one watched tree.
#[derive(Debug)]
pub struct Watch {
    root: PathBuf,
    quiet_period: Duration,
    dispatched: HashSet<PathBuf>,
}

impl Watch {
    pub fn new(root: impl Into<PathBuf>, quiet_period: Duration) -> Self {
        Self {
            root: root.into(),
            quiet_period,
            dispatched: HashSet::new(),
        }
    }

    /// Files whose last modification is older than the quiet period at `now`
    /// and that have not been returned before. Sorted by path.
    pub fn poll(&mut self, now: SystemTime) -> Vec<PathBuf> {
        let mut ready = Vec::new();
        for (path, modified) in list_files(&self.root) {
            if self.dispatched.contains(&path) {
                continue;
            }
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age > self.quiet_period {
                self.dispatched.insert(path.clone());
                ready.push(path);
            }
        }
        ready.sort();
        ready
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorState {
    Idle,
    Watching,
    Stopped,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorState::Idle => "idle",
            MonitorState::Watching => "watching",
            MonitorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("monitor cannot start while {0}")]
    InvalidState(MonitorState),
}

/// Timer-driven watcher reporting ready files to an owner.
///
/// Dropping the monitor cancels its timer.
#[derive(Debug)]
pub struct OutputMonitor {
    name: String,
    state: MonitorState,
    cancel: CancellationToken,
}

impl OutputMonitor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: MonitorState::Idle,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Begin watching `root`, telling `owner` `wrap(path)` for every ready file.
    pub fn start<M, F>(
        &mut self,
        owner: Recipient<M>,
        wrap: F,
        root: PathBuf,
        poll_interval: Duration,
        quiet_period: Duration,
    ) -> Result<(), MonitorError>
    where
        M: fmt::Debug + Send + 'static,
        F: Fn(PathBuf) -> M + Send + 'static,
    {
        if self.state != MonitorState::Idle {
            return Err(MonitorError::InvalidState(self.state));
        }

        tracing::debug!(
            monitor = %self.name,
            root = %root.display(),
            ?poll_interval,
            ?quiet_period,
            "watching output"
        );

        let name = self.name.clone();
        let cancel = self.cancel.clone();
        let mut watch = Watch::new(root, quiet_period);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let polled = tokio::task::spawn_blocking(move || {
                    let ready = watch.poll(SystemTime::now());
                    (watch, ready)
                })
                .await;

                let ready = match polled {
                    Ok((returned, ready)) => {
                        watch = returned;
                        ready
                    }
                    Err(e) => {
                        tracing::error!(monitor = %name, error = %e, "directory scan failed");
                        break;
                    }
                };

                if cancel.is_cancelled() {
                    break;
                }

                for path in ready {
                    tracing::debug!(monitor = %name, path = %path.display(), "file ready");
                    if !owner.tell(&name, wrap(path)) {
                        // Owner is gone; nothing left to report to.
                        cancel.cancel();
                    }
                }
            }

            tracing::debug!(monitor = %name, "monitor stopped");
        });

        self.state = MonitorState::Watching;
        Ok(())
    }

    /// Cancel the timer. Terminal for this instance.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.state = MonitorState::Stopped;
    }
}

impl Drop for OutputMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
