//! Per-job saga.
//!
//! A saga is one task driven by its own mailbox. It sequences download,
//! transcode and the monitor-driven uploads of every emitted file, then
//! reports a single outcome to its target. Legal messages per state:
//!
//! | state               | message                          | next                |
//! |---------------------|----------------------------------|---------------------|
//! | NotStarted          | Start                            | Downloading         |
//! | Downloading         | Downloaded(ok)                   | Processing          |
//! | Downloading         | Downloaded(err)                  | Failed              |
//! | Processing          | Transcoded(ok)                   | WaitingForUploads   |
//! | Processing          | Transcoded(err)                  | Failed              |
//! | Processing, Waiting | FileReady, Uploaded, RetryUpload | same, or Failed     |
//! | WaitingForUploads   | CompletionTick                   | same, or Completed  |
//!
//! Anything else is published as an unhandled dead letter and ignored.

use super::dead_letters::{DeadLetter, DeadLetterReason, DeadLetters};
use super::mailbox::{mailbox, Recipient, Reply};
use super::monitor::{list_files, OutputMonitor};
use super::orchestrator::{OrchestratorMessage, Services};
use super::pool::{PoolConfig, Role, WorkerError, WorkerPool};
use super::workers::{
    DownloadRequest, DownloadWorker, TranscodeRequest, TranscodeWorker, UploadRequest,
    UploadWorker,
};
use crate::config::AppConfig;
use crate::domain::hls::HlsProfile;
use crate::domain::jobs::{JobId, JobReport, JobState};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Handles to the three shared pools.
#[derive(Debug, Clone)]
pub struct JobPools {
    pub download: WorkerPool<DownloadWorker>,
    pub transcode: WorkerPool<TranscodeWorker>,
    pub upload: WorkerPool<UploadWorker>,
}

impl JobPools {
    /// Spawn the download, transcode and upload pools over `services`.
    pub fn start(config: &AppConfig, services: &Services) -> Self {
        let pool_config = PoolConfig {
            work_timeout: config.work_timeout,
        };

        let fetcher = services.fetcher.clone();
        let buffer_size = config.download_buffer_size;
        let download = WorkerPool::new(
            Role::Download,
            config.num_downloaders,
            pool_config,
            move |_| DownloadWorker::new(fetcher.clone(), buffer_size),
        );

        let transcoder = services.transcoder.clone();
        let profile = HlsProfile::new(config.transcoder_program.clone(), config.hls_segment_seconds);
        let transcode = WorkerPool::new(
            Role::Transcode,
            config.num_transcoders,
            pool_config,
            move |_| TranscodeWorker::new(transcoder.clone(), profile.clone()),
        );

        let store = services.store.clone();
        let bucket = config.upload_bucket.clone();
        let upload = WorkerPool::new(
            Role::Upload,
            config.num_uploaders,
            pool_config,
            move |_| UploadWorker::new(store.clone(), bucket.clone()),
        );

        Self {
            download,
            transcode,
            upload,
        }
    }
}

/// Timing and retry knobs for a saga.
#[derive(Debug, Clone, Copy)]
pub struct SagaSettings {
    pub poll_interval: Duration,
    pub quiet_period: Duration,
    pub completion_check_interval: Duration,
    pub upload_retry_delay: Duration,
    /// Total attempts per file, including the first.
    pub upload_max_attempts: u32,
}

impl From<&AppConfig> for SagaSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.monitor_poll_interval,
            quiet_period: config.monitor_quiet_period,
            completion_check_interval: config.completion_check_interval,
            upload_retry_delay: config.upload_retry_delay,
            upload_max_attempts: config.upload_max_attempts.max(1),
        }
    }
}

#[derive(Debug)]
pub struct StartJob {
    /// Receives the final `JobReport`.
    pub target: Recipient<OrchestratorMessage>,
    pub job_id: JobId,
    pub url: String,
    /// Base directories; the job works under `job-<id>` inside each.
    pub download_root: PathBuf,
    pub output_root: PathBuf,
}

#[derive(Debug)]
pub enum SagaMessage {
    Start(StartJob),
    Downloaded(Result<PathBuf, WorkerError>),
    Transcoded(Result<PathBuf, WorkerError>),
    FileReady(PathBuf),
    Uploaded {
        path: PathBuf,
        attempt: u32,
        result: Result<PathBuf, WorkerError>,
    },
    RetryUpload {
        path: PathBuf,
        attempt: u32,
    },
    CompletionTick,
}

impl SagaMessage {
    fn kind(&self) -> &'static str {
        match self {
            SagaMessage::Start(_) => "Start",
            SagaMessage::Downloaded(_) => "Downloaded",
            SagaMessage::Transcoded(_) => "Transcoded",
            SagaMessage::FileReady(_) => "FileReady",
            SagaMessage::Uploaded { .. } => "Uploaded",
            SagaMessage::RetryUpload { .. } => "RetryUpload",
            SagaMessage::CompletionTick => "CompletionTick",
        }
    }
}

/// Scratch directories exclusively owned by one job.
#[derive(Debug)]
struct Scratch {
    download: PathBuf,
    output: PathBuf,
}

pub struct JobSaga {
    name: String,
    job_id: JobId,
    state: JobState,
    me: Recipient<SagaMessage>,
    pools: JobPools,
    settings: SagaSettings,
    target: Option<Recipient<OrchestratorMessage>>,
    scratch: Option<Scratch>,
    target_dir: Option<PathBuf>,
    /// Reported by the monitor, upload not yet confirmed.
    dirty: HashSet<PathBuf>,
    /// Everything the monitor has reported so far.
    reported: HashSet<PathBuf>,
    monitor: Option<OutputMonitor>,
    /// Parent of every timer this saga schedules.
    timers: CancellationToken,
}

impl JobSaga {
    /// Spawn a saga for `start.job_id` with `start` as its first message.
    /// The task resolves to the terminal state.
    pub fn spawn(
        start: StartJob,
        pools: JobPools,
        settings: SagaSettings,
        dead_letters: DeadLetters,
    ) -> (Recipient<SagaMessage>, JoinHandle<JobState>) {
        let job_id = start.job_id;
        let name = format!("job-{job_id}");
        let (me, inbox) = mailbox(name.clone(), dead_letters);
        me.tell(&name, SagaMessage::Start(start));
        let saga = JobSaga {
            name,
            job_id,
            state: JobState::NotStarted,
            me: me.clone(),
            pools,
            settings,
            target: None,
            scratch: None,
            target_dir: None,
            dirty: HashSet::new(),
            reported: HashSet::new(),
            monitor: None,
            timers: CancellationToken::new(),
        };
        (me, tokio::spawn(saga.run(inbox)))
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SagaMessage>) -> JobState {
        while let Some(message) = inbox.recv().await {
            if self.handle(message).await.is_break() {
                break;
            }
        }
        self.state
    }

    async fn handle(&mut self, message: SagaMessage) -> ControlFlow<()> {
        match (self.state, message) {
            (JobState::NotStarted, SagaMessage::Start(start)) => self.on_start(start),
            (JobState::Downloading, SagaMessage::Downloaded(Ok(path))) => {
                self.on_downloaded(path).await
            }
            (JobState::Downloading, SagaMessage::Downloaded(Err(e))) => {
                self.fail(format!("download failed: {e}"))
            }
            (JobState::Processing, SagaMessage::Transcoded(Ok(output_dir))) => {
                tracing::info!(job_id = %self.job_id, output = %output_dir.display(), "transcode complete, waiting for uploads");
                self.state = JobState::WaitingForUploads;
                self.start_completion_checks();
                ControlFlow::Continue(())
            }
            (JobState::Processing, SagaMessage::Transcoded(Err(e))) => {
                self.fail(format!("transcode failed: {e}"))
            }
            (
                JobState::Processing | JobState::WaitingForUploads,
                SagaMessage::FileReady(path),
            ) => {
                self.on_file_ready(path);
                ControlFlow::Continue(())
            }
            (
                JobState::Processing | JobState::WaitingForUploads,
                SagaMessage::Uploaded {
                    path,
                    attempt,
                    result,
                },
            ) => self.on_uploaded(path, attempt, result),
            (
                JobState::Processing | JobState::WaitingForUploads,
                SagaMessage::RetryUpload { path, attempt },
            ) => {
                if self.dirty.contains(&path) {
                    self.submit_upload(path, attempt);
                }
                ControlFlow::Continue(())
            }
            (JobState::WaitingForUploads, SagaMessage::CompletionTick) => {
                self.on_completion_tick().await
            }
            (state, message) => {
                self.unhandled(state, message);
                ControlFlow::Continue(())
            }
        }
    }

    fn on_start(&mut self, start: StartJob) -> ControlFlow<()> {
        let StartJob {
            target,
            url,
            download_root,
            output_root,
            ..
        } = start;

        let scratch = Scratch {
            download: download_root.join(&self.name),
            output: output_root.join(&self.name),
        };

        tracing::info!(job_id = %self.job_id, %url, "job started");

        self.target = Some(target);
        self.pools.download.submit(
            DownloadRequest {
                url,
                download_dir: scratch.download.clone(),
            },
            Reply::to(self.me.clone(), SagaMessage::Downloaded),
        );
        self.scratch = Some(scratch);
        self.state = JobState::Downloading;
        ControlFlow::Continue(())
    }

    async fn on_downloaded(&mut self, path: PathBuf) -> ControlFlow<()> {
        let output_root = match &self.scratch {
            Some(scratch) => scratch.output.clone(),
            None => return self.fail("job has no scratch directories".to_string()),
        };
        let Some(stem) = path.file_stem() else {
            return self.fail(format!("downloaded file {} has no name", path.display()));
        };
        let target_dir = output_root.join(stem);

        if let Err(e) = tokio::fs::create_dir_all(&target_dir).await {
            return self.fail(format!("creating {}: {e}", target_dir.display()));
        }

        let mut monitor = OutputMonitor::new(format!("{}/monitor", self.name));
        if let Err(e) = monitor.start(
            self.me.clone(),
            SagaMessage::FileReady,
            target_dir.clone(),
            self.settings.poll_interval,
            self.settings.quiet_period,
        ) {
            return self.fail(e.to_string());
        }
        self.monitor = Some(monitor);

        tracing::info!(job_id = %self.job_id, input = %path.display(), output = %target_dir.display(), "download complete, transcoding");

        self.pools.transcode.submit(
            TranscodeRequest {
                input: path,
                output_dir: target_dir.clone(),
            },
            Reply::to(self.me.clone(), SagaMessage::Transcoded),
        );
        self.target_dir = Some(target_dir);
        self.state = JobState::Processing;
        ControlFlow::Continue(())
    }

    fn on_file_ready(&mut self, path: PathBuf) {
        self.reported.insert(path.clone());
        if self.dirty.insert(path.clone()) {
            tracing::debug!(job_id = %self.job_id, path = %path.display(), "uploading");
            self.submit_upload(path, 1);
        }
    }

    fn submit_upload(&self, path: PathBuf, attempt: u32) {
        let reply_path = path.clone();
        self.pools.upload.submit(
            UploadRequest { path },
            Reply::to(self.me.clone(), move |result| SagaMessage::Uploaded {
                path: reply_path,
                attempt,
                result,
            }),
        );
    }

    fn on_uploaded(
        &mut self,
        path: PathBuf,
        attempt: u32,
        result: Result<PathBuf, WorkerError>,
    ) -> ControlFlow<()> {
        if !self.dirty.contains(&path) {
            tracing::debug!(job_id = %self.job_id, path = %path.display(), "ignoring upload reply for unknown path");
            return ControlFlow::Continue(());
        }

        match result {
            Ok(_) => {
                self.dirty.remove(&path);
                tracing::debug!(
                    job_id = %self.job_id,
                    path = %path.display(),
                    remaining = self.dirty.len(),
                    "upload confirmed"
                );
                ControlFlow::Continue(())
            }
            Err(e) if attempt >= self.settings.upload_max_attempts => self.fail(format!(
                "upload of {} failed after {attempt} attempts: {e}",
                path.display()
            )),
            Err(e) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "upload failed, retrying"
                );
                self.schedule(
                    self.settings.upload_retry_delay,
                    SagaMessage::RetryUpload {
                        path,
                        attempt: attempt + 1,
                    },
                );
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_completion_tick(&mut self) -> ControlFlow<()> {
        if !self.dirty.is_empty() {
            tracing::trace!(job_id = %self.job_id, pending = self.dirty.len(), "uploads outstanding");
            return ControlFlow::Continue(());
        }

        // The monitor may not have seen the transcoder's last files yet.
        if let Some(target_dir) = self.target_dir.clone() {
            let files = match tokio::task::spawn_blocking(move || list_files(&target_dir)).await {
                Ok(files) => files,
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "output scan failed");
                    return ControlFlow::Continue(());
                }
            };
            let unreported = files
                .iter()
                .filter(|(path, _)| !self.reported.contains(path))
                .count();
            if unreported > 0 {
                tracing::debug!(job_id = %self.job_id, unreported, "waiting for output to settle");
                return ControlFlow::Continue(());
            }
        }

        self.finalize().await
    }

    async fn finalize(&mut self) -> ControlFlow<()> {
        self.teardown();

        if let Some(scratch) = &self.scratch {
            for root in [&scratch.download, &scratch.output] {
                match tokio::fs::remove_dir_all(root).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!(
                        job_id = %self.job_id,
                        path = %root.display(),
                        error = %e,
                        "could not remove scratch directory"
                    ),
                }
            }
        }

        tracing::info!(job_id = %self.job_id, uploaded = self.reported.len(), "job completed");
        self.state = JobState::Completed;
        self.report(JobReport::completed(self.job_id));
        ControlFlow::Break(())
    }

    /// Scratch directories are left in place for inspection.
    fn fail(&mut self, error: String) -> ControlFlow<()> {
        self.teardown();
        tracing::error!(job_id = %self.job_id, state = %self.state, %error, "job failed");
        self.state = JobState::Failed;
        self.report(JobReport::failed(self.job_id, error));
        ControlFlow::Break(())
    }

    fn report(&self, report: JobReport) {
        if let Some(target) = &self.target {
            target.tell(&self.name, OrchestratorMessage::JobFinished(report));
        }
    }

    fn teardown(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
        self.timers.cancel();
    }

    fn unhandled(&self, state: JobState, message: SagaMessage) {
        tracing::debug!(job_id = %self.job_id, %state, ?message, "unhandled message");
        self.me.dead_letters().publish(DeadLetter {
            message_type: message.kind(),
            sender: String::from("unknown"),
            recipient: self.name.clone(),
            message: format!("{message:?}"),
            reason: DeadLetterReason::Unhandled {
                state: state.to_string(),
            },
        });
    }

    /// Deliver `message` to this saga after `delay` unless the job ends first.
    fn schedule(&self, delay: Duration, message: SagaMessage) {
        let token = self.timers.child_token();
        let me = self.me.clone();
        let sender = format!("{}/timer", self.name);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    me.tell(&sender, message);
                }
            }
        });
    }

    fn start_completion_checks(&self) {
        let token = self.timers.child_token();
        let me = self.me.clone();
        let sender = format!("{}/timer", self.name);
        let period = self.settings.completion_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !me.tell(&sender, SagaMessage::CompletionTick) {
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl Drop for JobSaga {
    fn drop(&mut self) {
        self.timers.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::local::process::ProcessTranscoder;
    use crate::domain::hls::TranscodeCommand;
    use crate::domain::jobs::JobOutcome;
    use crate::ports::fetch::{FetchError, MediaFetcher};
    use crate::ports::storage::{ObjectStore, StorageError};
    use crate::ports::transcoder::{MockTranscoder, TranscodeError, Transcoder};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Notify;

    const OUTPUTS: [&str; 8] = [
        "0/data00.ts",
        "0/data01.ts",
        "1/data00.ts",
        "1/data01.ts",
        "2/data00.ts",
        "2/data01.ts",
        "manifest_0.m3u8",
        "manifest_master.m3u8",
    ];

    struct FakeFetcher {
        status: Option<u16>,
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn fetch(&self, url: &str, dest: &Path, _: usize) -> Result<u64, FetchError> {
            if let Some(status) = self.status {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status,
                });
            }
            tokio::fs::write(dest, b"source video").await?;
            Ok(12)
        }
    }

    /// Never finishes a download.
    struct StalledFetcher;

    #[async_trait]
    impl MediaFetcher for StalledFetcher {
        async fn fetch(&self, _: &str, _: &Path, _: usize) -> Result<u64, FetchError> {
            std::future::pending().await
        }
    }

    /// Emits `OUTPUTS` into the working directory one by one.
    struct FakeTranscoder;

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn run(&self, command: &TranscodeCommand) -> Result<(), TranscodeError> {
            for name in OUTPUTS {
                let path = command.working_dir.join(name);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.unwrap();
                }
                tokio::fs::write(&path, name).await.unwrap();
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
            Ok(())
        }
    }

    /// Writes every output, then holds the transcode open until released.
    struct GatedTranscoder {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl Transcoder for GatedTranscoder {
        async fn run(&self, command: &TranscodeCommand) -> Result<(), TranscodeError> {
            for name in OUTPUTS {
                let path = command.working_dir.join(name);
                tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
                tokio::fs::write(&path, name).await.unwrap();
            }
            self.gate.notified().await;
            Ok(())
        }
    }

    /// Writes the master playlist right before exiting, after the rest has settled.
    struct LateManifestTranscoder {
        settle: Duration,
    }

    #[async_trait]
    impl Transcoder for LateManifestTranscoder {
        async fn run(&self, command: &TranscodeCommand) -> Result<(), TranscodeError> {
            let (last, rest) = OUTPUTS.split_last().unwrap();
            for name in rest {
                let path = command.working_dir.join(name);
                tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
                tokio::fs::write(&path, name).await.unwrap();
            }
            tokio::time::sleep(self.settle).await;
            tokio::fs::write(command.working_dir.join(last), last).await.unwrap();
            Ok(())
        }
    }

    /// Records every put; keys ending in a configured suffix fail that many times.
    #[derive(Default)]
    struct RecordingStore {
        puts: Mutex<Vec<String>>,
        failures: Mutex<HashMap<&'static str, u32>>,
    }

    impl RecordingStore {
        fn failing(suffix: &'static str, times: u32) -> Self {
            let store = Self::default();
            store.failures.lock().unwrap().insert(suffix, times);
            store
        }

        fn puts(&self) -> Vec<String> {
            self.puts.lock().unwrap().clone()
        }

        fn puts_ending_with(&self, suffix: &str) -> usize {
            self.puts().iter().filter(|k| k.ends_with(suffix)).count()
        }
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn put(&self, bucket: &str, key: &str, _: Bytes) -> Result<(), StorageError> {
            self.puts.lock().unwrap().push(key.to_string());
            let mut failures = self.failures.lock().unwrap();
            for (suffix, remaining) in failures.iter_mut() {
                if key.ends_with(suffix) && *remaining > 0 {
                    *remaining -= 1;
                    return Err(StorageError::Put {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        reason: "service unavailable".into(),
                    });
                }
            }
            Ok(())
        }
    }

    fn settings() -> SagaSettings {
        SagaSettings {
            poll_interval: Duration::from_millis(20),
            quiet_period: Duration::from_millis(40),
            completion_check_interval: Duration::from_millis(30),
            upload_retry_delay: Duration::from_millis(30),
            upload_max_attempts: 3,
        }
    }

    fn services(
        fetcher: impl MediaFetcher + 'static,
        transcoder: impl Transcoder + 'static,
        store: Arc<RecordingStore>,
    ) -> Services {
        Services {
            fetcher: Arc::new(fetcher),
            transcoder: Arc::new(transcoder),
            store,
        }
    }

    fn pools(services: &Services) -> JobPools {
        let config = AppConfig {
            num_downloaders: 2,
            num_transcoders: 2,
            num_uploaders: 3,
            ..AppConfig::default()
        };
        JobPools::start(&config, services)
    }

    fn start_message(
        target: Recipient<OrchestratorMessage>,
        job_id: JobId,
        dirs: &TempDir,
    ) -> StartJob {
        StartJob {
            target,
            job_id,
            url: "http://x/video.mp4".into(),
            download_root: dirs.path().join("in"),
            output_root: dirs.path().join("out"),
        }
    }

    fn start_job(
        job_id: JobId,
        services: &Services,
        settings: SagaSettings,
        dirs: &TempDir,
    ) -> (mpsc::UnboundedReceiver<OrchestratorMessage>, JoinHandle<JobState>) {
        let hub = DeadLetters::new();
        let (target, reports) = mailbox::<OrchestratorMessage>("orchestrator", hub.clone());
        let (_, handle) = JobSaga::spawn(
            start_message(target, job_id, dirs),
            pools(services),
            settings,
            hub,
        );
        (reports, handle)
    }

    async fn next_report(reports: &mut mpsc::UnboundedReceiver<OrchestratorMessage>) -> JobReport {
        let message = tokio::time::timeout(Duration::from_secs(10), reports.recv())
            .await
            .expect("job did not finish")
            .expect("orchestrator mailbox closed");
        match message {
            OrchestratorMessage::JobFinished(report) => report,
            other => panic!("unexpected message {other:?}"),
        }
    }

    async fn run_job(services: &Services, dirs: &TempDir) -> (JobReport, JobState) {
        let (mut reports, handle) = start_job(JobId(1), services, settings(), dirs);
        let report = next_report(&mut reports).await;
        (report, handle.await.unwrap())
    }

    async fn wait_for_puts(store: &RecordingStore, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while store.puts().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("uploads did not arrive");
    }

    #[tokio::test]
    async fn test_job_uploads_every_output_once_and_cleans_up() {
        let dirs = tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let services = services(FakeFetcher { status: None }, FakeTranscoder, store.clone());

        let (report, state) = run_job(&services, &dirs).await;

        assert_eq!(report, JobReport::completed(JobId(1)));
        assert_eq!(state, JobState::Completed);

        let mut puts = store.puts();
        assert_eq!(puts.len(), OUTPUTS.len());
        puts.sort();
        puts.dedup();
        assert_eq!(puts.len(), OUTPUTS.len(), "each output uploaded exactly once");
        for name in OUTPUTS {
            assert_eq!(store.puts_ending_with(name), 1, "{name}");
        }

        assert!(!dirs.path().join("in/job-1").exists());
        assert!(!dirs.path().join("out/job-1").exists());
    }

    #[tokio::test]
    async fn test_no_completion_while_transcode_is_running() {
        let dirs = tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let store = Arc::new(RecordingStore::default());
        let transcoder = GatedTranscoder { gate: gate.clone() };
        let services = services(FakeFetcher { status: None }, transcoder, store.clone());

        let (mut reports, handle) = start_job(JobId(3), &services, settings(), &dirs);

        // Every output is uploaded, so nothing is dirty, yet the transcode is still open.
        wait_for_puts(&store, OUTPUTS.len()).await;
        tokio::time::sleep(settings().completion_check_interval * 10).await;
        assert!(reports.try_recv().is_err(), "job finished before the transcode");
        assert!(!handle.is_finished());

        gate.notify_one();

        let report = next_report(&mut reports).await;
        assert_eq!(report, JobReport::completed(JobId(3)));
        assert_eq!(handle.await.unwrap(), JobState::Completed);
        assert_eq!(store.puts().len(), OUTPUTS.len());
        assert!(!dirs.path().join("out/job-3").exists());
    }

    #[tokio::test]
    async fn test_file_written_at_transcode_exit_is_uploaded_before_completion() {
        let dirs = tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let settings = SagaSettings {
            poll_interval: Duration::from_millis(20),
            quiet_period: Duration::from_millis(150),
            completion_check_interval: Duration::from_millis(10),
            ..settings()
        };
        let transcoder = LateManifestTranscoder {
            settle: Duration::from_millis(400),
        };
        let services = services(FakeFetcher { status: None }, transcoder, store.clone());

        let (mut reports, handle) = start_job(JobId(4), &services, settings, &dirs);

        let report = next_report(&mut reports).await;
        assert_eq!(report, JobReport::completed(JobId(4)));
        assert_eq!(handle.await.unwrap(), JobState::Completed);
        assert_eq!(store.puts_ending_with("manifest_master.m3u8"), 1);
        assert_eq!(store.puts().len(), OUTPUTS.len());
    }

    #[tokio::test]
    async fn test_upload_failure_is_retried_once_then_succeeds() {
        let dirs = tempdir().unwrap();
        let store = Arc::new(RecordingStore::failing("1/data01.ts", 1));
        let services = services(FakeFetcher { status: None }, FakeTranscoder, store.clone());

        let (report, _) = run_job(&services, &dirs).await;

        assert!(report.is_success(), "{report:?}");
        assert_eq!(store.puts_ending_with("1/data01.ts"), 2);
        assert_eq!(store.puts().len(), OUTPUTS.len() + 1);
    }

    #[tokio::test]
    async fn test_permanent_upload_failure_fails_job() {
        let dirs = tempdir().unwrap();
        let store = Arc::new(RecordingStore::failing("manifest_master.m3u8", u32::MAX));
        let services = services(FakeFetcher { status: None }, FakeTranscoder, store.clone());

        let (report, state) = run_job(&services, &dirs).await;

        assert_eq!(state, JobState::Failed);
        let error = report.error().unwrap();
        assert!(error.contains("manifest_master.m3u8"), "{error}");
        assert!(error.contains("after 3 attempts"), "{error}");
        assert_eq!(store.puts_ending_with("manifest_master.m3u8"), 3);
        // Left behind for inspection.
        assert!(dirs.path().join("out/job-1").exists());
    }

    #[tokio::test]
    async fn test_missing_transcoder_fails_without_uploads() {
        let dirs = tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let services = Services {
            fetcher: Arc::new(FakeFetcher { status: None }),
            transcoder: Arc::new(ProcessTranscoder),
            store: store.clone(),
        };
        let config = AppConfig {
            transcoder_program: "fabricator-no-such-transcoder".into(),
            ..AppConfig::default()
        };
        let hub = DeadLetters::new();
        let (target, mut reports) = mailbox::<OrchestratorMessage>("orchestrator", hub.clone());
        let (_, handle) = JobSaga::spawn(
            start_message(target, JobId(2), &dirs),
            JobPools::start(&config, &services),
            settings(),
            hub,
        );

        let Some(OrchestratorMessage::JobFinished(report)) = reports.recv().await else {
            panic!("expected a job report");
        };
        assert_eq!(handle.await.unwrap(), JobState::Failed);
        match report.outcome {
            JobOutcome::Failed { error } => {
                assert!(error.starts_with("transcode failed"), "{error}");
                assert!(error.contains("fabricator-no-such-transcoder"), "{error}");
            }
            JobOutcome::Completed => panic!("job should have failed"),
        }
        assert!(store.puts().is_empty());
    }

    #[tokio::test]
    async fn test_download_failure_never_transcodes() {
        let dirs = tempdir().unwrap();
        let mut transcoder = MockTranscoder::new();
        transcoder.expect_run().never();
        let store = Arc::new(RecordingStore::default());
        let services = services(FakeFetcher { status: Some(404) }, transcoder, store.clone());

        let (report, state) = run_job(&services, &dirs).await;

        assert_eq!(state, JobState::Failed);
        assert_eq!(
            report.error(),
            Some("download failed: http://x/video.mp4 responded with HTTP 404")
        );
        assert!(store.puts().is_empty());
    }

    #[tokio::test]
    async fn test_message_illegal_in_state_becomes_dead_letter() {
        let dirs = tempdir().unwrap();
        let hub = DeadLetters::new();
        let mut letters = hub.subscribe();
        let store = Arc::new(RecordingStore::default());
        let services = services(StalledFetcher, MockTranscoder::new(), store);
        let (target, _reports) = mailbox::<OrchestratorMessage>("orchestrator", hub.clone());
        let (saga, handle) = JobSaga::spawn(
            start_message(target, JobId(5), &dirs),
            pools(&services),
            settings(),
            hub,
        );

        saga.tell("test", SagaMessage::CompletionTick);

        let letter = letters.recv().await.unwrap();
        assert_eq!(letter.recipient, "job-5");
        assert_eq!(letter.message_type, "CompletionTick");
        assert_eq!(
            letter.reason,
            DeadLetterReason::Unhandled {
                state: "downloading".into()
            }
        );
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[test]
    fn test_settings_follow_config() {
        let config = AppConfig {
            upload_max_attempts: 5,
            upload_retry_delay: Duration::from_millis(250),
            ..AppConfig::default()
        };
        let settings = SagaSettings::from(&config);
        assert_eq!(settings.upload_max_attempts, 5);
        assert_eq!(settings.upload_retry_delay, Duration::from_millis(250));
        assert_eq!(settings.quiet_period, config.monitor_quiet_period);
    }
}
