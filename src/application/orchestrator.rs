//! Process-wide entry point for jobs.
//!
//! The orchestrator owns the pools and the scratch roots. It spawns one saga
//! per job and keeps nothing per job beyond the saga's task handle, which is
//! released once the saga reports.

use super::dead_letters::DeadLetters;
use super::mailbox::{mailbox, Recipient};
use super::saga::{JobPools, JobSaga, SagaSettings, StartJob};
use crate::config::AppConfig;
use crate::domain::jobs::{JobId, JobOutcome, JobReport, JobState, StartJobRequest};
use crate::ports::{MediaFetcher, ObjectStore, Transcoder};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const NAME: &str = "orchestrator";
const REPORT_CAPACITY: usize = 64;

/// External collaborators shared by every worker.
#[derive(Clone)]
pub struct Services {
    pub fetcher: Arc<dyn MediaFetcher>,
    pub transcoder: Arc<dyn Transcoder>,
    pub store: Arc<dyn ObjectStore>,
}

#[derive(Debug)]
pub enum OrchestratorMessage {
    NewJob(StartJobRequest),
    JobFinished(JobReport),
}

/// Cloneable handle to the running orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    recipient: Recipient<OrchestratorMessage>,
    reports: broadcast::Sender<JobReport>,
}

impl OrchestratorHandle {
    /// Queue a job. Returns `false` if the orchestrator is gone.
    pub fn start_job(&self, request: StartJobRequest) -> bool {
        self.recipient
            .tell("front-end", OrchestratorMessage::NewJob(request))
    }

    /// Every job report from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobReport> {
        self.reports.subscribe()
    }
}

#[cfg(test)]
impl OrchestratorHandle {
    /// Handle over a bare mailbox, for exercising front-ends.
    pub(crate) fn detached(recipient: Recipient<OrchestratorMessage>) -> Self {
        let (reports, _) = broadcast::channel(1);
        Self { recipient, reports }
    }
}

pub struct Orchestrator {
    config: AppConfig,
    settings: SagaSettings,
    pools: JobPools,
    dead_letters: DeadLetters,
    me: Recipient<OrchestratorMessage>,
    sagas: HashMap<JobId, JoinHandle<JobState>>,
    reports: broadcast::Sender<JobReport>,
}

impl Orchestrator {
    /// Create the scratch roots and the pools, then start accepting jobs.
    pub async fn start(
        config: AppConfig,
        services: Services,
        dead_letters: DeadLetters,
    ) -> std::io::Result<OrchestratorHandle> {
        tokio::fs::create_dir_all(&config.download_dir).await?;
        tokio::fs::create_dir_all(&config.output_dir).await?;

        let pools = JobPools::start(&config, &services);
        let (me, inbox) = mailbox(NAME, dead_letters.clone());
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);

        let orchestrator = Orchestrator {
            settings: SagaSettings::from(&config),
            config,
            pools,
            dead_letters,
            me: me.clone(),
            sagas: HashMap::new(),
            reports: reports.clone(),
        };
        tokio::spawn(orchestrator.run(inbox));

        Ok(OrchestratorHandle {
            recipient: me,
            reports,
        })
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<OrchestratorMessage>) {
        tracing::info!(
            download_dir = %self.config.download_dir.display(),
            output_dir = %self.config.output_dir.display(),
            "orchestrator ready"
        );

        while let Some(message) = inbox.recv().await {
            match message {
                OrchestratorMessage::NewJob(request) => self.on_new_job(request),
                OrchestratorMessage::JobFinished(report) => self.on_job_finished(report),
            }
        }
    }

    fn on_new_job(&mut self, request: StartJobRequest) {
        let StartJobRequest { job_id, url } = request;
        if self.sagas.contains_key(&job_id) {
            tracing::warn!(%job_id, "job id already running, ignoring request");
            return;
        }

        let start = StartJob {
            target: self.me.clone(),
            job_id,
            url,
            download_root: self.config.download_dir.clone(),
            output_root: self.config.output_dir.clone(),
        };
        let (_, handle) = JobSaga::spawn(
            start,
            self.pools.clone(),
            self.settings,
            self.dead_letters.clone(),
        );
        self.sagas.insert(job_id, handle);
        tracing::debug!(%job_id, active = self.sagas.len(), "saga spawned");
    }

    fn on_job_finished(&mut self, report: JobReport) {
        match &report.outcome {
            JobOutcome::Completed => tracing::info!(job_id = %report.job_id, "job succeeded"),
            JobOutcome::Failed { error } => {
                tracing::error!(job_id = %report.job_id, %error, "job failed")
            }
        }

        if let Some(saga) = self.sagas.remove(&report.job_id) {
            saga.abort();
        }
        let _ = self.reports.send(report);
    }
}
