use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, increasing job identifier assigned by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instruction to process one remote media file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartJobRequest {
    pub job_id: JobId,
    pub url: String,
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    Failed { error: String },
}

/// Sent by a job saga to its target once the job has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub outcome: JobOutcome,
}

impl JobReport {
    pub fn completed(job_id: JobId) -> Self {
        Self {
            job_id,
            outcome: JobOutcome::Completed,
        }
    }

    pub fn failed(job_id: JobId, error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = String::from("unknown error");
        }
        Self {
            job_id,
            outcome: JobOutcome::Failed { error },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Completed)
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            JobOutcome::Completed => None,
            JobOutcome::Failed { error } => Some(error),
        }
    }
}

/// Job lifecycle, as driven by the saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    NotStarted,
    Downloading,
    Processing,
    WaitingForUploads,
    Completed,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::NotStarted => "not-started",
            JobState::Downloading => "downloading",
            JobState::Processing => "processing",
            JobState::WaitingForUploads => "waiting-for-uploads",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_report_never_has_empty_error() {
        let report = JobReport::failed(JobId(4), "  ");
        assert!(!report.is_success());
        assert_eq!(report.error(), Some("unknown error"));
    }

    #[test]
    fn test_report_serialization() {
        let report = JobReport::failed(JobId(7), "boom");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["job_id"], 7);
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["error"], "boom");

        let json = serde_json::to_value(JobReport::completed(JobId(8))).unwrap();
        assert_eq!(json["outcome"]["status"], "completed");
    }

    #[test]
    fn test_state_names() {
        assert_eq!(JobState::NotStarted.to_string(), "not-started");
        assert_eq!(JobState::WaitingForUploads.to_string(), "waiting-for-uploads");
    }
}
