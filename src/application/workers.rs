//! Concrete pool workers: download, transcode and upload.
//!
//! Each worker adapts one port to the pool's `Worker` contract. Port errors
//! are flattened into `WorkerError::Failed` carrying the error text.

use super::pool::{Worker, WorkerError};
use crate::domain::hls::HlsProfile;
use crate::ports::{MediaFetcher, ObjectStore, Transcoder};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    /// Directory the downloaded file is created in.
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeRequest {
    pub input: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub path: PathBuf,
}

fn failed(e: impl std::fmt::Display) -> WorkerError {
    WorkerError::Failed(e.to_string())
}

/// Local file name for a download: a fresh uuid, keeping the extension of
/// the URL path when it looks like one.
pub fn download_file_name(url: &str) -> String {
    let id = Uuid::new_v4();
    let extension = reqwest::Url::parse(url).ok().and_then(|parsed| {
        Path::new(parsed.path())
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(str::to_ascii_lowercase)
    });

    match extension {
        Some(ext) => format!("{id}.{ext}"),
        None => id.to_string(),
    }
}

pub struct DownloadWorker {
    fetcher: Arc<dyn MediaFetcher>,
    buffer_size: usize,
}

impl DownloadWorker {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, buffer_size: usize) -> Self {
        Self {
            fetcher,
            buffer_size,
        }
    }
}

#[async_trait]
impl Worker for DownloadWorker {
    type Work = DownloadRequest;
    type Output = PathBuf;

    async fn process(&mut self, work: DownloadRequest) -> Result<PathBuf, WorkerError> {
        tokio::fs::create_dir_all(&work.download_dir)
            .await
            .map_err(failed)?;
        let dest = work.download_dir.join(download_file_name(&work.url));

        match self.fetcher.fetch(&work.url, &dest, self.buffer_size).await {
            Ok(bytes) => {
                tracing::info!(url = %work.url, path = %dest.display(), bytes, "download finished");
                Ok(dest)
            }
            Err(e) => {
                // Partial file is useless.
                let _ = tokio::fs::remove_file(&dest).await;
                Err(failed(e))
            }
        }
    }
}

pub struct TranscodeWorker {
    transcoder: Arc<dyn Transcoder>,
    profile: HlsProfile,
}

impl TranscodeWorker {
    pub fn new(transcoder: Arc<dyn Transcoder>, profile: HlsProfile) -> Self {
        Self {
            transcoder,
            profile,
        }
    }
}

#[async_trait]
impl Worker for TranscodeWorker {
    type Work = TranscodeRequest;
    /// The output directory the artifacts were written to.
    type Output = PathBuf;

    async fn process(&mut self, work: TranscodeRequest) -> Result<PathBuf, WorkerError> {
        tokio::fs::create_dir_all(&work.output_dir)
            .await
            .map_err(failed)?;

        let command = self.profile.command(&work.input, &work.output_dir);
        tracing::debug!(program = %command.program, args = ?command.args, "starting transcode");

        self.transcoder.run(&command).await.map_err(failed)?;

        tracing::info!(input = %work.input.display(), output = %work.output_dir.display(), "transcode finished");
        Ok(work.output_dir)
    }
}

pub struct UploadWorker {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl UploadWorker {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl Worker for UploadWorker {
    type Work = UploadRequest;
    /// The path that was uploaded.
    type Output = PathBuf;

    async fn process(&mut self, work: UploadRequest) -> Result<PathBuf, WorkerError> {
        let body = tokio::fs::read(&work.path).await.map_err(|e| {
            WorkerError::Failed(format!("reading {}: {e}", work.path.display()))
        })?;
        let key = work.path.to_string_lossy();
        let size = body.len();

        self.store
            .put(&self.bucket, &key, Bytes::from(body))
            .await
            .map_err(failed)?;

        tracing::debug!(bucket = %self.bucket, %key, size, "uploaded");
        Ok(work.path)
    }
}
