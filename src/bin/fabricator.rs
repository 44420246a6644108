//! Fabricator Binary - single-process job server
//!
//! Wires up:
//! - HTTP fetcher, child-process transcoder and the configured object store
//! - Download, transcode and upload pools behind the orchestrator
//! - Fault monitor for dead letters
//! - HTTP front-end accepting `POST /api/job`

use fabricator::adapters::local::{http, FsObjectStore, HttpFetcher, ProcessTranscoder};
use fabricator::application::dead_letters::{DeadLetters, FaultMonitor};
use fabricator::config::{AppConfig, StorageBackend};
use fabricator::ports::ObjectStore;
use fabricator::{telemetry, Orchestrator, Services};
use std::error::Error;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = AppConfig::from_env()?;

    if let Some(path) = telemetry::init_tracing(config.log_dir.as_deref())? {
        tracing::info!(path = %path.display(), "writing debug log");
    }
    tracing::info!(config = %serde_json::to_string(&config)?, "configuration loaded");

    // 1. Adapters
    let store = object_store(&config).await?;
    let services = Services {
        fetcher: Arc::new(HttpFetcher::new()),
        transcoder: Arc::new(ProcessTranscoder::new()),
        store,
    };

    // 2. Dead letters
    let dead_letters = DeadLetters::new();
    FaultMonitor::spawn(&dead_letters);

    // 3. Orchestrator and pools
    let orchestrator = Orchestrator::start(config.clone(), services, dead_letters).await?;

    // 4. HTTP front-end
    let app = http::router(orchestrator);
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.addr, config.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shut down");
    Ok(())
}

async fn object_store(config: &AppConfig) -> Result<Arc<dyn ObjectStore>, Box<dyn Error>> {
    match config.storage_backend {
        StorageBackend::Fs => {
            tracing::info!(root = %config.storage_dir.display(), "using filesystem object store");
            Ok(Arc::new(FsObjectStore::new(config.storage_dir.clone())))
        }
        #[cfg(feature = "aws")]
        StorageBackend::S3 => {
            tracing::info!("using S3 object store");
            Ok(Arc::new(
                fabricator::adapters::aws::s3::S3ObjectStore::from_env().await,
            ))
        }
        #[cfg(not(feature = "aws"))]
        StorageBackend::S3 => Err("STORAGE_BACKEND=s3 requires the `aws` feature".into()),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
