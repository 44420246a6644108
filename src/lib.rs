//! Fabricator - Media job orchestration
//!
//! Downloads a remote video, transcodes it into multi-variant HLS and uploads
//! every emitted file to object storage as soon as it stops changing.
//!
//! Hexagonal Architecture:
//! - domain/: Pure types (jobs, hls profile)
//! - ports/: Trait definitions for fetching, transcoding and storage
//! - adapters/: Concrete implementations (HTTP, child process, filesystem, S3)
//! - application/: Actors (pools, monitor, saga, orchestrator, dead letters)
//! - config: Environment configuration
//! - telemetry: Tracing subscriber setup
//!
//! # Features
//! - `aws`: S3 object store backed by `aws-sdk-s3`

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
pub mod telemetry;

pub use application::orchestrator::{Orchestrator, OrchestratorHandle, Services};
pub use config::AppConfig;
