//! Configuration for the fabricator process.

use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Errors raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Where uploaded segments are stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Local directory acting as a bucket store
    Fs,
    /// AWS S3 (requires the `aws` feature)
    S3,
}

/// Process-wide configuration.
#[derive(Clone, Debug, Serialize)]
pub struct AppConfig {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: u16,
    /// Base directory for downloads to go into
    pub download_dir: PathBuf,
    /// Base directory for transcoder output to go into
    pub output_dir: PathBuf,
    /// Name of the upload bucket
    pub upload_bucket: String,
    /// Size of the in-memory download buffer, in bytes
    pub download_buffer_size: usize,
    pub num_downloaders: usize,
    pub num_uploaders: usize,
    pub num_transcoders: usize,
    pub storage_backend: StorageBackend,
    /// Root directory for the `fs` storage backend
    pub storage_dir: PathBuf,
    /// Executable used for transcoding
    pub transcoder_program: String,
    /// Target HLS segment length, in seconds
    pub hls_segment_seconds: u32,
    #[serde(serialize_with = "as_millis")]
    pub monitor_poll_interval: Duration,
    #[serde(serialize_with = "as_millis")]
    pub monitor_quiet_period: Duration,
    #[serde(serialize_with = "as_millis")]
    pub completion_check_interval: Duration,
    #[serde(serialize_with = "as_millis")]
    pub upload_retry_delay: Duration,
    /// Total upload attempts per file before the job fails
    pub upload_max_attempts: u32,
    /// Upper bound on a single pool work item. `None` disables it.
    #[serde(serialize_with = "as_millis_opt")]
    pub work_timeout: Option<Duration>,
    /// Directory for the debug log file. Console only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            addr: String::from("0.0.0.0"),
            port: 10104,
            download_dir: PathBuf::from("Input"),
            output_dir: PathBuf::from("Output"),
            upload_bucket: String::from("hls-segments"),
            download_buffer_size: 1024,
            num_downloaders: 12,
            num_uploaders: 12,
            num_transcoders: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            storage_backend: StorageBackend::Fs,
            storage_dir: PathBuf::from("Storage"),
            transcoder_program: String::from("ffmpeg"),
            hls_segment_seconds: 2,
            monitor_poll_interval: Duration::from_secs(2),
            monitor_quiet_period: Duration::from_secs(2),
            completion_check_interval: Duration::from_secs(2),
            upload_retry_delay: Duration::from_secs(2),
            upload_max_attempts: 3,
            work_timeout: None,
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from `.env` and environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup. Missing keys keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |key: &str, default: String| lookup(key).unwrap_or(default);
        let path = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);

        let storage_backend = match lookup("STORAGE_BACKEND").as_deref() {
            None | Some("fs") => StorageBackend::Fs,
            Some("s3") => StorageBackend::S3,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORAGE_BACKEND",
                    value: other.to_string(),
                    reason: "expected `fs` or `s3`".to_string(),
                })
            }
        };

        let work_timeout_secs: u64 = parse(&lookup, "WORK_TIMEOUT_SECS", 0)?;

        Ok(Self {
            addr: string("ADDR", defaults.addr),
            port: parse(&lookup, "PORT", defaults.port)?,
            download_dir: path("DOWNLOAD_DIR", defaults.download_dir),
            output_dir: path("OUTPUT_DIR", defaults.output_dir),
            upload_bucket: string("UPLOAD_BUCKET", defaults.upload_bucket),
            download_buffer_size: positive(
                &lookup,
                "DOWNLOAD_BUFFER_SIZE",
                defaults.download_buffer_size,
            )?,
            num_downloaders: positive(&lookup, "NUM_DOWNLOADERS", defaults.num_downloaders)?,
            num_uploaders: positive(&lookup, "NUM_UPLOADERS", defaults.num_uploaders)?,
            num_transcoders: positive(&lookup, "NUM_TRANSCODERS", defaults.num_transcoders)?,
            storage_backend,
            storage_dir: path("STORAGE_DIR", defaults.storage_dir),
            transcoder_program: string("TRANSCODER_PROGRAM", defaults.transcoder_program),
            hls_segment_seconds: positive(
                &lookup,
                "HLS_SEGMENT_SECONDS",
                defaults.hls_segment_seconds,
            )?,
            monitor_poll_interval: millis(&lookup, "MONITOR_POLL_MS", defaults.monitor_poll_interval)?,
            monitor_quiet_period: millis(&lookup, "MONITOR_QUIET_MS", defaults.monitor_quiet_period)?,
            completion_check_interval: millis(
                &lookup,
                "COMPLETION_CHECK_MS",
                defaults.completion_check_interval,
            )?,
            upload_retry_delay: millis(&lookup, "UPLOAD_RETRY_DELAY_MS", defaults.upload_retry_delay)?,
            upload_max_attempts: positive(
                &lookup,
                "UPLOAD_MAX_ATTEMPTS",
                defaults.upload_max_attempts,
            )?,
            work_timeout: (work_timeout_secs > 0).then(|| Duration::from_secs(work_timeout_secs)),
            log_dir: lookup("LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn positive<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialEq + Default + Copy + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let value = parse(lookup, key, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn millis<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let ms: u64 = positive(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

fn as_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

fn as_millis_opt<S: serde::Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}
