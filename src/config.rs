//! TOML configuration for the activity monitor daemon.
//!
//! Every section has compiled-in defaults, so an empty or partial file is
//! valid. The file is located via `--config`, the `ACTIVITYMONITOR_CONFIG`
//! environment variable or `./activitymonitor.toml`, in that order.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ACTIVITYMONITOR_CONFIG";

/// Config file looked for in the working directory.
pub const LOCAL_CONFIG: &str = "activitymonitor.toml";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("queue.max_concurrent_workers must be greater than zero")]
    NoWorkers,

    #[error("queue.max_queue_size must be greater than zero")]
    NoQueueCapacity,

    #[error("capture.frame_rate must be greater than zero")]
    NoFrameRate,

    #[error("sampling.interval_secs must be greater than zero")]
    NoSamplingInterval,

    #[error("invalid sampling.periodic_cron '{expr}': {reason}")]
    BadCron { expr: String, reason: String },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the daemon and CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults,
}

/// A config file that was tried and passed over.
#[derive(Debug)]
pub struct SkippedSource {
    pub path: PathBuf,
    pub error: anyhow::Error,
}

/// A resolved configuration plus how it was found.
///
/// Resolution runs before the subscriber exists, so nothing is logged while
/// loading; call [`LoadedConfig::log`] once tracing is initialised.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: MonitorConfig,
    pub source: ConfigSource,
    pub skipped: Vec<SkippedSource>,
}

impl LoadedConfig {
    pub fn log(&self) {
        for skipped in &self.skipped {
            let error = format!("{:#}", skipped.error);
            warn!(
                path = %skipped.path.display(),
                error = %error,
                "config file could not be loaded, trying next source"
            );
        }
        match &self.source {
            ConfigSource::File(path) => info!(path = %path.display(), "loaded configuration"),
            ConfigSource::Defaults => debug!("no config file found, using compiled-in defaults"),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Resolve and load the configuration.
    ///
    /// An explicit path must load; the environment variable and the local
    /// file fall through to the next source and are reported in
    /// [`LoadedConfig::skipped`].
    pub fn load_or_default(explicit: Option<&Path>) -> Result<LoadedConfig> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::resolve(explicit, env_path.as_deref(), Path::new(LOCAL_CONFIG))
    }

    fn resolve(explicit: Option<&Path>, env_path: Option<&Path>, local: &Path) -> Result<LoadedConfig> {
        // 1. Command line.
        if let Some(path) = explicit {
            return Ok(LoadedConfig {
                config: Self::load(path)?,
                source: ConfigSource::File(path.to_path_buf()),
                skipped: Vec::new(),
            });
        }

        let mut skipped = Vec::new();

        // 2. Environment variable override, then 3. working directory.
        let candidates = env_path.into_iter().chain(Some(local).filter(|p| p.exists()));
        for path in candidates {
            match Self::load(path) {
                Ok(config) => {
                    return Ok(LoadedConfig {
                        config,
                        source: ConfigSource::File(path.to_path_buf()),
                        skipped,
                    })
                }
                Err(error) => skipped.push(SkippedSource {
                    path: path.to_path_buf(),
                    error,
                }),
            }
        }

        // 4. Defaults.
        Ok(LoadedConfig {
            config: Self::default(),
            source: ConfigSource::Defaults,
            skipped,
        })
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.max_concurrent_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::NoQueueCapacity);
        }
        if self.capture.frame_rate == 0 {
            return Err(ConfigError::NoFrameRate);
        }
        if self.sampling.interval_secs == 0 {
            return Err(ConfigError::NoSamplingInterval);
        }
        self.sampling.schedule()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// How often sensors are read and what turns into a capture request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Seconds between sensor samples.
    pub interval_secs: u64,
    /// Idle time after which the user counts as away.
    pub idle_threshold_secs: u64,
    /// Six-field cron expression for periodic monitoring captures.
    pub periodic_cron: String,
    /// Minimum spacing of focus/idle triggered captures. Periodic captures
    /// are never throttled.
    pub min_trigger_interval_secs: u64,
}

impl SamplingConfig {
    pub fn schedule(&self) -> Result<cron::Schedule, ConfigError> {
        cron::Schedule::from_str(&self.periodic_cron).map_err(|e| ConfigError::BadCron {
            expr: self.periodic_cron.clone(),
            reason: e.to_string(),
        })
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            idle_threshold_secs: 300,
            periodic_cron: "0 */3 * * * *".to_string(),
            min_trigger_interval_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Screen capture command and clip shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Screenshot tool writing one encoded image to stdout.
    pub program: String,
    pub args: Vec<String>,
    /// Frames per second.
    pub frame_rate: u32,
    pub max_duration_secs: u32,
    pub max_frames_per_capture: u32,
    pub trigger_on_focus_change: bool,
    pub trigger_on_idle_resume: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: "import".to_string(),
            args: vec!["-window".into(), "root".into(), "jpeg:-".into()],
            frame_rate: 1,
            max_duration_secs: 30,
            max_frames_per_capture: 30,
            trigger_on_focus_change: true,
            trigger_on_idle_resume: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

/// Ollama backend and sampling options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    /// Maximum tokens generated per response.
    pub num_predict: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "qwen2.5-vl:3b".to_string(),
            temperature: 0.1,
            top_p: 0.9,
            num_predict: 512,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Admission and dispatch limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent_workers: usize,
    pub max_queue_size: usize,
    /// Accepted for compatibility; scheduling does not read it.
    pub high_priority_threshold: u32,
    /// Accepted for compatibility; requests are not timed out.
    pub processing_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 4,
            max_queue_size: 100,
            high_priority_threshold: 10,
            processing_timeout_secs: 120,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub compaction_interval_hours: u64,
    /// Activity events older than this are deleted by compaction.
    pub max_event_age_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/activitymonitor.db"),
            compaction_interval_hours: 24,
            max_event_age_days: 90,
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
