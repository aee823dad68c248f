//! Configuration structures for CoreLoop
//!
//! Configurations are loaded from YAML files. [`CoreLoopConfig::load`] additionally
//! layers `CORELOOP__<SECTION>__<KEY>` environment variables on top of the file.

use crate::error::{CoreLoopError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the dispatcher binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreLoopConfig {
    /// Dispatcher and queue settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Model artifact settings
    pub model: ModelConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Dispatcher-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Cores to spawn workers on: "auto", a list ("0,2,5") or ranges ("0-3")
    #[serde(default = "default_cores")]
    pub cores: String,

    /// Maximum queue size (None = unbounded)
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// Prefix for worker thread names
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            cores: default_cores(),
            queue_capacity: None,
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Compiled artifact loaded by every worker
    pub artifact_path: PathBuf,

    /// Source graph, compiled into `artifact_path` when the artifact is missing
    #[serde(default)]
    pub graph_path: Option<PathBuf>,

    /// Rows per request when splitting inputs for data-parallel inference
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Weight storage type used when compiling
    #[serde(default)]
    pub weight_dtype: WeightDType,
}

/// Weight storage type inside a compiled artifact
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WeightDType {
    /// Full precision
    #[default]
    F32,

    /// Half precision (weights are cast at compile time)
    F16,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Print Prometheus metrics after a run
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
            structured_logging: false,
        }
    }
}

fn default_cores() -> String {
    "auto".to_string()
}

fn default_thread_name_prefix() -> String {
    "coreloop-worker".to_string()
}

fn default_batch_size() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl CoreLoopConfig {
    /// Build a configuration for an artifact with every other field defaulted
    pub fn for_artifact<P: Into<PathBuf>>(artifact_path: P) -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            model: ModelConfig {
                artifact_path: artifact_path.into(),
                graph_path: None,
                batch_size: default_batch_size(),
                weight_dtype: WeightDType::default(),
            },
            observability: ObservabilityConfig::default(),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreLoopError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config = Self::from_yaml_str(&content).map_err(|e| {
            CoreLoopError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        Ok(config)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: CoreLoopConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file with `CORELOOP__*` environment overrides
    ///
    /// `CORELOOP__DISPATCHER__QUEUE_CAPACITY=64` overrides `dispatcher.queue_capacity`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix("CORELOOP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: CoreLoopConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.cores.trim().is_empty() {
            return Err(CoreLoopError::config("dispatcher.cores must not be empty"));
        }

        if self.dispatcher.queue_capacity == Some(0) {
            return Err(CoreLoopError::config(
                "dispatcher.queue_capacity must be at least 1 (omit it for an unbounded queue)",
            ));
        }

        if self.dispatcher.thread_name_prefix.is_empty() {
            return Err(CoreLoopError::config("dispatcher.thread_name_prefix must not be empty"));
        }

        if self.model.batch_size == 0 {
            return Err(CoreLoopError::config("model.batch_size must be at least 1"));
        }

        if self.model.artifact_path.as_os_str().is_empty() {
            return Err(CoreLoopError::config("model.artifact_path must not be empty"));
        }

        match self.observability.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(CoreLoopError::config(format!("Invalid log level: {}", other))),
        }
    }
}
