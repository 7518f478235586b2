//! Configuration management for metricollect
//!
//! Handles loading and validation of `metricollect.toml` files:
//!
//! ```toml
//! [general]
//! log_level = "info"
//! run_dir = "/run/user/1000/metricollect"
//!
//! [runner]
//! frequency_secs = 120
//! initial_workers = 2
//!
//! [[applications]]
//! name = "web"
//! prefix = "production"
//! publishers = ["log"]
//!
//! [[applications.metrics]]
//! namespace = "System"
//! name = "LoadAverage"
//! roles = ["web"]
//! command = "cut -d' ' -f1 /proc/loadavg"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::application::MetricApplication;
use crate::error::{ConfigError, Result};
use crate::logging::{LogConfig, LogFormat};
use crate::metric::{MetricDefinition, Unit};
use crate::publisher::PublisherRegistry;
use crate::reaper::PidFile;
use crate::registry::Registry;
use crate::runner::RunnerOptions;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Scheduling settings
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Application definitions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<ApplicationConfig>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional append-only log file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Directory holding PID files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
            run_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    /// Seconds between cycles
    #[serde(default = "default_frequency_secs")]
    pub frequency_secs: u64,

    /// Role filter (empty = all metrics)
    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default = "default_initial_workers")]
    pub initial_workers: usize,

    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Stop after this many cycles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,

    /// Reap stale instances before starting
    #[serde(default = "default_true")]
    pub reap_stale: bool,

    /// Seconds to wait for stale instances after SIGTERM
    #[serde(default = "default_reap_grace_secs")]
    pub reap_grace_secs: u64,

    /// Seconds between liveness polls while reaping
    #[serde(default = "default_reap_poll_secs")]
    pub reap_poll_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            frequency_secs: default_frequency_secs(),
            roles: Vec::new(),
            initial_workers: default_initial_workers(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            iterations: None,
            reap_stale: true,
            reap_grace_secs: default_reap_grace_secs(),
            reap_poll_secs: default_reap_poll_secs(),
        }
    }
}

fn default_frequency_secs() -> u64 {
    120
}

fn default_initial_workers() -> usize {
    2
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_reap_grace_secs() -> u64 {
    10
}

fn default_reap_poll_secs() -> u64 {
    1
}

/// One `[[applications]]` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    pub name: String,

    /// Namespace prefix for every metric id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Publisher names
    #[serde(default = "default_publishers")]
    pub publishers: Vec<String>,

    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

fn default_publishers() -> Vec<String> {
    vec!["log".to_string()]
}

/// One `[[applications.metrics]]` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricConfig {
    pub namespace: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,

    #[serde(default)]
    pub unit: Unit,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<String, String>,

    /// Constant value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    /// Shell pipeline printing the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl MetricConfig {
    fn definition(&self) -> std::result::Result<MetricDefinition, ConfigError> {
        let mut definition = MetricDefinition::new(&self.namespace, &self.name)
            .roles(self.roles.iter().cloned())
            .unit(self.unit);
        for (key, value) in &self.dimensions {
            definition = definition.dimension(key, value);
        }
        match (&self.value, &self.command) {
            (Some(value), None) => Ok(definition.value(*value)),
            (None, Some(command)) => Ok(definition.command(command)),
            _ => Err(ConfigError::ValidationError(format!(
                "metric {}/{} needs exactly one of `value` or `command`",
                self.namespace, self.name
            ))),
        }
    }
}

/// Default PID file directory: the runtime dir, else the temp dir.
pub fn default_run_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("metricollect")
}

/// Default config file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("metricollect").join("metricollect.toml"))
}

impl Config {
    /// Load from `path`, or from the default location when it exists, or
    /// fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ReadFailed(path.display().to_string(), e.to_string())
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate TOML.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))?)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.runner_options_base().validate()?;

        let mut names = HashSet::new();
        for app in &self.applications {
            if app.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "application name must not be empty".to_string(),
                ));
            }
            if !names.insert(app.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate application '{}'",
                    app.name
                )));
            }
            for metric in &app.metrics {
                metric.definition()?;
            }
        }
        Ok(())
    }

    pub fn run_dir(&self) -> PathBuf {
        self.general.run_dir.clone().unwrap_or_else(default_run_dir)
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.general.log_level.clone(),
            format: self.general.log_format,
            file: self.general.log_file.clone(),
        }
    }

    fn runner_options_base(&self) -> RunnerOptions {
        let runner = &self.runner;
        RunnerOptions {
            frequency: Duration::from_secs(runner.frequency_secs),
            roles: runner.roles.clone(),
            initial_workers: runner.initial_workers,
            min_workers: runner.min_workers,
            max_workers: runner.max_workers,
            iterations: runner.iterations,
            reap_stale: runner.reap_stale,
            pid_file: None,
            reap_grace: Duration::from_secs(runner.reap_grace_secs),
            reap_poll: Duration::from_secs(runner.reap_poll_secs),
        }
    }

    /// Runner options for `app`, with its PID file under [`Config::run_dir`].
    pub fn runner_options(&self, app: &str) -> RunnerOptions {
        RunnerOptions {
            pid_file: Some(PidFile::for_app(&self.run_dir(), app).path().to_path_buf()),
            ..self.runner_options_base()
        }
    }

    /// Build applications wired to the built-in publishers.
    pub fn build_registry(&self) -> Result<Registry> {
        self.build_registry_with(PublisherRegistry::default())
    }

    /// Build applications wired to publishers looked up in `publishers`.
    pub fn build_registry_with(&self, publishers: PublisherRegistry) -> Result<Registry> {
        let mut registry = Registry::with_publishers(publishers);
        for app_config in &self.applications {
            let mut app = MetricApplication::new(&app_config.name)
                .with_prefix(app_config.prefix.clone().unwrap_or_default());

            for name in &app_config.publishers {
                let publisher = registry.publishers().get(name).map_err(|_| {
                    ConfigError::ValidationError(format!(
                        "application '{}' uses unknown publisher '{name}'",
                        app_config.name
                    ))
                })?;
                app.add_publisher(publisher);
            }

            for metric in &app_config.metrics {
                app.define(metric.definition()?)?;
            }
            registry.register(Arc::new(app));
        }
        Ok(registry)
    }
}
