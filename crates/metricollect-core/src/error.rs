//! Error types for metricollect-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for metricollect-core
#[derive(Error, Debug)]
pub enum Error {
    /// Application name is not registered
    #[error("Application '{0}' not found")]
    UnknownApplication(String),

    /// Framed pipe channel errors
    #[error("Channel error: {0}")]
    Frame(#[from] FrameError),

    /// Worker process lifecycle errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Metric definition / evaluation errors
    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    /// A publisher rejected a metric
    #[error("Publish failed: {0}")]
    Publish(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Return remediation guidance for this error.
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::UnknownApplication(name) => Remediation::new(format!(
                "Application '{name}' is not registered. Use a configured application name."
            ))
            .command("List config", "mcollect config")
            .alternative("Add an [[applications]] table to the config file."),
            Self::Frame(err) => err.remediation(),
            Self::Worker(err) => err.remediation(),
            Self::Config(err) => err.remediation(),
            Self::Metric(err) => err.remediation(),
            Self::Publish(_) => Remediation::new(
                "A publisher failed. Check the publisher configuration and retry.",
            )
            .command("Publish once", "mcollect publish <app> <metric-id>")
            .alternative("Switch the application to the `log` publisher to isolate the sink."),
            Self::Io(_) => Remediation::new("Check filesystem permissions and paths, then retry.")
                .command("Check run dir", "ls -ld \"$XDG_RUNTIME_DIR\"")
                .alternative("Set [general].run_dir to a writable directory."),
        }
    }
}

/// Framed pipe channel errors
#[derive(Error, Debug)]
pub enum FrameError {
    /// Payload exceeds the 4-digit length prefix
    #[error("Message too long ({len} > 9999)")]
    PayloadTooLarge { len: usize },

    /// Length prefix is not four ASCII digits
    #[error("Invalid length prefix: {0:?}")]
    InvalidLength(String),

    /// Payload is not valid UTF-8
    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    /// Peer closed its end of the pipe
    #[error("Channel closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] filedescriptor::Error),
}

impl FrameError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::PayloadTooLarge { .. } => Remediation::new(
                "Metric ids must fit in 9999 bytes. Shorten the namespace or name.",
            )
            .command("List metric ids", "mcollect list <app>"),
            Self::InvalidLength(_) | Self::InvalidUtf8 => Remediation::new(
                "A worker sent a malformed frame. Restart the runner.",
            )
            .command("Reap stale instances", "mcollect reap <app>"),
            Self::Closed => Remediation::new("A worker process exited unexpectedly.")
                .command("Run with debug logs", "RUST_LOG=debug mcollect run <app>")
                .alternative("Check the metric commands for crashes."),
            Self::Io(_) | Self::Descriptor(_) => Remediation::new(
                "Pipe I/O failed. Check the file descriptor limit and retry.",
            )
            .command("Check fd limit", "ulimit -n"),
        }
    }
}

/// Worker process lifecycle errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("fork failed: {0}")]
    Fork(nix::errno::Errno),

    #[error("waiting for child {pid} failed: {source}")]
    Wait { pid: i32, source: nix::errno::Errno },


    #[error("failed to spawn dispatch thread: {0}")]
    Thread(String),
}

impl WorkerError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Fork(_) => Remediation::new(
                "Could not fork a worker. Lower max_workers or raise the process limit.",
            )
            .command("Check process limit", "ulimit -u"),
            Self::Wait { .. } => Remediation::new(
                "Worker process management failed. Reap stale instances and restart.",
            )
            .command("Reap stale instances", "mcollect reap <app>"),
            Self::Thread(_) => Remediation::new(
                "Could not start a dispatch thread. Lower max_workers or raise the thread limit.",
            )
            .command("Check thread limit", "cat /proc/sys/kernel/threads-max"),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\"")),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax.")
                .command("Print a default config", "mcollect config"),
            Self::SerializeFailed(_) => Remediation::new("Failed to serialize configuration.")
                .command("Print a default config", "mcollect config"),
            Self::ValidationError(_) => Remediation::new(
                "Config validation failed. Check worker counts (1 <= min <= initial <= max) and names.",
            )
            .command("Print a default config", "mcollect config"),
        }
    }
}

/// Metric definition / evaluation errors
#[derive(Error, Debug)]
pub enum MetricError {
    #[error("Metric '{0}' has already been defined")]
    Duplicate(String),

    #[error("Metric '{0}' has not been defined")]
    NotFound(String),

    #[error("Metric '{id}' produced an invalid value: {reason}")]
    InvalidValue { id: String, reason: String },

    #[error("Metric '{id}' command failed: {reason}")]
    CommandFailed { id: String, reason: String },
}

impl MetricError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Duplicate(_) => Remediation::new("Metric ids must be unique per application.")
                .alternative("Rename the metric or move it to another namespace."),
            Self::NotFound(_) => Remediation::new("Use an id from the application's metric list.")
                .command("List metric ids", "mcollect list <app>"),
            Self::InvalidValue { .. } | Self::CommandFailed { .. } => Remediation::new(
                "The metric value source failed. Run its command by hand and check the output is a number.",
            )
            .command("Publish once", "mcollect publish <app> <metric-id>"),
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    output.push('\n');
    output.push('\n');
    output.push_str(&error.remediation().render_plain());
    output
}
