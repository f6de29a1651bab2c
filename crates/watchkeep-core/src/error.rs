//! Error types for watchkeep-core

use std::fmt::Write;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::ErrorClass;

/// Remediation command for resolving an error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
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

/// Coarse failure taxonomy used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network, timeout, rate limit: absorbed by the retry policy.
    RetryableTransient,
    /// Authentication and other non-retryable provider failures.
    Fatal,
    /// A malformed per-sample result; kept but down-weighted.
    DataQuality,
    /// Too few valid samples to produce a consensus report.
    InsufficientData,
    /// Repeated failures crossing health thresholds.
    SystemHealth,
    /// Invalid or unreadable configuration.
    Configuration,
    /// Anything else (I/O, serialization, runtime plumbing).
    Internal,
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for watchkeep-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Capture or analysis provider errors
    #[error("Provider error: {0}")]
    Analysis(#[from] AnalysisError),

    /// Consensus synthesis errors
    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    /// Alert lifecycle errors
    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    /// Storage collaborator errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Scheduling halted by the emergency shutdown threshold
    #[error("Scheduling halted after {consecutive_failures} consecutive failures")]
    SchedulingHalted { consecutive_failures: u32 },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task joins, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Classify this error into the propagation taxonomy.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Analysis(err) => err.class.category(),
            Self::Synthesis(err) => err.category(),
            Self::SchedulingHalted { .. } => ErrorCategory::SystemHealth,
            Self::Alert(_) | Self::Storage(_) | Self::Io(_) | Self::Json(_) | Self::Runtime(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Analysis(err) => Some(err.remediation()),
            Self::Synthesis(err) => Some(err.remediation()),
            Self::Alert(_) => Some(
                Remediation::new("Alert not found. List alerts and use a known id.")
                    .command("Validate config", "wk config check"),
            ),
            Self::Storage(_) => Some(
                Remediation::new("Storage collaborator failed. Check its availability and retry.")
                    .command("Validate config", "wk config check")
                    .alternative("Reports are kept in memory until storage recovers."),
            ),
            Self::SchedulingHalted { .. } => Some(
                Remediation::new(
                    "Capture scheduling halted after repeated failures. Fix the provider, then resume.",
                )
                .command("Inspect schedule", "wk resolve")
                .alternative("Raise health.emergency_shutdown_threshold if failures are expected."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Validate config", "wk config check"),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Restart the monitoring loop or retry the command.")
                    .command("Validate config", "wk config check"),
            ),
        }
    }
}

/// Failure reported by the capture or analysis collaborator.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{class} failure: {message}")]
pub struct AnalysisError {
    /// Failure class driving the retry decision
    pub class: ErrorClass,
    /// Provider-supplied detail
    pub message: String,
    /// Provider-advertised retry-after (rate limits)
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration_ms")]
    pub retry_after: Option<Duration>,
}

impl AnalysisError {
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            class: ErrorClass::RateLimit,
            message: message.into(),
            retry_after,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self.class {
            ErrorClass::Auth => Remediation::new(
                "The provider rejected our credentials. Update them before resuming.",
            )
            .command("Validate config", "wk config check")
            .alternative("Rotate the provider API key."),
            ErrorClass::RateLimit => {
                Remediation::new("The provider is rate limiting requests. Lower the capture cadence.")
                    .command("Inspect schedule", "wk resolve")
                    .alternative("Add an override with a longer interval.")
            }
            ErrorClass::Malformed => {
                Remediation::new("The provider returned a malformed result. Check the model output.")
                    .command("Re-run synthesis", "wk synthesize samples.json")
            }
            ErrorClass::Network | ErrorClass::Timeout | ErrorClass::Unknown => {
                Remediation::new("Transient provider failure. Retries are automatic.")
                    .command("Retry plan", "wk retry-plan")
                    .alternative("Check network connectivity to the provider.")
            }
        }
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Consensus synthesis errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("expected a sequence of {expected} samples, got {actual}")]
    SequenceLength { expected: usize, actual: usize },

    #[error("only {valid} valid samples, at least {required} required")]
    InsufficientData { valid: usize, required: usize },
}

impl SynthesisError {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SequenceLength { .. } => "synthesis_sequence_length",
            Self::InsufficientData { .. } => "synthesis_insufficient_data",
        }
    }

    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::SequenceLength { .. } => ErrorCategory::Internal,
            Self::InsufficientData { .. } => ErrorCategory::InsufficientData,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::SequenceLength { expected, .. } => Remediation::new(format!(
                "Provide exactly {expected} samples, ordered by sequence index."
            ))
            .command("Show config", "wk config show"),
            Self::InsufficientData { required, .. } => Remediation::new(format!(
                "Too few valid samples. At least {required} must pass validation."
            ))
            .command("Re-run synthesis", "wk synthesize samples.json")
            .alternative("Inspect the reliability section of earlier reports for failing samples."),
        }
    }
}

/// Alert lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlertError {
    #[error("Alert not found: {0}")]
    NotFound(String),
}

/// Storage collaborator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    WriteRejected(String),
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

    #[error("Overrides {first} and {second} can be active at the same time")]
    OverlappingOverrides { first: String, second: String },
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
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Validate config", "wk config check")
                .alternative("Start from the defaults printed by `wk config show`."),
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
                    .command("Show defaults", "wk config show")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Validate config", "wk config check")
            }
            Self::OverlappingOverrides { first, second } => Remediation::new(format!(
                "Make overrides {first} and {second} disjoint in time."
            ))
            .command("Preview transitions", "wk timeline --hours 48")
            .alternative("Set schedule.reject_overlapping_overrides = false to let the first one win."),
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
