//! Configuration management for watchkeep
//!
//! Loads `watchkeep.toml` (or `.yaml`/`.yml`) once at startup. Every section
//! has serde defaults, so an empty file is a valid configuration. The loaded
//! value is treated as read-only for the lifetime of a run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::{LogConfig, LogLevel};
pub use crate::schedule::ScheduleConfig;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LogConfig,

    /// Day/night periods, overrides and maintenance windows
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// HealthMonitor thresholds
    #[serde(default)]
    pub health: HealthConfig,

    /// Consensus synthesis parameters
    #[serde(default)]
    pub synthesis: SynthesisConfig,

    /// Control loop settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Health thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Sliding window of recent outcomes per mode
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,

    #[serde(default = "default_recovery_delay_minutes")]
    pub recovery_delay_minutes: u32,

    /// Success-rate floor in `[0, 1]`
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,

    /// Outcomes required before the success-rate floor is checked
    #[serde(default = "default_min_outcomes_for_rate")]
    pub min_outcomes_for_rate: usize,

    #[serde(default = "default_max_average_response_secs")]
    pub max_average_response_secs: f64,

    /// Storage usage ceiling in percent
    #[serde(default = "default_max_storage_usage")]
    pub max_storage_usage_percent: f64,

    /// Global consecutive failures that halt scheduling
    #[serde(default = "default_emergency_shutdown_threshold")]
    pub emergency_shutdown_threshold: u32,

    #[serde(default = "default_check_interval_minutes")]
    pub check_interval_minutes: u32,

    /// Activity older than this scores zero freshness
    #[serde(default = "default_freshness_window_minutes")]
    pub freshness_window_minutes: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_recovery_attempts: default_max_recovery_attempts(),
            recovery_delay_minutes: default_recovery_delay_minutes(),
            min_success_rate: default_min_success_rate(),
            min_outcomes_for_rate: default_min_outcomes_for_rate(),
            max_average_response_secs: default_max_average_response_secs(),
            max_storage_usage_percent: default_max_storage_usage(),
            emergency_shutdown_threshold: default_emergency_shutdown_threshold(),
            check_interval_minutes: default_check_interval_minutes(),
            freshness_window_minutes: default_freshness_window_minutes(),
        }
    }
}

fn default_window_size() -> usize {
    20
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_max_recovery_attempts() -> u32 {
    4
}

fn default_recovery_delay_minutes() -> u32 {
    5
}

fn default_min_success_rate() -> f64 {
    0.8
}

fn default_min_outcomes_for_rate() -> usize {
    5
}

fn default_max_average_response_secs() -> f64 {
    30.0
}

fn default_max_storage_usage() -> f64 {
    85.0
}

fn default_emergency_shutdown_threshold() -> u32 {
    10
}

fn default_check_interval_minutes() -> u32 {
    15
}

fn default_freshness_window_minutes() -> u32 {
    120
}

/// Synthesis parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// N: samples per consensus sequence
    #[serde(default = "default_sequence_length")]
    pub sequence_length: usize,

    /// Minimum valid samples = ceil(N * fraction)
    #[serde(default = "default_min_valid_fraction")]
    pub min_valid_fraction: f64,

    /// Divergence at or above which a sample is an outlier
    #[serde(default = "default_outlier_threshold")]
    pub outlier_threshold: f64,

    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f64,

    #[serde(default = "default_strong_agreement")]
    pub strong_agreement: f64,

    #[serde(default = "default_moderate_agreement")]
    pub moderate_agreement: f64,

    /// Health-score delta (points) that counts as a move
    #[serde(default = "default_health_trend_threshold")]
    pub health_trend_threshold: f64,

    /// Mean risk-level delta that counts as a move
    #[serde(default = "default_risk_trend_threshold")]
    pub risk_trend_threshold: f64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            sequence_length: default_sequence_length(),
            min_valid_fraction: default_min_valid_fraction(),
            outlier_threshold: default_outlier_threshold(),
            low_confidence_threshold: default_low_confidence_threshold(),
            strong_agreement: default_strong_agreement(),
            moderate_agreement: default_moderate_agreement(),
            health_trend_threshold: default_health_trend_threshold(),
            risk_trend_threshold: default_risk_trend_threshold(),
        }
    }
}

impl SynthesisConfig {
    /// Minimum valid samples for a report.
    #[must_use]
    pub fn min_valid_samples(&self) -> usize {
        let required = (self.sequence_length as f64 * self.min_valid_fraction).ceil() as usize;
        required.clamp(1, self.sequence_length.max(1))
    }
}

fn default_sequence_length() -> usize {
    10
}

fn default_min_valid_fraction() -> f64 {
    0.5
}

fn default_outlier_threshold() -> f64 {
    0.5
}

fn default_low_confidence_threshold() -> f64 {
    0.5
}

fn default_strong_agreement() -> f64 {
    0.8
}

fn default_moderate_agreement() -> f64 {
    0.6
}

fn default_health_trend_threshold() -> f64 {
    5.0
}

fn default_risk_trend_threshold() -> f64 {
    0.5
}

/// Control loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Concurrent capture-and-analyze operations per subject
    #[serde(default = "default_max_concurrent_captures")]
    pub max_concurrent_captures: usize,

    /// Timer loop period
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Pause between samples inside one capture cycle
    #[serde(default = "default_sample_spacing_secs")]
    pub sample_spacing_secs: u64,

    /// Broadcast channel capacity for presentation events
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_captures: default_max_concurrent_captures(),
            tick_interval_secs: default_tick_interval_secs(),
            sample_spacing_secs: default_sample_spacing_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_concurrent_captures() -> usize {
    1
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_sample_spacing_secs() -> u64 {
    5
}

fn default_event_capacity() -> usize {
    256
}

fn check_fraction(name: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::ValidationError(format!(
            "{name} must be within 0.0..=1.0 (got {value})"
        )));
    }
    Ok(())
}

fn check_positive(name: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{name} must be positive"
        )));
    }
    Ok(())
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("health.window_size", self.window_size as u64)?;
        check_positive("health.max_consecutive_failures", self.max_consecutive_failures.into())?;
        check_positive("health.check_interval_minutes", self.check_interval_minutes.into())?;
        check_positive("health.freshness_window_minutes", self.freshness_window_minutes.into())?;
        check_fraction("health.min_success_rate", self.min_success_rate)?;
        if !(0.0..=100.0).contains(&self.max_storage_usage_percent) {
            return Err(ConfigError::ValidationError(format!(
                "health.max_storage_usage_percent must be within 0..=100 (got {})",
                self.max_storage_usage_percent
            )));
        }
        if !(self.max_average_response_secs.is_finite() && self.max_average_response_secs > 0.0) {
            return Err(ConfigError::ValidationError(
                "health.max_average_response_secs must be a positive number".to_string(),
            ));
        }
        if self.emergency_shutdown_threshold < self.max_consecutive_failures {
            return Err(ConfigError::ValidationError(format!(
                "health.emergency_shutdown_threshold ({}) must be >= max_consecutive_failures ({})",
                self.emergency_shutdown_threshold, self.max_consecutive_failures
            )));
        }
        Ok(())
    }
}

impl SynthesisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("synthesis.sequence_length", self.sequence_length as u64)?;
        check_fraction("synthesis.min_valid_fraction", self.min_valid_fraction)?;
        check_fraction("synthesis.outlier_threshold", self.outlier_threshold)?;
        check_fraction("synthesis.low_confidence_threshold", self.low_confidence_threshold)?;
        check_fraction("synthesis.strong_agreement", self.strong_agreement)?;
        check_fraction("synthesis.moderate_agreement", self.moderate_agreement)?;
        if self.moderate_agreement > self.strong_agreement {
            return Err(ConfigError::ValidationError(
                "synthesis.moderate_agreement must not exceed strong_agreement".to_string(),
            ));
        }
        if !(self.health_trend_threshold.is_finite() && self.health_trend_threshold >= 0.0)
            || !(self.risk_trend_threshold.is_finite() && self.risk_trend_threshold >= 0.0)
        {
            return Err(ConfigError::ValidationError(
                "synthesis trend thresholds must be non-negative numbers".to_string(),
            ));
        }
        Ok(())
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("orchestrator.max_concurrent_captures", self.max_concurrent_captures as u64)?;
        check_positive("orchestrator.tick_interval_secs", self.tick_interval_secs)?;
        check_positive("orchestrator.event_capacity", self.event_capacity as u64)?;
        Ok(())
    }
}

impl Config {
    /// `~/.config/watchkeep/watchkeep.toml`
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("watchkeep").join("watchkeep.toml"))
    }

    /// Parse configuration text. `yaml`/`yml` select YAML, anything else TOML.
    pub fn parse(content: &str, extension: Option<&str>) -> crate::Result<Self> {
        let config: Self = match extension {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                serde_yaml::from_str(content)
                    .map_err(|e| ConfigError::ParseFailed(e.to_string()))?
            }
            _ => toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?,
        };
        Ok(config)
    }

    /// Load and validate configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::parse(&content, path.extension().and_then(|e| e.to_str()))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from `path`, or from [`Config::default_path`] when `None`.
    ///
    /// A missing file at the default location yields defaults; a missing
    /// explicit path is an error.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.logging
            .level
            .parse::<LogLevel>()
            .map_err(ConfigError::ValidationError)?;
        self.schedule.validate()?;
        self.health.validate()?;
        self.synthesis.validate()?;
        self.orchestrator.validate()?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::schedule::{Quality, RetrySettings, SchedulePeriod};

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.window_size, 20);
        assert_eq!(config.health.emergency_shutdown_threshold, 10);
        assert_eq!(config.synthesis.sequence_length, 10);
        assert_eq!(config.orchestrator.max_concurrent_captures, 1);
    }

    #[test]
    fn empty_toml_is_default() {
        let config = Config::parse("", Some("toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::parse(
            r#"
[health]
max_consecutive_failures = 5

[schedule.night]
name = "overnight"
window = { start_hour = 21, end_hour = 5 }
interval_minutes = 90
samples_per_cycle = 8
quality = "low"

[[schedule.overrides]]
id = "vet"
start = "2026-03-01T08:00:00"
end = "2026-03-01T12:00:00"
action = "modify"
changes = { interval_minutes = 5 }
"#,
            Some("toml"),
        )
        .unwrap();
        assert_eq!(config.health.max_consecutive_failures, 5);
        assert_eq!(config.health.window_size, 20);
        assert_eq!(config.schedule.night.name, "overnight");
        assert_eq!(config.schedule.night.quality, Quality::Low);
        assert_eq!(config.schedule.night.retry.max_attempts, 5);
        assert_eq!(config.schedule.night.storage.compression_quality, 75);
        assert_eq!(config.schedule.overrides[0].changes.interval_minutes, Some(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn night_table_without_retry_keeps_night_budget() {
        let config = Config::parse(
            r#"
[schedule.night]
name = "night"
window = { start_hour = 20, end_hour = 6 }
interval_minutes = 60
samples_per_cycle = 10
quality = "medium"
"#,
            Some("toml"),
        )
        .unwrap();
        assert_eq!(config.schedule.night.retry, RetrySettings::nighttime());
        assert_eq!(config.schedule.night.priority, 1);
        assert_eq!(config.schedule.day, SchedulePeriod::daytime());
    }

    #[test]
    fn partial_retry_block_merges_over_period_defaults() {
        let config = Config::parse(
            "[schedule.night.retry]\nmax_attempts = 7\n\n[schedule.day]\ninterval_minutes = 20\n",
            Some("toml"),
        )
        .unwrap();
        let night = &config.schedule.night;
        assert_eq!(night.retry.max_attempts, 7);
        assert_eq!(night.retry.base_delay_secs, 10);
        assert_eq!(night.retry.max_delay_secs, 600);
        assert_eq!(night.window, SchedulePeriod::nighttime().window);

        let day = &config.schedule.day;
        assert_eq!(day.interval_minutes, 20);
        assert_eq!(day.retry, RetrySettings::daytime());
        assert_eq!(day.name, "daytime");
    }

    #[test]
    fn yaml_is_supported() {
        let config = Config::parse(
            "synthesis:\n  sequence_length: 6\nlogging:\n  format: json\n",
            Some("yml"),
        )
        .unwrap();
        assert_eq!(config.synthesis.sequence_length, 6);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn parse_errors_are_config_errors() {
        let err = Config::parse("[health\n", Some("toml")).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ParseFailed(_))));
    }

    #[test]
    fn load_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn load_from_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchkeep.toml");
        std::fs::write(&path, "[synthesis]\nmin_valid_fraction = 1.5\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ValidationError(_))));
    }

    #[test]
    fn min_valid_samples_rounds_up() {
        let mut s = SynthesisConfig::default();
        assert_eq!(s.min_valid_samples(), 5);
        s.sequence_length = 7;
        assert_eq!(s.min_valid_samples(), 4);
        s.min_valid_fraction = 0.0;
        assert_eq!(s.min_valid_samples(), 1);
    }

    #[test]
    fn health_validation_catches_inverted_thresholds() {
        let mut config = Config::default();
        config.health.emergency_shutdown_threshold = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let config = Config::default();
        let text = config.to_toml_string().unwrap();
        let back = Config::parse(&text, Some("toml")).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
