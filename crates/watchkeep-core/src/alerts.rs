//! Alert lifecycle.
//!
//! Alerts form an append-only log: creation and one-way acknowledgement are
//! the only mutations, and nothing here deletes an alert. Counters are derived
//! from the log on every query, so they cannot drift from the alert set.

use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::AlertError;
use crate::retry::ErrorClass;
use crate::schedule::ModeKind;

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    Warning,
    Critical,
    Emergency,
}

impl Severity {
    pub const ALL: [Self; 4] = [Self::Normal, Self::Warning, Self::Critical, Self::Emergency];

    /// One level up, capped at `Emergency`.
    #[must_use]
    pub const fn escalate(self) -> Self {
        match self {
            Self::Normal => Self::Warning,
            Self::Warning => Self::Critical,
            Self::Critical | Self::Emergency => Self::Emergency,
        }
    }

    #[must_use]
    pub const fn actions(self) -> &'static [AlertAction] {
        match self {
            Self::Normal => &[],
            Self::Warning => &[AlertAction::Log, AlertAction::Display],
            Self::Critical => &[AlertAction::Log, AlertAction::Display, AlertAction::Notify],
            Self::Emergency => &[
                AlertAction::Log,
                AlertAction::Display,
                AlertAction::Notify,
                AlertAction::Escalate,
            ],
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effect requested by an alert's severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    Log,
    Display,
    Notify,
    Escalate,
}

/// Recovery step tried by auto-recovery, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Restart,
    ReduceFrequency,
    ReduceQuality,
    Notify,
}

impl RecoveryAction {
    pub const SEQUENCE: [Self; 4] = [
        Self::Restart,
        Self::ReduceFrequency,
        Self::ReduceQuality,
        Self::Notify,
    ];

    /// Action for the given 1-based recovery attempt; cycles past the end.
    #[must_use]
    pub const fn for_attempt(attempt: u32) -> Self {
        Self::SEQUENCE[(attempt.saturating_sub(1) % 4) as usize]
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Restart => "restart",
            Self::ReduceFrequency => "reduce_frequency",
            Self::ReduceQuality => "reduce_quality",
            Self::Notify => "notify",
        })
    }
}

/// Immutable source condition of an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum AlertCondition {
    ConsecutiveFailures { mode: ModeKind, count: u32 },
    RecoveryAttempt {
        mode: ModeKind,
        action: RecoveryAction,
        attempt: u32,
    },
    RecoveryExhausted { mode: ModeKind, attempts: u32 },
    LowSuccessRate { mode: ModeKind, rate: f64 },
    SlowResponses {
        mode: ModeKind,
        #[serde(with = "duration_secs")]
        average: Duration,
    },
    StorageUsage { percent: f64 },
    EmergencyShutdown { consecutive_failures: u32 },
    FatalProviderError { class: ErrorClass },
    SynthesisUnavailable { sequence_id: u64, valid: usize, required: usize },
    EmergencyIndicator { sequence_id: u64 },
}

impl std::fmt::Display for AlertCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConsecutiveFailures { mode, count } => {
                write!(f, "{count} consecutive capture failures during {mode}")
            }
            Self::RecoveryAttempt {
                mode,
                action,
                attempt,
            } => write!(f, "auto-recovery attempt {attempt} during {mode}: {action}"),
            Self::RecoveryExhausted { mode, attempts } => {
                write!(f, "auto-recovery exhausted after {attempts} attempts during {mode}")
            }
            Self::LowSuccessRate { mode, rate } => {
                write!(f, "success rate {:.0}% during {mode}", rate * 100.0)
            }
            Self::SlowResponses { mode, average } => write!(
                f,
                "average response time {:.1}s during {mode}",
                average.as_secs_f64()
            ),
            Self::StorageUsage { percent } => write!(f, "storage usage at {percent:.1}%"),
            Self::EmergencyShutdown {
                consecutive_failures,
            } => write!(
                f,
                "scheduling halted after {consecutive_failures} consecutive failures"
            ),
            Self::FatalProviderError { class } => {
                write!(f, "fatal {class} error from the analysis provider")
            }
            Self::SynthesisUnavailable {
                sequence_id,
                valid,
                required,
            } => write!(
                f,
                "analysis unavailable for sequence {sequence_id}: {valid} valid samples, {required} required"
            ),
            Self::EmergencyIndicator { sequence_id } => {
                write!(f, "emergency indicator reported in sequence {sequence_id}")
            }
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub id: String,
    pub severity: Severity,
    pub created_at: NaiveDateTime,
    pub source: AlertCondition,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<NaiveDateTime>,
}

impl SystemAlert {
    #[must_use]
    pub fn actions(&self) -> &'static [AlertAction] {
        self.severity.actions()
    }

    #[must_use]
    pub fn is_open_critical(&self) -> bool {
        !self.acknowledged && self.severity >= Severity::Critical
    }
}

/// Result of [`AlertManager::acknowledge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Acknowledged,
    AlreadyAcknowledged,
}

/// Counts for the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSummary {
    pub total: usize,
    pub unacknowledged: usize,
    pub critical: usize,
    pub by_severity: SeverityCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub normal: usize,
    pub warning: usize,
    pub critical: usize,
    pub emergency: usize,
}

/// Owner of the alert log.
#[derive(Debug, Default)]
pub struct AlertManager {
    alerts: Vec<SystemAlert>,
    next_id: u64,
}

impl AlertManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an alert and run its log action.
    pub fn raise(
        &mut self,
        severity: Severity,
        source: AlertCondition,
        subject_id: Option<&str>,
        now: NaiveDateTime,
    ) -> &SystemAlert {
        self.next_id += 1;
        let alert = SystemAlert {
            id: format!("alert-{}", self.next_id),
            severity,
            created_at: now,
            message: source.to_string(),
            source,
            subject_id: subject_id.map(str::to_string),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
        };

        if severity.actions().contains(&AlertAction::Log) {
            let subject = alert.subject_id.as_deref().unwrap_or("-");
            match severity {
                Severity::Warning => warn!(
                    alert_id = %alert.id,
                    severity = %severity,
                    subject_id = subject,
                    "{}",
                    alert.message
                ),
                Severity::Critical | Severity::Emergency => error!(
                    alert_id = %alert.id,
                    severity = %severity,
                    subject_id = subject,
                    escalate = severity == Severity::Emergency,
                    "{}",
                    alert.message
                ),
                Severity::Normal => {}
            }
        }

        self.alerts.push(alert);
        let idx = self.alerts.len() - 1;
        &self.alerts[idx]
    }

    /// One-way acknowledgement. Re-acknowledging is a no-op.
    pub fn acknowledge(
        &mut self,
        id: &str,
        by: &str,
        at: NaiveDateTime,
    ) -> Result<AckOutcome, AlertError> {
        let alert = self
            .alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| AlertError::NotFound(id.to_string()))?;
        if alert.acknowledged {
            return Ok(AckOutcome::AlreadyAcknowledged);
        }
        alert.acknowledged = true;
        alert.acknowledged_by = Some(by.to_string());
        alert.acknowledged_at = Some(at);
        info!(alert_id = %id, acknowledged_by = by, "Alert acknowledged");
        Ok(AckOutcome::Acknowledged)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&SystemAlert> {
        self.alerts.iter().find(|a| a.id == id)
    }

    #[must_use]
    pub fn alerts(&self) -> &[SystemAlert] {
        &self.alerts
    }

    pub fn unacknowledged(&self) -> impl Iterator<Item = &SystemAlert> {
        self.alerts.iter().filter(|a| !a.acknowledged)
    }

    #[must_use]
    pub fn unacknowledged_count(&self) -> usize {
        self.unacknowledged().count()
    }

    /// Unacknowledged alerts at critical severity or above.
    #[must_use]
    pub fn critical_count(&self) -> usize {
        self.alerts.iter().filter(|a| a.is_open_critical()).count()
    }

    #[must_use]
    pub fn summary(&self) -> AlertSummary {
        let mut by_severity = SeverityCounts::default();
        for alert in &self.alerts {
            let slot = match alert.severity {
                Severity::Normal => &mut by_severity.normal,
                Severity::Warning => &mut by_severity.warning,
                Severity::Critical => &mut by_severity.critical,
                Severity::Emergency => &mut by_severity.emergency,
            };
            *slot += 1;
        }
        AlertSummary {
            total: self.alerts.len(),
            unacknowledged: self.unacknowledged_count(),
            critical: self.critical_count(),
            by_severity,
            latest_id: self.alerts.last().map(|a| a.id.clone()),
        }
    }
}
