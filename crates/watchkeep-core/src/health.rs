//! Capture health tracking and auto-recovery.
//!
//! [`HealthMonitor`] never blocks and never performs side effects. Each
//! recorded outcome returns a list of [`HealthIntent`]s that the orchestrator
//! turns into recovery actions and alerts.
//!
//! Per-mode state: a sliding window of the last `window_size` outcomes, a
//! consecutive-failure counter and an optional recovery sequence. A separate
//! global counter spans all modes and halts scheduling once it reaches
//! `emergency_shutdown_threshold`.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::alerts::{AlertCondition, RecoveryAction, Severity};
use crate::config::HealthConfig;
use crate::retry::ErrorClass;
use crate::schedule::ModeKind;

/// Result of one capture-and-analyze operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CaptureOutcome {
    Success {
        #[serde(with = "duration_ms")]
        response_time: Duration,
    },
    Failure {
        class: ErrorClass,
        #[serde(with = "duration_ms")]
        response_time: Duration,
    },
    /// Cancelled in flight; neither success nor failure.
    Aborted,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// What the monitor asks the orchestrator to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum HealthIntent {
    /// Run a recovery action.
    Recover {
        mode: ModeKind,
        action: RecoveryAction,
        attempt: u32,
    },
    /// Raise an alert.
    Alert {
        severity: Severity,
        condition: AlertCondition,
    },
    /// A success ended an in-progress recovery.
    Recovered { mode: ModeKind },
    /// Halt scheduling until externally resumed.
    EmergencyShutdown { consecutive_failures: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutcomeRecord {
    success: bool,
    response_time: Duration,
}

/// Progress of an auto-recovery sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryProgress {
    /// Recovery attempts made so far.
    pub attempts: u32,
    pub severity: Severity,
    pub last_action: RecoveryAction,
    /// Earliest time for the next attempt.
    pub next_attempt_at: NaiveDateTime,
    pub exhausted: bool,
}

#[derive(Debug, Clone, Default)]
struct ModeHealth {
    window: VecDeque<OutcomeRecord>,
    consecutive_failures: u32,
    total_successes: u64,
    total_failures: u64,
    last_activity: Option<NaiveDateTime>,
    recovery: Option<RecoveryProgress>,
    low_rate_breached: bool,
    slow_breached: bool,
}

impl ModeHealth {
    fn push(&mut self, record: OutcomeRecord, window_size: usize) {
        self.window.push_back(record);
        while self.window.len() > window_size {
            self.window.pop_front();
        }
    }

    fn success_rate(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let ok = self.window.iter().filter(|r| r.success).count();
        Some(ok as f64 / self.window.len() as f64)
    }

    fn average_response(&self) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let total: Duration = self.window.iter().map(|r| r.response_time).sum();
        Some(total / self.window.len() as u32)
    }
}

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    /// Scheduling halted by the emergency shutdown threshold.
    Halted,
}

impl HealthStatus {
    #[must_use]
    pub fn from_score(score: f64, halted: bool) -> Self {
        if halted {
            Self::Halted
        } else if score >= 80.0 {
            Self::Healthy
        } else if score >= 50.0 {
            Self::Degraded
        } else {
            Self::Critical
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
            Self::Halted => "halted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeSnapshot {
    pub mode: ModeKind,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_response_ms: Option<u64>,
    pub total_successes: u64,
    pub total_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryProgress>,
}

/// Point-in-time view for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Global consecutive failures across all modes.
    pub consecutive_failures: u32,
    /// Rolling success rate over every mode's window; 1.0 with no data.
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_usage_percent: Option<f64>,
    pub overall_health: f64,
    pub status: HealthStatus,
    pub halted: bool,
    pub modes: Vec<ModeSnapshot>,
    pub computed_at: NaiveDateTime,
}

/// Rolling health state for one subject.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    modes: BTreeMap<ModeKind, ModeHealth>,
    global_consecutive_failures: u32,
    halted: bool,
    started_at: NaiveDateTime,
    last_activity: Option<NaiveDateTime>,
    storage_usage_percent: Option<f64>,
    storage_breached: bool,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(config: HealthConfig, started_at: NaiveDateTime) -> Self {
        Self {
            config,
            modes: BTreeMap::new(),
            global_consecutive_failures: 0,
            halted: false,
            started_at,
            last_activity: None,
            storage_usage_percent: None,
            storage_breached: false,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &HealthConfig {
        &self.config
    }

    #[must_use]
    pub const fn is_halted(&self) -> bool {
        self.halted
    }

    #[must_use]
    pub const fn global_consecutive_failures(&self) -> u32 {
        self.global_consecutive_failures
    }

    #[must_use]
    pub fn consecutive_failures(&self, mode: ModeKind) -> u32 {
        self.modes.get(&mode).map_or(0, |m| m.consecutive_failures)
    }

    #[must_use]
    pub fn recovery(&self, mode: ModeKind) -> Option<&RecoveryProgress> {
        self.modes.get(&mode).and_then(|m| m.recovery.as_ref())
    }

    #[must_use]
    pub fn success_rate(&self, mode: ModeKind) -> Option<f64> {
        self.modes.get(&mode).and_then(ModeHealth::success_rate)
    }

    /// Clear the emergency halt and the global failure counter.
    pub fn resume(&mut self) {
        if self.halted {
            info!("Scheduling resumed after emergency shutdown");
        }
        self.halted = false;
        self.global_consecutive_failures = 0;
    }

    /// Record one capture outcome for `mode`.
    pub fn record(
        &mut self,
        mode: ModeKind,
        outcome: CaptureOutcome,
        now: NaiveDateTime,
    ) -> Vec<HealthIntent> {
        self.last_activity = Some(now);
        let window_size = self.config.window_size.max(1);
        let state = self.modes.entry(mode).or_default();
        state.last_activity = Some(now);

        let mut intents = Vec::new();
        match outcome {
            CaptureOutcome::Aborted => {
                debug!(mode = %mode, "Aborted attempt ignored by health counters");
                return intents;
            }
            CaptureOutcome::Success { response_time } => {
                state.push(
                    OutcomeRecord {
                        success: true,
                        response_time,
                    },
                    window_size,
                );
                state.total_successes += 1;
                state.consecutive_failures = 0;
                self.global_consecutive_failures = 0;
                if state.recovery.take().is_some() {
                    info!(mode = %mode, "Capture recovered");
                    intents.push(HealthIntent::Recovered { mode });
                }
            }
            CaptureOutcome::Failure {
                class,
                response_time,
            } => {
                state.push(
                    OutcomeRecord {
                        success: false,
                        response_time,
                    },
                    window_size,
                );
                state.total_failures += 1;
                state.consecutive_failures += 1;
                self.global_consecutive_failures += 1;
                debug!(
                    mode = %mode,
                    error_class = %class,
                    consecutive_failures = state.consecutive_failures,
                    global_consecutive_failures = self.global_consecutive_failures,
                    "Capture failure recorded"
                );
                Self::advance_recovery(&self.config, mode, state, now, &mut intents);
            }
        }

        Self::check_thresholds(&self.config, mode, state, &mut intents);

        if !self.halted
            && self.global_consecutive_failures >= self.config.emergency_shutdown_threshold
        {
            self.halted = true;
            warn!(
                consecutive_failures = self.global_consecutive_failures,
                "Emergency shutdown threshold reached"
            );
            intents.push(HealthIntent::Alert {
                severity: Severity::Emergency,
                condition: AlertCondition::EmergencyShutdown {
                    consecutive_failures: self.global_consecutive_failures,
                },
            });
            intents.push(HealthIntent::EmergencyShutdown {
                consecutive_failures: self.global_consecutive_failures,
            });
        }

        intents
    }

    fn advance_recovery(
        config: &HealthConfig,
        mode: ModeKind,
        state: &mut ModeHealth,
        now: NaiveDateTime,
        intents: &mut Vec<HealthIntent>,
    ) {
        let delay = ChronoDuration::minutes(i64::from(config.recovery_delay_minutes));

        let Some(progress) = state.recovery.as_mut() else {
            if state.consecutive_failures < config.max_consecutive_failures
                || config.max_recovery_attempts == 0
            {
                return;
            }
            let action = RecoveryAction::for_attempt(1);
            state.recovery = Some(RecoveryProgress {
                attempts: 1,
                severity: Severity::Warning,
                last_action: action,
                next_attempt_at: now + delay,
                exhausted: false,
            });
            info!(mode = %mode, action = %action, attempt = 1u32, "Starting auto-recovery");
            intents.push(HealthIntent::Alert {
                severity: Severity::Warning,
                condition: AlertCondition::ConsecutiveFailures {
                    mode,
                    count: state.consecutive_failures,
                },
            });
            intents.push(HealthIntent::Recover {
                mode,
                action,
                attempt: 1,
            });
            return;
        };

        if progress.exhausted || now < progress.next_attempt_at {
            return;
        }

        if progress.attempts >= config.max_recovery_attempts {
            progress.exhausted = true;
            warn!(mode = %mode, attempts = progress.attempts, "Auto-recovery exhausted");
            intents.push(HealthIntent::Alert {
                severity: progress.severity,
                condition: AlertCondition::RecoveryExhausted {
                    mode,
                    attempts: progress.attempts,
                },
            });
            return;
        }

        progress.attempts += 1;
        progress.severity = progress.severity.escalate();
        progress.last_action = RecoveryAction::for_attempt(progress.attempts);
        progress.next_attempt_at = now + delay;
        info!(
            mode = %mode,
            action = %progress.last_action,
            attempt = progress.attempts,
            severity = %progress.severity,
            "Escalating auto-recovery"
        );
        intents.push(HealthIntent::Alert {
            severity: progress.severity,
            condition: AlertCondition::RecoveryAttempt {
                mode,
                action: progress.last_action,
                attempt: progress.attempts,
            },
        });
        intents.push(HealthIntent::Recover {
            mode,
            action: progress.last_action,
            attempt: progress.attempts,
        });
    }

    fn check_thresholds(
        config: &HealthConfig,
        mode: ModeKind,
        state: &mut ModeHealth,
        intents: &mut Vec<HealthIntent>,
    ) {
        let low_rate = if state.window.len() >= config.min_outcomes_for_rate {
            state
                .success_rate()
                .filter(|rate| *rate < config.min_success_rate)
        } else {
            None
        };
        match (low_rate, state.low_rate_breached) {
            (Some(rate), false) => {
                state.low_rate_breached = true;
                intents.push(HealthIntent::Alert {
                    severity: Severity::Warning,
                    condition: AlertCondition::LowSuccessRate { mode, rate },
                });
            }
            (None, true) => state.low_rate_breached = false,
            _ => {}
        }

        let max_avg =
            Duration::try_from_secs_f64(config.max_average_response_secs).unwrap_or(Duration::MAX);
        let slow = state.average_response().filter(|avg| *avg > max_avg);
        match (slow, state.slow_breached) {
            (Some(average), false) => {
                state.slow_breached = true;
                intents.push(HealthIntent::Alert {
                    severity: Severity::Warning,
                    condition: AlertCondition::SlowResponses { mode, average },
                });
            }
            (None, true) => state.slow_breached = false,
            _ => {}
        }
    }

    /// Feed a storage usage sample, taken at each health check.
    pub fn record_storage_usage(&mut self, percent: f64) -> Vec<HealthIntent> {
        self.storage_usage_percent = Some(percent);
        let breached = percent > self.config.max_storage_usage_percent;
        let mut intents = Vec::new();
        if breached && !self.storage_breached {
            intents.push(HealthIntent::Alert {
                severity: Severity::Warning,
                condition: AlertCondition::StorageUsage { percent },
            });
        }
        self.storage_breached = breached;
        intents
    }

    fn aggregate_success_rate(&self) -> f64 {
        let (ok, total) = self.modes.values().fold((0usize, 0usize), |(ok, total), m| {
            (
                ok + m.window.iter().filter(|r| r.success).count(),
                total + m.window.len(),
            )
        });
        if total == 0 {
            1.0
        } else {
            ok as f64 / total as f64
        }
    }

    fn freshness(&self, now: NaiveDateTime) -> f64 {
        let last = self.last_activity.unwrap_or(self.started_at);
        let age_secs = (now - last).num_seconds().max(0) as f64;
        let window_secs = f64::from(self.config.freshness_window_minutes.max(1)) * 60.0;
        (1.0 - age_secs / window_secs).clamp(0.0, 1.0)
    }

    /// Weighted 0-100 score: 50% success rate, 30% freshness of the last
    /// activity, 20% absence of open critical alerts.
    #[must_use]
    pub fn overall_health(&self, now: NaiveDateTime, open_critical_alerts: usize) -> f64 {
        let alert_component = if open_critical_alerts == 0 { 1.0 } else { 0.0 };
        let score = 50.0 * self.aggregate_success_rate()
            + 30.0 * self.freshness(now)
            + 20.0 * alert_component;
        (score * 10.0).round() / 10.0
    }

    #[must_use]
    pub fn snapshot(&self, now: NaiveDateTime, open_critical_alerts: usize) -> HealthSnapshot {
        let overall_health = self.overall_health(now, open_critical_alerts);
        HealthSnapshot {
            consecutive_failures: self.global_consecutive_failures,
            success_rate: self.aggregate_success_rate(),
            last_activity: self.last_activity,
            storage_usage_percent: self.storage_usage_percent,
            overall_health,
            status: HealthStatus::from_score(overall_health, self.halted),
            halted: self.halted,
            modes: self
                .modes
                .iter()
                .map(|(mode, m)| ModeSnapshot {
                    mode: *mode,
                    consecutive_failures: m.consecutive_failures,
                    success_rate: m.success_rate(),
                    average_response_ms: m.average_response().map(|d| d.as_millis() as u64),
                    total_successes: m.total_successes,
                    total_failures: m.total_failures,
                    last_activity: m.last_activity,
                    recovery: m.recovery.clone(),
                })
                .collect(),
            computed_at: now,
        }
    }
}
