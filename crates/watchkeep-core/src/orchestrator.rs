//! Control loop tying schedule, retry, health, alerts and synthesis together.
//!
//! [`OrchestratorState`] is a plain state machine owned by the caller:
//! [`OrchestratorState::apply`] takes one [`ControlEvent`] and returns the
//! [`Effect`]s the driver must carry out. [`Orchestrator`] is the async driver
//! that talks to the providers, feeds their results back through `apply` and
//! publishes on the [`EventBus`]. The state lock is never held across an
//! `.await`, so status queries can run while a sequence is in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::alerts::{AckOutcome, AlertCondition, AlertManager, RecoveryAction, Severity};
use crate::analysis::SampleEntry;
use crate::config::{Config, OrchestratorConfig, SynthesisConfig};
use crate::error::{AlertError, AnalysisError, Error, Result};
use crate::events::{EventBus, OrchestratorEvent};
use crate::health::{CaptureOutcome, HealthIntent, HealthMonitor, HealthSnapshot};
use crate::ports::{
    AnalysisContext, AnalysisProvider, CaptureProvider, CaptureRequest, Clock, StorageSink,
    SystemClock,
};
use crate::retry::{
    AttemptOutcome, ErrorClass, RetryPolicy, RetryState, run_with_retry, wait_for_abort,
};
use crate::schedule::{EffectiveSchedule, ModeKind, ScheduleResolver, StoragePolicy};
use crate::synthesis::{SequenceReport, Synthesizer};

/// Largest interval multiplier `reduce_frequency` may reach.
pub const MAX_INTERVAL_FACTOR: u32 = 8;

/// Temporary cadence and quality reductions applied by auto-recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Degradation {
    /// Interval multiplier: 1, 2, 4 or 8.
    pub interval_factor: u32,
    /// Quality levels dropped below the scheduled quality.
    pub quality_steps: u8,
}

impl Default for Degradation {
    fn default() -> Self {
        Self {
            interval_factor: 1,
            quality_steps: 0,
        }
    }
}

impl Degradation {
    #[must_use]
    pub fn is_active(&self) -> bool {
        *self != Self::default()
    }

    fn reduce_frequency(&mut self) {
        self.interval_factor = (self.interval_factor * 2).min(MAX_INTERVAL_FACTOR);
    }

    fn reduce_quality(&mut self) {
        self.quality_steps = self.quality_steps.saturating_add(1).min(3);
    }

    /// The schedule as it runs under this degradation.
    #[must_use]
    pub fn apply(&self, schedule: &EffectiveSchedule) -> EffectiveSchedule {
        let mut degraded = schedule.clone();
        degraded.interval_minutes = schedule
            .interval_minutes
            .saturating_mul(self.interval_factor);
        for _ in 0..self.quality_steps {
            degraded.quality = degraded.quality.step_down();
        }
        degraded
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// The resolver was consulted.
    Resolved { schedule: EffectiveSchedule },
    /// A capture cycle of `samples` slots began.
    SequenceStarted { samples: u32, at: NaiveDateTime },
    /// One provider attempt failed; retries may follow.
    AttemptFailed {
        attempt: u32,
        class: ErrorClass,
        retry_after: Option<Duration>,
        at: NaiveDateTime,
    },
    /// A slot reached its terminal outcome.
    SampleFinished {
        sequence_index: u32,
        attempts: u32,
        outcome: CaptureOutcome,
        /// Set for fatal and exhausted failures.
        error: Option<AnalysisError>,
        at: NaiveDateTime,
    },
    /// Periodic health check, with the storage usage sampled for it.
    HealthChecked {
        storage_usage_percent: Option<f64>,
        at: NaiveDateTime,
    },
    SequenceCompleted { report: SequenceReport },
    /// The operator cleared an emergency shutdown.
    Resumed { at: NaiveDateTime },
}

/// What the driver must do after an [`OrchestratorState::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Publish(OrchestratorEvent),
    /// Call [`CaptureProvider::restart`].
    RestartCapture { mode: ModeKind },
}

/// Everything the control loop knows about one subject.
#[derive(Debug)]
pub struct OrchestratorState {
    subject_id: String,
    health: HealthMonitor,
    alerts: AlertManager,
    schedule: Option<EffectiveSchedule>,
    degradation: Degradation,
    retry: Option<RetryState>,
    last_cycle_at: Option<NaiveDateTime>,
    last_health_check: Option<NaiveDateTime>,
    next_sequence_id: u64,
    active_sequence: Option<u64>,
}

impl OrchestratorState {
    #[must_use]
    pub fn new(subject_id: impl Into<String>, config: &Config, started_at: NaiveDateTime) -> Self {
        Self {
            subject_id: subject_id.into(),
            health: HealthMonitor::new(config.health.clone(), started_at),
            alerts: AlertManager::new(),
            schedule: None,
            degradation: Degradation::default(),
            retry: None,
            last_cycle_at: None,
            last_health_check: None,
            next_sequence_id: 1,
            active_sequence: None,
        }
    }

    #[must_use]
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    #[must_use]
    pub const fn health(&self) -> &HealthMonitor {
        &self.health
    }

    #[must_use]
    pub const fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    #[must_use]
    pub const fn degradation(&self) -> Degradation {
        self.degradation
    }

    #[must_use]
    pub const fn retry_state(&self) -> Option<&RetryState> {
        self.retry.as_ref()
    }

    #[must_use]
    pub const fn last_cycle_at(&self) -> Option<NaiveDateTime> {
        self.last_cycle_at
    }

    #[must_use]
    pub const fn active_sequence(&self) -> Option<u64> {
        self.active_sequence
    }

    #[must_use]
    pub const fn is_halted(&self) -> bool {
        self.health.is_halted()
    }

    /// The last resolved schedule with any recovery degradation applied.
    #[must_use]
    pub fn effective_schedule(&self) -> Option<EffectiveSchedule> {
        self.schedule.as_ref().map(|s| self.degradation.apply(s))
    }

    #[must_use]
    pub fn snapshot(&self, now: NaiveDateTime) -> HealthSnapshot {
        self.health.snapshot(now, self.alerts.critical_count())
    }

    fn mode(&self) -> ModeKind {
        self.schedule
            .as_ref()
            .map_or(ModeKind::Daytime, |s| s.mode.kind())
    }

    fn health_check_due(&self, now: NaiveDateTime) -> bool {
        let every = chrono::Duration::minutes(i64::from(self.health.config().check_interval_minutes));
        self.last_health_check
            .is_none_or(|last| now - last >= every)
    }

    fn capture_due(&self, now: NaiveDateTime) -> bool {
        self.active_sequence.is_none()
            && !self.is_halted()
            && self
                .effective_schedule()
                .is_some_and(|s| s.is_capture_due(self.last_cycle_at, now))
    }

    /// Acknowledge an alert; publishes only on the first acknowledgement.
    pub fn acknowledge(
        &mut self,
        alert_id: &str,
        by: &str,
        at: NaiveDateTime,
    ) -> std::result::Result<(AckOutcome, Vec<Effect>), AlertError> {
        let outcome = self.alerts.acknowledge(alert_id, by, at)?;
        let effects = match outcome {
            AckOutcome::Acknowledged => vec![Effect::Publish(OrchestratorEvent::AlertAcknowledged {
                alert_id: alert_id.to_string(),
                by: by.to_string(),
            })],
            AckOutcome::AlreadyAcknowledged => Vec::new(),
        };
        Ok((outcome, effects))
    }

    /// Advance the state machine by one event.
    pub fn apply(&mut self, event: ControlEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            ControlEvent::Resolved { schedule } => {
                let changed = self
                    .schedule
                    .as_ref()
                    .is_none_or(|prev| prev.mode != schedule.mode);
                if changed {
                    info!(
                        subject_id = %self.subject_id,
                        mode = %schedule.mode,
                        capture_enabled = schedule.capture_enabled,
                        "Schedule mode changed"
                    );
                    effects.push(Effect::Publish(OrchestratorEvent::ModeChanged {
                        subject_id: self.subject_id.clone(),
                        schedule: self.degradation.apply(&schedule),
                    }));
                }
                self.schedule = Some(schedule);
            }

            ControlEvent::SequenceStarted { samples, at } => {
                let sequence_id = self.next_sequence_id;
                self.next_sequence_id += 1;
                self.active_sequence = Some(sequence_id);
                self.last_cycle_at = Some(at);
                self.retry = None;
                effects.push(Effect::Publish(OrchestratorEvent::SequenceStarted {
                    subject_id: self.subject_id.clone(),
                    sequence_id,
                    samples,
                }));
            }

            ControlEvent::AttemptFailed {
                attempt,
                class,
                retry_after,
                at,
            } => {
                let settings = self
                    .schedule
                    .as_ref()
                    .map(|s| s.retry.clone())
                    .unwrap_or_default();
                let mut policy = RetryPolicy::from_settings(&settings);
                // next_retry_at is reported without jitter
                policy.jitter_fraction = 0.0;
                let decision = policy.should_retry(attempt, class, retry_after);
                self.retry
                    .get_or_insert_with(|| RetryState::new(policy.max_attempts))
                    .record_failure(class, &decision, at);
            }

            ControlEvent::SampleFinished {
                sequence_index,
                attempts,
                outcome,
                error,
                at,
            } => {
                self.retry = None;
                let sequence_id = self.active_sequence.unwrap_or_default();
                let mode = self.mode();

                if matches!(outcome, CaptureOutcome::Success { .. }) && self.degradation.is_active() {
                    debug!(subject_id = %self.subject_id, "Capture succeeded, clearing degradation");
                    self.degradation = Degradation::default();
                }

                effects.push(Effect::Publish(match &error {
                    Some(err) => OrchestratorEvent::SampleFailed {
                        subject_id: self.subject_id.clone(),
                        sequence_id,
                        sequence_index,
                        attempts,
                        error_class: err.class,
                        message: err.message.clone(),
                    },
                    None => OrchestratorEvent::SampleCaptured {
                        subject_id: self.subject_id.clone(),
                        sequence_id,
                        sequence_index,
                        attempts,
                        outcome,
                    },
                }));

                if let Some(err) = error.as_ref().filter(|e| e.class.is_fatal()) {
                    self.raise(
                        Severity::Critical,
                        AlertCondition::FatalProviderError { class: err.class },
                        at,
                        &mut effects,
                    );
                }

                let intents = self.health.record(mode, outcome, at);
                self.handle_intents(intents, at, &mut effects);
                self.publish_health(at, &mut effects);
            }

            ControlEvent::HealthChecked {
                storage_usage_percent,
                at,
            } => {
                self.last_health_check = Some(at);
                if let Some(percent) = storage_usage_percent {
                    let intents = self.health.record_storage_usage(percent);
                    self.handle_intents(intents, at, &mut effects);
                }
                self.publish_health(at, &mut effects);
            }

            ControlEvent::SequenceCompleted { report } => {
                self.active_sequence = None;
                let sequence_id = report.sequence_id();
                let at = match &report {
                    SequenceReport::Consensus { completed_at, .. }
                    | SequenceReport::Unavailable { completed_at, .. } => *completed_at,
                };
                let emergency = match &report {
                    SequenceReport::Consensus { report, .. } => !report.emergency_samples.is_empty(),
                    SequenceReport::Unavailable { emergency, .. } => *emergency,
                };
                if let SequenceReport::Unavailable {
                    valid_samples,
                    required_samples,
                    ..
                } = &report
                {
                    self.raise(
                        Severity::Warning,
                        AlertCondition::SynthesisUnavailable {
                            sequence_id,
                            valid: *valid_samples,
                            required: *required_samples,
                        },
                        at,
                        &mut effects,
                    );
                }
                if emergency {
                    self.raise(
                        Severity::Emergency,
                        AlertCondition::EmergencyIndicator { sequence_id },
                        at,
                        &mut effects,
                    );
                }
                effects.push(Effect::Publish(OrchestratorEvent::ReportReady {
                    subject_id: self.subject_id.clone(),
                    report,
                }));
            }

            ControlEvent::Resumed { at } => {
                if self.health.is_halted() {
                    self.health.resume();
                    self.active_sequence = None;
                    effects.push(Effect::Publish(OrchestratorEvent::SchedulingResumed {
                        subject_id: self.subject_id.clone(),
                    }));
                    self.publish_health(at, &mut effects);
                }
            }
        }
        effects
    }

    fn raise(
        &mut self,
        severity: Severity,
        condition: AlertCondition,
        at: NaiveDateTime,
        effects: &mut Vec<Effect>,
    ) {
        let alert = self
            .alerts
            .raise(severity, condition, Some(&self.subject_id), at)
            .clone();
        effects.push(Effect::Publish(OrchestratorEvent::AlertRaised { alert }));
    }

    fn publish_health(&self, at: NaiveDateTime, effects: &mut Vec<Effect>) {
        effects.push(Effect::Publish(OrchestratorEvent::HealthUpdated {
            subject_id: self.subject_id.clone(),
            snapshot: self.snapshot(at),
        }));
    }

    fn handle_intents(
        &mut self,
        intents: Vec<HealthIntent>,
        at: NaiveDateTime,
        effects: &mut Vec<Effect>,
    ) {
        let mut critical_raised = false;
        for intent in intents {
            match intent {
                HealthIntent::Alert {
                    severity,
                    condition,
                } => {
                    critical_raised |= severity >= Severity::Critical;
                    self.raise(severity, condition, at, effects);
                }
                HealthIntent::Recover {
                    mode,
                    action,
                    attempt,
                } => {
                    info!(
                        subject_id = %self.subject_id,
                        mode = %mode,
                        action = %action,
                        attempt,
                        "Running recovery action"
                    );
                    match action {
                        RecoveryAction::Restart => {
                            self.retry = None;
                            effects.push(Effect::RestartCapture { mode });
                        }
                        RecoveryAction::ReduceFrequency => self.degradation.reduce_frequency(),
                        RecoveryAction::ReduceQuality => self.degradation.reduce_quality(),
                        RecoveryAction::Notify => {
                            if !critical_raised {
                                critical_raised = true;
                                self.raise(
                                    Severity::Critical,
                                    AlertCondition::RecoveryAttempt {
                                        mode,
                                        action,
                                        attempt,
                                    },
                                    at,
                                    effects,
                                );
                            }
                        }
                    }
                }
                HealthIntent::Recovered { mode } => {
                    info!(subject_id = %self.subject_id, mode = %mode, "Recovery complete");
                    self.degradation = Degradation::default();
                }
                HealthIntent::EmergencyShutdown {
                    consecutive_failures,
                } => {
                    self.active_sequence = None;
                    effects.push(Effect::Publish(OrchestratorEvent::SchedulingHalted {
                        subject_id: self.subject_id.clone(),
                        consecutive_failures,
                    }));
                }
            }
        }
    }
}

/// Why a sequence stopped before synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    /// Shutdown was requested mid-sequence.
    Aborted,
    /// The emergency shutdown threshold was reached.
    Halted,
    /// The provider reported a non-retryable error.
    Fatal { class: ErrorClass },
}

/// Result of one [`Orchestrator::tick`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Scheduling is halted until resumed.
    Halted,
    /// The current mode suspends capture.
    Suspended { mode: ModeKind },
    /// Nothing due yet.
    Idle,
    /// A full sequence was captured and synthesized.
    Completed { sequence_id: u64, available: bool },
    Interrupted {
        sequence_id: u64,
        reason: InterruptReason,
    },
}

/// Recover the guard even if a previous holder panicked.
fn lock(state: &Mutex<OrchestratorState>) -> MutexGuard<'_, OrchestratorState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Async driver for one subject.
pub struct Orchestrator {
    subject_id: String,
    config: Config,
    resolver: ScheduleResolver,
    capture: Arc<dyn CaptureProvider>,
    analysis: Arc<dyn AnalysisProvider>,
    storage: Arc<dyn StorageSink>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("subject_id", &self.subject_id)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        subject_id: impl Into<String>,
        config: Config,
        capture: Arc<dyn CaptureProvider>,
        analysis: Arc<dyn AnalysisProvider>,
        storage: Arc<dyn StorageSink>,
    ) -> Self {
        let bus = EventBus::new(config.orchestrator.event_capacity);
        let permits = Arc::new(Semaphore::new(
            config.orchestrator.max_concurrent_captures.max(1),
        ));
        Self {
            subject_id: subject_id.into(),
            resolver: ScheduleResolver::new(config.schedule.clone()),
            config,
            capture,
            analysis,
            storage,
            clock: Arc::new(SystemClock),
            bus,
            permits,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    #[must_use]
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub const fn resolver(&self) -> &ScheduleResolver {
        &self.resolver
    }

    #[must_use]
    pub const fn orchestrator_config(&self) -> &OrchestratorConfig {
        &self.config.orchestrator
    }

    /// Fresh state for this subject, starting now.
    #[must_use]
    pub fn new_state(&self) -> OrchestratorState {
        OrchestratorState::new(self.subject_id.clone(), &self.config, self.clock.now())
    }

    async fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(event) => {
                    self.bus.publish(event);
                }
                Effect::RestartCapture { mode } => {
                    if let Err(err) = self.capture.restart().await {
                        warn!(
                            subject_id = %self.subject_id,
                            mode = %mode,
                            error_class = %err.class,
                            error = %err,
                            "Capture restart failed"
                        );
                    }
                }
            }
        }
    }

    async fn apply(&self, state: &Mutex<OrchestratorState>, event: ControlEvent) {
        let effects = lock(state).apply(event);
        self.dispatch(effects).await;
    }

    /// Clear an emergency shutdown.
    pub async fn resume(&self, state: &Mutex<OrchestratorState>) {
        let at = self.clock.now();
        self.apply(state, ControlEvent::Resumed { at }).await;
    }

    pub async fn acknowledge(
        &self,
        state: &Mutex<OrchestratorState>,
        alert_id: &str,
        by: &str,
    ) -> Result<AckOutcome> {
        let at = self.clock.now();
        let (outcome, effects) = lock(state).acknowledge(alert_id, by, at)?;
        self.dispatch(effects).await;
        Ok(outcome)
    }

    async fn health_check(&self, state: &Mutex<OrchestratorState>, now: NaiveDateTime) {
        let storage_usage_percent = match self.storage.usage_stats().await {
            Ok(stats) => Some(stats.usage_percent()),
            Err(err) => {
                warn!(subject_id = %self.subject_id, error = %err, "Storage usage unavailable");
                None
            }
        };
        self.apply(
            state,
            ControlEvent::HealthChecked {
                storage_usage_percent,
                at: now,
            },
        )
        .await;
    }

    /// One control step: resolve, health check when due, and capture a full
    /// sequence when one is due.
    pub async fn tick(
        &self,
        state: &Mutex<OrchestratorState>,
        abort: &watch::Receiver<bool>,
    ) -> Result<TickOutcome> {
        let now = self.clock.now();
        if lock(state).is_halted() {
            return Ok(TickOutcome::Halted);
        }

        let schedule = self.resolver.resolve(now);
        self.apply(state, ControlEvent::Resolved { schedule }).await;

        if lock(state).health_check_due(now) {
            self.health_check(state, now).await;
        }

        let Some(schedule) = lock(state).effective_schedule() else {
            return Ok(TickOutcome::Idle);
        };
        if !schedule.capture_enabled {
            return Ok(TickOutcome::Suspended {
                mode: schedule.mode.kind(),
            });
        }
        if !lock(state).capture_due(now) {
            return Ok(TickOutcome::Idle);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| Error::Runtime(e.to_string()))?;

        // Another tick may have run the sequence while we waited.
        let started_at = self.clock.now();
        let (sequence_id, effects) = {
            let mut guard = lock(state);
            if !guard.capture_due(started_at) {
                return Ok(TickOutcome::Idle);
            }
            let effects = guard.apply(ControlEvent::SequenceStarted {
                samples: schedule.samples_per_cycle,
                at: started_at,
            });
            (guard.active_sequence().unwrap_or_default(), effects)
        };
        self.dispatch(effects).await;

        self.run_sequence(state, &schedule, sequence_id, started_at, abort.clone())
            .await
    }

    async fn run_sequence(
        &self,
        state: &Mutex<OrchestratorState>,
        schedule: &EffectiveSchedule,
        sequence_id: u64,
        started_at: NaiveDateTime,
        mut abort: watch::Receiver<bool>,
    ) -> Result<TickOutcome> {
        let samples = schedule.samples_per_cycle;
        let policy = RetryPolicy::from_settings(&schedule.retry);
        let spacing = Duration::from_secs(self.config.orchestrator.sample_spacing_secs);
        let mode = schedule.mode.kind();
        let mut entries = Vec::with_capacity(samples as usize);

        debug!(
            subject_id = %self.subject_id,
            sequence_id,
            samples,
            mode = %mode,
            quality = %schedule.quality,
            "Starting capture sequence"
        );

        for index in 1..=samples {
            if index > 1 && !spacing.is_zero() {
                tokio::select! {
                    biased;
                    () = wait_for_abort(&mut abort) => {
                        return Ok(self.interrupt(state, sequence_id, index, InterruptReason::Aborted));
                    }
                    () = tokio::time::sleep(spacing) => {}
                }
            }

            let context = AnalysisContext {
                subject_id: self.subject_id.clone(),
                sequence_id,
                sequence_index: index,
                sequence_length: samples as usize,
                offset_secs: (self.clock.now() - started_at).num_seconds().max(0) as u64,
                mode,
            };
            let request = CaptureRequest {
                subject_id: self.subject_id.clone(),
                sequence_id,
                sequence_index: index,
                quality: schedule.quality,
            };
            let last_elapsed_ms = AtomicU64::new(0);

            let outcome = {
                let this = self;
                let context = &context;
                let last_elapsed_ms = &last_elapsed_ms;
                let storage_policy = &schedule.storage;
                run_with_retry(&policy, &mut abort, move |attempt| {
                    let request = request.clone();
                    async move {
                        let started = tokio::time::Instant::now();
                        let result = this
                            .capture_and_analyze(&request, context, storage_policy)
                            .await;
                        last_elapsed_ms.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                        if let Err(err) = &result {
                            let at = this.clock.now();
                            let effects = lock(state).apply(ControlEvent::AttemptFailed {
                                attempt,
                                class: err.class,
                                retry_after: err.retry_after,
                                at,
                            });
                            debug_assert!(effects.is_empty());
                        }
                        result
                    }
                })
                .await
            };

            let response_time = Duration::from_millis(last_elapsed_ms.load(Ordering::Relaxed));
            let at = self.clock.now();
            let (entry, capture_outcome, error, attempts) = match outcome {
                AttemptOutcome::Succeeded { value, attempts } => (
                    value,
                    CaptureOutcome::Success { response_time },
                    None,
                    attempts,
                ),
                AttemptOutcome::Fatal { error, attempts }
                | AttemptOutcome::Exhausted { error, attempts } => (
                    SampleEntry::missing(index, error.to_string()),
                    CaptureOutcome::Failure {
                        class: error.class,
                        response_time,
                    },
                    Some(error),
                    attempts,
                ),
                AttemptOutcome::Aborted { attempts } => {
                    self.apply(
                        state,
                        ControlEvent::SampleFinished {
                            sequence_index: index,
                            attempts,
                            outcome: CaptureOutcome::Aborted,
                            error: None,
                            at,
                        },
                    )
                    .await;
                    return Ok(self.interrupt(state, sequence_id, index, InterruptReason::Aborted));
                }
            };

            let fatal = error.as_ref().filter(|e| e.class.is_fatal()).map(|e| e.class);
            self.apply(
                state,
                ControlEvent::SampleFinished {
                    sequence_index: index,
                    attempts,
                    outcome: capture_outcome,
                    error,
                    at,
                },
            )
            .await;
            entries.push(entry);

            if lock(state).is_halted() {
                return Ok(self.interrupt(state, sequence_id, index, InterruptReason::Halted));
            }
            if let Some(class) = fatal {
                let reason = InterruptReason::Fatal { class };
                return Ok(self.interrupt(state, sequence_id, index, reason));
            }
        }

        let completed_at = self.clock.now();
        let synthesizer = Synthesizer::new(SynthesisConfig {
            sequence_length: samples as usize,
            ..self.config.synthesis.clone()
        });
        let result = synthesizer.synthesize(&entries);
        if let Err(err) = &result {
            warn!(
                subject_id = %self.subject_id,
                sequence_id,
                code = err.code(),
                error = %err,
                "Analysis unavailable"
            );
        }
        let report =
            SequenceReport::from_result(&self.subject_id, sequence_id, completed_at, &entries, result);
        let available = report.is_available();

        self.persist_report(&report, &schedule.storage, completed_at).await;
        self.apply(state, ControlEvent::SequenceCompleted { report }).await;

        info!(subject_id = %self.subject_id, sequence_id, available, "Sequence complete");
        Ok(TickOutcome::Completed {
            sequence_id,
            available,
        })
    }

    fn interrupt(
        &self,
        state: &Mutex<OrchestratorState>,
        sequence_id: u64,
        index: u32,
        reason: InterruptReason,
    ) -> TickOutcome {
        lock(state).active_sequence = None;
        info!(
            subject_id = %self.subject_id,
            sequence_id,
            sequence_index = index,
            reason = ?reason,
            "Sequence interrupted"
        );
        TickOutcome::Interrupted {
            sequence_id,
            reason,
        }
    }

    async fn capture_and_analyze(
        &self,
        request: &CaptureRequest,
        context: &AnalysisContext,
        storage_policy: &StoragePolicy,
    ) -> std::result::Result<SampleEntry, AnalysisError> {
        let image = self.capture.capture(request).await?;
        if let Err(err) = self.storage.store_photo(&image, storage_policy).await {
            warn!(
                subject_id = %self.subject_id,
                sequence_id = request.sequence_id,
                error = %err,
                "Photo not stored"
            );
        }
        self.analysis.analyze(&image, context).await
    }

    async fn persist_report(
        &self,
        report: &SequenceReport,
        policy: &StoragePolicy,
        now: NaiveDateTime,
    ) {
        if let Err(err) = self.storage.store_report(report).await {
            warn!(
                subject_id = %self.subject_id,
                sequence_id = report.sequence_id(),
                error = %err,
                "Report not stored"
            );
            return;
        }
        match self.storage.cleanup(policy, now).await {
            Ok(outcome) if outcome.removed_photos + outcome.removed_reports > 0 => debug!(
                removed_photos = outcome.removed_photos,
                removed_reports = outcome.removed_reports,
                freed_bytes = outcome.freed_bytes,
                "Storage cleanup"
            ),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Storage cleanup failed"),
        }
    }

    /// Tick every `tick_interval_secs` until `shutdown` flips to true.
    pub async fn run(
        &self,
        state: &Mutex<OrchestratorState>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let period = Duration::from_secs(self.config.orchestrator.tick_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(subject_id = %self.subject_id, tick_secs = period.as_secs(), "Orchestrator started");

        loop {
            tokio::select! {
                biased;
                () = wait_for_abort(&mut shutdown) => {
                    info!(subject_id = %self.subject_id, "Orchestrator shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            match self.tick(state, &shutdown).await? {
                TickOutcome::Interrupted {
                    reason: InterruptReason::Aborted,
                    ..
                } => {
                    info!(subject_id = %self.subject_id, "Orchestrator shutting down");
                    return Ok(());
                }
                outcome => debug!(subject_id = %self.subject_id, ?outcome, "Tick"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{Quality, ScheduleMode};
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 5, 4)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn state() -> OrchestratorState {
        let mut config = Config::default();
        config.health.min_success_rate = 0.0;
        OrchestratorState::new("pen-1", &config, at(8, 0))
    }

    fn resolved(state: &mut OrchestratorState, now: NaiveDateTime) -> Vec<Effect> {
        let resolver = ScheduleResolver::new(Config::default().schedule);
        state.apply(ControlEvent::Resolved {
            schedule: resolver.resolve(now),
        })
    }

    fn fail(state: &mut OrchestratorState, now: NaiveDateTime) -> Vec<Effect> {
        state.apply(ControlEvent::SampleFinished {
            sequence_index: 1,
            attempts: 3,
            outcome: CaptureOutcome::Failure {
                class: ErrorClass::Timeout,
                response_time: Duration::from_secs(1),
            },
            error: Some(AnalysisError::new(ErrorClass::Timeout, "camera timeout")),
            at: now,
        })
    }

    fn succeed(state: &mut OrchestratorState, now: NaiveDateTime) -> Vec<Effect> {
        state.apply(ControlEvent::SampleFinished {
            sequence_index: 1,
            attempts: 1,
            outcome: CaptureOutcome::Success {
                response_time: Duration::from_secs(1),
            },
            error: None,
            at: now,
        })
    }

    fn alerts_raised(effects: &[Effect]) -> Vec<Severity> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Publish(OrchestratorEvent::AlertRaised { alert }) => Some(alert.severity),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn mode_change_published_once() {
        let mut s = state();
        let first = resolved(&mut s, at(8, 0));
        assert!(matches!(
            first.as_slice(),
            [Effect::Publish(OrchestratorEvent::ModeChanged { .. })]
        ));
        assert!(resolved(&mut s, at(9, 0)).is_empty());
        let night = resolved(&mut s, at(21, 0));
        assert_eq!(night.len(), 1);
        assert_eq!(
            s.effective_schedule().map(|e| e.mode),
            Some(ScheduleMode::Nighttime)
        );
    }

    #[test]
    fn sequence_ids_are_monotonic() {
        let mut s = state();
        resolved(&mut s, at(8, 0));
        s.apply(ControlEvent::SequenceStarted { samples: 10, at: at(8, 0) });
        assert_eq!(s.active_sequence(), Some(1));
        assert!(!s.capture_due(at(9, 0)));
        s.active_sequence = None;
        s.apply(ControlEvent::SequenceStarted { samples: 10, at: at(8, 30) });
        assert_eq!(s.active_sequence(), Some(2));
        assert_eq!(s.last_cycle_at(), Some(at(8, 30)));
    }

    #[test]
    fn attempt_failures_track_retry_state() {
        let mut s = state();
        resolved(&mut s, at(8, 0));
        s.apply(ControlEvent::AttemptFailed {
            attempt: 1,
            class: ErrorClass::Network,
            retry_after: None,
            at: at(8, 0),
        });
        let retry = s.retry_state().unwrap();
        assert_eq!(retry.attempts, 1);
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.next_retry_at, Some(at(8, 0) + chrono::Duration::seconds(5)));

        succeed(&mut s, at(8, 1));
        assert!(s.retry_state().is_none());
    }

    #[test]
    fn recovery_actions_degrade_then_success_clears() {
        let mut s = state();
        resolved(&mut s, at(8, 0));

        fail(&mut s, at(8, 0));
        fail(&mut s, at(8, 1));
        let effects = fail(&mut s, at(8, 2));
        assert!(effects.contains(&Effect::RestartCapture {
            mode: ModeKind::Daytime
        }));
        assert_eq!(alerts_raised(&effects), vec![Severity::Warning]);

        // after the recovery delay the next failure reduces frequency
        fail(&mut s, at(8, 8));
        assert_eq!(s.degradation().interval_factor, 2);
        assert_eq!(s.effective_schedule().unwrap().interval_minutes, 60);

        fail(&mut s, at(8, 14));
        assert_eq!(s.degradation().quality_steps, 1);
        assert_eq!(s.effective_schedule().unwrap().quality, Quality::Medium);

        let effects = succeed(&mut s, at(8, 15));
        assert!(!s.degradation().is_active());
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Publish(OrchestratorEvent::HealthUpdated { .. })
        )));
    }

    #[test]
    fn notify_does_not_duplicate_escalated_alert() {
        let mut s = state();
        resolved(&mut s, at(8, 0));
        for minute in [0, 1, 2, 8, 14] {
            fail(&mut s, at(8, minute));
        }
        // fourth recovery attempt: notify, already escalated past critical
        let effects = fail(&mut s, at(8, 20));
        assert_eq!(alerts_raised(&effects), vec![Severity::Emergency]);
    }

    #[test]
    fn reduce_frequency_caps_at_eight() {
        let mut d = Degradation::default();
        for _ in 0..5 {
            d.reduce_frequency();
        }
        assert_eq!(d.interval_factor, MAX_INTERVAL_FACTOR);
    }

    #[test]
    fn fatal_error_raises_critical_alert() {
        let mut s = state();
        resolved(&mut s, at(8, 0));
        let effects = s.apply(ControlEvent::SampleFinished {
            sequence_index: 1,
            attempts: 1,
            outcome: CaptureOutcome::Failure {
                class: ErrorClass::Auth,
                response_time: Duration::ZERO,
            },
            error: Some(AnalysisError::new(ErrorClass::Auth, "bad key")),
            at: at(8, 0),
        });
        assert_eq!(alerts_raised(&effects), vec![Severity::Critical]);
        assert_eq!(s.alerts().critical_count(), 1);
    }

    #[test]
    fn emergency_shutdown_halts_until_resumed() {
        let mut s = state();
        resolved(&mut s, at(8, 0));
        let mut halted = false;
        for n in 0..10 {
            let effects = fail(&mut s, at(8, n * 6));
            halted |= effects.iter().any(|e| {
                matches!(e, Effect::Publish(OrchestratorEvent::SchedulingHalted { .. }))
            });
        }
        assert!(halted);
        assert!(s.is_halted());
        assert!(!s.capture_due(at(12, 0)));

        let effects = s.apply(ControlEvent::Resumed { at: at(12, 0) });
        assert!(matches!(
            effects[0],
            Effect::Publish(OrchestratorEvent::SchedulingResumed { .. })
        ));
        assert!(!s.is_halted());
        assert!(s.apply(ControlEvent::Resumed { at: at(12, 1) }).is_empty());
    }

    #[test]
    fn unavailable_report_raises_alerts() {
        let mut s = state();
        let report = SequenceReport::Unavailable {
            subject_id: "pen-1".to_string(),
            sequence_id: 7,
            completed_at: at(9, 0),
            code: "synthesis_insufficient_data".to_string(),
            reason: "only 2 valid samples".to_string(),
            valid_samples: 2,
            required_samples: 5,
            emergency: true,
        };
        let effects = s.apply(ControlEvent::SequenceCompleted { report });
        assert_eq!(
            alerts_raised(&effects),
            vec![Severity::Warning, Severity::Emergency]
        );
        assert!(matches!(
            effects.last(),
            Some(Effect::Publish(OrchestratorEvent::ReportReady { .. }))
        ));
    }

    #[test]
    fn acknowledge_publishes_once() {
        let mut s = state();
        resolved(&mut s, at(8, 0));
        for minute in 0..3 {
            fail(&mut s, at(8, minute));
        }
        let id = s.alerts().alerts()[0].id.clone();
        let (outcome, effects) = s.acknowledge(&id, "ops", at(8, 5)).unwrap();
        assert_eq!(outcome, AckOutcome::Acknowledged);
        assert_eq!(effects.len(), 1);
        let (outcome, effects) = s.acknowledge(&id, "ops", at(8, 6)).unwrap();
        assert_eq!(outcome, AckOutcome::AlreadyAcknowledged);
        assert!(effects.is_empty());
        assert!(s.acknowledge("alert-999", "ops", at(8, 6)).is_err());
    }

    #[test]
    fn health_check_cadence() {
        let mut s = state();
        assert!(s.health_check_due(at(8, 0)));
        s.apply(ControlEvent::HealthChecked {
            storage_usage_percent: Some(90.0),
            at: at(8, 0),
        });
        assert!(!s.health_check_due(at(8, 10)));
        assert!(s.health_check_due(at(8, 15)));
        assert_eq!(s.alerts().unacknowledged_count(), 1);
    }
}
