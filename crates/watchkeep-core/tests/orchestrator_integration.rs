//! End-to-end tests of the control loop against in-process fakes.
//!
//! The clock is manual, so sequences only become due when a test moves it.
//! Tokio time is paused, so retry backoff resolves instantly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use tokio::sync::{broadcast, watch};

use watchkeep_core::alerts::{AlertCondition, Severity};
use watchkeep_core::analysis::{Finding, FindingCategory, PerSampleAnalysis, RiskLevel, SampleEntry};
use watchkeep_core::config::Config;
use watchkeep_core::error::AnalysisError;
use watchkeep_core::events::OrchestratorEvent;
use watchkeep_core::orchestrator::{InterruptReason, Orchestrator, OrchestratorState, TickOutcome};
use watchkeep_core::ports::{
    AnalysisContext, AnalysisProvider, CaptureProvider, CaptureRequest, CapturedImage,
    ManualClock, MemoryStorage,
};
use watchkeep_core::retry::ErrorClass;
use watchkeep_core::synthesis::SequenceReport;

fn at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 7, 14)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

// =============================================================================
// Fakes
// =============================================================================

#[derive(Default)]
struct FakeCamera {
    failure: Mutex<Option<ErrorClass>>,
    captures: AtomicU32,
    restarts: AtomicU32,
}

impl FakeCamera {
    fn fail_with(&self, class: Option<ErrorClass>) {
        *self.failure.lock().unwrap() = class;
    }
}

#[async_trait]
impl CaptureProvider for FakeCamera {
    async fn capture(&self, request: &CaptureRequest) -> Result<CapturedImage, AnalysisError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if let Some(class) = *self.failure.lock().unwrap() {
            return Err(AnalysisError::new(class, "camera unavailable"));
        }
        Ok(CapturedImage {
            subject_id: request.subject_id.clone(),
            sequence_id: request.sequence_id,
            sequence_index: request.sequence_index,
            captured_at: at(8, 0),
            content_type: "image/jpeg".to_string(),
            bytes: vec![0; 1_000],
        })
    }

    async fn restart(&self) -> Result<(), AnalysisError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeAnalyzer;

#[async_trait]
impl AnalysisProvider for FakeAnalyzer {
    async fn analyze(
        &self,
        _image: &CapturedImage,
        context: &AnalysisContext,
    ) -> Result<SampleEntry, AnalysisError> {
        Ok(SampleEntry::Parsed(PerSampleAnalysis {
            sequence_index: context.sequence_index,
            offset_secs: context.offset_secs,
            confidence: 0.9,
            health_score: Some(82.0),
            findings: vec![Finding::new(FindingCategory::Behavior, "resting", RiskLevel::Low)],
            emergency: false,
            recommendations: vec!["No action needed".to_string()],
        }))
    }
}

struct Harness {
    orchestrator: Orchestrator,
    state: Mutex<OrchestratorState>,
    camera: Arc<FakeCamera>,
    storage: Arc<MemoryStorage>,
    clock: Arc<ManualClock>,
    events: broadcast::Receiver<OrchestratorEvent>,
}

fn harness(configure: impl FnOnce(&mut Config)) -> Harness {
    let mut config = Config::default();
    config.schedule.day.samples_per_cycle = 4;
    config.schedule.day.retry.max_attempts = 2;
    config.orchestrator.sample_spacing_secs = 0;
    configure(&mut config);

    let camera = Arc::new(FakeCamera::default());
    let storage = Arc::new(MemoryStorage::new(1 << 30));
    let clock = Arc::new(ManualClock::new(at(8, 0)));
    let orchestrator = Orchestrator::new(
        "pen-7",
        config,
        camera.clone(),
        Arc::new(FakeAnalyzer),
        storage.clone(),
    )
    .with_clock(clock.clone());
    let events = orchestrator.events().subscribe();
    let state = Mutex::new(orchestrator.new_state());
    Harness {
        orchestrator,
        state,
        camera,
        storage,
        clock,
        events,
    }
}

fn drain(rx: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// An abort flag that is never raised.
fn idle_abort() -> watch::Receiver<bool> {
    watch::channel(false).1
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn completed_sequence_produces_report() {
    let mut h = harness(|_| {});
    let abort = idle_abort();

    let outcome = h.orchestrator.tick(&h.state, &abort).await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Completed {
            sequence_id: 1,
            available: true
        }
    );
    assert_eq!(h.camera.captures.load(Ordering::SeqCst), 4);
    assert_eq!(h.storage.photo_count(), 4);

    let reports = h.storage.reports();
    assert_eq!(reports.len(), 1);
    match &reports[0] {
        SequenceReport::Consensus { report, .. } => {
            assert_eq!(report.valid_samples, 4);
            assert_eq!(report.consensus_findings.len(), 1);
            assert_eq!(report.consensus_findings[0].code, "resting");
        }
        other => panic!("expected consensus report, got {other:?}"),
    }

    let events = drain(&mut h.events);
    assert!(matches!(events.first(), Some(OrchestratorEvent::ModeChanged { .. })));
    let captured = events
        .iter()
        .filter(|e| matches!(e, OrchestratorEvent::SampleCaptured { .. }))
        .count();
    assert_eq!(captured, 4);
    assert!(matches!(
        events.last(),
        Some(OrchestratorEvent::ReportReady { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn next_sequence_waits_for_interval() {
    let h = harness(|_| {});
    let abort = idle_abort();

    h.orchestrator.tick(&h.state, &abort).await.unwrap();
    h.clock.advance(ChronoDuration::minutes(10));
    assert_eq!(
        h.orchestrator.tick(&h.state, &abort).await.unwrap(),
        TickOutcome::Idle
    );

    h.clock.advance(ChronoDuration::minutes(20));
    assert_eq!(
        h.orchestrator.tick(&h.state, &abort).await.unwrap(),
        TickOutcome::Completed {
            sequence_id: 2,
            available: true
        }
    );
}

#[tokio::test(start_paused = true)]
async fn auth_error_interrupts_with_critical_alert() {
    let h = harness(|_| {});
    h.camera.fail_with(Some(ErrorClass::Auth));
    let abort = idle_abort();

    let outcome = h.orchestrator.tick(&h.state, &abort).await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Interrupted {
            sequence_id: 1,
            reason: InterruptReason::Fatal {
                class: ErrorClass::Auth
            }
        }
    );
    // fatal errors are not retried
    assert_eq!(h.camera.captures.load(Ordering::SeqCst), 1);
    assert!(h.storage.reports().is_empty());

    let state = h.state.lock().unwrap();
    assert_eq!(state.alerts().critical_count(), 1);
    assert!(state.alerts().alerts().iter().any(|a| matches!(
        a.source,
        AlertCondition::FatalProviderError { .. }
    )));
    assert_eq!(state.active_sequence(), None);
}

#[tokio::test(start_paused = true)]
async fn failing_samples_become_invalid_slots() {
    let h = harness(|c| c.health.emergency_shutdown_threshold = 100);
    h.camera.fail_with(Some(ErrorClass::Network));
    let abort = idle_abort();

    let outcome = h.orchestrator.tick(&h.state, &abort).await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Completed {
            sequence_id: 1,
            available: false
        }
    );
    // two attempts per slot
    assert_eq!(h.camera.captures.load(Ordering::SeqCst), 8);
    assert!(h.camera.restarts.load(Ordering::SeqCst) >= 1);

    let reports = h.storage.reports();
    assert!(matches!(
        &reports[0],
        SequenceReport::Unavailable { valid_samples: 0, required_samples: 2, .. }
    ));
    let state = h.state.lock().unwrap();
    assert!(state.alerts().alerts().iter().any(|a| matches!(
        a.source,
        AlertCondition::SynthesisUnavailable { .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn emergency_shutdown_halts_until_resumed() {
    let mut h = harness(|c| {
        c.schedule.day.retry.max_attempts = 1;
        c.health.emergency_shutdown_threshold = 3;
    });
    h.camera.fail_with(Some(ErrorClass::Timeout));
    let abort = idle_abort();

    let outcome = h.orchestrator.tick(&h.state, &abort).await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Interrupted {
            sequence_id: 1,
            reason: InterruptReason::Halted
        }
    );
    assert!(drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::SchedulingHalted { .. })));
    {
        let state = h.state.lock().unwrap();
        assert!(state
            .alerts()
            .alerts()
            .iter()
            .any(|a| a.severity == Severity::Emergency));
    }

    h.clock.advance(ChronoDuration::hours(1));
    assert_eq!(
        h.orchestrator.tick(&h.state, &abort).await.unwrap(),
        TickOutcome::Halted
    );

    h.camera.fail_with(None);
    h.orchestrator.resume(&h.state).await;
    assert!(drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::SchedulingResumed { .. })));

    let outcome = h.orchestrator.tick(&h.state, &abort).await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Completed {
            sequence_id: 2,
            available: true
        }
    );
}

#[tokio::test(start_paused = true)]
async fn maintenance_window_suspends_capture() {
    let h = harness(|c| {
        c.schedule.maintenance.push(watchkeep_core::schedule::MaintenanceWindow {
            name: "cleaning".to_string(),
            window: watchkeep_core::schedule::HourWindow::new(7, 9),
            enabled: true,
        });
    });
    let abort = idle_abort();

    let outcome = h.orchestrator.tick(&h.state, &abort).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Suspended { .. }));
    assert_eq!(h.camera.captures.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn pre_raised_abort_interrupts_sequence() {
    let h = harness(|_| {});
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let outcome = h.orchestrator.tick(&h.state, &rx).await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Interrupted {
            sequence_id: 1,
            reason: InterruptReason::Aborted
        }
    );
    assert_eq!(h.camera.captures.load(Ordering::SeqCst), 0);
    assert_eq!(h.state.lock().unwrap().active_sequence(), None);
}

#[tokio::test(start_paused = true)]
async fn run_loop_stops_on_shutdown() {
    let h = harness(|_| {});
    let (tx, rx) = watch::channel(false);

    let stopper = async {
        tokio::time::sleep(std::time::Duration::from_secs(120)).await;
        tx.send(true).unwrap();
    };
    let (result, ()) = tokio::join!(h.orchestrator.run(&h.state, rx), stopper);
    result.unwrap();

    // the clock never moved, so exactly one sequence ran
    assert_eq!(h.storage.reports().len(), 1);
    assert_eq!(h.camera.captures.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn acknowledge_through_orchestrator() {
    let h = harness(|_| {});
    h.camera.fail_with(Some(ErrorClass::Auth));
    let abort = idle_abort();
    h.orchestrator.tick(&h.state, &abort).await.unwrap();

    let id = h.state.lock().unwrap().alerts().alerts()[0].id.clone();
    h.orchestrator
        .acknowledge(&h.state, &id, "keeper")
        .await
        .unwrap();
    assert_eq!(h.state.lock().unwrap().alerts().critical_count(), 0);
    assert!(h
        .orchestrator
        .acknowledge(&h.state, "alert-404", "keeper")
        .await
        .is_err());
}
