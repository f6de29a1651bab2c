//! watchkeep-core: adaptive capture scheduling and consensus analysis
//!
//! Decides when to photograph a watched subject, keeps the capture path
//! healthy with bounded retries and auto-recovery, and fuses a fixed-length
//! sequence of independent per-photo assessments into one consensus report.
//!
//! # Architecture
//!
//! ```text
//! Clock tick → ScheduleResolver → Orchestrator ── capture/analyze (RetryPolicy)
//!                                      │                 ↓
//!                                      │           HealthMonitor → AlertManager
//!                                      ↓
//!                                 Synthesizer → StorageSink / EventBus
//! ```
//!
//! # Modules
//!
//! - `schedule`: day/night periods, overrides, maintenance windows, resolution
//! - `retry`: error classes, backoff policy, abortable retry executor
//! - `health`: rolling outcome statistics and auto-recovery escalation
//! - `alerts`: append-only alert log with derived counters
//! - `analysis`: per-sample analysis model and validation
//! - `synthesis`: N-sample consensus, trend, risk and reliability
//! - `ports`: capture, analysis, storage and clock boundaries
//! - `events`: event bus for the presentation layer
//! - `orchestrator`: caller-owned state machine and async control loop
//! - `config`: TOML/YAML configuration
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod alerts;
pub mod analysis;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod logging;
pub mod orchestrator;
pub mod ports;
pub mod retry;
pub mod schedule;
pub mod synthesis;

pub use error::{Error, Result};

/// Version of the watchkeep-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
