//! Capture schedule resolution.
//!
//! A [`ScheduleResolver`] turns wall-clock time plus a read-only
//! [`ScheduleConfig`] into exactly one [`EffectiveSchedule`]. Precedence,
//! highest first:
//!
//! 1. an enabled [`MaintenanceWindow`] containing the current hour
//! 2. the first declared [`ScheduleOverride`] active at `now`
//! 3. the base period (day if its window contains the hour, else night)
//!
//! Resolution holds no state and can be called at any frequency.

use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::ConfigError;

const FULL_DAY_MASK: u32 = (1 << 24) - 1;

// =============================================================================
// Period building blocks
// =============================================================================

/// Capture quality setting, ordered from cheapest to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Low,
    Medium,
    High,
    Maximum,
}

impl Quality {
    /// One level lower, saturating at `Low`.
    #[must_use]
    pub const fn step_down(self) -> Self {
        match self {
            Self::Maximum => Self::High,
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Maximum => "maximum",
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry parameters attached to a period. See [`crate::retry::RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub backoff_multiplier: f64,
    pub max_delay_secs: u64,
    pub jitter_fraction: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::daytime()
    }
}

impl RetrySettings {
    #[must_use]
    pub const fn daytime() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 5,
            backoff_multiplier: 2.0,
            max_delay_secs: 300,
            jitter_fraction: 0.1,
        }
    }

    #[must_use]
    pub const fn nighttime() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 10,
            backoff_multiplier: 2.0,
            max_delay_secs: 600,
            jitter_fraction: 0.1,
        }
    }
}

/// Photo storage policy handed to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragePolicy {
    pub compress: bool,
    /// JPEG-style quality, 1..=100.
    pub compression_quality: u8,
    pub retention_days: u32,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            compress: true,
            compression_quality: 85,
            retention_days: 30,
        }
    }
}

/// Hour-of-day window `[start_hour, end_hour)`.
///
/// When `end_hour <= start_hour` the window wraps past midnight, so
/// `start_hour == end_hour` covers the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HourWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl HourWindow {
    #[must_use]
    pub const fn new(start_hour: u8, end_hour: u8) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    #[must_use]
    pub const fn contains(&self, hour: u32) -> bool {
        let start = self.start_hour as u32;
        let end = self.end_hour as u32;
        if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    /// Bitmask of covered hours (bit `h` set when hour `h` is inside).
    #[must_use]
    pub fn hour_mask(&self) -> u32 {
        (0..24).filter(|h| self.contains(*h)).fold(0, |m, h| m | (1 << h))
    }

    fn validate(&self, what: &str) -> Result<(), ConfigError> {
        if self.start_hour > 23 || self.end_hour > 23 {
            return Err(ConfigError::ValidationError(format!(
                "{what}: hours must be in 0..=23 (got {}..{})",
                self.start_hour, self.end_hour
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for HourWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:00-{:02}:00", self.start_hour, self.end_hour)
    }
}

/// A named time-of-day operating mode.
///
/// Read from config through [`deserialize_day`] or [`deserialize_night`], so
/// omitted fields come from that period's built-in settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulePeriod {
    pub name: String,
    pub window: HourWindow,
    pub interval_minutes: u32,
    pub samples_per_cycle: u32,
    pub quality: Quality,
    pub enabled: bool,
    pub priority: u8,
    pub retry: RetrySettings,
    pub storage: StoragePolicy,
}

/// Config form of a period: every field optional.
#[derive(Deserialize)]
struct PeriodTable {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    window: Option<HourWindow>,
    #[serde(flatten)]
    changes: PeriodPatch,
}

impl PeriodTable {
    fn over(self, builtin: &SchedulePeriod) -> SchedulePeriod {
        let mut period = merge_period(builtin, &self.changes);
        if let Some(name) = self.name {
            period.name = name;
        }
        if let Some(window) = self.window {
            period.window = window;
        }
        period
    }
}

fn deserialize_day<'de, D>(deserializer: D) -> Result<SchedulePeriod, D::Error>
where
    D: Deserializer<'de>,
{
    PeriodTable::deserialize(deserializer).map(|t| t.over(&SchedulePeriod::daytime()))
}

fn deserialize_night<'de, D>(deserializer: D) -> Result<SchedulePeriod, D::Error>
where
    D: Deserializer<'de>,
{
    PeriodTable::deserialize(deserializer).map(|t| t.over(&SchedulePeriod::nighttime()))
}

fn default_true() -> bool {
    true
}

impl SchedulePeriod {
    /// Built-in day period: 06-20, every 30 minutes, high quality, 3 attempts.
    #[must_use]
    pub fn daytime() -> Self {
        Self {
            name: "daytime".to_string(),
            window: HourWindow::new(6, 20),
            interval_minutes: 30,
            samples_per_cycle: 10,
            quality: Quality::High,
            enabled: true,
            priority: 2,
            retry: RetrySettings::daytime(),
            storage: StoragePolicy::default(),
        }
    }

    /// Built-in night period: 20-06, hourly, medium quality, 5 attempts.
    #[must_use]
    pub fn nighttime() -> Self {
        Self {
            name: "nighttime".to_string(),
            window: HourWindow::new(20, 6),
            interval_minutes: 60,
            samples_per_cycle: 10,
            quality: Quality::Medium,
            enabled: true,
            priority: 1,
            retry: RetrySettings::nighttime(),
            storage: StoragePolicy {
                compression_quality: 75,
                ..StoragePolicy::default()
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let what = format!("period {}", self.name);
        self.window.validate(&what)?;
        if self.enabled && self.interval_minutes == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{what}: interval_minutes must be positive"
            )));
        }
        if self.enabled && self.samples_per_cycle == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{what}: samples_per_cycle must be positive"
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{what}: retry.max_attempts must be at least 1"
            )));
        }
        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "{what}: retry.backoff_multiplier must be >= 1.0"
            )));
        }
        if !(0.0..=0.1).contains(&self.retry.jitter_fraction) {
            return Err(ConfigError::ValidationError(format!(
                "{what}: retry.jitter_fraction must be within 0.0..=0.1"
            )));
        }
        if !(1..=100).contains(&self.storage.compression_quality) {
            return Err(ConfigError::ValidationError(format!(
                "{what}: storage.compression_quality must be within 1..=100"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Overrides and maintenance
// =============================================================================

/// What an active override does to the base period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    /// Suspend capture.
    Disable,
    /// Patch the base period field by field.
    Modify,
    /// Tighten cadence: half the interval, quality at least high.
    Enhance,
    /// Suspend capture.
    Pause,
}

impl OverrideAction {
    #[must_use]
    pub const fn suspends_capture(self) -> bool {
        matches!(self, Self::Disable | Self::Pause)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_fraction: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_quality: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
}

/// Partial period. Present fields replace the base value, absent fields keep it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples_per_cycle: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StoragePatch>,
}

/// Merge `patch` over `base` one field at a time.
///
/// Nested retry and storage settings are merged the same way, so a patch
/// that only sets `retry.max_attempts` keeps the base backoff parameters.
#[must_use]
pub fn merge_period(base: &SchedulePeriod, patch: &PeriodPatch) -> SchedulePeriod {
    let mut merged = base.clone();
    if let Some(v) = patch.interval_minutes {
        merged.interval_minutes = v;
    }
    if let Some(v) = patch.samples_per_cycle {
        merged.samples_per_cycle = v;
    }
    if let Some(v) = patch.quality {
        merged.quality = v;
    }
    if let Some(v) = patch.enabled {
        merged.enabled = v;
    }
    if let Some(v) = patch.priority {
        merged.priority = v;
    }
    if let Some(retry) = &patch.retry {
        let r = &mut merged.retry;
        if let Some(v) = retry.max_attempts {
            r.max_attempts = v;
        }
        if let Some(v) = retry.base_delay_secs {
            r.base_delay_secs = v;
        }
        if let Some(v) = retry.backoff_multiplier {
            r.backoff_multiplier = v;
        }
        if let Some(v) = retry.max_delay_secs {
            r.max_delay_secs = v;
        }
        if let Some(v) = retry.jitter_fraction {
            r.jitter_fraction = v;
        }
    }
    if let Some(storage) = &patch.storage {
        let s = &mut merged.storage;
        if let Some(v) = storage.compress {
            s.compress = v;
        }
        if let Some(v) = storage.compression_quality {
            s.compression_quality = v;
        }
        if let Some(v) = storage.retention_days {
            s.retention_days = v;
        }
    }
    merged
}

/// Tightened cadence used by [`OverrideAction::Enhance`].
#[must_use]
pub fn enhance_period(base: &SchedulePeriod) -> SchedulePeriod {
    SchedulePeriod {
        interval_minutes: (base.interval_minutes / 2).max(1),
        quality: base.quality.max(Quality::High),
        enabled: true,
        ..base.clone()
    }
}

/// A time-bounded patch that supersedes the base schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOverride {
    pub id: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_hours: Option<HourWindow>,
    pub action: OverrideAction,
    #[serde(default)]
    pub changes: PeriodPatch,
    #[serde(default)]
    pub recurring: bool,
}

impl ScheduleOverride {
    /// Whether this override applies at `now`.
    ///
    /// One-off overrides cover `[start, end)`, narrowed to `specific_hours`
    /// when set. Recurring overrides apply on every date from `start` to
    /// `end` inclusive, during `specific_hours` or else the daily time span
    /// `start.time()..end.time()`.
    #[must_use]
    pub fn is_active(&self, now: NaiveDateTime) -> bool {
        if self.recurring {
            let date = now.date();
            if date < self.start.date() || date > self.end.date() {
                return false;
            }
            match self.specific_hours {
                Some(hours) => hours.contains(now.hour()),
                None => time_in_span(now.time(), self.start.time(), self.end.time()),
            }
        } else {
            if now < self.start || now >= self.end {
                return false;
            }
            self.specific_hours
                .is_none_or(|hours| hours.contains(now.hour()))
        }
    }

    /// Conservative outer bound `[from, to)` of instants this override may cover.
    fn outer_span(&self) -> (NaiveDateTime, NaiveDateTime) {
        if self.recurring {
            let from = self.start.date().and_time(NaiveTime::MIN);
            let to = self.end.date().and_time(NaiveTime::MIN) + ChronoDuration::days(1);
            (from, to)
        } else {
            (self.start, self.end)
        }
    }

    /// Hours of the day this override may cover.
    fn hour_mask(&self) -> u32 {
        if let Some(hours) = self.specific_hours {
            return hours.hour_mask();
        }
        if !self.recurring && self.end - self.start >= ChronoDuration::days(1) {
            return FULL_DAY_MASK;
        }
        span_hour_mask(self.start.time(), self.end.time())
    }

    /// Whether both overrides could be active at the same instant.
    ///
    /// Errs on the side of reporting an overlap.
    #[must_use]
    pub fn may_overlap(&self, other: &Self) -> bool {
        let (a_from, a_to) = self.outer_span();
        let (b_from, b_to) = other.outer_span();
        a_from < b_to && b_from < a_to && (self.hour_mask() & other.hour_mask()) != 0
    }

    /// Instants at which this override may switch on or off within `[from, to]`.
    fn boundaries(&self, from: NaiveDateTime, to: NaiveDateTime) -> Vec<NaiveDateTime> {
        let mut out = vec![self.start, self.end];
        if self.recurring && self.specific_hours.is_none() {
            let mut date = from.date().max(self.start.date());
            let last = to.date().min(self.end.date());
            while date <= last {
                out.push(date.and_time(self.start.time()));
                out.push(date.and_time(self.end.time()));
                match date.succ_opt() {
                    Some(next) => date = next,
                    None => break,
                }
            }
        }
        out.retain(|t| *t > from && *t <= to);
        out
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "override id must not be empty".to_string(),
            ));
        }
        if self.end <= self.start {
            return Err(ConfigError::ValidationError(format!(
                "override {}: end must be after start",
                self.id
            )));
        }
        if let Some(hours) = self.specific_hours {
            hours.validate(&format!("override {}", self.id))?;
        }
        Ok(())
    }
}

fn time_in_span(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    match start.cmp(&end) {
        std::cmp::Ordering::Less => t >= start && t < end,
        std::cmp::Ordering::Greater => t >= start || t < end,
        std::cmp::Ordering::Equal => true,
    }
}

fn span_hour_mask(start: NaiveTime, end: NaiveTime) -> u32 {
    if start == end {
        return FULL_DAY_MASK;
    }
    // `end` is exclusive; NaiveTime subtraction wraps at midnight
    let last = (end - ChronoDuration::seconds(1)).hour();
    let mut hour = start.hour();
    // a wrapping span that ends inside its starting hour touches every hour
    if end < start && last == hour {
        return FULL_DAY_MASK;
    }
    let mut mask = 1u32 << hour;
    while hour != last {
        hour = (hour + 1) % 24;
        mask |= 1 << hour;
    }
    mask
}

/// Hour range during which capture is suppressed regardless of period or override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub name: String,
    pub window: HourWindow,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl MaintenanceWindow {
    #[must_use]
    pub fn is_active(&self, now: NaiveDateTime) -> bool {
        self.enabled && self.window.contains(now.hour())
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Read-only schedule configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    #[serde(deserialize_with = "deserialize_day")]
    pub day: SchedulePeriod,
    #[serde(deserialize_with = "deserialize_night")]
    pub night: SchedulePeriod,
    pub overrides: Vec<ScheduleOverride>,
    pub maintenance: Vec<MaintenanceWindow>,
    /// Treat overrides that can be active at the same time as a load error
    /// instead of letting the first declared one win.
    pub reject_overlapping_overrides: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            day: SchedulePeriod::daytime(),
            night: SchedulePeriod::nighttime(),
            overrides: Vec::new(),
            maintenance: Vec::new(),
            reject_overlapping_overrides: false,
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.day.validate()?;
        self.night.validate()?;
        for window in &self.maintenance {
            window
                .window
                .validate(&format!("maintenance window {}", window.name))?;
        }
        for (i, o) in self.overrides.iter().enumerate() {
            o.validate()?;
            for base in [&self.day, &self.night] {
                merge_period(base, &o.changes)
                    .validate()
                    .map_err(|err| match err {
                        ConfigError::ValidationError(msg) => {
                            ConfigError::ValidationError(format!("override {}: {msg}", o.id))
                        }
                        other => other,
                    })?;
            }
            if self.overrides[..i].iter().any(|prev| prev.id == o.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate override id {}",
                    o.id
                )));
            }
        }

        if self.reject_overlapping_overrides {
            for (i, first) in self.overrides.iter().enumerate() {
                if let Some(second) = self.overrides[i + 1..]
                    .iter()
                    .find(|other| first.may_overlap(other))
                {
                    return Err(ConfigError::OverlappingOverrides {
                        first: first.id.clone(),
                        second: second.id.clone(),
                    });
                }
            }
        }

        let day = self.day.window.hour_mask();
        let night = self.night.window.hour_mask();
        if day & night != 0 {
            warn!(
                day = %self.day.window,
                night = %self.night.window,
                "Day and night windows overlap; day wins for shared hours"
            );
        }
        if day | night != FULL_DAY_MASK {
            warn!(
                day = %self.day.window,
                night = %self.night.window,
                "Day and night windows leave a gap; night covers uncovered hours"
            );
        }
        Ok(())
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Which base period an instant falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasePeriod {
    Day,
    Night,
}

/// Coarse mode tag used to key per-mode state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Daytime,
    Nighttime,
    Maintenance,
    Override,
}

impl std::fmt::Display for ModeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Daytime => "daytime",
            Self::Nighttime => "nighttime",
            Self::Maintenance => "maintenance",
            Self::Override => "override",
        })
    }
}

/// The single operating mode active at an instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleMode {
    Daytime,
    Nighttime,
    Maintenance {
        window: String,
    },
    Override {
        id: String,
        action: OverrideAction,
        base: BasePeriod,
    },
}

impl ScheduleMode {
    #[must_use]
    pub const fn kind(&self) -> ModeKind {
        match self {
            Self::Daytime => ModeKind::Daytime,
            Self::Nighttime => ModeKind::Nighttime,
            Self::Maintenance { .. } => ModeKind::Maintenance,
            Self::Override { .. } => ModeKind::Override,
        }
    }
}

impl std::fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daytime | Self::Nighttime => write!(f, "{}", self.kind()),
            Self::Maintenance { window } => write!(f, "maintenance({window})"),
            Self::Override { id, .. } => write!(f, "override({id})"),
        }
    }
}

/// Resolved cadence and parameters at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveSchedule {
    pub mode: ScheduleMode,
    /// Name of the base period the parameters derive from.
    pub period: String,
    pub capture_enabled: bool,
    /// Minutes between capture cycles; 0 while capture is suspended.
    pub interval_minutes: u32,
    pub samples_per_cycle: u32,
    pub quality: Quality,
    pub priority: u8,
    pub retry: RetrySettings,
    pub storage: StoragePolicy,
    pub resolved_at: NaiveDateTime,
}

impl EffectiveSchedule {
    fn from_period(
        mode: ScheduleMode,
        base_name: &str,
        period: &SchedulePeriod,
        capture_enabled: bool,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            mode,
            period: base_name.to_string(),
            capture_enabled,
            interval_minutes: if capture_enabled {
                period.interval_minutes
            } else {
                0
            },
            samples_per_cycle: period.samples_per_cycle,
            quality: period.quality,
            priority: period.priority,
            retry: period.retry.clone(),
            storage: period.storage.clone(),
            resolved_at: now,
        }
    }

    /// Whether a new capture cycle should start at `now`.
    #[must_use]
    pub fn is_capture_due(&self, last_cycle_at: Option<NaiveDateTime>, now: NaiveDateTime) -> bool {
        if !self.capture_enabled || self.interval_minutes == 0 {
            return false;
        }
        last_cycle_at.is_none_or(|last| {
            now - last >= ChronoDuration::minutes(i64::from(self.interval_minutes))
        })
    }
}

/// A mode change in the upcoming timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTransition {
    pub at: NaiveDateTime,
    pub from: ScheduleMode,
    pub to: ScheduleMode,
    pub capture_enabled: bool,
    pub interval_minutes: u32,
}

/// Pure resolver over a read-only [`ScheduleConfig`].
#[derive(Debug, Clone)]
pub struct ScheduleResolver {
    config: ScheduleConfig,
}

impl ScheduleResolver {
    #[must_use]
    pub const fn new(config: ScheduleConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Base period for `now`: day if its window contains the hour, else night.
    #[must_use]
    pub fn base_period(&self, now: NaiveDateTime) -> (BasePeriod, &SchedulePeriod) {
        if self.config.day.window.contains(now.hour()) {
            (BasePeriod::Day, &self.config.day)
        } else {
            (BasePeriod::Night, &self.config.night)
        }
    }

    /// First declared override active at `now`.
    #[must_use]
    pub fn active_override(&self, now: NaiveDateTime) -> Option<&ScheduleOverride> {
        self.config.overrides.iter().find(|o| o.is_active(now))
    }

    #[must_use]
    pub fn resolve(&self, now: NaiveDateTime) -> EffectiveSchedule {
        let (base_kind, base) = self.base_period(now);

        if let Some(window) = self.config.maintenance.iter().find(|w| w.is_active(now)) {
            let mode = ScheduleMode::Maintenance {
                window: window.name.clone(),
            };
            return EffectiveSchedule::from_period(mode, &base.name, base, false, now);
        }

        if let Some(o) = self.active_override(now) {
            let mode = ScheduleMode::Override {
                id: o.id.clone(),
                action: o.action,
                base: base_kind,
            };
            return match o.action {
                OverrideAction::Disable | OverrideAction::Pause => {
                    EffectiveSchedule::from_period(mode, &base.name, base, false, now)
                }
                OverrideAction::Modify => {
                    let merged = merge_period(base, &o.changes);
                    let enabled = merged.enabled && merged.interval_minutes > 0;
                    EffectiveSchedule::from_period(mode, &base.name, &merged, enabled, now)
                }
                OverrideAction::Enhance => {
                    let enhanced = enhance_period(base);
                    EffectiveSchedule::from_period(mode, &base.name, &enhanced, true, now)
                }
            };
        }

        let mode = match base_kind {
            BasePeriod::Day => ScheduleMode::Daytime,
            BasePeriod::Night => ScheduleMode::Nighttime,
        };
        EffectiveSchedule::from_period(mode, &base.name, base, base.enabled, now)
    }

    /// Mode changes within `(from, from + horizon]`.
    ///
    /// Candidate instants are hour boundaries plus override start/end times.
    #[must_use]
    pub fn transitions(&self, from: NaiveDateTime, horizon: ChronoDuration) -> Vec<ScheduleTransition> {
        let to = from + horizon;
        let mut candidates = Vec::new();

        let mut hour = from
            .date()
            .and_hms_opt(from.hour(), 0, 0)
            .unwrap_or(from)
            + ChronoDuration::hours(1);
        while hour <= to {
            candidates.push(hour);
            hour += ChronoDuration::hours(1);
        }
        for o in &self.config.overrides {
            candidates.extend(o.boundaries(from, to));
        }
        candidates.sort_unstable();
        candidates.dedup();

        let mut current = self.resolve(from).mode;
        let mut out = Vec::new();
        for at in candidates {
            let next = self.resolve(at);
            if next.mode != current {
                out.push(ScheduleTransition {
                    at,
                    from: std::mem::replace(&mut current, next.mode.clone()),
                    to: next.mode,
                    capture_enabled: next.capture_enabled,
                    interval_minutes: next.interval_minutes,
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    fn override_of(id: &str, action: OverrideAction, start: NaiveDateTime, end: NaiveDateTime) -> ScheduleOverride {
        ScheduleOverride {
            id: id.to_string(),
            start,
            end,
            specific_hours: None,
            action,
            changes: PeriodPatch::default(),
            recurring: false,
        }
    }

    #[test]
    fn hour_window_wraps() {
        let night = HourWindow::new(20, 6);
        assert!(night.contains(20));
        assert!(night.contains(23));
        assert!(night.contains(0));
        assert!(night.contains(5));
        assert!(!night.contains(6));
        assert!(!night.contains(19));

        let all = HourWindow::new(7, 7);
        assert!((0..24).all(|h| all.contains(h)));
        assert_eq!(all.hour_mask(), FULL_DAY_MASK);
    }

    #[test]
    fn base_period_boundaries() {
        let resolver = ScheduleResolver::new(ScheduleConfig::default());
        assert_eq!(resolver.resolve(at(2026, 3, 1, 5, 59)).mode, ScheduleMode::Nighttime);
        assert_eq!(resolver.resolve(at(2026, 3, 1, 6, 0)).mode, ScheduleMode::Daytime);
        assert_eq!(resolver.resolve(at(2026, 3, 1, 19, 59)).mode, ScheduleMode::Daytime);
        assert_eq!(resolver.resolve(at(2026, 3, 1, 20, 0)).mode, ScheduleMode::Nighttime);

        let day = resolver.resolve(at(2026, 3, 1, 12, 0));
        assert!(day.capture_enabled);
        assert_eq!(day.interval_minutes, 30);
        assert_eq!(day.quality, Quality::High);
        assert_eq!(day.retry.max_attempts, 3);

        let night = resolver.resolve(at(2026, 3, 1, 2, 0));
        assert_eq!(night.interval_minutes, 60);
        assert_eq!(night.retry.max_attempts, 5);
        assert_eq!(night.period, "nighttime");
    }

    #[test]
    fn disabled_period_suspends_capture() {
        let mut config = ScheduleConfig::default();
        config.night.enabled = false;
        let resolved = ScheduleResolver::new(config).resolve(at(2026, 3, 1, 1, 0));
        assert_eq!(resolved.mode, ScheduleMode::Nighttime);
        assert!(!resolved.capture_enabled);
        assert_eq!(resolved.interval_minutes, 0);
    }

    #[test]
    fn maintenance_outranks_override() {
        let mut config = ScheduleConfig::default();
        config.maintenance.push(MaintenanceWindow {
            name: "backup".to_string(),
            window: HourWindow::new(2, 3),
            enabled: true,
        });
        config.overrides.push(override_of(
            "vet-visit",
            OverrideAction::Enhance,
            at(2026, 3, 1, 0, 0),
            at(2026, 3, 2, 0, 0),
        ));
        let resolver = ScheduleResolver::new(config);

        let r = resolver.resolve(at(2026, 3, 1, 2, 30));
        assert_eq!(
            r.mode,
            ScheduleMode::Maintenance {
                window: "backup".to_string()
            }
        );
        assert!(!r.capture_enabled);
        assert_eq!(r.interval_minutes, 0);

        let r = resolver.resolve(at(2026, 3, 1, 3, 0));
        assert_eq!(r.mode.kind(), ModeKind::Override);
    }

    #[test]
    fn disabled_maintenance_is_ignored() {
        let mut config = ScheduleConfig::default();
        config.maintenance.push(MaintenanceWindow {
            name: "off".to_string(),
            window: HourWindow::new(0, 0),
            enabled: false,
        });
        let r = ScheduleResolver::new(config).resolve(at(2026, 3, 1, 10, 0));
        assert_eq!(r.mode, ScheduleMode::Daytime);
    }

    #[test]
    fn modify_merges_field_by_field() {
        let mut o = override_of(
            "tuning",
            OverrideAction::Modify,
            at(2026, 3, 1, 0, 0),
            at(2026, 3, 3, 0, 0),
        );
        o.changes = PeriodPatch {
            interval_minutes: Some(10),
            retry: Some(RetryPatch {
                max_attempts: Some(7),
                ..RetryPatch::default()
            }),
            ..PeriodPatch::default()
        };
        let mut config = ScheduleConfig::default();
        config.overrides.push(o);
        let r = ScheduleResolver::new(config).resolve(at(2026, 3, 2, 9, 0));

        assert_eq!(
            r.mode,
            ScheduleMode::Override {
                id: "tuning".to_string(),
                action: OverrideAction::Modify,
                base: BasePeriod::Day,
            }
        );
        assert_eq!(r.interval_minutes, 10);
        assert_eq!(r.retry.max_attempts, 7);
        // untouched fields inherit from the day period
        assert_eq!(r.retry.base_delay_secs, 5);
        assert_eq!(r.quality, Quality::High);
        assert_eq!(r.samples_per_cycle, 10);
    }

    #[test]
    fn modify_can_disable_capture() {
        let mut o = override_of("quiet", OverrideAction::Modify, at(2026, 3, 1, 0, 0), at(2026, 3, 2, 0, 0));
        o.changes.enabled = Some(false);
        let mut config = ScheduleConfig::default();
        config.overrides.push(o);
        let r = ScheduleResolver::new(config).resolve(at(2026, 3, 1, 12, 0));
        assert!(!r.capture_enabled);
        assert_eq!(r.interval_minutes, 0);
    }

    #[test]
    fn pause_and_disable_suspend_capture() {
        for action in [OverrideAction::Pause, OverrideAction::Disable] {
            let mut config = ScheduleConfig::default();
            config
                .overrides
                .push(override_of("hold", action, at(2026, 3, 1, 0, 0), at(2026, 3, 2, 0, 0)));
            let r = ScheduleResolver::new(config).resolve(at(2026, 3, 1, 22, 0));
            assert!(!r.capture_enabled, "{action:?}");
            assert_eq!(r.interval_minutes, 0);
            assert_eq!(r.period, "nighttime");
        }
    }

    #[test]
    fn enhance_tightens_cadence() {
        let mut config = ScheduleConfig::default();
        config.overrides.push(override_of(
            "watch",
            OverrideAction::Enhance,
            at(2026, 3, 1, 0, 0),
            at(2026, 3, 2, 0, 0),
        ));
        let r = ScheduleResolver::new(config).resolve(at(2026, 3, 1, 23, 0));
        assert!(r.capture_enabled);
        assert_eq!(r.interval_minutes, 30);
        assert_eq!(r.quality, Quality::High);

        let mut tiny = SchedulePeriod::daytime();
        tiny.interval_minutes = 1;
        tiny.quality = Quality::Maximum;
        let e = enhance_period(&tiny);
        assert_eq!(e.interval_minutes, 1);
        assert_eq!(e.quality, Quality::Maximum);
    }

    #[test]
    fn override_end_is_exclusive() {
        let mut config = ScheduleConfig::default();
        config.overrides.push(override_of(
            "short",
            OverrideAction::Pause,
            at(2026, 3, 1, 10, 0),
            at(2026, 3, 1, 11, 0),
        ));
        let resolver = ScheduleResolver::new(config);
        assert_eq!(resolver.resolve(at(2026, 3, 1, 9, 59)).mode, ScheduleMode::Daytime);
        assert_eq!(resolver.resolve(at(2026, 3, 1, 10, 0)).mode.kind(), ModeKind::Override);
        assert_eq!(resolver.resolve(at(2026, 3, 1, 11, 0)).mode, ScheduleMode::Daytime);
    }

    #[test]
    fn specific_hours_narrow_one_off_override() {
        let mut o = override_of("noon", OverrideAction::Pause, at(2026, 3, 1, 0, 0), at(2026, 3, 5, 0, 0));
        o.specific_hours = Some(HourWindow::new(12, 14));
        assert!(o.is_active(at(2026, 3, 2, 12, 30)));
        assert!(!o.is_active(at(2026, 3, 2, 14, 0)));
        assert!(!o.is_active(at(2026, 3, 5, 12, 0)));
    }

    #[test]
    fn recurring_override_uses_daily_time_span() {
        let mut o = override_of(
            "feeding",
            OverrideAction::Enhance,
            at(2026, 3, 1, 7, 0),
            at(2026, 3, 3, 8, 30),
        );
        o.recurring = true;
        assert!(o.is_active(at(2026, 3, 2, 7, 15)));
        assert!(o.is_active(at(2026, 3, 3, 8, 29)));
        assert!(!o.is_active(at(2026, 3, 2, 9, 0)));
        assert!(!o.is_active(at(2026, 3, 4, 7, 15)));

        o.specific_hours = Some(HourWindow::new(22, 2));
        assert!(o.is_active(at(2026, 3, 2, 23, 0)));
        assert!(o.is_active(at(2026, 3, 2, 1, 0)));
        assert!(!o.is_active(at(2026, 3, 2, 7, 15)));
    }

    #[test]
    fn first_declared_override_wins() {
        let mut config = ScheduleConfig::default();
        config.overrides.push(override_of("first", OverrideAction::Pause, at(2026, 3, 1, 0, 0), at(2026, 3, 2, 0, 0)));
        config.overrides.push(override_of("second", OverrideAction::Enhance, at(2026, 3, 1, 0, 0), at(2026, 3, 2, 0, 0)));
        let r = ScheduleResolver::new(config.clone()).resolve(at(2026, 3, 1, 12, 0));
        match r.mode {
            ScheduleMode::Override { id, .. } => assert_eq!(id, "first"),
            other => panic!("unexpected mode {other:?}"),
        }

        assert!(config.validate().is_ok());
        config.reject_overlapping_overrides = true;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OverlappingOverrides { ref first, ref second } if first == "first" && second == "second"
        ));
    }

    #[test]
    fn disjoint_hours_do_not_overlap() {
        let mut a = override_of("morning", OverrideAction::Pause, at(2026, 3, 1, 0, 0), at(2026, 3, 9, 0, 0));
        a.specific_hours = Some(HourWindow::new(6, 9));
        let mut b = override_of("evening", OverrideAction::Enhance, at(2026, 3, 1, 0, 0), at(2026, 3, 9, 0, 0));
        b.specific_hours = Some(HourWindow::new(18, 21));
        assert!(!a.may_overlap(&b));

        let c = override_of("later", OverrideAction::Pause, at(2026, 3, 9, 0, 0), at(2026, 3, 10, 0, 0));
        assert!(!a.may_overlap(&c));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = ScheduleConfig::default();
        config.day.window.end_hour = 24;
        assert!(config.validate().is_err());

        let mut config = ScheduleConfig::default();
        config.day.interval_minutes = 0;
        assert!(config.validate().is_err());

        let mut config = ScheduleConfig::default();
        config.overrides.push(override_of("backwards", OverrideAction::Pause, at(2026, 3, 2, 0, 0), at(2026, 3, 1, 0, 0)));
        assert!(config.validate().is_err());

        let mut config = ScheduleConfig::default();
        config.overrides.push(override_of("dup", OverrideAction::Pause, at(2026, 3, 1, 0, 0), at(2026, 3, 2, 0, 0)));
        config.overrides.push(override_of("dup", OverrideAction::Pause, at(2026, 4, 1, 0, 0), at(2026, 4, 2, 0, 0)));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_override_changes() {
        let mut config = ScheduleConfig::default();
        let mut o = override_of("noop", OverrideAction::Modify, at(2026, 3, 1, 0, 0), at(2026, 3, 2, 0, 0));
        o.changes.samples_per_cycle = Some(0);
        config.overrides.push(o);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("override noop"), "{err}");
        assert!(err.contains("samples_per_cycle"), "{err}");

        let bad_retry = [
            RetryPatch { max_attempts: Some(0), ..RetryPatch::default() },
            RetryPatch { jitter_fraction: Some(0.9), ..RetryPatch::default() },
            RetryPatch { backoff_multiplier: Some(0.5), ..RetryPatch::default() },
        ];
        for retry in bad_retry {
            let mut config = ScheduleConfig::default();
            let mut o = override_of("retry", OverrideAction::Modify, at(2026, 3, 1, 0, 0), at(2026, 3, 2, 0, 0));
            o.changes.retry = Some(retry.clone());
            config.overrides.push(o);
            assert!(config.validate().is_err(), "{retry:?} accepted");
        }

        let mut config = ScheduleConfig::default();
        let mut o = override_of("slow", OverrideAction::Modify, at(2026, 3, 1, 0, 0), at(2026, 3, 2, 0, 0));
        o.changes.retry = Some(RetryPatch { max_attempts: Some(2), ..RetryPatch::default() });
        o.changes.samples_per_cycle = Some(4);
        config.overrides.push(o);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn capture_due_respects_interval() {
        let resolver = ScheduleResolver::new(ScheduleConfig::default());
        let now = at(2026, 3, 1, 12, 0);
        let r = resolver.resolve(now);
        assert!(r.is_capture_due(None, now));
        assert!(!r.is_capture_due(Some(at(2026, 3, 1, 11, 31)), now));
        assert!(r.is_capture_due(Some(at(2026, 3, 1, 11, 30)), now));
    }

    #[test]
    fn transitions_cover_day_night_and_overrides() {
        let mut config = ScheduleConfig::default();
        config.overrides.push(override_of(
            "check",
            OverrideAction::Enhance,
            at(2026, 3, 1, 10, 15),
            at(2026, 3, 1, 10, 45),
        ));
        let resolver = ScheduleResolver::new(config);
        let changes = resolver.transitions(at(2026, 3, 1, 5, 30), ChronoDuration::hours(24));

        let times: Vec<_> = changes.iter().map(|t| t.at).collect();
        assert_eq!(
            times,
            vec![
                at(2026, 3, 1, 6, 0),
                at(2026, 3, 1, 10, 15),
                at(2026, 3, 1, 10, 45),
                at(2026, 3, 1, 20, 0),
            ]
        );
        assert_eq!(changes[0].from, ScheduleMode::Nighttime);
        assert_eq!(changes[0].to, ScheduleMode::Daytime);
        assert_eq!(changes[1].to.kind(), ModeKind::Override);
        assert_eq!(changes[2].to, ScheduleMode::Daytime);
    }

    #[test]
    fn mode_serializes_as_tagged_variant() {
        let mode = ScheduleMode::Override {
            id: "x".to_string(),
            action: OverrideAction::Enhance,
            base: BasePeriod::Night,
        };
        let json = serde_json::to_value(&mode).unwrap();
        assert_eq!(json["kind"], "override");
        assert_eq!(json["action"], "enhance");
        assert_eq!(json["base"], "night");
    }

    #[test]
    fn quality_steps_down() {
        assert_eq!(Quality::Maximum.step_down(), Quality::High);
        assert_eq!(Quality::Low.step_down(), Quality::Low);
    }
}
