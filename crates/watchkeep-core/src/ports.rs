//! Boundaries to the collaborators the engine drives but does not own:
//! the camera, the AI analysis provider, storage and the wall clock.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::analysis::SampleEntry;
use crate::error::{AnalysisError, StorageError};
use crate::schedule::{ModeKind, Quality, StoragePolicy};
use crate::synthesis::SequenceReport;

/// One capture to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub subject_id: String,
    pub sequence_id: u64,
    /// 1-based slot within the sequence.
    pub sequence_index: u32,
    pub quality: Quality,
}

/// A captured photo. Bytes are opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedImage {
    pub subject_id: String,
    pub sequence_id: u64,
    pub sequence_index: u32,
    pub captured_at: NaiveDateTime,
    pub content_type: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

/// What the analysis provider knows about a photo's place in the sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub subject_id: String,
    pub sequence_id: u64,
    pub sequence_index: u32,
    pub sequence_length: usize,
    /// Seconds since the first capture of the sequence.
    pub offset_secs: u64,
    pub mode: ModeKind,
}

#[async_trait]
pub trait CaptureProvider: Send + Sync {
    async fn capture(&self, request: &CaptureRequest) -> Result<CapturedImage, AnalysisError>;

    /// Reinitialise the device. Invoked by the `restart` recovery action.
    async fn restart(&self) -> Result<(), AnalysisError> {
        Ok(())
    }
}

#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Assess one photo. Unparseable provider output is returned as
    /// [`SampleEntry::Malformed`] rather than as an error, so it is kept and
    /// down-weighted by synthesis instead of being retried.
    async fn analyze(
        &self,
        image: &CapturedImage,
        context: &AnalysisContext,
    ) -> Result<SampleEntry, AnalysisError>;
}

/// Storage usage as reported by the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub photos: u64,
    pub reports: u64,
}

impl UsageStats {
    /// Percentage of capacity used; 0 when capacity is unknown.
    #[must_use]
    pub fn usage_percent(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.capacity_bytes as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupOutcome {
    pub removed_photos: u64,
    pub removed_reports: u64,
    pub freed_bytes: u64,
}

/// Persistence collaborator. Retention is applied by the sink; the engine
/// only says when and with which policy.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn store_report(&self, report: &SequenceReport) -> Result<(), StorageError>;

    async fn store_photo(
        &self,
        image: &CapturedImage,
        policy: &StoragePolicy,
    ) -> Result<(), StorageError>;

    async fn usage_stats(&self) -> Result<UsageStats, StorageError>;

    async fn cleanup(
        &self,
        policy: &StoragePolicy,
        now: NaiveDateTime,
    ) -> Result<CleanupOutcome, StorageError>;
}

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    #[must_use]
    pub const fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
struct StoredPhoto {
    captured_at: NaiveDateTime,
    size: u64,
}

#[derive(Debug, Clone)]
struct StoredReport {
    completed_at: NaiveDateTime,
    size: u64,
}

#[derive(Debug, Default)]
struct MemoryInner {
    photos: Vec<StoredPhoto>,
    reports: Vec<(StoredReport, SequenceReport)>,
    rejecting: bool,
}

/// In-process storage sink with a fixed capacity. Photos are accounted at
/// their compressed size when the policy asks for compression.
#[derive(Debug)]
pub struct MemoryStorage {
    capacity_bytes: u64,
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make subsequent writes fail, as a full or read-only volume would.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.lock().rejecting = rejecting;
    }

    #[must_use]
    pub fn reports(&self) -> Vec<SequenceReport> {
        self.lock().reports.iter().map(|(_, r)| r.clone()).collect()
    }

    #[must_use]
    pub fn photo_count(&self) -> usize {
        self.lock().photos.len()
    }

    fn used_bytes(inner: &MemoryInner) -> u64 {
        inner.photos.iter().map(|p| p.size).sum::<u64>()
            + inner.reports.iter().map(|(r, _)| r.size).sum::<u64>()
    }
}

/// Stored size of `raw` bytes at `quality` percent, without overflowing.
fn compressed_size(raw: u64, quality: u8) -> u64 {
    let q = u64::from(quality.min(100));
    raw / 100 * q + raw % 100 * q / 100
}

#[async_trait]
impl StorageSink for MemoryStorage {
    async fn store_report(&self, report: &SequenceReport) -> Result<(), StorageError> {
        let size = serde_json::to_vec(report)
            .map_err(|e| StorageError::WriteRejected(e.to_string()))?
            .len() as u64;
        let completed_at = match report {
            SequenceReport::Consensus { completed_at, .. }
            | SequenceReport::Unavailable { completed_at, .. } => *completed_at,
        };
        let mut inner = self.lock();
        if inner.rejecting {
            return Err(StorageError::WriteRejected("storage is read-only".to_string()));
        }
        inner
            .reports
            .push((StoredReport { completed_at, size }, report.clone()));
        Ok(())
    }

    async fn store_photo(
        &self,
        image: &CapturedImage,
        policy: &StoragePolicy,
    ) -> Result<(), StorageError> {
        let raw = image.bytes.len() as u64;
        let size = if policy.compress {
            compressed_size(raw, policy.compression_quality)
        } else {
            raw
        };
        let mut inner = self.lock();
        if inner.rejecting {
            return Err(StorageError::WriteRejected("storage is read-only".to_string()));
        }
        if Self::used_bytes(&inner).saturating_add(size) > self.capacity_bytes {
            return Err(StorageError::WriteRejected(format!(
                "photo of {size} bytes exceeds remaining capacity"
            )));
        }
        inner.photos.push(StoredPhoto {
            captured_at: image.captured_at,
            size,
        });
        Ok(())
    }

    async fn usage_stats(&self) -> Result<UsageStats, StorageError> {
        let inner = self.lock();
        Ok(UsageStats {
            used_bytes: Self::used_bytes(&inner),
            capacity_bytes: self.capacity_bytes,
            photos: inner.photos.len() as u64,
            reports: inner.reports.len() as u64,
        })
    }

    async fn cleanup(
        &self,
        policy: &StoragePolicy,
        now: NaiveDateTime,
    ) -> Result<CleanupOutcome, StorageError> {
        let cutoff = now - chrono::Duration::days(i64::from(policy.retention_days));
        let mut inner = self.lock();
        let mut outcome = CleanupOutcome::default();
        inner.photos.retain(|p| {
            let keep = p.captured_at >= cutoff;
            if !keep {
                outcome.removed_photos += 1;
                outcome.freed_bytes += p.size;
            }
            keep
        });
        inner.reports.retain(|(r, _)| {
            let keep = r.completed_at >= cutoff;
            if !keep {
                outcome.removed_reports += 1;
                outcome.freed_bytes += r.size;
            }
            keep
        });
        Ok(outcome)
    }
}
