//! Per-sample analysis records and their validation.
//!
//! The external AI collaborator produces one [`PerSampleAnalysis`] per
//! captured photo. Entries that fail to parse are kept as
//! [`SampleEntry::Malformed`] so they lower reliability instead of
//! silently disappearing from the sequence.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Risk level asserted by a finding, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [Self; 4] = [Self::Low, Self::Moderate, Self::High, Self::Critical];

    #[must_use]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::Low
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    Health,
    Behavior,
    Risk,
}

impl std::fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Health => "health",
            Self::Behavior => "behavior",
            Self::Risk => "risk",
        })
    }
}

/// One categorical observation in a sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub category: FindingCategory,
    pub code: String,
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Finding {
    #[must_use]
    pub fn new(category: FindingCategory, code: impl Into<String>, risk: RiskLevel) -> Self {
        Self {
            category,
            code: code.into(),
            risk,
            detail: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> FindingKey {
        FindingKey {
            category: self.category,
            code: normalize_code(&self.code),
        }
    }
}

/// Identity of a finding across samples.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FindingKey {
    pub category: FindingCategory,
    pub code: String,
}

impl std::fmt::Display for FindingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.category, self.code)
    }
}

/// Lowercase, trimmed, with runs of whitespace and `-` collapsed to `_`.
#[must_use]
pub fn normalize_code(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut pending_sep = false;
    for ch in code.trim().chars() {
        if ch.is_whitespace() || ch == '-' || ch == '_' {
            pending_sep = true;
            continue;
        }
        if pending_sep && !out.is_empty() {
            out.push('_');
        }
        pending_sep = false;
        out.extend(ch.to_lowercase());
    }
    out
}

/// Assessment of one photo, produced once by the analysis provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerSampleAnalysis {
    /// 1-based position in the sequence.
    pub sequence_index: u32,
    /// Seconds since the first capture of the sequence.
    #[serde(default)]
    pub offset_secs: u64,
    /// Provider confidence in `[0, 1]`.
    pub confidence: f64,
    /// Overall health score in `[0, 100]`.
    #[serde(default)]
    pub health_score: Option<f64>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Emergency-condition indicator.
    #[serde(default)]
    pub emergency: bool,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl PerSampleAnalysis {
    /// Highest risk asserted by any finding, `Low` when there are none.
    #[must_use]
    pub fn sample_risk(&self) -> RiskLevel {
        self.findings
            .iter()
            .map(|f| f.risk)
            .max()
            .unwrap_or_default()
    }

    /// Distinct finding keys, each with the highest risk this sample gave it.
    #[must_use]
    pub fn finding_keys(&self) -> Vec<(FindingKey, RiskLevel)> {
        let mut keys: Vec<(FindingKey, RiskLevel)> = Vec::new();
        for finding in &self.findings {
            let key = finding.key();
            match keys.iter_mut().find(|(k, _)| *k == key) {
                Some((_, risk)) => *risk = (*risk).max(finding.risk),
                None => keys.push((key, finding.risk)),
            }
        }
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        keys
    }
}

/// One slot of the sequence as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleEntry {
    Parsed(PerSampleAnalysis),
    /// Could not be parsed into a [`PerSampleAnalysis`].
    Malformed(MalformedSample),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_index: Option<u32>,
    pub reason: String,
    /// Emergency indicator recovered from the raw payload, if present.
    #[serde(default)]
    pub emergency: bool,
}

impl SampleEntry {
    /// Lenient conversion from untyped JSON.
    #[must_use]
    pub fn from_value(value: serde_json::Value) -> Self {
        let sequence_index = value
            .get("sequence_index")
            .and_then(serde_json::Value::as_u64)
            .and_then(|i| u32::try_from(i).ok());
        let emergency = value
            .get("emergency")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        match serde_json::from_value::<PerSampleAnalysis>(value) {
            Ok(sample) => Self::Parsed(sample),
            Err(err) => Self::Malformed(MalformedSample {
                sequence_index,
                reason: err.to_string(),
                emergency,
            }),
        }
    }

    /// A slot for a capture that produced no analysis.
    #[must_use]
    pub fn missing(sequence_index: u32, reason: impl Into<String>) -> Self {
        Self::Malformed(MalformedSample {
            sequence_index: Some(sequence_index),
            reason: reason.into(),
            emergency: false,
        })
    }

    #[must_use]
    pub fn sequence_index(&self) -> Option<u32> {
        match self {
            Self::Parsed(s) => Some(s.sequence_index),
            Self::Malformed(m) => m.sequence_index,
        }
    }

    #[must_use]
    pub fn emergency(&self) -> bool {
        match self {
            Self::Parsed(s) => s.emergency,
            Self::Malformed(m) => m.emergency,
        }
    }

    #[must_use]
    pub const fn as_parsed(&self) -> Option<&PerSampleAnalysis> {
        match self {
            Self::Parsed(s) => Some(s),
            Self::Malformed(_) => None,
        }
    }
}

impl From<PerSampleAnalysis> for SampleEntry {
    fn from(sample: PerSampleAnalysis) -> Self {
        Self::Parsed(sample)
    }
}

/// Parse a JSON array of samples, keeping unparseable elements as malformed.
pub fn parse_sequence(json: &str) -> Result<Vec<SampleEntry>, serde_json::Error> {
    let values: Vec<serde_json::Value> = serde_json::from_str(json)?;
    Ok(values.into_iter().map(SampleEntry::from_value).collect())
}

/// Why a sample was excluded from consensus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum InvalidReason {
    Malformed { detail: String },
    IndexOutOfRange { index: u32, max: usize },
    DuplicateIndex { index: u32 },
    ConfidenceOutOfRange,
    MissingHealthScore,
    HealthScoreOutOfRange,
    EmptyFindingCode,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed { detail } => write!(f, "malformed: {detail}"),
            Self::IndexOutOfRange { index, max } => {
                write!(f, "sequence index {index} outside 1..={max}")
            }
            Self::DuplicateIndex { index } => write!(f, "duplicate sequence index {index}"),
            Self::ConfidenceOutOfRange => f.write_str("confidence outside [0, 1]"),
            Self::MissingHealthScore => f.write_str("missing health score"),
            Self::HealthScoreOutOfRange => f.write_str("health score outside [0, 100]"),
            Self::EmptyFindingCode => f.write_str("finding with empty code"),
        }
    }
}

/// Validate every slot of a sequence of expected length `n`.
///
/// Returns one entry per input slot, in order: `Ok` with the usable sample or
/// `Err` with the reason it was marked invalid. Later duplicates of an index
/// are the ones marked invalid.
#[must_use]
pub fn validate_sequence(
    entries: &[SampleEntry],
    n: usize,
) -> Vec<Result<&PerSampleAnalysis, InvalidReason>> {
    let mut seen = BTreeSet::new();
    entries
        .iter()
        .map(|entry| {
            let sample = match entry {
                SampleEntry::Parsed(sample) => sample,
                SampleEntry::Malformed(m) => {
                    return Err(InvalidReason::Malformed {
                        detail: m.reason.clone(),
                    });
                }
            };
            validate_sample(sample, n)?;
            if !seen.insert(sample.sequence_index) {
                return Err(InvalidReason::DuplicateIndex {
                    index: sample.sequence_index,
                });
            }
            Ok(sample)
        })
        .collect()
}

fn validate_sample(sample: &PerSampleAnalysis, n: usize) -> Result<(), InvalidReason> {
    if sample.sequence_index == 0 || sample.sequence_index as usize > n {
        return Err(InvalidReason::IndexOutOfRange {
            index: sample.sequence_index,
            max: n,
        });
    }
    if !(sample.confidence.is_finite() && (0.0..=1.0).contains(&sample.confidence)) {
        return Err(InvalidReason::ConfidenceOutOfRange);
    }
    match sample.health_score {
        None => return Err(InvalidReason::MissingHealthScore),
        Some(score) if !(score.is_finite() && (0.0..=100.0).contains(&score)) => {
            return Err(InvalidReason::HealthScoreOutOfRange);
        }
        Some(_) => {}
    }
    if sample.findings.iter().any(|f| normalize_code(&f.code).is_empty()) {
        return Err(InvalidReason::EmptyFindingCode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(index: u32) -> PerSampleAnalysis {
        PerSampleAnalysis {
            sequence_index: index,
            offset_secs: u64::from(index) * 5,
            confidence: 0.9,
            health_score: Some(80.0),
            findings: vec![Finding::new(FindingCategory::Behavior, "resting", RiskLevel::Low)],
            emergency: false,
            recommendations: Vec::new(),
        }
    }

    #[test]
    fn normalize_code_collapses_separators() {
        assert_eq!(normalize_code("  Labored Breathing "), "labored_breathing");
        assert_eq!(normalize_code("labored-breathing"), "labored_breathing");
        assert_eq!(normalize_code("LABORED__breathing"), "labored_breathing");
        assert_eq!(normalize_code(" - "), "");
    }

    #[test]
    fn finding_keys_dedupe_with_max_risk() {
        let mut s = sample(1);
        s.findings = vec![
            Finding::new(FindingCategory::Health, "Limping", RiskLevel::Moderate),
            Finding::new(FindingCategory::Health, "limping", RiskLevel::High),
            Finding::new(FindingCategory::Behavior, "limping", RiskLevel::Low),
        ];
        let keys = s.finding_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].0.category, FindingCategory::Health);
        assert_eq!(keys[0].1, RiskLevel::High);
        assert_eq!(s.sample_risk(), RiskLevel::High);
    }

    #[test]
    fn malformed_json_is_kept() {
        let json = r#"[
            {"sequence_index": 1, "confidence": 0.8, "health_score": 70},
            {"sequence_index": 2, "confidence": "high", "emergency": true},
            42
        ]"#;
        let entries = parse_sequence(json).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].as_parsed().is_some());
        assert!(matches!(&entries[1], SampleEntry::Malformed(m) if m.sequence_index == Some(2) && m.emergency));
        assert!(matches!(&entries[2], SampleEntry::Malformed(m) if m.sequence_index.is_none()));
        assert!(entries[1].emergency());
    }

    #[test]
    fn validation_marks_each_problem() {
        let mut bad_conf = sample(2);
        bad_conf.confidence = f64::NAN;
        let mut no_score = sample(3);
        no_score.health_score = None;
        let mut high_score = sample(4);
        high_score.health_score = Some(120.0);
        let mut empty_code = sample(5);
        empty_code.findings.push(Finding::new(FindingCategory::Risk, "  ", RiskLevel::Low));

        let entries: Vec<SampleEntry> = vec![
            sample(1).into(),
            bad_conf.into(),
            no_score.into(),
            high_score.into(),
            empty_code.into(),
            sample(1).into(),
            sample(11).into(),
            SampleEntry::missing(8, "capture failed"),
        ];
        let results = validate_sequence(&entries, 10);
        assert!(results[0].is_ok());
        assert_eq!(results[1], Err(InvalidReason::ConfidenceOutOfRange));
        assert_eq!(results[2], Err(InvalidReason::MissingHealthScore));
        assert_eq!(results[3], Err(InvalidReason::HealthScoreOutOfRange));
        assert_eq!(results[4], Err(InvalidReason::EmptyFindingCode));
        assert_eq!(results[5], Err(InvalidReason::DuplicateIndex { index: 1 }));
        assert_eq!(results[6], Err(InvalidReason::IndexOutOfRange { index: 11, max: 10 }));
        assert!(matches!(results[7], Err(InvalidReason::Malformed { .. })));
    }

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert_eq!(RiskLevel::Moderate.ordinal(), 1);
        assert_eq!(RiskLevel::default(), RiskLevel::Low);
    }
}
