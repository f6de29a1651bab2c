//! Consensus synthesis over a fixed-length sample sequence.
//!
//! [`Synthesizer::synthesize`] is a pure batch computation: the same input
//! always yields the same report. Steps:
//!
//! 1. validate every slot; invalid slots are kept and lower reliability
//! 2. fail with `synthesis_insufficient_data` below the valid-sample minimum
//! 3. split findings into consensus (strictly more than half of valid
//!    samples) and isolated
//! 4. aggregate confidence and per-field agreement
//! 5. classify the trend from early, middle and late partitions
//! 6. take risk from consensus findings only; any emergency indicator
//!    forces immediate urgency
//! 7. rank samples by divergence from consensus
//! 8. group recommendations by how many samples support them

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::analysis::{
    FindingCategory, FindingKey, InvalidReason, PerSampleAnalysis, RiskLevel, SampleEntry,
    validate_sequence,
};
use crate::config::SynthesisConfig;
use crate::error::SynthesisError;

// =============================================================================
// Report types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStrength {
    Strong,
    Moderate,
    Weak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
    Variable,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Improving => "improving",
            Self::Stable => "stable",
            Self::Declining => "declining",
            Self::Variable => "variable",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Routine,
    Elevated,
    Urgent,
    Immediate,
}

impl Urgency {
    #[must_use]
    pub const fn from_risk(risk: RiskLevel) -> Self {
        match risk {
            RiskLevel::Low => Self::Routine,
            RiskLevel::Moderate => Self::Elevated,
            RiskLevel::High => Self::Urgent,
            RiskLevel::Critical => Self::Immediate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusFinding {
    pub category: FindingCategory,
    pub code: String,
    /// Modal risk among supporting samples, ties to the higher level.
    pub risk: RiskLevel,
    pub support: usize,
    /// `support / valid_samples`
    pub support_fraction: f64,
    /// Sequence indexes of the supporting samples.
    pub samples: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolatedFinding {
    pub category: FindingCategory,
    pub code: String,
    pub risk: RiskLevel,
    pub support: usize,
    /// Half the support fraction.
    pub weight: f64,
    pub samples: Vec<u32>,
}

/// Agreement with the majority value of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAgreement {
    pub field: String,
    pub majority: String,
    /// Fraction of valid samples agreeing with `majority`.
    pub agreement: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSummary {
    pub positions: (usize, usize),
    pub valid_samples: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_health: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_risk: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAssessment {
    pub direction: Trend,
    pub early: PartitionSummary,
    pub middle: PartitionSummary,
    pub late: PartitionSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleReliability {
    /// 1-based slot position in the received sequence.
    pub position: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_index: Option<u32>,
    pub valid: bool,
    /// 0 = identical to consensus, 1 = fully divergent.
    pub divergence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub outlier: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "factor", rename_all = "snake_case")]
pub enum LimitingFactor {
    InvalidSamples { count: usize },
    LowConfidence { count: usize },
    WeakConsensus,
    SparsePartitions,
    Outliers { count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityGrade {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityReport {
    /// mean confidence x valid fraction x consensus strength
    pub score: f64,
    pub grade: ReliabilityGrade,
    /// Every slot, most divergent first; invalid slots lead ties.
    pub ranking: Vec<SampleReliability>,
    /// Slot positions to double check, most divergent first.
    pub least_reliable: Vec<usize>,
    pub limiting_factors: Vec<LimitingFactor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationBasis {
    /// Supported by more than half of valid samples.
    Consensus,
    /// Supported by at least two samples.
    Partial,
    SingleSample,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub text: String,
    pub basis: RecommendationBasis,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusReport {
    pub sequence_length: usize,
    pub valid_samples: usize,
    pub invalid_samples: usize,
    pub mean_confidence: f64,
    pub mean_health_score: f64,
    pub consensus_findings: Vec<ConsensusFinding>,
    pub isolated_findings: Vec<IsolatedFinding>,
    pub field_agreement: Vec<FieldAgreement>,
    /// Mean of `field_agreement`.
    pub consensus_strength: f64,
    pub strength: ConsensusStrength,
    pub trend: TrendAssessment,
    pub risk_level: RiskLevel,
    pub urgency: Urgency,
    /// Slot positions (1-based) whose sample flagged an emergency.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub emergency_samples: Vec<usize>,
    pub reliability: ReliabilityReport,
    pub recommendations: Vec<Recommendation>,
}

/// What the orchestrator hands to storage and presentation per sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SequenceReport {
    Consensus {
        subject_id: String,
        sequence_id: u64,
        completed_at: NaiveDateTime,
        report: Box<ConsensusReport>,
    },
    /// "Analysis unavailable": synthesis refused to guess.
    Unavailable {
        subject_id: String,
        sequence_id: u64,
        completed_at: NaiveDateTime,
        code: String,
        reason: String,
        valid_samples: usize,
        required_samples: usize,
        /// Emergency indicators still surface when no report can be built.
        emergency: bool,
    },
}

impl SequenceReport {
    #[must_use]
    pub fn from_result(
        subject_id: &str,
        sequence_id: u64,
        completed_at: NaiveDateTime,
        entries: &[SampleEntry],
        result: Result<ConsensusReport, SynthesisError>,
    ) -> Self {
        match result {
            Ok(report) => Self::Consensus {
                subject_id: subject_id.to_string(),
                sequence_id,
                completed_at,
                report: Box::new(report),
            },
            Err(err) => {
                let (valid, required) = match err {
                    SynthesisError::InsufficientData { valid, required } => (valid, required),
                    SynthesisError::SequenceLength { .. } => (0, 0),
                };
                Self::Unavailable {
                    subject_id: subject_id.to_string(),
                    sequence_id,
                    completed_at,
                    code: err.code().to_string(),
                    reason: err.to_string(),
                    valid_samples: valid,
                    required_samples: required,
                    emergency: entries.iter().any(SampleEntry::emergency),
                }
            }
        }
    }

    #[must_use]
    pub const fn sequence_id(&self) -> u64 {
        match self {
            Self::Consensus { sequence_id, .. } | Self::Unavailable { sequence_id, .. } => {
                *sequence_id
            }
        }
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self, Self::Consensus { .. })
    }
}

// =============================================================================
// Synthesizer
// =============================================================================

/// Direction of a metric between two partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Move {
    Up,
    Flat,
    Down,
}

impl Move {
    fn of(delta: Option<f64>, threshold: f64) -> Self {
        match delta {
            Some(d) if d > threshold => Self::Up,
            Some(d) if d < -threshold => Self::Down,
            _ => Self::Flat,
        }
    }

    fn opposes(self, other: Self) -> bool {
        matches!((self, other), (Self::Up, Self::Down) | (Self::Down, Self::Up))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum HealthBand {
    Poor,
    Fair,
    Good,
}

impl HealthBand {
    fn of(score: f64) -> Self {
        if score >= 70.0 {
            Self::Good
        } else if score >= 40.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Poor => "poor",
            Self::Fair => "fair",
            Self::Good => "good",
        }
    }
}

struct ValidSample<'a> {
    position: usize,
    sample: &'a PerSampleAnalysis,
    health: f64,
    keys: Vec<(FindingKey, RiskLevel)>,
}

struct FindingTally {
    positions: Vec<usize>,
    indexes: Vec<u32>,
    risks: BTreeMap<RiskLevel, usize>,
}

impl FindingTally {
    /// Most frequent risk; ties resolve to the higher level.
    fn modal_risk(&self) -> RiskLevel {
        self.risks
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
            .map_or(RiskLevel::Low, |(risk, _)| *risk)
    }
}

/// Most frequent value; ties resolve to the greater value.
fn mode_of<T: Ord + Copy>(values: impl Iterator<Item = T>) -> Option<(T, usize)> {
    let mut counts: BTreeMap<T, usize> = BTreeMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Fuses a sequence of per-sample analyses into one report.
#[derive(Debug, Clone, Default)]
pub struct Synthesizer {
    config: SynthesisConfig,
}

impl Synthesizer {
    #[must_use]
    pub const fn new(config: SynthesisConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Synthesize a sequence of exactly `sequence_length` slots.
    pub fn synthesize(&self, entries: &[SampleEntry]) -> Result<ConsensusReport, SynthesisError> {
        let n = self.config.sequence_length;
        if entries.len() != n {
            return Err(SynthesisError::SequenceLength {
                expected: n,
                actual: entries.len(),
            });
        }

        let validated = validate_sequence(entries, n);
        let valid: Vec<ValidSample<'_>> = validated
            .iter()
            .enumerate()
            .filter_map(|(position, result)| {
                let sample = *result.as_ref().ok()?;
                Some(ValidSample {
                    position,
                    sample,
                    health: sample.health_score.unwrap_or_default(),
                    keys: sample.finding_keys(),
                })
            })
            .collect();

        let required = self.config.min_valid_samples();
        if valid.is_empty() || valid.len() < required {
            return Err(SynthesisError::InsufficientData {
                valid: valid.len(),
                required,
            });
        }
        let valid_count = valid.len();

        // Consensus extraction
        let mut tallies: BTreeMap<FindingKey, FindingTally> = BTreeMap::new();
        for v in &valid {
            for (key, risk) in &v.keys {
                let tally = tallies.entry(key.clone()).or_insert_with(|| FindingTally {
                    positions: Vec::new(),
                    indexes: Vec::new(),
                    risks: BTreeMap::new(),
                });
                tally.positions.push(v.position);
                tally.indexes.push(v.sample.sequence_index);
                *tally.risks.entry(*risk).or_default() += 1;
            }
        }

        let mut consensus_findings = Vec::new();
        let mut isolated_findings = Vec::new();
        let mut field_agreement = Vec::new();
        for (key, tally) in &tallies {
            let support = tally.positions.len();
            let fraction = support as f64 / valid_count as f64;
            let mut samples = tally.indexes.clone();
            samples.sort_unstable();
            if support * 2 > valid_count {
                consensus_findings.push(ConsensusFinding {
                    category: key.category,
                    code: key.code.clone(),
                    risk: tally.modal_risk(),
                    support,
                    support_fraction: round3(fraction),
                    samples,
                });
            } else {
                isolated_findings.push(IsolatedFinding {
                    category: key.category,
                    code: key.code.clone(),
                    risk: tally.modal_risk(),
                    support,
                    weight: round3(fraction / 2.0),
                    samples,
                });
            }
            field_agreement.push(FieldAgreement {
                field: key.to_string(),
                majority: if support * 2 > valid_count {
                    "present"
                } else {
                    "absent"
                }
                .to_string(),
                agreement: round3(fraction.max(1.0 - fraction)),
            });
        }

        if let Some((risk, count)) = mode_of(valid.iter().map(|v| v.sample.sample_risk())) {
            field_agreement.push(FieldAgreement {
                field: "risk_level".to_string(),
                majority: risk.to_string(),
                agreement: round3(count as f64 / valid_count as f64),
            });
        }
        if let Some((band, count)) = mode_of(valid.iter().map(|v| HealthBand::of(v.health))) {
            field_agreement.push(FieldAgreement {
                field: "health_band".to_string(),
                majority: band.as_str().to_string(),
                agreement: round3(count as f64 / valid_count as f64),
            });
        }

        let consensus_strength =
            round3(mean(field_agreement.iter().map(|f| f.agreement)).unwrap_or(1.0));
        let strength = if consensus_strength >= self.config.strong_agreement {
            ConsensusStrength::Strong
        } else if consensus_strength >= self.config.moderate_agreement {
            ConsensusStrength::Moderate
        } else {
            ConsensusStrength::Weak
        };

        let mean_confidence = mean(valid.iter().map(|v| v.sample.confidence)).unwrap_or(0.0);
        let mean_health_score = mean(valid.iter().map(|v| v.health)).unwrap_or(0.0);

        let trend = self.assess_trend(&valid, n);

        // Risk comes from consensus findings only
        let risk_level = consensus_findings
            .iter()
            .map(|f| f.risk)
            .max()
            .unwrap_or(RiskLevel::Low);
        let emergency_samples: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.emergency())
            .map(|(i, _)| i + 1)
            .collect();
        let urgency = if emergency_samples.is_empty() {
            Urgency::from_risk(risk_level)
        } else {
            Urgency::Immediate
        };

        let reliability = self.assess_reliability(
            entries,
            &validated,
            &valid,
            &consensus_findings,
            ReliabilityInputs {
                mean_confidence,
                consensus_strength,
                strength,
                sparse_partitions: trend.early.valid_samples == 0 || trend.late.valid_samples == 0,
            },
        );

        let recommendations = Self::group_recommendations(&valid);

        Ok(ConsensusReport {
            sequence_length: n,
            valid_samples: valid_count,
            invalid_samples: n - valid_count,
            mean_confidence: round3(mean_confidence),
            mean_health_score: round3(mean_health_score),
            consensus_findings,
            isolated_findings,
            field_agreement,
            consensus_strength,
            strength,
            trend,
            risk_level,
            urgency,
            emergency_samples,
            reliability,
            recommendations,
        })
    }

    fn partition(valid: &[ValidSample<'_>], range: (usize, usize)) -> PartitionSummary {
        let members: Vec<&ValidSample<'_>> = valid
            .iter()
            .filter(|v| v.position >= range.0 && v.position < range.1)
            .collect();
        PartitionSummary {
            positions: range,
            valid_samples: members.len(),
            mean_health: mean(members.iter().map(|v| v.health)).map(round3),
            mean_risk: mean(
                members
                    .iter()
                    .map(|v| f64::from(v.sample.sample_risk().ordinal())),
            )
            .map(round3),
        }
    }

    fn assess_trend(&self, valid: &[ValidSample<'_>], n: usize) -> TrendAssessment {
        let third = n / 3;
        let early = Self::partition(valid, (0, third));
        let middle = Self::partition(valid, (third, n - third));
        let late = Self::partition(valid, (n - third, n));

        let delta = |a: Option<f64>, b: Option<f64>| a.zip(b).map(|(a, b)| b - a);
        let health_delta = delta(early.mean_health, late.mean_health);
        let risk_delta = delta(early.mean_risk, late.mean_risk);

        let ht = self.config.health_trend_threshold;
        let rt = self.config.risk_trend_threshold;

        let direction = if early.valid_samples == 0 || late.valid_samples == 0 {
            Trend::Stable
        } else {
            let health_first = Move::of(delta(early.mean_health, middle.mean_health), ht);
            let health_second = Move::of(delta(middle.mean_health, late.mean_health), ht);
            let risk_first = Move::of(delta(early.mean_risk, middle.mean_risk), rt);
            let risk_second = Move::of(delta(middle.mean_risk, late.mean_risk), rt);
            let health = Move::of(health_delta, ht);
            let risk = Move::of(risk_delta, rt);

            // Rising health with rising risk (or the reverse) disagree
            let contradictory = health != Move::Flat && health == risk;
            if health_first.opposes(health_second) || risk_first.opposes(risk_second) || contradictory
            {
                Trend::Variable
            } else if health == Move::Up || risk == Move::Down {
                Trend::Improving
            } else if health == Move::Down || risk == Move::Up {
                Trend::Declining
            } else {
                Trend::Stable
            }
        };

        TrendAssessment {
            direction,
            early,
            middle,
            late,
            health_delta: health_delta.map(round3),
            risk_delta: risk_delta.map(round3),
        }
    }

    fn assess_reliability(
        &self,
        entries: &[SampleEntry],
        validated: &[Result<&PerSampleAnalysis, InvalidReason>],
        valid: &[ValidSample<'_>],
        consensus: &[ConsensusFinding],
        inputs: ReliabilityInputs,
    ) -> ReliabilityReport {
        let consensus_keys: Vec<FindingKey> = consensus
            .iter()
            .map(|f| FindingKey {
                category: f.category,
                code: f.code.clone(),
            })
            .collect();
        let mut scores: Vec<f64> = valid.iter().map(|v| v.health).collect();
        let median_health = median(&mut scores);
        let low_conf = self.config.low_confidence_threshold;

        let mut ranking: Vec<SampleReliability> = entries
            .iter()
            .zip(validated)
            .enumerate()
            .map(|(position, (entry, result))| match result {
                Err(reason) => SampleReliability {
                    position: position + 1,
                    sequence_index: entry.sequence_index(),
                    valid: false,
                    divergence: 1.0,
                    confidence: entry.as_parsed().map(|s| s.confidence).filter(|c| c.is_finite()),
                    outlier: true,
                    issues: vec![reason.to_string()],
                },
                Ok(sample) => {
                    let v = valid
                        .iter()
                        .find(|v| v.position == position)
                        .map_or(0.0, |v| {
                            let keys: Vec<&FindingKey> = v.keys.iter().map(|(k, _)| k).collect();
                            let inter = keys.iter().filter(|k| consensus_keys.contains(k)).count();
                            let union = keys.len() + consensus_keys.len() - inter;
                            let jaccard = if union == 0 {
                                0.0
                            } else {
                                1.0 - inter as f64 / union as f64
                            };
                            let score_dist = (v.health - median_health).abs() / 100.0;
                            (jaccard + 0.5 * score_dist).min(1.0)
                        });
                    let divergence = round3(v);
                    let mut issues = Vec::new();
                    if sample.confidence < low_conf {
                        issues.push(format!("low confidence {:.2}", sample.confidence));
                    }
                    let outlier = divergence >= self.config.outlier_threshold;
                    if outlier {
                        issues.push("diverges from consensus".to_string());
                    }
                    SampleReliability {
                        position: position + 1,
                        sequence_index: Some(sample.sequence_index),
                        valid: true,
                        divergence,
                        confidence: Some(sample.confidence),
                        outlier,
                        issues,
                    }
                }
            })
            .collect();

        ranking.sort_by(|a, b| {
            b.divergence
                .total_cmp(&a.divergence)
                .then(a.valid.cmp(&b.valid))
                .then(a.position.cmp(&b.position))
        });

        let invalid = ranking.iter().filter(|r| !r.valid).count();
        let low_confidence = valid.iter().filter(|v| v.sample.confidence < low_conf).count();
        let outliers = ranking.iter().filter(|r| r.valid && r.outlier).count();

        let mut limiting_factors = Vec::new();
        if invalid > 0 {
            limiting_factors.push(LimitingFactor::InvalidSamples { count: invalid });
        }
        if low_confidence > 0 {
            limiting_factors.push(LimitingFactor::LowConfidence {
                count: low_confidence,
            });
        }
        if inputs.strength == ConsensusStrength::Weak {
            limiting_factors.push(LimitingFactor::WeakConsensus);
        }
        if inputs.sparse_partitions {
            limiting_factors.push(LimitingFactor::SparsePartitions);
        }
        if outliers > 0 {
            limiting_factors.push(LimitingFactor::Outliers { count: outliers });
        }

        let valid_fraction = valid.len() as f64 / entries.len().max(1) as f64;
        let score = round3(inputs.mean_confidence * valid_fraction * inputs.consensus_strength);
        let grade = if score >= 0.7 {
            ReliabilityGrade::High
        } else if score >= 0.4 {
            ReliabilityGrade::Medium
        } else {
            ReliabilityGrade::Low
        };

        let least_reliable = ranking
            .iter()
            .filter(|r| r.outlier || !r.issues.is_empty())
            .take(3)
            .map(|r| r.position)
            .collect();

        ReliabilityReport {
            score,
            grade,
            ranking,
            least_reliable,
            limiting_factors,
        }
    }

    fn group_recommendations(valid: &[ValidSample<'_>]) -> Vec<Recommendation> {
        let mut groups: BTreeMap<String, (String, usize)> = BTreeMap::new();
        for v in valid {
            let mut seen = Vec::new();
            for text in &v.sample.recommendations {
                let key = normalize_text(text);
                if key.is_empty() || seen.contains(&key) {
                    continue;
                }
                seen.push(key.clone());
                groups
                    .entry(key)
                    .or_insert_with(|| (text.trim().to_string(), 0))
                    .1 += 1;
            }
        }

        let valid_count = valid.len();
        let mut out: Vec<Recommendation> = groups
            .into_values()
            .map(|(text, support)| Recommendation {
                text,
                basis: if support * 2 > valid_count {
                    RecommendationBasis::Consensus
                } else if support >= 2 {
                    RecommendationBasis::Partial
                } else {
                    RecommendationBasis::SingleSample
                },
                support,
            })
            .collect();
        out.sort_by(|a, b| b.support.cmp(&a.support).then_with(|| a.text.cmp(&b.text)));
        out
    }
}

#[derive(Debug, Clone, Copy)]
struct ReliabilityInputs {
    mean_confidence: f64,
    consensus_strength: f64,
    strength: ConsensusStrength,
    sparse_partitions: bool,
}
