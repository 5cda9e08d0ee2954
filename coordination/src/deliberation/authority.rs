//! Decision authority: turns council output into one [`Decision`].
//!
//! ```text
//! contributions + votes
//!        │
//!        ├─▶ framework      rational | consensus_building | intuitive | evidence_based
//!        ├─▶ conflict       severity × context ──▶ resolution strategy
//!        ├─▶ perspective    weighted_average | consensus_building | best_of_breed
//!        │                  | dialectical | emergent
//!        ▼
//!   confidence = 0.4·framework + 0.4·synthesis + 0.2·alignment
//!        │
//!        ▼
//!   quality (5 weighted criteria) ──▶ QualityLevel
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::participant::Contribution;
use super::voting::{detect_conflict, ConflictSeverity, ConsensusResult};
use super::workflows::TaskAnalysis;
use super::{DeliberationError, DeliberationResult};

/// Recommendation text of the fallback decision
pub const FALLBACK_RECOMMENDATION: &str = "Unable to reach definitive decision";
/// Confidence of the fallback decision
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

const FRAMEWORK_WEIGHT: f64 = 0.4;
const SYNTHESIS_WEIGHT: f64 = 0.4;
const ALIGNMENT_WEIGHT: f64 = 0.2;

// ── Enumerations ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionFramework {
    Rational,
    ConsensusBuilding,
    Intuitive,
    EvidenceBased,
}

impl DecisionFramework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rational => "rational",
            Self::ConsensusBuilding => "consensus_building",
            Self::Intuitive => "intuitive",
            Self::EvidenceBased => "evidence_based",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    Mediation,
    Arbitration,
    Compromise,
    Integration,
    Escalation,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mediation => "mediation",
            Self::Arbitration => "arbitration",
            Self::Compromise => "compromise",
            Self::Integration => "integration",
            Self::Escalation => "escalation",
        }
    }
}

/// How individual perspectives are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisApproach {
    WeightedAverage,
    ConsensusBuilding,
    BestOfBreed,
    Dialectical,
    Emergent,
}

impl SynthesisApproach {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WeightedAverage => "weighted_average",
            Self::ConsensusBuilding => "consensus_building",
            Self::BestOfBreed => "best_of_breed",
            Self::Dialectical => "dialectical",
            Self::Emergent => "emergent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Unacceptable,
    Poor,
    Acceptable,
    Good,
    Excellent,
}

impl QualityLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Self::Excellent
        } else if score >= 0.75 {
            Self::Good
        } else if score >= 0.6 {
            Self::Acceptable
        } else if score >= 0.4 {
            Self::Poor
        } else {
            Self::Unacceptable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Acceptable => "acceptable",
            Self::Poor => "poor",
            Self::Unacceptable => "unacceptable",
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

// ── Decision ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub score: f64,
    pub factors: Vec<String>,
}

/// Per-criterion quality scores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityCriteria {
    pub logical_consistency: f64,
    pub evidence_support: f64,
    pub stakeholder_alignment: f64,
    pub feasibility: f64,
    pub risk_management: f64,
}

impl QualityCriteria {
    pub fn overall(&self) -> f64 {
        (0.25 * self.logical_consistency
            + 0.25 * self.evidence_support
            + 0.2 * self.stakeholder_alignment
            + 0.15 * self.feasibility
            + 0.15 * self.risk_management)
            .clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub overall: f64,
    pub level: QualityLevel,
    pub criteria: QualityCriteria,
}

impl QualityAssessment {
    pub fn from_criteria(criteria: QualityCriteria) -> Self {
        let overall = criteria.overall();
        Self {
            overall,
            level: QualityLevel::from_score(overall),
            criteria,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub severity: ConflictSeverity,
    pub score: f64,
    pub strategy: ResolutionStrategy,
}

/// Final output of a discussion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub recommendation: String,
    pub confidence: f64,
    pub rationale: String,
    pub risk_assessment: RiskAssessment,
    pub quality: QualityAssessment,
    /// Unset on fallback decisions
    pub framework_used: Option<DecisionFramework>,
    pub synthesis_approach: Option<SynthesisApproach>,
    pub conflict: Option<ConflictResolution>,
    pub fallback: bool,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    /// Low-confidence decision used when synthesis could not complete
    pub fn fallback(reason: impl Into<String>) -> Self {
        let criteria = QualityCriteria {
            logical_consistency: FALLBACK_CONFIDENCE,
            evidence_support: FALLBACK_CONFIDENCE,
            stakeholder_alignment: FALLBACK_CONFIDENCE,
            feasibility: FALLBACK_CONFIDENCE,
            risk_management: FALLBACK_CONFIDENCE,
        };
        Self {
            id: Uuid::new_v4().to_string(),
            recommendation: FALLBACK_RECOMMENDATION.to_string(),
            confidence: FALLBACK_CONFIDENCE,
            rationale: reason.into(),
            risk_assessment: RiskAssessment {
                level: RiskLevel::High,
                score: 1.0,
                factors: vec!["no definitive decision".to_string()],
            },
            quality: QualityAssessment::from_criteria(criteria),
            framework_used: None,
            synthesis_approach: None,
            conflict: None,
            fallback: true,
            timestamp: Utc::now(),
        }
    }

    pub fn quality_level(&self) -> QualityLevel {
        self.quality.level
    }
}

// ── Selection tables ────────────────────────────────────────────────

/// Context signals the tables are driven by, each in [0, 1] except the
/// stakeholder count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionSignals {
    pub complexity: f64,
    pub evidence: f64,
    pub time_pressure: f64,
    pub stakeholder_count: usize,
    pub consensus: f64,
}

impl DecisionSignals {
    fn stakeholder_factor(&self) -> f64 {
        (self.stakeholder_count as f64 / 5.0).min(1.0)
    }
}

/// Score every framework; the highest wins, ties by declaration order
pub fn select_framework(signals: &DecisionSignals) -> (DecisionFramework, f64) {
    let c = signals.complexity;
    let e = signals.evidence;
    let tp = signals.time_pressure;
    let scored = [
        (DecisionFramework::Rational, 0.4 * c + 0.3 * e + 0.3 * (1.0 - tp)),
        (
            DecisionFramework::ConsensusBuilding,
            0.5 * signals.stakeholder_factor() + 0.3 * (1.0 - signals.consensus) + 0.2 * (1.0 - tp),
        ),
        (DecisionFramework::Intuitive, 0.6 * tp + 0.4 * (1.0 - c)),
        (DecisionFramework::EvidenceBased, 0.7 * e + 0.3 * c),
    ];
    let mut best = scored[0];
    for candidate in &scored[1..] {
        if candidate.1 > best.1 {
            best = *candidate;
        }
    }
    (best.0, best.1.clamp(0.0, 1.0))
}

/// Severity × context resolution table
pub fn select_resolution(
    severity: ConflictSeverity,
    time_pressure: f64,
    stakeholder_count: usize,
) -> ResolutionStrategy {
    let urgent = time_pressure > 0.7;
    match severity {
        ConflictSeverity::Low if urgent => ResolutionStrategy::Compromise,
        ConflictSeverity::Low => ResolutionStrategy::Integration,
        ConflictSeverity::Medium if stakeholder_count > 3 => ResolutionStrategy::Mediation,
        ConflictSeverity::Medium => ResolutionStrategy::Compromise,
        ConflictSeverity::High if urgent => ResolutionStrategy::Arbitration,
        ConflictSeverity::High => ResolutionStrategy::Mediation,
        ConflictSeverity::Critical if urgent => ResolutionStrategy::Arbitration,
        ConflictSeverity::Critical => ResolutionStrategy::Escalation,
    }
}

pub fn select_approach(
    conflict: Option<&ConflictResolution>,
    complexity: f64,
    stakeholder_count: usize,
) -> SynthesisApproach {
    match conflict.map(|c| c.severity) {
        Some(severity) if severity >= ConflictSeverity::High => SynthesisApproach::Dialectical,
        _ if stakeholder_count >= 5 && complexity > 0.7 => SynthesisApproach::Emergent,
        Some(ConflictSeverity::Medium) => SynthesisApproach::ConsensusBuilding,
        _ if complexity > 0.6 => SynthesisApproach::BestOfBreed,
        _ => SynthesisApproach::WeightedAverage,
    }
}

// ── Authority ───────────────────────────────────────────────────────

/// Everything the authority looks at
#[derive(Debug, Clone, Copy)]
pub struct AuthorityInput<'a> {
    pub analysis: &'a TaskAnalysis,
    pub contributions: &'a [Contribution],
    pub consensus: Option<&'a ConsensusResult>,
}

/// Coordinator-side decision maker
#[derive(Debug, Clone, Copy)]
pub struct DecisionAuthority {
    conflict_threshold: f64,
}

impl DecisionAuthority {
    pub fn new(conflict_threshold: f64) -> Self {
        Self { conflict_threshold }
    }

    pub fn decide(&self, input: AuthorityInput<'_>) -> DeliberationResult<Decision> {
        if input.contributions.is_empty() {
            return Err(DeliberationError::NoContributions);
        }

        let evidence = mean(input.contributions.iter().map(|c| c.confidence));
        let alignment = input.consensus.map(|c| c.score).unwrap_or(evidence);
        let signals = DecisionSignals {
            complexity: input.analysis.complexity,
            evidence,
            time_pressure: input.analysis.time_pressure,
            stakeholder_count: input.analysis.stakeholder_count,
            consensus: input.consensus.map(|c| c.score).unwrap_or(0.5),
        };

        let (framework, framework_confidence) = select_framework(&signals);

        let conflict = input.consensus.and_then(|c| {
            let assessment = detect_conflict(c.score, self.conflict_threshold);
            assessment.detected.then(|| ConflictResolution {
                severity: assessment.severity,
                score: assessment.score,
                strategy: select_resolution(
                    assessment.severity,
                    signals.time_pressure,
                    signals.stakeholder_count,
                ),
            })
        });

        let approach = select_approach(conflict.as_ref(), signals.complexity, signals.stakeholder_count);
        let (recommendation, synthesis_confidence) =
            synthesize_perspectives(approach, input.contributions, input.consensus)?;

        let confidence = (FRAMEWORK_WEIGHT * framework_confidence
            + SYNTHESIS_WEIGHT * synthesis_confidence
            + ALIGNMENT_WEIGHT * alignment)
            .clamp(0.0, 1.0);

        let risk_assessment = assess_risk(&signals, alignment, conflict.as_ref(), input.consensus);
        let quality = QualityAssessment::from_criteria(QualityCriteria {
            logical_consistency: framework_confidence,
            evidence_support: evidence,
            stakeholder_alignment: alignment,
            feasibility: (1.0 - 0.5 * signals.time_pressure * signals.complexity).clamp(0.0, 1.0),
            risk_management: 1.0 - risk_assessment.score,
        });

        let mut rationale = format!(
            "Framework {} ({:.2}); {} over {} contributions",
            framework.as_str(),
            framework_confidence,
            approach.as_str(),
            input.contributions.len()
        );
        if let Some(consensus) = input.consensus {
            rationale.push_str(&format!(
                "; consensus {:.2} ({})",
                consensus.score,
                if consensus.achieved { "achieved" } else { "not achieved" }
            ));
        }
        if let Some(conflict) = &conflict {
            rationale.push_str(&format!(
                "; {:?} conflict resolved by {}",
                conflict.severity,
                conflict.strategy.as_str()
            ));
        }

        Ok(Decision {
            id: Uuid::new_v4().to_string(),
            recommendation,
            confidence,
            rationale,
            risk_assessment,
            quality,
            framework_used: Some(framework),
            synthesis_approach: Some(approach),
            conflict,
            fallback: false,
            timestamp: Utc::now(),
        })
    }
}

impl Default for DecisionAuthority {
    fn default() -> Self {
        Self::new(0.5)
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Contributions ordered by confidence, highest first; input order breaks ties
fn ranked(contributions: &[Contribution]) -> Vec<&Contribution> {
    let mut ranked: Vec<&Contribution> = contributions.iter().collect();
    ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    ranked
}

fn synthesize_perspectives(
    approach: SynthesisApproach,
    contributions: &[Contribution],
    consensus: Option<&ConsensusResult>,
) -> DeliberationResult<(String, f64)> {
    let ranked = ranked(contributions);
    let top = ranked.first().ok_or(DeliberationError::NoContributions)?;
    let mean_confidence = mean(contributions.iter().map(|c| c.confidence));
    let agreed = consensus.and_then(|c| c.agreed_recommendations.first());
    let primary = agreed.cloned().unwrap_or_else(|| top.payload.clone());

    let result = match approach {
        SynthesisApproach::WeightedAverage => {
            let total: f64 = contributions.iter().map(|c| c.confidence).sum();
            let weighted = if total > 0.0 {
                contributions.iter().map(|c| c.confidence * c.confidence).sum::<f64>() / total
            } else {
                0.0
            };
            (primary, weighted)
        }
        SynthesisApproach::BestOfBreed => (top.payload.clone(), top.confidence),
        SynthesisApproach::ConsensusBuilding => {
            let score = consensus.map(|c| c.score).unwrap_or(0.5);
            let text = match consensus {
                Some(c) if c.agreed_recommendations.len() > 1 => c.agreed_recommendations.join("; "),
                _ => primary,
            };
            (text, mean_confidence * (0.5 + 0.5 * score))
        }
        SynthesisApproach::Dialectical => {
            let counterpoint = consensus
                .and_then(|c| c.dissenting_opinions.first().cloned())
                .or_else(|| ranked.last().filter(|c| c.participant_id != top.participant_id).map(|c| c.payload.clone()));
            let text = match counterpoint {
                Some(counter) => format!("{}\n\nCounterpoint: {}", primary, counter),
                None => primary,
            };
            (text, mean_confidence * 0.8)
        }
        SynthesisApproach::Emergent => {
            let mut insights: Vec<&str> = Vec::new();
            for contribution in &ranked {
                for insight in &contribution.insights {
                    if insights.len() < 5 && !insights.contains(&insight.as_str()) {
                        insights.push(insight);
                    }
                }
            }
            let mut text = primary;
            if !insights.is_empty() {
                text.push_str("\n\nKey insights:");
                for insight in insights {
                    text.push_str(&format!("\n- {}", insight));
                }
            }
            (text, mean_confidence * 0.9)
        }
    };
    Ok((result.0, result.1.clamp(0.0, 1.0)))
}

fn assess_risk(
    signals: &DecisionSignals,
    alignment: f64,
    conflict: Option<&ConflictResolution>,
    consensus: Option<&ConsensusResult>,
) -> RiskAssessment {
    let score =
        (0.4 * (1.0 - alignment) + 0.3 * signals.time_pressure + 0.3 * signals.complexity).clamp(0.0, 1.0);
    let mut factors = Vec::new();
    if alignment < 0.5 {
        factors.push("low stakeholder alignment".to_string());
    }
    if signals.time_pressure > 0.7 {
        factors.push("high time pressure".to_string());
    }
    if signals.complexity > 0.7 {
        factors.push("high complexity".to_string());
    }
    if let Some(conflict) = conflict {
        factors.push(format!("{:?} conflict", conflict.severity).to_lowercase());
    }
    if let Some(dissent) = consensus.map(|c| c.dissenting_opinions.len()).filter(|n| *n > 0) {
        factors.push(format!("{} dissenting opinion(s)", dissent));
    }
    let level = if score < 0.33 {
        RiskLevel::Low
    } else if score < 0.66 {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    };
    RiskAssessment { level, score, factors }
}
