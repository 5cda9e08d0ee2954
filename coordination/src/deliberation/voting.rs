//! Vote tallying and conflict detection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::participant::ParticipantReply;

/// Five-point agreement scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    StronglyAgree,
    Agree,
    Neutral,
    Disagree,
    StronglyDisagree,
}

impl Vote {
    pub fn weight(&self) -> f64 {
        match self {
            Vote::StronglyAgree => 1.0,
            Vote::Agree => 0.75,
            Vote::Neutral => 0.5,
            Vote::Disagree => 0.25,
            Vote::StronglyDisagree => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Vote::StronglyAgree => "strongly_agree",
            Vote::Agree => "agree",
            Vote::Neutral => "neutral",
            Vote::Disagree => "disagree",
            Vote::StronglyDisagree => "strongly_disagree",
        }
    }

    /// Parse a vote label; separators may be spaces, dashes or underscores.
    pub fn parse(label: &str) -> Option<Vote> {
        let normalized = label.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "strongly_agree" => Some(Vote::StronglyAgree),
            "agree" => Some(Vote::Agree),
            "neutral" => Some(Vote::Neutral),
            "disagree" => Some(Vote::Disagree),
            "strongly_disagree" => Some(Vote::StronglyDisagree),
            _ => None,
        }
    }

    /// Vote label at the start of free text ("Agree, because ...")
    pub fn parse_leading(text: &str) -> Option<Vote> {
        let lowered = text.trim_start().to_lowercase().replace(['-', '_'], " ");
        // Longer labels first so "disagree" is not read as "agree".
        [
            ("strongly agree", Vote::StronglyAgree),
            ("strongly disagree", Vote::StronglyDisagree),
            ("disagree", Vote::Disagree),
            ("agree", Vote::Agree),
            ("neutral", Vote::Neutral),
        ]
        .into_iter()
        .find(|(label, _)| lowered.starts_with(label))
        .map(|(_, vote)| vote)
    }
}

/// Weight of a raw vote; missing or unrecognized votes count as neutral
pub fn vote_weight(raw: Option<&str>) -> f64 {
    raw.and_then(Vote::parse)
        .map(|v| v.weight())
        .unwrap_or(Vote::Neutral.weight())
}

/// Outcome of a council vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub achieved: bool,
    pub score: f64,
    pub agreed_recommendations: Vec<String>,
    pub dissenting_opinions: Vec<String>,
    /// Missing or unrecognized votes are recorded as neutral
    pub voting_results: BTreeMap<String, Vote>,
}

/// Tally votes from the participants that answered.
///
/// The score is the mean vote weight over those voters, not over the whole
/// council. With no voters the score is 0 and consensus is not achieved.
pub fn tally(votes: &[(String, ParticipantReply)], threshold: f64) -> ConsensusResult {
    let mut voting_results = BTreeMap::new();
    let mut agreed_recommendations: Vec<String> = Vec::new();
    let mut dissenting_opinions = Vec::new();
    let mut total = 0.0;

    for (participant, reply) in votes {
        let vote = reply
            .vote
            .as_deref()
            .and_then(Vote::parse)
            .unwrap_or(Vote::Neutral);
        let weight = vote_weight(reply.vote.as_deref());
        total += weight;
        voting_results.insert(participant.clone(), vote);

        let recommendation = reply
            .recommendation
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());
        if weight >= Vote::Agree.weight() {
            if let Some(rec) = recommendation {
                if !agreed_recommendations.iter().any(|r| r == rec) {
                    agreed_recommendations.push(rec.to_string());
                }
            }
        } else if weight <= Vote::Disagree.weight() {
            dissenting_opinions.push(format!(
                "{}: {}",
                participant,
                recommendation.unwrap_or(vote.as_str())
            ));
        }
    }

    let score = if votes.is_empty() {
        0.0
    } else {
        total / votes.len() as f64
    };

    ConsensusResult {
        achieved: !votes.is_empty() && score >= threshold,
        score,
        agreed_recommendations,
        dissenting_opinions,
        voting_results,
    }
}

/// How badly the council disagrees
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ConflictSeverity {
    /// Severity bucket for a consensus score
    pub fn from_score(score: f64) -> Self {
        if score < 0.10 {
            ConflictSeverity::Critical
        } else if score < 0.15 {
            ConflictSeverity::High
        } else if score < 0.20 {
            ConflictSeverity::Medium
        } else {
            ConflictSeverity::Low
        }
    }
}

/// Conflict check on a consensus score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConflictAssessment {
    pub detected: bool,
    pub severity: ConflictSeverity,
    pub score: f64,
}

/// A conflict exists when the score falls below `threshold`
pub fn detect_conflict(score: f64, threshold: f64) -> ConflictAssessment {
    ConflictAssessment {
        detected: score < threshold,
        severity: ConflictSeverity::from_score(score),
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voted(id: &str, vote: Option<&str>, rec: Option<&str>) -> (String, ParticipantReply) {
        (
            id.to_string(),
            ParticipantReply {
                success: true,
                vote: vote.map(str::to_string),
                recommendation: rec.map(str::to_string),
                confidence: 0.8,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!(Vote::parse("Strongly Agree"), Some(Vote::StronglyAgree));
        assert_eq!(Vote::parse("strongly-disagree"), Some(Vote::StronglyDisagree));
        assert_eq!(Vote::parse("maybe"), None);
        assert_eq!(Vote::parse_leading("Disagree: too risky"), Some(Vote::Disagree));
        assert_eq!(Vote::parse_leading("agree"), Some(Vote::Agree));
        assert_eq!(Vote::parse_leading("I think so"), None);
    }

    #[test]
    fn test_score_is_mean_over_voters() {
        let votes = vec![
            voted("a", Some("strongly_agree"), Some("ship")),
            voted("b", Some("agree"), Some("ship")),
            voted("c", Some("banana"), None),
        ];
        let result = tally(&votes, 0.7);
        assert!((result.score - 0.75).abs() < 1e-9);
        assert!(result.achieved);
        assert_eq!(result.agreed_recommendations, vec!["ship"]);
        assert_eq!(result.voting_results.get("c"), Some(&Vote::Neutral));
    }

    #[test]
    fn test_dissent_recorded() {
        let votes = vec![
            voted("a", Some("disagree"), Some("wait a quarter")),
            voted("b", Some("strongly_disagree"), None),
        ];
        let result = tally(&votes, 0.7);
        assert!(!result.achieved);
        assert_eq!(result.score, 0.125);
        assert_eq!(
            result.dissenting_opinions,
            vec!["a: wait a quarter", "b: strongly_disagree"]
        );
    }

    #[test]
    fn test_no_voters() {
        let result = tally(&[], 0.7);
        assert_eq!(result.score, 0.0);
        assert!(!result.achieved);
    }

    #[test]
    fn test_conflict_severity_buckets() {
        assert_eq!(ConflictSeverity::from_score(0.05), ConflictSeverity::Critical);
        assert_eq!(ConflictSeverity::from_score(0.12), ConflictSeverity::High);
        assert_eq!(ConflictSeverity::from_score(0.18), ConflictSeverity::Medium);
        assert_eq!(ConflictSeverity::from_score(0.25), ConflictSeverity::Low);

        let conflict = detect_conflict(0.25, 0.5);
        assert!(conflict.detected);
        assert_eq!(conflict.severity, ConflictSeverity::Low);
        assert!(!detect_conflict(0.8, 0.5).detected);
    }
}
