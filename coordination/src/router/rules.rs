//! Routing rule table.
//!
//! A rule is a set of patterns, a target and a base confidence. Scoring
//! applies fixed multiplicative adjustments per (target, condition) pair on
//! top of the base confidence.
//!
//! | Target        | Condition                          | Factor |
//! |---------------|------------------------------------|--------|
//! | knowledge     | complexity > 0.7                   | 0.80   |
//! | knowledge     | intent = question                  | 1.10   |
//! | reasoning     | complexity > 0.5                   | 1.10   |
//! | reasoning     | intent = analysis/problem_solving  | 1.10   |
//! | deliberation  | complexity > 0.8                   | 1.20   |
//! | deliberation  | intent = planning                  | 1.10   |
//! | deliberation  | urgency > 0.7                      | 0.85   |
//! | hybrid        | intent = comparison                | 1.15   |
//! | hybrid        | complexity > 0.6                   | 1.05   |

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{RouteTarget, RouterError, RouterResult};
use crate::classifier::{Classification, Intent};

/// Serializable form of a rule, as found in YAML rule packs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub target: RouteTarget,
    pub base_confidence: f64,
    pub patterns: Vec<String>,
}

/// A compiled routing rule
#[derive(Debug, Clone)]
pub struct RoutingRule {
    spec: RuleSpec,
    patterns: Vec<Regex>,
}

impl RoutingRule {
    pub fn new(
        id: &str,
        target: RouteTarget,
        base_confidence: f64,
        patterns: &[&str],
    ) -> RouterResult<Self> {
        Self::from_spec(RuleSpec {
            id: id.to_string(),
            description: String::new(),
            target,
            base_confidence,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        })
    }

    pub fn from_spec(spec: RuleSpec) -> RouterResult<Self> {
        if spec.id.trim().is_empty() {
            return Err(RouterError::InvalidRule {
                rule: spec.id,
                message: "rule id must not be empty".to_string(),
            });
        }
        if spec.patterns.is_empty() {
            return Err(RouterError::InvalidRule {
                rule: spec.id,
                message: "rule needs at least one pattern".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&spec.base_confidence) {
            return Err(RouterError::InvalidRule {
                rule: spec.id,
                message: format!("base confidence {} outside [0, 1]", spec.base_confidence),
            });
        }

        let patterns = spec
            .patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| RouterError::InvalidRule {
                    rule: spec.id.clone(),
                    message: e.to_string(),
                })
            })
            .collect::<RouterResult<Vec<_>>>()?;

        Ok(Self { spec, patterns })
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.spec.description = description.to_string();
        self
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn target(&self) -> RouteTarget {
        self.spec.target
    }

    pub fn base_confidence(&self) -> f64 {
        self.spec.base_confidence
    }

    pub fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    /// Whether any pattern matches the text
    pub fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }

    /// Base confidence adjusted by the classification, clamped to [0, 1]
    pub fn score(&self, classification: &Classification) -> f64 {
        (self.spec.base_confidence * adjustment(self.spec.target, classification)).clamp(0.0, 1.0)
    }
}

/// Combined multiplier for a target under a classification
pub fn adjustment(target: RouteTarget, c: &Classification) -> f64 {
    let mut factor = 1.0;
    match target {
        RouteTarget::Knowledge => {
            if c.complexity > 0.7 {
                factor *= 0.8;
            }
            if c.intent == Intent::Question {
                factor *= 1.1;
            }
        }
        RouteTarget::Reasoning => {
            if c.complexity > 0.5 {
                factor *= 1.1;
            }
            if matches!(c.intent, Intent::Analysis | Intent::ProblemSolving) {
                factor *= 1.1;
            }
        }
        RouteTarget::Deliberation => {
            if c.complexity > 0.8 {
                factor *= 1.2;
            }
            if c.intent == Intent::Planning {
                factor *= 1.1;
            }
            if c.urgency > 0.7 {
                factor *= 0.85;
            }
        }
        RouteTarget::Hybrid => {
            if c.intent == Intent::Comparison {
                factor *= 1.15;
            }
            if c.complexity > 0.6 {
                factor *= 1.05;
            }
        }
    }
    factor
}

/// The built-in rule table, in declaration order
pub fn default_rules() -> Vec<RoutingRule> {
    DEFAULT_RULES.clone()
}

static DEFAULT_RULES: LazyLock<Vec<RoutingRule>> = LazyLock::new(|| {
    DEFAULT_TABLE
        .iter()
        .map(|(id, target, base, patterns, description)| {
            RoutingRule::new(id, *target, *base, patterns)
                .map(|r| r.with_description(description))
                .unwrap_or_else(|e| panic!("built-in routing rule should compile: {}", e))
        })
        .collect()
});

type RuleRow = (&'static str, RouteTarget, f64, &'static [&'static str], &'static str);

const DEFAULT_TABLE: [RuleRow; 7] = [
    (
        "factual_lookup",
        RouteTarget::Knowledge,
        0.8,
        &[
            r"(?i)^\s*(what|who|when|where) (is|are|was|were)\b",
            r"(?i)\b(define|definition of|meaning of|look up)\b",
        ],
        "Direct factual questions answered from stored knowledge",
    ),
    (
        "documentation",
        RouteTarget::Knowledge,
        0.75,
        &[r"(?i)\b(documentation|docs|reference|manual|specification)\b"],
        "Requests for reference material",
    ),
    (
        "analytical_reasoning",
        RouteTarget::Reasoning,
        0.8,
        &[r"(?i)\b(why|explain|reason|analy[sz]e|infer|deduce|implications?)\b"],
        "Explanations and inference",
    ),
    (
        "problem_solving",
        RouteTarget::Reasoning,
        0.75,
        &[r"(?i)\b(solve|fix|debug|troubleshoot|calculate|optimi[sz]e|resolve)\b"],
        "Concrete problems with a computable answer",
    ),
    (
        "strategic_decision",
        RouteTarget::Deliberation,
        0.8,
        &[r"(?i)\b(should (we|i)|decide|decision|strategy|strategic|recommend)\b"],
        "Decisions that benefit from several roles",
    ),
    (
        "multi_perspective",
        RouteTarget::Deliberation,
        0.85,
        &[r"(?i)\b(perspectives?|viewpoints?|stakeholders?|debate|pros and cons|trade-?offs?)\b"],
        "Explicitly multi-sided questions",
    ),
    (
        "research_and_reason",
        RouteTarget::Hybrid,
        0.75,
        &[r"(?i)\b(research|compare|comparison|evidence|versus|vs\.?)\b"],
        "Retrieve supporting material, then reason over it",
    ),
];

/// A YAML document of additional rules
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePack {
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl RulePack {
    pub fn from_yaml_str(content: &str) -> RouterResult<Self> {
        serde_yaml::from_str(content).map_err(|e| RouterError::RulePack(e.to_string()))
    }

    /// Compile every rule; the first invalid rule fails the pack
    pub fn compile(self) -> RouterResult<Vec<RoutingRule>> {
        self.rules.into_iter().map(RoutingRule::from_spec).collect()
    }
}
