//! Response synthesis
//!
//! Merges subsystem and participant outputs into one response.
//!
//! ```text
//! inputs ──▶ normalize ──▶ strategy ──┬─ ok ───────────────┐
//!            (drop empty,             └─ err ─▶ simple_merge┤
//!             clamp conf)                        └─ err ─▶ placeholder
//!                                                           │
//!                              truncate ◀───────────────────┘
//!                                 │
//!                           citations block ──▶ quality score
//! ```
//!
//! Synthesis never fails: a strategy error falls back to the simple merge,
//! and an empty input set yields a zero-confidence placeholder.

pub mod normalize;
pub mod quality;
pub mod strategies;

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SynthesizerConfig;
use crate::events::{CoordinationEvent, SharedEventBus};

pub use normalize::{normalize_all, NormalizedResult, SynthesisInput};
pub use quality::QualityScore;
pub use strategies::{StrategyOutput, SynthesisStrategy};

/// Content returned when nothing usable was supplied
pub const PLACEHOLDER_CONTENT: &str = "No valid results were available to synthesize.";

/// Errors inside a merge strategy. Recovered by the synthesizer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SynthesisError {
    #[error("No valid results to synthesize")]
    NoValidResults,

    #[error("Every result weighs at or below {threshold}")]
    AllBelowThreshold { threshold: f64 },

    #[error("Unknown synthesis strategy: {0}")]
    UnknownStrategy(String),
}

/// Result type for synthesis strategies
pub type SynthesisResult<T> = Result<T, SynthesisError>;

/// Per-call overrides; unset fields take the configured defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesisOptions {
    pub strategy: Option<SynthesisStrategy>,
    pub include_attribution: Option<bool>,
    pub include_citations: Option<bool>,
    pub compute_quality: Option<bool>,
    pub max_length: Option<usize>,
    /// Original request, used by the relevance heuristic
    pub query: Option<String>,
}

impl SynthesisOptions {
    pub fn with_strategy(mut self, strategy: SynthesisStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

/// Final merged response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedResponse {
    pub content: String,
    pub confidence: f64,
    /// Sources that made it into the content
    pub sources: BTreeSet<String>,
    pub quality: Option<QualityScore>,
    pub strategy_used: SynthesisStrategy,
    /// Inputs received, including ones that were dropped
    pub total_sources: usize,
    /// Distinct sources present in the content
    pub used_sources: usize,
    pub truncated: bool,
    pub metadata: Map<String, Value>,
}

impl SynthesizedResponse {
    pub fn quality_score(&self) -> Option<f64> {
        self.quality.map(|q| q.overall)
    }
}

/// Stateless merger configured once
pub struct ResponseSynthesizer {
    config: SynthesizerConfig,
    events: Option<SharedEventBus>,
}

impl ResponseSynthesizer {
    pub fn new(config: SynthesizerConfig) -> Self {
        Self {
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, bus: SharedEventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn config(&self) -> &SynthesizerConfig {
        &self.config
    }

    /// Merge `inputs` into one response.
    pub fn synthesize(
        &self,
        inputs: &[SynthesisInput],
        options: &SynthesisOptions,
    ) -> SynthesizedResponse {
        let strategy = options.strategy.unwrap_or(self.config.default_strategy);
        let attribution = options
            .include_attribution
            .unwrap_or(self.config.include_attribution);
        let citations = options
            .include_citations
            .unwrap_or(self.config.include_citations);
        let compute_quality = options
            .compute_quality
            .unwrap_or(self.config.compute_quality);
        let max_length = options.max_length.unwrap_or(self.config.max_length).max(1);

        let total_sources = inputs.len();
        let results = normalize_all(inputs);
        let mut metadata = Map::new();
        metadata.insert("requested_strategy".to_string(), Value::from(strategy.as_str()));
        metadata.insert("valid_results".to_string(), Value::from(results.len()));

        let output = match strategies::apply(strategy, &results, &self.config, attribution) {
            Ok(output) => Some(output),
            Err(SynthesisError::NoValidResults) => None,
            Err(e) => {
                warn!(strategy = %strategy, error = %e, "Synthesis strategy failed, using simple merge");
                metadata.insert("error".to_string(), Value::from(e.to_string()));
                match strategies::simple_merge(&results, attribution) {
                    Ok(mut output) => {
                        output.fallback_from = Some(strategy);
                        Some(output)
                    }
                    Err(_) => None,
                }
            }
        };

        let Some(output) = output else {
            debug!(total_sources, "Nothing to synthesize, returning placeholder");
            let response = SynthesizedResponse {
                content: PLACEHOLDER_CONTENT.to_string(),
                confidence: 0.0,
                sources: BTreeSet::new(),
                quality: None,
                strategy_used: strategy,
                total_sources,
                used_sources: 0,
                truncated: false,
                metadata,
            };
            self.publish(&response);
            return response;
        };

        if let Some(from) = output.fallback_from {
            metadata.insert("fallback_from".to_string(), Value::from(from.as_str()));
        }

        let (mut content, truncated) = truncate(&output.content, max_length);
        if citations && !output.used_sources.is_empty() {
            content.push_str("\n\nSources:");
            for (i, source) in output.used_sources.iter().enumerate() {
                content.push_str(&format!("\n{}. {}", i + 1, source));
            }
        }

        let quality = compute_quality.then(|| {
            quality::score(quality::QualityInputs {
                content: &content,
                used_sources: output.used_sources.len(),
                total_sources,
                source_confidence: output.used_confidence,
                query: options.query.as_deref(),
            })
        });

        let response = SynthesizedResponse {
            content,
            confidence: output.confidence.clamp(0.0, 1.0),
            sources: output.used_sources.iter().cloned().collect(),
            quality,
            strategy_used: output.strategy_used,
            total_sources,
            used_sources: output.used_sources.len(),
            truncated,
            metadata,
        };

        debug!(
            strategy = %response.strategy_used,
            total_sources,
            used_sources = response.used_sources,
            confidence = response.confidence,
            truncated,
            "Synthesis complete"
        );
        self.publish(&response);
        response
    }

    fn publish(&self, response: &SynthesizedResponse) {
        if let Some(bus) = &self.events {
            bus.publish(CoordinationEvent::SynthesisCompleted {
                strategy: response.strategy_used,
                total_sources: response.total_sources,
                confidence: response.confidence,
                timestamp: Utc::now(),
            });
        }
    }
}

impl Default for ResponseSynthesizer {
    fn default() -> Self {
        Self::new(SynthesizerConfig::default())
    }
}

/// Cut `content` to at most `max_chars` characters, preferring a sentence
/// end in the second half of the window, then a word boundary followed by
/// an ellipsis.
pub fn truncate(content: &str, max_chars: usize) -> (String, bool) {
    if content.chars().count() <= max_chars {
        return (content.to_string(), false);
    }
    let cut: String = content.chars().take(max_chars).collect();

    let half = cut.len() / 2;
    if let Some(pos) = cut.rfind(['.', '!', '?']) {
        if pos >= half {
            return (cut[..=pos].to_string(), true);
        }
    }
    if max_chars <= ELLIPSIS.len() {
        return (cut, true);
    }

    // The ellipsis counts against the limit.
    let room_chars = max_chars - ELLIPSIS.len();
    let room: String = content.chars().take(room_chars).collect();
    if content.chars().nth(room_chars).is_some_and(char::is_whitespace) {
        return (format!("{}{}", room.trim_end(), ELLIPSIS), true);
    }
    if let Some(pos) = room.rfind(char::is_whitespace) {
        if pos > 0 {
            return (format!("{}{}", room[..pos].trim_end(), ELLIPSIS), true);
        }
    }
    (format!("{}{}", room, ELLIPSIS), true)
}

const ELLIPSIS: &str = "...";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::{SubsystemKind, SubsystemResponse};
    use serde_json::json;

    fn response(name: &str, kind: SubsystemKind, content: &str, confidence: f64) -> SynthesisInput {
        SubsystemResponse::new(name, kind, content, confidence).into()
    }

    #[test]
    fn test_light_source_excluded_but_counted() {
        let synthesizer = ResponseSynthesizer::default();
        let inputs = vec![
            response("knowledge", SubsystemKind::Knowledge, "Water boils at 100C.", 0.9),
            response("reasoning", SubsystemKind::Reasoning, "Probably hot.", 0.1),
        ];
        let out = synthesizer.synthesize(&inputs, &SynthesisOptions::default());
        assert_eq!(out.strategy_used, SynthesisStrategy::WeightedMerge);
        assert_eq!(out.total_sources, 2);
        assert_eq!(out.used_sources, 1);
        assert!(!out.content.contains("Probably hot."));
        assert!(out.sources.contains("knowledge"));
    }

    #[test]
    fn test_empty_input_yields_placeholder() {
        let synthesizer = ResponseSynthesizer::default();
        let out = synthesizer.synthesize(
            &[json!({"error": "timeout", "system": "knowledge"}).into()],
            &SynthesisOptions::default(),
        );
        assert_eq!(out.content, PLACEHOLDER_CONTENT);
        assert_eq!(out.confidence, 0.0);
        assert_eq!(out.total_sources, 1);
        assert_eq!(out.used_sources, 0);
    }

    #[test]
    fn test_strategy_failure_falls_back_to_simple_merge() {
        let synthesizer = ResponseSynthesizer::default();
        let inputs = vec![response("reasoning", SubsystemKind::Reasoning, "Weak guess.", 0.05)];
        let out = synthesizer.synthesize(&inputs, &SynthesisOptions::default());
        assert_eq!(out.strategy_used, SynthesisStrategy::SimpleMerge);
        assert_eq!(out.metadata.get("fallback_from"), Some(&json!("weighted_merge")));
        assert!((out.confidence - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_truncation_and_citations() {
        let synthesizer = ResponseSynthesizer::default();
        let long = "First sentence is here. Second sentence is a little longer than the first.";
        let out = synthesizer.synthesize(
            &[response("knowledge", SubsystemKind::Knowledge, long, 0.9)],
            &SynthesisOptions::default()
                .with_strategy(SynthesisStrategy::Hierarchical)
                .with_max_length(40),
        );
        assert!(out.truncated);
        assert!(out.content.starts_with("First sentence is here.\n\nSources:\n1. knowledge"));
    }

    #[test]
    fn test_truncate_word_boundary() {
        let (cut, truncated) = truncate("alpha beta gamma delta", 12);
        assert!(truncated);
        assert_eq!(cut, "alpha...");
        let (cut, _) = truncate("alpha beta gamma delta", 13);
        assert_eq!(cut, "alpha beta...");
        let (same, truncated) = truncate("short", 12);
        assert!(!truncated);
        assert_eq!(same, "short");
    }

    #[test]
    fn test_truncate_never_exceeds_limit() {
        let text = "lorem ipsum dolor sit amet consectetur adipiscing elit sed do";
        for max in 0..text.len() {
            let (cut, truncated) = truncate(text, max);
            assert!(truncated);
            assert!(cut.chars().count() <= max, "{:?} longer than {}", cut, max);
        }
        let (cut, _) = truncate("unbrokenwordwithoutspaces", 10);
        assert_eq!(cut, "unbroke...");
    }

    #[test]
    fn test_resynthesis_is_identical() {
        let synthesizer = ResponseSynthesizer::default();
        let inputs = vec![
            response("knowledge", SubsystemKind::Knowledge, "Tokio is an async runtime for Rust.", 0.8),
            response("reasoning", SubsystemKind::Reasoning, "Tokio is an async runtime used widely.", 0.7),
        ];
        let options = SynthesisOptions::default()
            .with_strategy(SynthesisStrategy::Consensus)
            .with_query("what is tokio");
        let a = synthesizer.synthesize(&inputs, &options);
        let b = synthesizer.synthesize(&inputs, &options);
        assert_eq!(a, b);
        assert!(a.quality_score().is_some());
    }
}
