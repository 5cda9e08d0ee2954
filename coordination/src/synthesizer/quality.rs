//! Heuristic quality score for a synthesized response.
//!
//! overall = 0.25·coherence + 0.25·completeness + 0.30·accuracy + 0.20·relevance

use serde::{Deserialize, Serialize};

use super::strategies::split_sentences;

const COHERENCE_WEIGHT: f64 = 0.25;
const COMPLETENESS_WEIGHT: f64 = 0.25;
const ACCURACY_WEIGHT: f64 = 0.3;
const RELEVANCE_WEIGHT: f64 = 0.2;

/// Relevance assumed when no query is known
const NEUTRAL_RELEVANCE: f64 = 0.7;
/// Content length treated as "complete enough"
const FULL_LENGTH_CHARS: f64 = 200.0;

/// Component scores, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub overall: f64,
    pub coherence: f64,
    pub completeness: f64,
    pub accuracy: f64,
    pub relevance: f64,
}

/// Inputs to the quality heuristics
#[derive(Debug, Clone, Copy)]
pub struct QualityInputs<'a> {
    pub content: &'a str,
    pub used_sources: usize,
    pub total_sources: usize,
    /// Mean confidence of the sources that made it into the content
    pub source_confidence: f64,
    pub query: Option<&'a str>,
}

pub fn score(inputs: QualityInputs<'_>) -> QualityScore {
    let coherence = coherence(inputs.content);
    let completeness = completeness(inputs.content, inputs.used_sources, inputs.total_sources);
    let accuracy = inputs.source_confidence.clamp(0.0, 1.0);
    let relevance = inputs
        .query
        .map(|q| relevance(inputs.content, q))
        .unwrap_or(NEUTRAL_RELEVANCE);

    let overall = COHERENCE_WEIGHT * coherence
        + COMPLETENESS_WEIGHT * completeness
        + ACCURACY_WEIGHT * accuracy
        + RELEVANCE_WEIGHT * relevance;

    QualityScore {
        overall: overall.clamp(0.0, 1.0),
        coherence,
        completeness,
        accuracy,
        relevance,
    }
}

/// Share of well-formed sentences, penalized for verbatim repetition
fn coherence(content: &str) -> f64 {
    let sentences = split_sentences(content);
    if sentences.is_empty() {
        return if content.trim().is_empty() { 0.0 } else { 0.5 };
    }
    let well_formed = sentences
        .iter()
        .filter(|s| s.split_whitespace().count() <= 40)
        .count() as f64
        / sentences.len() as f64;

    let mut distinct: Vec<String> = sentences.iter().map(|s| s.to_lowercase()).collect();
    distinct.sort();
    distinct.dedup();
    let repetition_penalty = 1.0 - distinct.len() as f64 / sentences.len() as f64;

    (well_formed - 0.5 * repetition_penalty).clamp(0.0, 1.0)
}

fn completeness(content: &str, used: usize, total: usize) -> f64 {
    let coverage = if total == 0 {
        0.0
    } else {
        used as f64 / total as f64
    };
    let length = (content.chars().count() as f64 / FULL_LENGTH_CHARS).min(1.0);
    (0.6 * coverage + 0.4 * length).clamp(0.0, 1.0)
}

/// Fraction of the query's significant words present in the content
fn relevance(content: &str, query: &str) -> f64 {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 4)
        .map(|w| w.to_lowercase())
        .collect();
    if terms.is_empty() {
        return NEUTRAL_RELEVANCE;
    }
    let haystack = content.to_lowercase();
    let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    hits as f64 / terms.len() as f64
}
