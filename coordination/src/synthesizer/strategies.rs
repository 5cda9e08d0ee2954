//! Merge strategies.
//!
//! Each strategy takes normalized results (in input order) and produces
//! content, a confidence and the ordered list of sources it actually used.
//! All orderings break ties by input position, so a given input always
//! merges to the same output.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::normalize::NormalizedResult;
use super::{SynthesisError, SynthesisResult};
use crate::config::SynthesizerConfig;

/// How results are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStrategy {
    WeightedMerge,
    Consensus,
    Hierarchical,
    SimpleMerge,
}

impl SynthesisStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthesisStrategy::WeightedMerge => "weighted_merge",
            SynthesisStrategy::Consensus => "consensus",
            SynthesisStrategy::Hierarchical => "hierarchical",
            SynthesisStrategy::SimpleMerge => "simple_merge",
        }
    }
}

impl std::fmt::Display for SynthesisStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SynthesisStrategy {
    type Err = SynthesisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weighted_merge" => Ok(SynthesisStrategy::WeightedMerge),
            "consensus" => Ok(SynthesisStrategy::Consensus),
            "hierarchical" => Ok(SynthesisStrategy::Hierarchical),
            "simple_merge" => Ok(SynthesisStrategy::SimpleMerge),
            other => Err(SynthesisError::UnknownStrategy(other.to_string())),
        }
    }
}

/// What a strategy produced
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutput {
    pub content: String,
    pub confidence: f64,
    /// Sources that contributed, in presentation order
    pub used_sources: Vec<String>,
    /// Mean confidence of the contributing results
    pub used_confidence: f64,
    pub strategy_used: SynthesisStrategy,
    /// Set when the requested strategy handed over to another one
    pub fallback_from: Option<SynthesisStrategy>,
}

const THEME_STOPWORDS: &[&str] = &[
    "about", "after", "again", "being", "between", "could", "every", "other", "should",
    "their", "there", "these", "those", "through", "under", "where", "which", "while", "would",
];

const MAX_THEMES: usize = 5;

/// Reliability for a result: by source name, then by kind, then the default
pub fn reliability_of(config: &SynthesizerConfig, result: &NormalizedResult) -> f64 {
    config
        .source_reliability
        .get(&result.source)
        .or_else(|| config.source_reliability.get(&result.kind))
        .copied()
        .unwrap_or(config.default_reliability)
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn block(result: &NormalizedResult, attribution: bool) -> String {
    if attribution {
        format!("[{}] {}", result.source, result.content)
    } else {
        result.content.clone()
    }
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|s| s == item) {
        list.push(item.to_string());
    }
}

/// Weight each result by confidence × reliability, drop the light ones and
/// concatenate the rest heaviest first.
pub fn weighted_merge(
    results: &[NormalizedResult],
    config: &SynthesizerConfig,
    attribution: bool,
) -> SynthesisResult<StrategyOutput> {
    let mut weighted: Vec<(usize, f64)> = results
        .iter()
        .enumerate()
        .map(|(i, r)| (i, r.confidence * reliability_of(config, r)))
        .filter(|(_, w)| *w > config.min_weight)
        .collect();

    if weighted.is_empty() {
        return Err(SynthesisError::AllBelowThreshold {
            threshold: config.min_weight,
        });
    }

    weighted.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let total_weight: f64 = weighted.iter().map(|(_, w)| w).sum();
    let confidence = weighted
        .iter()
        .map(|(i, w)| w * results[*i].confidence)
        .sum::<f64>()
        / total_weight;

    let mut used_sources = Vec::new();
    let content = weighted
        .iter()
        .map(|(i, _)| {
            push_unique(&mut used_sources, &results[*i].source);
            block(&results[*i], attribution)
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    Ok(StrategyOutput {
        content,
        confidence,
        used_sources,
        used_confidence: mean(weighted.iter().map(|(i, _)| results[*i].confidence)),
        strategy_used: SynthesisStrategy::WeightedMerge,
        fallback_from: None,
    })
}

fn words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Split on sentence terminators followed by whitespace; fragments under
/// three words are dropped.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(true, |next| next.is_whitespace());
        if at_boundary {
            sentences.push(std::mem::take(&mut current));
        }
    }
    sentences.push(current);

    sentences
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| s.split_whitespace().count() >= 3)
        .collect()
}

/// Word-set Jaccard similarity
pub fn jaccard(a: &str, b: &str) -> f64 {
    let wa = words(a);
    let wb = words(b);
    if wa.is_empty() && wb.is_empty() {
        return 0.0;
    }
    let intersection = wa.intersection(&wb).count();
    let union = wa.union(&wb).count();
    intersection as f64 / union as f64
}

/// Words longer than four letters found in at least two sources, most
/// widespread first.
pub fn common_themes(results: &[NormalizedResult]) -> Vec<String> {
    let mut seen: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    for r in results {
        for w in words(&r.content) {
            if w.chars().count() > 4 && !THEME_STOPWORDS.contains(&w.as_str()) {
                seen.entry(w).or_default().insert(r.source.as_str());
            }
        }
    }
    let mut themes: Vec<(String, usize)> = seen
        .into_iter()
        .filter(|(_, sources)| sources.len() >= 2)
        .map(|(w, sources)| (w, sources.len()))
        .collect();
    themes.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    themes.into_iter().take(MAX_THEMES).map(|(w, _)| w).collect()
}

struct Agreement {
    statement: String,
    supporters: Vec<String>,
}

/// Bullet list of cross-source agreements and shared themes; hands over to
/// [`weighted_merge`] when no two sources agree.
pub fn consensus(
    results: &[NormalizedResult],
    config: &SynthesizerConfig,
    attribution: bool,
) -> SynthesisResult<StrategyOutput> {
    let sentences: Vec<Vec<String>> = results.iter().map(|r| split_sentences(&r.content)).collect();
    let mut agreements: Vec<Agreement> = Vec::new();

    for i in 0..results.len() {
        for j in (i + 1)..results.len() {
            if results[i].source == results[j].source {
                continue;
            }
            for a in &sentences[i] {
                for b in &sentences[j] {
                    if jaccard(a, b) < config.agreement_threshold {
                        continue;
                    }
                    // The more confident source phrases the agreement.
                    let statement = if results[j].confidence > results[i].confidence {
                        b
                    } else {
                        a
                    };
                    let index = match agreements.iter().position(|ag| &ag.statement == statement)
                    {
                        Some(index) => index,
                        None => {
                            agreements.push(Agreement {
                                statement: statement.clone(),
                                supporters: Vec::new(),
                            });
                            agreements.len() - 1
                        }
                    };
                    push_unique(&mut agreements[index].supporters, &results[i].source);
                    push_unique(&mut agreements[index].supporters, &results[j].source);
                }
            }
        }
    }

    if agreements.is_empty() {
        let mut output = weighted_merge(results, config, attribution)?;
        output.fallback_from = Some(SynthesisStrategy::Consensus);
        return Ok(output);
    }

    let supporters: BTreeSet<&str> = agreements
        .iter()
        .flat_map(|a| a.supporters.iter().map(String::as_str))
        .collect();
    let mut used_sources = Vec::new();
    for r in results {
        if supporters.contains(r.source.as_str()) {
            push_unique(&mut used_sources, &r.source);
        }
    }

    let mut content = String::from("Points of agreement:\n");
    for agreement in &agreements {
        if attribution {
            content.push_str(&format!(
                "- {} ({})\n",
                agreement.statement,
                agreement.supporters.join(", ")
            ));
        } else {
            content.push_str(&format!("- {}\n", agreement.statement));
        }
    }
    let themes = common_themes(results);
    if !themes.is_empty() {
        content.push_str(&format!("Common themes: {}\n", themes.join(", ")));
    }

    let confidence = mean(
        results
            .iter()
            .filter(|r| supporters.contains(r.source.as_str()))
            .map(|r| r.confidence),
    );

    Ok(StrategyOutput {
        content: content.trim_end().to_string(),
        confidence,
        used_sources,
        used_confidence: confidence,
        strategy_used: SynthesisStrategy::Consensus,
        fallback_from: None,
    })
}

fn priority_rank(config: &SynthesizerConfig, r: &NormalizedResult) -> usize {
    config
        .source_priority
        .iter()
        .position(|p| *p == r.source || *p == r.kind)
        .unwrap_or(config.source_priority.len())
}

/// Most trusted source first, the others appended as additional context.
pub fn hierarchical(
    results: &[NormalizedResult],
    config: &SynthesizerConfig,
    attribution: bool,
) -> SynthesisResult<StrategyOutput> {
    if results.is_empty() {
        return Err(SynthesisError::NoValidResults);
    }
    let mut order: Vec<usize> = (0..results.len()).collect();
    order.sort_by(|&a, &b| {
        priority_rank(config, &results[a])
            .cmp(&priority_rank(config, &results[b]))
            .then(results[b].confidence.total_cmp(&results[a].confidence))
            .then(a.cmp(&b))
    });

    let primary = &results[order[0]];
    let rest: Vec<&NormalizedResult> = order[1..].iter().map(|&i| &results[i]).collect();

    let mut content = primary.content.clone();
    let mut used_sources = vec![primary.source.clone()];
    for r in &rest {
        if attribution {
            content.push_str(&format!("\n\nAdditional context ({}):\n{}", r.source, r.content));
        } else {
            content.push_str(&format!("\n\nAdditional context:\n{}", r.content));
        }
        push_unique(&mut used_sources, &r.source);
    }

    let confidence = if rest.is_empty() {
        primary.confidence
    } else {
        0.7 * primary.confidence + 0.3 * mean(rest.iter().map(|r| r.confidence))
    };

    Ok(StrategyOutput {
        content,
        confidence,
        used_sources,
        used_confidence: mean(results.iter().map(|r| r.confidence)),
        strategy_used: SynthesisStrategy::Hierarchical,
        fallback_from: None,
    })
}

/// Everything, in input order, with the mean confidence.
pub fn simple_merge(results: &[NormalizedResult], attribution: bool) -> SynthesisResult<StrategyOutput> {
    if results.is_empty() {
        return Err(SynthesisError::NoValidResults);
    }
    let mut used_sources = Vec::new();
    let content = results
        .iter()
        .map(|r| {
            push_unique(&mut used_sources, &r.source);
            block(r, attribution)
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let confidence = mean(results.iter().map(|r| r.confidence));

    Ok(StrategyOutput {
        content,
        confidence,
        used_sources,
        used_confidence: confidence,
        strategy_used: SynthesisStrategy::SimpleMerge,
        fallback_from: None,
    })
}

/// Dispatch by strategy
pub fn apply(
    strategy: SynthesisStrategy,
    results: &[NormalizedResult],
    config: &SynthesizerConfig,
    attribution: bool,
) -> SynthesisResult<StrategyOutput> {
    if results.is_empty() {
        return Err(SynthesisError::NoValidResults);
    }
    match strategy {
        SynthesisStrategy::WeightedMerge => weighted_merge(results, config, attribution),
        SynthesisStrategy::Consensus => consensus(results, config, attribution),
        SynthesisStrategy::Hierarchical => hierarchical(results, config, attribution),
        SynthesisStrategy::SimpleMerge => simple_merge(results, attribution),
    }
}
