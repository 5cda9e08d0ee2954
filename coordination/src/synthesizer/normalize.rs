//! Input normalization.
//!
//! Whatever produced a result (a subsystem, a council participant, a raw
//! JSON payload) it is reduced to `{content, confidence, source, kind}`
//! before any merge strategy sees it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::deliberation::Contribution;
use crate::subsystems::SubsystemResponse;

/// JSON keys searched, in order, for the content of a raw result
pub const CONTENT_KEYS: &[&str] = &[
    "content",
    "response",
    "answer",
    "text",
    "recommendation",
    "result",
];

/// Anything the synthesizer can merge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisInput {
    Subsystem(SubsystemResponse),
    Contribution(Contribution),
    Json(Value),
}

impl From<SubsystemResponse> for SynthesisInput {
    fn from(response: SubsystemResponse) -> Self {
        SynthesisInput::Subsystem(response)
    }
}

impl From<Contribution> for SynthesisInput {
    fn from(contribution: Contribution) -> Self {
        SynthesisInput::Contribution(contribution)
    }
}

impl From<Value> for SynthesisInput {
    fn from(value: Value) -> Self {
        SynthesisInput::Json(value)
    }
}

/// Uniform view of one result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub content: String,
    pub confidence: f64,
    pub source: String,
    /// Producer category, used for reliability when the source is unknown
    pub kind: String,
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Normalize one input; `None` when it carries no usable content.
pub fn normalize(input: &SynthesisInput) -> Option<NormalizedResult> {
    let result = match input {
        SynthesisInput::Subsystem(r) => NormalizedResult {
            content: r.content.trim().to_string(),
            confidence: clamp_confidence(r.confidence),
            source: r.subsystem.clone(),
            kind: r.kind.as_str().to_string(),
        },
        SynthesisInput::Contribution(c) => {
            let content = if c.payload.trim().is_empty() {
                c.insights.join(" ")
            } else {
                c.payload.clone()
            };
            NormalizedResult {
                content: content.trim().to_string(),
                confidence: clamp_confidence(c.confidence),
                source: c.participant_id.clone(),
                kind: "contribution".to_string(),
            }
        }
        SynthesisInput::Json(value) => normalize_json(value)?,
    };

    if result.content.is_empty() {
        None
    } else {
        Some(result)
    }
}

fn normalize_json(value: &Value) -> Option<NormalizedResult> {
    match value {
        Value::String(s) => Some(NormalizedResult {
            content: s.trim().to_string(),
            confidence: 0.5,
            source: "unknown".to_string(),
            kind: "text".to_string(),
        }),
        Value::Object(map) => {
            // Captured call failures look like {error, system}.
            if map.contains_key("error") && !CONTENT_KEYS.iter().any(|k| map.contains_key(*k)) {
                return None;
            }
            let content = CONTENT_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(content_text))?;
            let confidence = map
                .get("confidence")
                .and_then(Value::as_f64)
                .map(clamp_confidence)
                .unwrap_or(0.5);
            let source = ["source", "subsystem", "system", "participant_id"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))
                .unwrap_or("unknown")
                .to_string();
            let kind = map
                .get("type")
                .or_else(|| map.get("kind"))
                .and_then(Value::as_str)
                .unwrap_or("json")
                .to_string();
            Some(NormalizedResult {
                content: content.trim().to_string(),
                confidence,
                source,
                kind,
            })
        }
        _ => None,
    }
}

fn content_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect();
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        _ => None,
    }
}

/// Normalize a batch, dropping unusable entries; order is preserved.
pub fn normalize_all(inputs: &[SynthesisInput]) -> Vec<NormalizedResult> {
    inputs.iter().filter_map(normalize).collect()
}
