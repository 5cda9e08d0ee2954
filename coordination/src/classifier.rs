//! Request classification.
//!
//! Turns free text plus an optional context map into a [`Classification`]:
//! complexity, intent, urgency and keywords. Every downstream component
//! reads these features; nothing here performs I/O or fails.
//!
//! ```text
//! text ──┬─▶ length bucket ─────┐
//!        ├─▶ question words ────┼─▶ complexity ∈ [0,1]
//!        ├─▶ complex vocabulary ┤
//!        ├─▶ sentence count ────┘
//!        ├─▶ intent table (first match wins) ─▶ intent
//!        └─▶ urgency cues ─┐
//! context.deadline ────────┴─▶ urgency ∈ [0,1]
//! ```

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form request context
pub type RequestContext = Map<String, Value>;

/// Coarse purpose of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Question,
    HowTo,
    Comparison,
    Analysis,
    ProblemSolving,
    Planning,
    Creative,
    General,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Intent::Question => "question",
            Intent::HowTo => "how_to",
            Intent::Comparison => "comparison",
            Intent::Analysis => "analysis",
            Intent::ProblemSolving => "problem_solving",
            Intent::Planning => "planning",
            Intent::Creative => "creative",
            Intent::General => "general",
        };
        write!(f, "{}", s)
    }
}

/// Facts about the request that fed the scores
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextClues {
    pub word_count: usize,
    pub sentence_count: usize,
    pub question_words: usize,
    pub complex_terms: usize,
    pub urgency_cues: Vec<String>,
    pub domain: Option<String>,
    /// Seconds until the context deadline, negative when already past
    pub seconds_to_deadline: Option<i64>,
}

/// Feature summary of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub text: String,
    pub complexity: f64,
    pub intent: Intent,
    pub keywords: BTreeSet<String>,
    pub urgency: f64,
    pub context_clues: ContextClues,
}

const QUESTION_WORDS: &[&str] = &["what", "why", "how", "when", "where", "which", "who"];

const COMPLEX_TERMS: &[&str] = &[
    "analyze",
    "analyse",
    "evaluate",
    "compare",
    "strategy",
    "strategic",
    "optimize",
    "architecture",
    "tradeoff",
    "trade-off",
    "implications",
    "comprehensive",
    "framework",
    "integrate",
    "synthesize",
    "consequences",
    "multifaceted",
    "systemic",
];

const STRONG_URGENCY: &[&str] = &["urgent", "asap", "emergency", "immediately"];
const SOFT_URGENCY: &[&str] = &["soon", "quickly", "today", "deadline", "priority"];

const STOPWORDS: &[&str] = &[
    "about", "after", "again", "also", "been", "before", "being", "between", "could", "does",
    "doing", "from", "have", "having", "here", "into", "just", "more", "most", "other", "over",
    "should", "some", "such", "than", "that", "their", "them", "then", "there", "these", "they",
    "this", "those", "through", "very", "what", "when", "where", "which", "while", "with",
    "would", "your", "will", "want", "need", "please",
];

// Increments
const BASE_COMPLEXITY: f64 = 0.1;
const QUESTION_WORD_STEP: f64 = 0.05;
const QUESTION_WORD_CAP: f64 = 0.15;
const COMPLEX_TERM_STEP: f64 = 0.1;
const COMPLEX_TERM_CAP: f64 = 0.3;
const STRONG_URGENCY_BONUS: f64 = 0.5;
const SOFT_URGENCY_BONUS: f64 = 0.2;
const DEADLINE_HOUR_BONUS: f64 = 0.4;
const DEADLINE_DAY_BONUS: f64 = 0.2;
const HIGH_PRIORITY_BONUS: f64 = 0.2;

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z][A-Za-z'\-]*").expect("WORD_RE regex should compile"));

static SENTENCE_END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+(\s|$)").expect("SENTENCE_END_RE regex should compile"));

/// Intent table in priority order: the first matching row decides.
static INTENT_TABLE: LazyLock<Vec<(Intent, Regex)>> = LazyLock::new(|| {
    [
        (
            Intent::Question,
            r"(?i)^\s*(what|who|when|where|which|is|are|does|do|can|could|will)\b|\?\s*$",
        ),
        (
            Intent::HowTo,
            r"(?i)\bhow (do|to|can|should|would)\b|\bsteps? to\b|\bguide\b|\btutorial\b",
        ),
        (
            Intent::Comparison,
            r"(?i)\b(compare|comparison|versus|vs\.?|difference between|better than|pros and cons)\b",
        ),
        (
            Intent::Analysis,
            r"(?i)\b(analy[sz]e|analysis|evaluate|assess|examine|investigate|implications?)\b",
        ),
        (
            Intent::ProblemSolving,
            r"(?i)\b(solve|fix|debug|troubleshoot|resolve|issue|problem|error|broken)\b",
        ),
        (
            Intent::Planning,
            r"(?i)\b(plan|planning|strategy|roadmap|schedule|organi[sz]e|prioriti[sz]e)\b",
        ),
        (
            Intent::Creative,
            r"(?i)\b(write|create|design|imagine|story|poem|brainstorm|invent)\b",
        ),
    ]
    .into_iter()
    .map(|(intent, pattern)| {
        (
            intent,
            Regex::new(pattern).expect("INTENT_TABLE regex should compile"),
        )
    })
    .collect()
});

/// Stateless request classifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestClassifier;

impl RequestClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify against the current time.
    pub fn classify(&self, text: &str, context: &RequestContext) -> Classification {
        self.classify_at(text, context, Utc::now())
    }

    /// Classify with an explicit "now" for deadline arithmetic.
    pub fn classify_at(
        &self,
        text: &str,
        context: &RequestContext,
        now: DateTime<Utc>,
    ) -> Classification {
        let words: Vec<String> = WORD_RE
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect();

        let sentence_count = match SENTENCE_END_RE.find_iter(text).count() {
            0 if !words.is_empty() => 1,
            n => n,
        };
        let question_words = words
            .iter()
            .filter(|w| QUESTION_WORDS.contains(&w.as_str()))
            .count();
        let complex_terms = words
            .iter()
            .filter(|w| COMPLEX_TERMS.contains(&w.as_str()))
            .count();

        let complexity = complexity_score(words.len(), question_words, complex_terms, sentence_count);
        let intent = intent_of(text);
        let keywords = keywords(&words);

        let urgency_cues: Vec<String> = words
            .iter()
            .filter(|w| STRONG_URGENCY.contains(&w.as_str()) || SOFT_URGENCY.contains(&w.as_str()))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let seconds_to_deadline = deadline_seconds(context, now);
        let urgency = urgency_score(&urgency_cues, seconds_to_deadline, context);

        let domain = context
            .get("domain")
            .and_then(Value::as_str)
            .map(str::to_string);

        Classification {
            text: text.to_string(),
            complexity,
            intent,
            keywords,
            urgency,
            context_clues: ContextClues {
                word_count: words.len(),
                sentence_count,
                question_words,
                complex_terms,
                urgency_cues,
                domain,
                seconds_to_deadline,
            },
        }
    }
}

fn intent_of(text: &str) -> Intent {
    INTENT_TABLE
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(intent, _)| *intent)
        .unwrap_or(Intent::General)
}

fn complexity_score(
    word_count: usize,
    question_words: usize,
    complex_terms: usize,
    sentence_count: usize,
) -> f64 {
    // ── Length bucket ─────────────────────────────────────────────────────
    let length = match word_count {
        n if n > 100 => 0.3,
        n if n > 50 => 0.2,
        n if n > 20 => 0.1,
        _ => 0.0,
    };

    // ── Vocabulary ────────────────────────────────────────────────────────
    let questions = (question_words as f64 * QUESTION_WORD_STEP).min(QUESTION_WORD_CAP);
    let complex = (complex_terms as f64 * COMPLEX_TERM_STEP).min(COMPLEX_TERM_CAP);

    // ── Structure ─────────────────────────────────────────────────────────
    let sentences = match sentence_count {
        n if n > 6 => 0.2,
        n if n > 3 => 0.1,
        _ => 0.0,
    };

    (BASE_COMPLEXITY + length + questions + complex + sentences).clamp(0.0, 1.0)
}

fn keywords(words: &[String]) -> BTreeSet<String> {
    words
        .iter()
        .filter(|w| w.len() >= 4 && !STOPWORDS.contains(&w.as_str()))
        .cloned()
        .collect()
}

fn deadline_seconds(context: &RequestContext, now: DateTime<Utc>) -> Option<i64> {
    match context.get("deadline")? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| (d.with_timezone(&Utc) - now).num_seconds()),
        // Numeric deadlines are seconds from now.
        Value::Number(n) => n.as_f64().map(|secs| secs as i64),
        _ => None,
    }
}

fn urgency_score(cues: &[String], seconds_to_deadline: Option<i64>, context: &RequestContext) -> f64 {
    let mut urgency: f64 = 0.0;

    if cues.iter().any(|c| STRONG_URGENCY.contains(&c.as_str())) {
        urgency += STRONG_URGENCY_BONUS;
    } else if !cues.is_empty() {
        urgency += SOFT_URGENCY_BONUS;
    }

    match seconds_to_deadline {
        Some(secs) if secs < 3_600 => urgency += DEADLINE_HOUR_BONUS,
        Some(secs) if secs < 86_400 => urgency += DEADLINE_DAY_BONUS,
        _ => {}
    }

    let high_priority = context
        .get("priority")
        .and_then(Value::as_str)
        .is_some_and(|p| matches!(p.to_lowercase().as_str(), "high" | "urgent" | "critical"));
    if high_priority {
        urgency += HIGH_PRIORITY_BONUS;
    }

    urgency.clamp(0.0, 1.0)
}
