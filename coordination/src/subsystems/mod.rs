//! Downstream reasoning subsystems
//!
//! The coordination layer never computes answers itself. It talks to three
//! kinds of collaborator through narrow async traits:
//!
//! ```text
//!                    ┌────────────────────┐
//!   Orchestrator ───▶│ SubsystemRegistry  │  name → Arc<dyn Subsystem>
//!                    └─────────┬──────────┘
//!            ┌─────────────────┼──────────────────┐
//!            ▼                 ▼                  ▼
//!   KnowledgeSubsystem  ReasoningSubsystem  DeliberationEngine
//!   (KnowledgeRetriever) (ReasoningEngine)   (participants)
//! ```
//!
//! [`Subsystem::invoke`] is the uniform call the orchestrator makes. The
//! adapters lift the richer `retrieve`/`process` contracts into it.

pub mod health;
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use health::{CircuitState, HealthSnapshot, SubsystemHealth};
pub use http::{HttpKnowledgeClient, HttpReasoningClient};

/// Default registry name of the knowledge-retrieval subsystem
pub const KNOWLEDGE: &str = "knowledge";
/// Default registry name of the reasoning subsystem
pub const REASONING: &str = "reasoning";
/// Default registry name of the deliberation subsystem
pub const DELIBERATION: &str = "deliberation";

/// Errors from subsystem calls
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubsystemError {
    #[error("Subsystem unavailable: {0}")]
    Unavailable(String),

    #[error("Subsystem {subsystem} timed out after {timeout_ms}ms")]
    Timeout { subsystem: String, timeout_ms: u64 },

    #[error("Subsystem {subsystem} failed: {message}")]
    Failed { subsystem: String, message: String },

    #[error("Subsystem {subsystem} returned an invalid response: {message}")]
    InvalidResponse { subsystem: String, message: String },
}

impl SubsystemError {
    /// Whether retrying the same call could succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Failed { .. })
    }

    /// Whether the failure should count against the subsystem's health
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::Unavailable(_))
    }

    pub fn failed(subsystem: &str, message: impl Into<String>) -> Self {
        Self::Failed {
            subsystem: subsystem.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for subsystem calls
pub type SubsystemResult<T> = Result<T, SubsystemError>;

/// Which contract a subsystem fulfils
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemKind {
    Knowledge,
    Reasoning,
    Deliberation,
}

impl SubsystemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Knowledge => KNOWLEDGE,
            Self::Reasoning => REASONING,
            Self::Deliberation => DELIBERATION,
        }
    }
}

impl std::fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Uniform request handed to every subsystem
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubsystemRequest {
    pub text: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Supplementary material from earlier calls (documents, prior answers)
    #[serde(default)]
    pub sources: Vec<String>,
}

impl SubsystemRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    /// Insert a single context entry
    pub fn set(&mut self, key: &str, value: Value) {
        self.context.insert(key.to_string(), value);
    }
}

/// A retrieved document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub score: f64,
}

/// Uniform response returned by every subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsystemResponse {
    /// Registry name of the responder
    pub subsystem: String,
    pub kind: SubsystemKind,
    pub content: String,
    pub confidence: f64,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SubsystemResponse {
    pub fn new(
        subsystem: impl Into<String>,
        kind: SubsystemKind,
        content: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            subsystem: subsystem.into(),
            kind,
            content: content.into(),
            confidence: confidence.clamp(0.0, 1.0),
            sources: Vec::new(),
            reasoning: None,
            documents: Vec::new(),
            metadata: Map::new(),
        }
    }
}

/// A downstream subsystem the orchestrator can call
#[async_trait]
pub trait Subsystem: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    fn kind(&self) -> SubsystemKind;

    async fn invoke(&self, request: &SubsystemRequest) -> SubsystemResult<SubsystemResponse>;
}

/// Shared handle to a subsystem
pub type SharedSubsystem = Arc<dyn Subsystem>;

/// Options for knowledge retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalOptions {
    pub max_results: usize,
    pub threshold: f64,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            max_results: 5,
            threshold: 0.7,
        }
    }
}

/// Output of a knowledge retrieval
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Knowledge-retrieval collaborator
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        options: &RetrievalOptions,
    ) -> SubsystemResult<RetrievalResult>;
}

/// Input to the reasoning collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningInput {
    pub text: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Per-call options for the reasoning collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningOptions {
    /// Role or perspective the answer should take
    #[serde(default)]
    pub framing: Option<String>,
}

/// Output of the reasoning collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningOutput {
    pub response: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub layers_used: Vec<String>,
}

/// Reasoning collaborator
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn process(
        &self,
        input: &ReasoningInput,
        options: &ReasoningOptions,
    ) -> SubsystemResult<ReasoningOutput>;
}

/// Lifts a [`KnowledgeRetriever`] into a [`Subsystem`]
pub struct KnowledgeSubsystem {
    name: String,
    retriever: Arc<dyn KnowledgeRetriever>,
    options: RetrievalOptions,
}

impl KnowledgeSubsystem {
    pub fn new(name: impl Into<String>, retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        Self {
            name: name.into(),
            retriever,
            options: RetrievalOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RetrievalOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl Subsystem for KnowledgeSubsystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SubsystemKind {
        SubsystemKind::Knowledge
    }

    async fn invoke(&self, request: &SubsystemRequest) -> SubsystemResult<SubsystemResponse> {
        let result = self.retriever.retrieve(&request.text, &self.options).await?;

        let content = result
            .documents
            .iter()
            .map(|d| d.content.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut sources = result.sources;
        for doc in &result.documents {
            if let Some(source) = &doc.source {
                if !sources.contains(source) {
                    sources.push(source.clone());
                }
            }
        }

        let mut response =
            SubsystemResponse::new(&self.name, SubsystemKind::Knowledge, content, result.confidence);
        response.sources = sources;
        response.metadata.insert(
            "document_count".to_string(),
            Value::from(result.documents.len()),
        );
        response.documents = result.documents;
        Ok(response)
    }
}

/// Lifts a [`ReasoningEngine`] into a [`Subsystem`]
pub struct ReasoningSubsystem {
    name: String,
    engine: Arc<dyn ReasoningEngine>,
}

impl ReasoningSubsystem {
    pub fn new(name: impl Into<String>, engine: Arc<dyn ReasoningEngine>) -> Self {
        Self {
            name: name.into(),
            engine,
        }
    }
}

#[async_trait]
impl Subsystem for ReasoningSubsystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SubsystemKind {
        SubsystemKind::Reasoning
    }

    async fn invoke(&self, request: &SubsystemRequest) -> SubsystemResult<SubsystemResponse> {
        let input = ReasoningInput {
            text: request.text.clone(),
            context: request.context.clone(),
            sources: request.sources.clone(),
        };
        let output = self
            .engine
            .process(&input, &ReasoningOptions::default())
            .await?;

        let mut response = SubsystemResponse::new(
            &self.name,
            SubsystemKind::Reasoning,
            output.response,
            output.confidence,
        );
        response.reasoning = output.reasoning;
        response.sources = request.sources.clone();
        if !output.layers_used.is_empty() {
            response
                .metadata
                .insert("layers_used".to_string(), Value::from(output.layers_used));
        }
        Ok(response)
    }
}

/// Named subsystems available to the orchestrator
#[derive(Clone, Default)]
pub struct SubsystemRegistry {
    entries: HashMap<String, SharedSubsystem>,
    order: Vec<String>,
}

/// Shared reference to a registry
pub type SharedRegistry = Arc<SubsystemRegistry>;

impl SubsystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the subsystem's own name, replacing any previous entry
    pub fn register(&mut self, subsystem: SharedSubsystem) {
        let name = subsystem.name().to_string();
        self.register_as(name, subsystem);
    }

    /// Register under an explicit name
    pub fn register_as(&mut self, name: impl Into<String>, subsystem: SharedSubsystem) {
        let name = name.into();
        if !self.entries.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.entries.insert(name, subsystem);
    }

    pub fn with(mut self, subsystem: SharedSubsystem) -> Self {
        self.register(subsystem);
        self
    }

    /// Look up by name; a missing entry is `Unavailable`
    pub fn get(&self, name: &str) -> SubsystemResult<SharedSubsystem> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| SubsystemError::Unavailable(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Names in registration order
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// First registered subsystem of a kind
    pub fn first_of_kind(&self, kind: SubsystemKind) -> Option<String> {
        self.order
            .iter()
            .find(|n| self.entries.get(*n).is_some_and(|s| s.kind() == kind))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(self)
    }
}

impl std::fmt::Debug for SubsystemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubsystemRegistry")
            .field("names", &self.order)
            .finish()
    }
}
