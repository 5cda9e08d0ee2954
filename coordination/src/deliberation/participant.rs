//! Council participants.
//!
//! A participant is anything that can answer the three council messages
//! (`collaboration_invite`, `phase_execution`, `consensus_request`).
//! [`ReasoningParticipant`] is the production implementation: it frames
//! each message for its role and asks a [`ReasoningEngine`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::voting::Vote;
use crate::subsystems::{ReasoningEngine, ReasoningInput, ReasoningOptions};

/// Errors from a single participant call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParticipantError {
    #[error("Participant {participant} timed out after {timeout_ms}ms")]
    Timeout { participant: String, timeout_ms: u64 },

    #[error("Participant {participant} failed: {message}")]
    Failed { participant: String, message: String },
}

/// Result type for participant calls
pub type ParticipantResult<T> = Result<T, ParticipantError>;

/// Specialization of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Analyst,
    Researcher,
    Strategist,
    Critic,
    Creative,
    Executor,
    /// Always present; synthesizes the final decision
    Coordinator,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyst => "analyst",
            Self::Researcher => "researcher",
            Self::Strategist => "strategist",
            Self::Critic => "critic",
            Self::Creative => "creative",
            Self::Executor => "executor",
            Self::Coordinator => "coordinator",
        }
    }

    /// Expertise tags used to decide whether an optional participant joins
    pub fn default_specialties(&self) -> &'static [&'static str] {
        match self {
            Self::Analyst => &["analysis", "data", "logic", "metrics"],
            Self::Researcher => &["research", "evidence", "sources", "facts"],
            Self::Strategist => &["strategy", "planning", "prioritization", "goals"],
            Self::Critic => &["risk", "review", "quality", "security"],
            Self::Creative => &["ideation", "writing", "design", "narrative"],
            Self::Executor => &["execution", "tools", "automation", "operations"],
            Self::Coordinator => &["coordination", "synthesis"],
        }
    }

    /// How the role should approach any question
    pub fn framing(&self) -> &'static str {
        match self {
            Self::Analyst => "Break the problem into parts and reason from the data.",
            Self::Researcher => "Ground every claim in evidence and name the sources you rely on.",
            Self::Strategist => "Weigh goals, options and long-term consequences.",
            Self::Critic => "Look for flaws, risks and unstated assumptions.",
            Self::Creative => "Propose original options others may have missed.",
            Self::Executor => "Focus on concrete, executable steps.",
            Self::Coordinator => "Integrate the other perspectives into one position.",
        }
    }
}

impl std::fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Council message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    CollaborationInvite,
    PhaseExecution,
    ConsensusRequest,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CollaborationInvite => "collaboration_invite",
            Self::PhaseExecution => "phase_execution",
            Self::ConsensusRequest => "consensus_request",
        }
    }
}

/// Message broadcast to participants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantMessage {
    pub kind: MessageKind,
    pub discussion_id: String,
    pub workflow: String,
    /// Set for phase execution
    pub phase: Option<String>,
    pub input: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Insights gathered so far in the discussion
    #[serde(default)]
    pub prior_insights: Vec<String>,
    /// Set for consensus requests: the position being voted on
    pub proposal: Option<String>,
}

/// Answer to a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantReply {
    pub success: bool,
    /// Main contribution text
    pub content: Option<String>,
    #[serde(default)]
    pub insights: Vec<String>,
    /// Raw vote label for consensus requests
    pub vote: Option<String>,
    pub recommendation: Option<String>,
    pub confidence: f64,
}

impl ParticipantReply {
    pub fn contribution(content: impl Into<String>, insights: Vec<String>, confidence: f64) -> Self {
        Self {
            success: true,
            content: Some(content.into()),
            insights,
            confidence,
            ..Default::default()
        }
    }

    pub fn vote(vote: Vote, recommendation: Option<String>, confidence: f64) -> Self {
        Self {
            success: true,
            vote: Some(vote.as_str().to_string()),
            recommendation,
            confidence,
            ..Default::default()
        }
    }

    pub fn accept() -> Self {
        Self {
            success: true,
            confidence: 1.0,
            ..Default::default()
        }
    }

    pub fn decline() -> Self {
        Self::default()
    }
}

/// One participant's output for one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub participant_id: String,
    pub role: ParticipantRole,
    pub phase: String,
    pub payload: String,
    pub insights: Vec<String>,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// A council member
#[async_trait]
pub trait Participant: Send + Sync {
    fn id(&self) -> &str;

    fn role(&self) -> ParticipantRole;

    fn specialties(&self) -> Vec<String> {
        self.role()
            .default_specialties()
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    async fn respond(&self, message: &ParticipantMessage) -> ParticipantResult<ParticipantReply>;
}

/// Shared handle to a participant
pub type SharedParticipant = Arc<dyn Participant>;

/// Participant backed by the reasoning subsystem
pub struct ReasoningParticipant {
    id: String,
    role: ParticipantRole,
    engine: Arc<dyn ReasoningEngine>,
}

impl ReasoningParticipant {
    pub fn new(id: impl Into<String>, role: ParticipantRole, engine: Arc<dyn ReasoningEngine>) -> Self {
        Self {
            id: id.into(),
            role,
            engine,
        }
    }

    /// One participant per role, all sharing `engine`
    pub fn council(engine: Arc<dyn ReasoningEngine>) -> Vec<SharedParticipant> {
        [
            ParticipantRole::Analyst,
            ParticipantRole::Researcher,
            ParticipantRole::Strategist,
            ParticipantRole::Critic,
            ParticipantRole::Creative,
            ParticipantRole::Executor,
            ParticipantRole::Coordinator,
        ]
        .into_iter()
        .map(|role| Arc::new(Self::new(role.as_str(), role, engine.clone())) as SharedParticipant)
        .collect()
    }

    fn prompt(&self, message: &ParticipantMessage) -> String {
        let mut prompt = format!(
            "You are the {} of a decision council. {}\n\nRequest: {}",
            self.role,
            self.role.framing(),
            message.input
        );
        if let Some(phase) = &message.phase {
            prompt.push_str(&format!("\n\nCurrent phase: {}", phase));
        }
        if !message.prior_insights.is_empty() {
            prompt.push_str("\n\nInsights so far:");
            for insight in &message.prior_insights {
                prompt.push_str(&format!("\n- {}", insight));
            }
        }
        if let Some(proposal) = &message.proposal {
            prompt.push_str(&format!(
                "\n\nProposal: {}\n\nStart your answer with one of: strongly agree, agree, \
                 neutral, disagree, strongly disagree. Then give your recommendation.",
                proposal
            ));
        }
        prompt
    }
}

/// Bullet lines, or failing that the first sentences, of a free-text answer
pub fn extract_insights(text: &str, limit: usize) -> Vec<String> {
    let bullets: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter_map(|l| l.strip_prefix("- ").or_else(|| l.strip_prefix("* ")))
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .take(limit)
        .collect();
    if !bullets.is_empty() {
        return bullets;
    }
    text.split_terminator(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(limit)
        .map(|s| s.to_string())
        .collect()
}

#[async_trait]
impl Participant for ReasoningParticipant {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> ParticipantRole {
        self.role
    }

    async fn respond(&self, message: &ParticipantMessage) -> ParticipantResult<ParticipantReply> {
        if message.kind == MessageKind::CollaborationInvite {
            return Ok(ParticipantReply::accept());
        }

        let input = ReasoningInput {
            text: self.prompt(message),
            context: message.context.clone(),
            sources: message.prior_insights.clone(),
        };
        let options = ReasoningOptions {
            framing: Some(self.role.as_str().to_string()),
        };
        let output = self
            .engine
            .process(&input, &options)
            .await
            .map_err(|e| ParticipantError::Failed {
                participant: self.id.clone(),
                message: e.to_string(),
            })?;

        match message.kind {
            MessageKind::ConsensusRequest => {
                let vote = Vote::parse_leading(&output.response);
                Ok(ParticipantReply {
                    success: true,
                    content: None,
                    insights: Vec::new(),
                    vote: vote.map(|v| v.as_str().to_string()),
                    recommendation: Some(output.response.trim().to_string()),
                    confidence: output.confidence,
                })
            }
            _ => Ok(ParticipantReply::contribution(
                output.response.trim(),
                extract_insights(&output.response, 3),
                output.confidence,
            )),
        }
    }
}
