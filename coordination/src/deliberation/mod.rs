//! Deliberation engine
//!
//! A council of role-specialized participants discusses a request in
//! phases, optionally votes, and a decision authority turns the result into
//! one [`Decision`].
//!
//! ```text
//! idle ──▶ initiated ──▶ phase execution ×N ──▶ consensus ──▶ decided ──▶ idle
//!                         (skipped when the workflow has no vote) ┘
//! ```

pub mod authority;
pub mod engine;
pub mod participant;
pub mod voting;
pub mod workflows;

use thiserror::Error;

pub use authority::{
    ConflictResolution, Decision, DecisionAuthority, DecisionFramework, QualityAssessment,
    QualityCriteria, QualityLevel, ResolutionStrategy, RiskAssessment, RiskLevel,
    SynthesisApproach, FALLBACK_CONFIDENCE, FALLBACK_RECOMMENDATION,
};
pub use engine::{
    Broadcast, DeliberationEngine, DeliberationOutcome, DeliberationStats, DiscussionState,
    DiscussionSummary, PhaseOutcome, SharedContext, SharedDeliberationEngine,
};
pub use participant::{
    Contribution, MessageKind, Participant, ParticipantError, ParticipantMessage,
    ParticipantReply, ParticipantResult, ParticipantRole, ReasoningParticipant,
    SharedParticipant,
};
pub use voting::{ConflictAssessment, ConflictSeverity, ConsensusResult, Vote};
pub use workflows::{DeliberationWorkflow, TaskAnalysis, TaskType};

/// Errors inside one discussion. The engine recovers from all of them with a
/// fallback decision.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeliberationError {
    #[error("No participant with required role {0}")]
    MissingRequiredRole(ParticipantRole),

    #[error("No participant accepted the invitation")]
    NoParticipants,

    #[error("No contributions were collected")]
    NoContributions,

    #[error("Too many active discussions (limit {limit})")]
    TooManyDiscussions { limit: usize },
}

/// Result type for deliberation steps
pub type DeliberationResult<T> = Result<T, DeliberationError>;
