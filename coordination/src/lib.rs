//! Meridian Coordination Library
//!
//! This library coordinates a knowledge-retrieval subsystem, a reasoning
//! subsystem and a council of specialized participants behind one request
//! surface:
//! - Rule-based request routing with a TTL decision cache
//! - Multi-strategy task execution and named workflows
//! - Council deliberation with voting, conflict detection and a decision authority
//! - Response synthesis with attribution, citations and quality scoring
//!
//! # Components
//!
//! ## Routing
//! - [`RequestClassifier`]: intent, complexity, domain and urgency of a request
//! - [`Router`]: ordered rule table, fallback target, decision cache
//!
//! ## Execution
//! - [`ExecutionOrchestrator`]: single, sequential, parallel, hybrid and
//!   consensus strategies, workflow templates, admission control, cancellation
//! - [`SubsystemRegistry`]: named subsystems with per-subsystem circuit breakers
//!
//! ## Deliberation
//! - [`DeliberationEngine`]: phased council discussions ending in a [`Decision`]
//!
//! ## Synthesis
//! - [`ResponseSynthesizer`]: merges many responses into one
//!
//! # Usage
//!
//! ```no_run
//! use meridian_coordination::{
//!     CoordinationConfig, CoordinationService, SubsystemRegistry, TaskOptions,
//! };
//!
//! # async fn demo(registry: SubsystemRegistry) -> Result<(), Box<dyn std::error::Error>> {
//! let service = CoordinationService::new(CoordinationConfig::default(), registry, Vec::new())?;
//! service.initialize();
//! let response = service
//!     .execute_task("What is the boiling point of water?", TaskOptions::default())
//!     .await?;
//! println!("{}", response.synthesis.content);
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod classifier;
pub mod config;
pub mod deliberation;
pub mod events;
pub mod orchestrator;
pub mod router;
pub mod scheduler;
pub mod service;
pub mod subsystems;
pub mod synthesizer;

// Re-export classification types
pub use classifier::{Classification, ContextClues, Intent, RequestClassifier, RequestContext};

// Re-export configuration types
pub use config::{
    ConfigError, ConfigResult, CoordinationConfig, DeliberationConfig, EndpointsConfig,
    EventConfig, OrchestratorConfig, RouterConfig, SynthesizerConfig,
};

// Re-export routing types
pub use router::{
    RouteTarget, Router, RouterError, RouterResult, RouterStats, RoutingDecision, RoutingRecord,
    RoutingRule, RulePack, RuleSpec, SharedRouter,
};

// Re-export orchestration types
pub use orchestrator::{
    ExecutionOrchestrator, ExecutionStrategy, OrchestrationError, OrchestrationResult,
    OrchestratorStats, StepAction, StepRecord, Task, TaskId, TaskOptions, TaskResult, TaskStatus,
    WorkflowCatalog, WorkflowDefinition, WorkflowStep,
};

// Re-export deliberation types
pub use deliberation::{
    ConflictSeverity, ConsensusResult, Contribution, Decision, DeliberationEngine,
    DeliberationError, DeliberationOutcome, DeliberationStats, Participant, ParticipantRole,
    QualityLevel, ReasoningParticipant, SharedDeliberationEngine, SharedParticipant, TaskType,
    Vote,
};

// Re-export synthesis types
pub use synthesizer::{
    QualityScore, ResponseSynthesizer, SynthesisInput, SynthesisOptions, SynthesisStrategy,
    SynthesizedResponse,
};

// Re-export subsystem types
pub use subsystems::{
    HttpKnowledgeClient, HttpReasoningClient, KnowledgeRetriever, KnowledgeSubsystem,
    ReasoningEngine, ReasoningSubsystem, SharedRegistry, SharedSubsystem, Subsystem,
    SubsystemError, SubsystemHealth, SubsystemKind, SubsystemRegistry, SubsystemRequest,
    SubsystemResponse, SubsystemResult,
};

// Re-export event types
pub use events::{CoordinationEvent, EventBus, EventHistory, EventReceiver, SharedEventBus};

// Re-export scheduling types
pub use scheduler::{Clock, ManualClock, Scheduler, SharedClock, SystemClock};

// Re-export service types
pub use service::{
    CoordinatedResponse, CoordinationService, ServiceError, ServiceHistory, ServiceStats,
};
