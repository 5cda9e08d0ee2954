//! Notification types emitted by the coordination layer
//!
//! Every component publishes through the same bus; consumers pick what they
//! care about by `event_type()` or by task/discussion id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deliberation::QualityLevel;
use crate::orchestrator::{ExecutionStrategy, TaskId, TaskStatus};
use crate::router::RouteTarget;
use crate::synthesizer::SynthesisStrategy;

/// All coordination events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    /// The router produced a decision (fresh or cached)
    DecisionMade {
        cache_key: String,
        target: RouteTarget,
        confidence: f64,
        rule_matched: Option<String>,
        fallback: bool,
        cached: bool,
        timestamp: DateTime<Utc>,
    },

    /// A routing decision was served from cache
    RoutingCacheHit {
        cache_key: String,
        timestamp: DateTime<Utc>,
    },

    /// Expired or overflowing cache entries were removed
    RoutingCacheEvicted {
        evicted: usize,
        remaining: usize,
        timestamp: DateTime<Utc>,
    },

    /// A task was admitted and began running
    TaskStarted {
        task_id: TaskId,
        strategy: ExecutionStrategy,
        targets: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A task reached the completed state
    TaskCompleted {
        task_id: TaskId,
        strategy: ExecutionStrategy,
        duration_ms: u64,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },

    /// A task reached the failed state
    TaskFailed {
        task_id: TaskId,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A task was cancelled by id
    TaskCancelled {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },

    /// A workflow run ended
    WorkflowCompleted {
        task_id: TaskId,
        workflow: String,
        status: TaskStatus,
        steps_completed: usize,
        timestamp: DateTime<Utc>,
    },

    /// The council produced a final decision
    DeliberationDecided {
        discussion_id: String,
        workflow: String,
        confidence: f64,
        consensus_achieved: bool,
        quality_level: QualityLevel,
        timestamp: DateTime<Utc>,
    },

    /// The synthesizer merged a result set
    SynthesisCompleted {
        strategy: SynthesisStrategy,
        total_sources: usize,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },

    /// A recoverable or fatal error somewhere in the pipeline
    Error {
        component: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl CoordinationEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CoordinationEvent::DecisionMade { timestamp, .. } => *timestamp,
            CoordinationEvent::RoutingCacheHit { timestamp, .. } => *timestamp,
            CoordinationEvent::RoutingCacheEvicted { timestamp, .. } => *timestamp,
            CoordinationEvent::TaskStarted { timestamp, .. } => *timestamp,
            CoordinationEvent::TaskCompleted { timestamp, .. } => *timestamp,
            CoordinationEvent::TaskFailed { timestamp, .. } => *timestamp,
            CoordinationEvent::TaskCancelled { timestamp, .. } => *timestamp,
            CoordinationEvent::WorkflowCompleted { timestamp, .. } => *timestamp,
            CoordinationEvent::DeliberationDecided { timestamp, .. } => *timestamp,
            CoordinationEvent::SynthesisCompleted { timestamp, .. } => *timestamp,
            CoordinationEvent::Error { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            CoordinationEvent::DecisionMade { .. } => "decision_made",
            CoordinationEvent::RoutingCacheHit { .. } => "routing_cache_hit",
            CoordinationEvent::RoutingCacheEvicted { .. } => "routing_cache_evicted",
            CoordinationEvent::TaskStarted { .. } => "task_started",
            CoordinationEvent::TaskCompleted { .. } => "task_completed",
            CoordinationEvent::TaskFailed { .. } => "task_failed",
            CoordinationEvent::TaskCancelled { .. } => "task_cancelled",
            CoordinationEvent::WorkflowCompleted { .. } => "workflow_completed",
            CoordinationEvent::DeliberationDecided { .. } => "deliberation_decided",
            CoordinationEvent::SynthesisCompleted { .. } => "synthesis_completed",
            CoordinationEvent::Error { .. } => "error",
        }
    }

    /// Get the task ID if this event is task-scoped
    pub fn task_id(&self) -> Option<&str> {
        match self {
            CoordinationEvent::TaskStarted { task_id, .. } => Some(task_id),
            CoordinationEvent::TaskCompleted { task_id, .. } => Some(task_id),
            CoordinationEvent::TaskFailed { task_id, .. } => Some(task_id),
            CoordinationEvent::TaskCancelled { task_id, .. } => Some(task_id),
            CoordinationEvent::WorkflowCompleted { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Convenience constructor for the generic error event
    pub fn error(component: &str, message: impl Into<String>) -> Self {
        CoordinationEvent::Error {
            component: component.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
