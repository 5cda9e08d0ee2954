//! Task data model and lifecycle.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{OrchestrationError, OrchestrationResult};
use crate::router::RoutingDecision;
use crate::subsystems::SubsystemResponse;

pub type TaskId = String;

/// Lifecycle of a task
///
/// ```text
/// pending ──▶ running ──┬──▶ completed
///    │                  ├──▶ failed
///    └──────────────────┴──▶ cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Failed | Self::Cancelled) => true,
            (Self::Running, s) => s.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Single,
    Sequential,
    Parallel,
    Hybrid,
    Consensus,
}

impl ExecutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Hybrid => "hybrid",
            Self::Consensus => "consensus",
        }
    }
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStrategy {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "hybrid" => Ok(Self::Hybrid),
            "consensus" => Ok(Self::Consensus),
            other => Err(OrchestrationError::InvalidTask(format!(
                "unknown strategy '{}'",
                other
            ))),
        }
    }
}

/// A failed subsystem call captured instead of aborting a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFailure {
    pub system: String,
    pub error: String,
}

/// One executed step of a task or workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub targets: Vec<String>,
    pub success: bool,
    pub duration_ms: u64,
    pub responses: Vec<SubsystemResponse>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Caller options for one task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Falls back to the configured default strategy
    pub strategy: Option<ExecutionStrategy>,
    /// Subsystem names; empty means "route the request"
    #[serde(default)]
    pub targets: Vec<String>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl TaskOptions {
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Orchestrator-owned record of one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub request: String,
    pub context: Map<String, Value>,
    pub strategy: ExecutionStrategy,
    pub targets: Vec<String>,
    /// Set for workflow runs
    pub workflow: Option<String>,
    pub status: TaskStatus,
    pub steps: Vec<StepRecord>,
    pub results: BTreeMap<String, SubsystemResponse>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(request: impl Into<String>, strategy: ExecutionStrategy) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request: request.into(),
            context: Map::new(),
            strategy,
            targets: Vec::new(),
            workflow: None,
            status: TaskStatus::Pending,
            steps: Vec::new(),
            results: BTreeMap::new(),
            error: None,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
        }
    }

    /// Move to `next`, refusing anything but forward transitions
    pub fn transition(&mut self, next: TaskStatus) -> OrchestrationResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestrationError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == TaskStatus::Running {
            self.start_time = Some(now);
        }
        if next.is_terminal() {
            self.end_time = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}

/// What a caller receives for a finished task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub strategy: ExecutionStrategy,
    pub workflow: Option<String>,
    /// Final answer text
    pub content: String,
    pub confidence: f64,
    /// Every successful response, in call order
    pub responses: Vec<SubsystemResponse>,
    pub failures: Vec<CallFailure>,
    pub successes: usize,
    /// Consensus strategy only: share of targets agreeing on the answer
    pub agreement: Option<f64>,
    /// Routing decision when targets were derived by the router
    pub decision: Option<RoutingDecision>,
    pub steps: Vec<StepRecord>,
    pub duration_ms: u64,
}
