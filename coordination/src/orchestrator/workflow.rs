//! Named workflow templates and their runner.
//!
//! A workflow is an ordered list of steps. Each step's best response is
//! chained into the next step's request. A `router` step stores a routing
//! decision; a later `dynamic` step executes whatever that decision chose.
//!
//! ```yaml
//! workflows:
//!   - name: triage
//!     description: Route, then answer
//!     timeout_ms: 30000
//!     steps:
//!       - name: route
//!         type: router
//!       - name: answer
//!         type: dynamic
//! ```

use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::strategy::{self, chain, targets_for, Dispatcher, ExecutionTrace, StrategyOutcome};
use super::task::{CallFailure, ExecutionStrategy};
use super::{OrchestrationError, OrchestrationResult};
use crate::router::{Router, RoutingDecision};
use crate::subsystems::{SubsystemRequest, SubsystemResponse, KNOWLEDGE, REASONING, DELIBERATION};

const DEFAULT_WORKFLOW_TIMEOUT_MS: u64 = 60_000;

fn default_timeout_ms() -> u64 {
    DEFAULT_WORKFLOW_TIMEOUT_MS
}

/// What a step does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// Call the listed subsystems, chained or concurrently
    Invoke {
        targets: Vec<String>,
        #[serde(default)]
        parallel: bool,
    },
    /// Route the request and keep the decision for a later dynamic step
    Router,
    /// Execute the target chosen by the latest router step
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    #[serde(flatten)]
    pub action: StepAction,
}

impl WorkflowStep {
    pub fn invoke(name: &str, targets: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            action: StepAction::Invoke {
                targets: targets.iter().map(|t| t.to_string()).collect(),
                parallel: false,
            },
        }
    }

    pub fn parallel(name: &str, targets: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            action: StepAction::Invoke {
                targets: targets.iter().map(|t| t.to_string()).collect(),
                parallel: true,
            },
        }
    }

    pub fn router(name: &str) -> Self {
        Self {
            name: name.to_string(),
            action: StepAction::Router,
        }
    }

    pub fn dynamic(name: &str) -> Self {
        Self {
            name: name.to_string(),
            action: StepAction::Dynamic,
        }
    }
}

/// Immutable workflow template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<WorkflowStep>,
    /// Deadline for the whole run
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            steps,
            timeout_ms: DEFAULT_WORKFLOW_TIMEOUT_MS,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn validate(&self) -> OrchestrationResult<()> {
        let invalid = |reason: String| OrchestrationError::InvalidWorkflow {
            name: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("no steps".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms must be positive".to_string()));
        }
        let mut routed = false;
        // Router step still waiting for a dynamic step to consume it
        let mut unconsumed: Option<&str> = None;
        for step in &self.steps {
            match &step.action {
                StepAction::Invoke { targets, .. } if targets.is_empty() => {
                    return Err(invalid(format!("step '{}' has no targets", step.name)));
                }
                StepAction::Router => {
                    routed = true;
                    unconsumed = Some(step.name.as_str());
                }
                StepAction::Dynamic if !routed => {
                    return Err(invalid(format!(
                        "dynamic step '{}' has no router step before it",
                        step.name
                    )));
                }
                StepAction::Dynamic => unconsumed = None,
                _ => {}
            }
        }
        if let Some(router) = unconsumed {
            return Err(invalid(format!(
                "router step '{}' has no dynamic step after it",
                router
            )));
        }
        Ok(())
    }
}

/// Workflows loaded from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowCatalog {
    pub workflows: Vec<WorkflowDefinition>,
}

impl WorkflowCatalog {
    pub fn from_yaml_str(yaml: &str) -> OrchestrationResult<Self> {
        let catalog: Self = serde_yaml::from_str(yaml).map_err(|e| OrchestrationError::InvalidWorkflow {
            name: "<catalog>".to_string(),
            reason: e.to_string(),
        })?;
        for workflow in &catalog.workflows {
            workflow.validate()?;
        }
        Ok(catalog)
    }
}

/// Workflows every orchestrator starts with
pub fn builtin_workflows() -> Vec<WorkflowDefinition> {
    vec![
        WorkflowDefinition::new(
            "research",
            "Retrieve knowledge, then reason over it",
            vec![
                WorkflowStep::invoke("retrieve", &[KNOWLEDGE]),
                WorkflowStep::invoke("reason", &[REASONING]),
            ],
        ),
        WorkflowDefinition::new(
            "adaptive",
            "Route the request and run whatever the router picks",
            vec![WorkflowStep::router("route"), WorkflowStep::dynamic("execute")],
        ),
        WorkflowDefinition::new(
            "comprehensive",
            "Knowledge and reasoning in parallel, then council deliberation",
            vec![
                WorkflowStep::parallel("gather", &[KNOWLEDGE, REASONING]),
                WorkflowStep::invoke("deliberate", &[DELIBERATION]),
            ],
        )
        .with_timeout_ms(120_000),
        WorkflowDefinition::new(
            "verified_answer",
            "Answer by reasoning, then fact-check against knowledge",
            vec![
                WorkflowStep::invoke("answer", &[REASONING]),
                WorkflowStep::invoke("verify", &[KNOWLEDGE]),
            ],
        ),
    ]
}

/// Output of a full workflow run
#[derive(Debug, Clone)]
pub struct WorkflowOutput {
    pub outcome: StrategyOutcome,
    pub decision: Option<RoutingDecision>,
}

/// Run every step in order. The first failing step is recorded and aborts
/// the run.
pub async fn run_workflow(
    dispatcher: &Dispatcher,
    router: &Router,
    definition: &WorkflowDefinition,
    request: &SubsystemRequest,
    trace: &ExecutionTrace,
) -> OrchestrationResult<WorkflowOutput> {
    let mut context = request.context.clone();
    let mut previous: Option<SubsystemResponse> = None;
    let mut decision: Option<RoutingDecision> = None;
    let mut responses: Vec<SubsystemResponse> = Vec::new();
    let mut failures: Vec<CallFailure> = Vec::new();

    for (index, step) in definition.steps.iter().enumerate() {
        let mut step_request = SubsystemRequest::new(request.text.clone())
            .with_context(context.clone())
            .with_sources(request.sources.clone());
        if let Some(previous) = &previous {
            chain(&mut step_request, previous);
        }
        debug!(workflow = %definition.name, step = %step.name, index, "Running workflow step");

        let step_failure = |message: String| OrchestrationError::WorkflowStepFailure {
            workflow: definition.name.clone(),
            step: step.name.clone(),
            index,
            message,
        };

        if trace.is_stopped() {
            debug!(workflow = %definition.name, step = %step.name, "Task stopped, remaining steps skipped");
            return Err(step_failure("task stopped before this step".to_string()));
        }

        let result: Result<StrategyOutcome, String> = match &step.action {
            StepAction::Router => {
                let started_at = Utc::now();
                let started = Instant::now();
                let routed = router.route(&request.text, &context);
                context.insert("route".to_string(), json!(routed));
                trace.record_step(&step.name, Vec::new(), started_at, started.elapsed(), Ok(Vec::new()));
                info!(workflow = %definition.name, target = %routed.target, "Workflow routed");
                decision = Some(routed);
                continue;
            }
            StepAction::Invoke { targets, parallel } => {
                run_invoke(dispatcher, &step.name, targets, *parallel, &step_request, trace).await
            }
            StepAction::Dynamic => match &decision {
                Some(routed) => {
                    let (strategy, targets) = targets_for(routed.target);
                    let started_at = Utc::now();
                    let started = Instant::now();
                    let nested = trace.nested();
                    let result = strategy::run(dispatcher, strategy, &targets, &step_request, &nested).await;
                    trace.record_step(
                        &step.name,
                        targets.clone(),
                        started_at,
                        started.elapsed(),
                        result
                            .as_ref()
                            .map(|o| o.responses.clone())
                            .map_err(|e| e.to_string()),
                    );
                    trace.merge_calls(&nested);
                    result.map_err(|e| e.to_string())
                }
                None => {
                    let message = "no routing decision for dynamic step".to_string();
                    trace.record_step(&step.name, Vec::new(), Utc::now(), Default::default(), Err(message.clone()));
                    Err(message)
                }
            },
        };

        let outcome = result.map_err(step_failure)?;
        if let Some(best) = best_of(&outcome) {
            previous = Some(best);
        }
        responses.extend(outcome.responses);
        failures.extend(outcome.failures);
    }

    let last = previous.ok_or_else(|| OrchestrationError::NoResults {
        failures: failures.clone(),
    })?;
    Ok(WorkflowOutput {
        outcome: StrategyOutcome {
            content: last.content,
            confidence: last.confidence,
            responses,
            failures,
            agreement: None,
        },
        decision,
    })
}

/// One invoke step, recorded as a single step record
async fn run_invoke(
    dispatcher: &Dispatcher,
    step_name: &str,
    targets: &[String],
    parallel: bool,
    request: &SubsystemRequest,
    trace: &ExecutionTrace,
) -> Result<StrategyOutcome, String> {
    let started_at = Utc::now();
    let started = Instant::now();

    let result = if parallel {
        let calls = targets
            .iter()
            .map(|target| async move { (target, dispatcher.call(target, request, trace).await) });
        let mut responses = Vec::new();
        let mut failures = Vec::new();
        for (target, result) in join_all(calls).await {
            match result {
                Ok(response) => responses.push(response),
                Err(e) => failures.push(CallFailure {
                    system: target.clone(),
                    error: e.to_string(),
                }),
            }
        }
        if responses.is_empty() {
            Err(failures
                .iter()
                .map(|f| format!("{}: {}", f.system, f.error))
                .collect::<Vec<_>>()
                .join("; "))
        } else {
            Ok(outcome_of(responses, failures, ExecutionStrategy::Parallel))
        }
    } else {
        let mut responses: Vec<SubsystemResponse> = Vec::new();
        let mut error = None;
        for target in targets {
            let mut chained = request.clone();
            if let Some(previous) = responses.last() {
                chain(&mut chained, previous);
            }
            match dispatcher.call(target, &chained, trace).await {
                Ok(response) => responses.push(response),
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            }
        }
        match error {
            Some(e) => Err(e),
            None => Ok(outcome_of(responses, Vec::new(), ExecutionStrategy::Sequential)),
        }
    };

    trace.record_step(
        step_name,
        targets.to_vec(),
        started_at,
        started.elapsed(),
        result
            .as_ref()
            .map(|o| o.responses.clone())
            .map_err(Clone::clone),
    );
    result
}

fn outcome_of(
    responses: Vec<SubsystemResponse>,
    failures: Vec<CallFailure>,
    strategy: ExecutionStrategy,
) -> StrategyOutcome {
    let chosen = match strategy {
        ExecutionStrategy::Sequential => responses.last(),
        _ => responses
            .iter()
            .reduce(|best, r| if r.confidence > best.confidence { r } else { best }),
    };
    let (content, confidence) = chosen
        .map(|r| (r.content.clone(), r.confidence))
        .unwrap_or_default();
    StrategyOutcome {
        content,
        confidence,
        responses,
        failures,
        agreement: None,
    }
}

/// Response that the next step is chained to
fn best_of(outcome: &StrategyOutcome) -> Option<SubsystemResponse> {
    outcome
        .responses
        .iter()
        .find(|r| r.content == outcome.content)
        .or_else(|| outcome.responses.last())
        .cloned()
}
