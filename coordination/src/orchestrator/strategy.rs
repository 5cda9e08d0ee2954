//! Execution strategies and the guarded subsystem call underneath them.
//!
//! | Strategy   | Calls                       | Failure handling                    | Confidence            |
//! |------------|-----------------------------|-------------------------------------|-----------------------|
//! | single     | first target                | error propagates                    | response              |
//! | sequential | targets in order, chained   | first error aborts                  | last response         |
//! | parallel   | all targets concurrently    | captured per call, always reported  | mean of successes     |
//! | hybrid     | knowledge ──▶ reasoning     | either error propagates             | min of the two        |
//! | consensus  | all targets concurrently    | errors discarded; none left = error | mean of winning group |

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::task::{CallFailure, ExecutionStrategy, StepRecord};
use super::{OrchestrationError, OrchestrationResult};
use crate::router::RouteTarget;
use crate::subsystems::{
    SharedRegistry, SubsystemError, SubsystemHealth, SubsystemKind, SubsystemRequest,
    SubsystemResponse, SubsystemResult, DELIBERATION, KNOWLEDGE, REASONING,
};

/// Calls and steps of one task, shared with the code that runs it.
///
/// Carries the task's stop signal: once it fires no new call or workflow
/// step is started.
#[derive(Debug, Default)]
pub struct ExecutionTrace {
    calls: Mutex<BTreeMap<String, u64>>,
    steps: Mutex<Vec<StepRecord>>,
    stop: CancellationToken,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stop(stop: CancellationToken) -> Self {
        Self {
            stop,
            ..Self::default()
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// A trace for nested work that stops with this one
    pub fn nested(&self) -> Self {
        Self::with_stop(self.stop.child_token())
    }

    fn record_call(&self, name: &str) {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        *calls.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Append a step record; its index is its position
    pub fn record_step(
        &self,
        name: &str,
        targets: Vec<String>,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        outcome: Result<Vec<SubsystemResponse>, String>,
    ) {
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        let (success, responses, error) = match outcome {
            Ok(responses) => (true, responses, None),
            Err(error) => (false, Vec::new(), Some(error)),
        };
        let index = steps.len();
        steps.push(StepRecord {
            index,
            name: name.to_string(),
            targets,
            success,
            duration_ms: elapsed.as_millis() as u64,
            responses,
            error,
            started_at,
        });
    }

    /// Add another trace's call counts to this one
    pub fn merge_calls(&self, other: &ExecutionTrace) {
        let other = other.calls();
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        for (name, count) in other {
            *calls.entry(name).or_insert(0) += count;
        }
    }

    pub fn steps(&self) -> Vec<StepRecord> {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Calls issued per subsystem name, retries included
    pub fn calls(&self) -> BTreeMap<String, u64> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Registry lookup, circuit check, deadline and bounded retry for one call
#[derive(Clone)]
pub struct Dispatcher {
    registry: SharedRegistry,
    health: Arc<SubsystemHealth>,
    call_timeout: Duration,
    retries: u32,
}

impl Dispatcher {
    pub fn new(
        registry: SharedRegistry,
        health: Arc<SubsystemHealth>,
        call_timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            registry,
            health,
            call_timeout,
            retries,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn health(&self) -> &Arc<SubsystemHealth> {
        &self.health
    }

    /// Call `name`. The call runs detached: if the caller stops waiting,
    /// it still completes and its result is discarded.
    pub async fn call(
        &self,
        name: &str,
        request: &SubsystemRequest,
        trace: &ExecutionTrace,
    ) -> SubsystemResult<SubsystemResponse> {
        let subsystem = self.registry.get(name)?;
        let timeout_ms = self.call_timeout.as_millis() as u64;
        let mut attempt = 0;

        loop {
            if trace.is_stopped() {
                debug!(subsystem = name, "Task stopped, call not issued");
                return Err(SubsystemError::failed(name, "task stopped before the call"));
            }
            self.health.check(name)?;
            trace.record_call(name);

            let handle = tokio::spawn({
                let subsystem = subsystem.clone();
                let request = request.clone();
                async move { subsystem.invoke(&request).await }
            });
            let result = match tokio::time::timeout(self.call_timeout, handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(SubsystemError::failed(
                    name,
                    format!("call aborted: {}", join_error),
                )),
                Err(_) => Err(SubsystemError::Timeout {
                    subsystem: name.to_string(),
                    timeout_ms,
                }),
            };

            match result {
                Ok(response) => {
                    self.health.record_success(name);
                    return Ok(response);
                }
                Err(e) => {
                    if e.counts_as_failure() {
                        self.health.record_failure(name);
                    }
                    if e.is_retriable() && attempt < self.retries {
                        attempt += 1;
                        debug!(subsystem = name, attempt, error = %e, "Retrying subsystem call");
                        continue;
                    }
                    warn!(subsystem = name, error = %e, "Subsystem call failed");
                    return Err(e);
                }
            }
        }
    }

    /// Call and record the call as one step
    pub async fn call_step(
        &self,
        step_name: &str,
        target: &str,
        request: &SubsystemRequest,
        trace: &ExecutionTrace,
    ) -> SubsystemResult<SubsystemResponse> {
        let started_at = Utc::now();
        let started = Instant::now();
        let result = self.call(target, request, trace).await;
        trace.record_step(
            step_name,
            vec![target.to_string()],
            started_at,
            started.elapsed(),
            result
                .as_ref()
                .map(|r| vec![r.clone()])
                .map_err(|e| e.to_string()),
        );
        result
    }
}

/// What a strategy produced
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    pub content: String,
    pub confidence: f64,
    pub responses: Vec<SubsystemResponse>,
    pub failures: Vec<CallFailure>,
    pub agreement: Option<f64>,
}

impl StrategyOutcome {
    fn from_response(response: SubsystemResponse) -> Self {
        Self {
            content: response.content.clone(),
            confidence: response.confidence,
            responses: vec![response],
            failures: Vec::new(),
            agreement: None,
        }
    }
}

/// Strategy and subsystem names for a routing target
pub fn targets_for(target: RouteTarget) -> (ExecutionStrategy, Vec<String>) {
    match target {
        RouteTarget::Knowledge => (ExecutionStrategy::Single, vec![KNOWLEDGE.to_string()]),
        RouteTarget::Reasoning => (ExecutionStrategy::Single, vec![REASONING.to_string()]),
        RouteTarget::Deliberation => (ExecutionStrategy::Single, vec![DELIBERATION.to_string()]),
        RouteTarget::Hybrid => (
            ExecutionStrategy::Hybrid,
            vec![KNOWLEDGE.to_string(), REASONING.to_string()],
        ),
    }
}

pub async fn run(
    dispatcher: &Dispatcher,
    strategy: ExecutionStrategy,
    targets: &[String],
    request: &SubsystemRequest,
    trace: &ExecutionTrace,
) -> OrchestrationResult<StrategyOutcome> {
    if targets.is_empty() && strategy != ExecutionStrategy::Hybrid {
        return Err(OrchestrationError::InvalidTask(format!(
            "strategy {} needs at least one target",
            strategy
        )));
    }
    debug!(strategy = %strategy, targets = ?targets, "Running strategy");
    match strategy {
        ExecutionStrategy::Single => single(dispatcher, &targets[0], request, trace).await,
        ExecutionStrategy::Sequential => sequential(dispatcher, targets, request, trace).await,
        ExecutionStrategy::Parallel => parallel(dispatcher, targets, request, trace).await,
        ExecutionStrategy::Hybrid => hybrid(dispatcher, targets, request, trace).await,
        ExecutionStrategy::Consensus => consensus(dispatcher, targets, request, trace).await,
    }
}

pub async fn single(
    dispatcher: &Dispatcher,
    target: &str,
    request: &SubsystemRequest,
    trace: &ExecutionTrace,
) -> OrchestrationResult<StrategyOutcome> {
    let response = dispatcher.call_step(target, target, request, trace).await?;
    Ok(StrategyOutcome::from_response(response))
}

/// Each call sees the previous output in its context and sources
pub async fn sequential(
    dispatcher: &Dispatcher,
    targets: &[String],
    request: &SubsystemRequest,
    trace: &ExecutionTrace,
) -> OrchestrationResult<StrategyOutcome> {
    let mut responses: Vec<SubsystemResponse> = Vec::with_capacity(targets.len());
    for target in targets {
        let mut step_request = request.clone();
        if let Some(previous) = responses.last() {
            chain(&mut step_request, previous);
        }
        let response = dispatcher
            .call_step(target, target, &step_request, trace)
            .await?;
        responses.push(response);
    }
    let last = responses
        .last()
        .cloned()
        .ok_or_else(|| OrchestrationError::InvalidTask("no targets".to_string()))?;
    Ok(StrategyOutcome {
        content: last.content,
        confidence: last.confidence,
        responses,
        failures: Vec::new(),
        agreement: None,
    })
}

/// Feed a previous response into the next request
pub fn chain(request: &mut SubsystemRequest, previous: &SubsystemResponse) {
    request.set("previous_output", json!(previous.content));
    request.set("previous_system", json!(previous.subsystem));
    request.sources.push(previous.content.clone());
}

/// Fan out to every target and wait for all of them
async fn fan_out(
    dispatcher: &Dispatcher,
    targets: &[String],
    request: &SubsystemRequest,
    trace: &ExecutionTrace,
) -> (Vec<SubsystemResponse>, Vec<CallFailure>) {
    let calls = targets.iter().map(|target| async move {
        let started_at = Utc::now();
        let started = Instant::now();
        let result = dispatcher.call(target, request, trace).await;
        (target, started_at, started.elapsed(), result)
    });

    let mut responses = Vec::new();
    let mut failures = Vec::new();
    // Steps are recorded in target order, not completion order.
    for (target, started_at, elapsed, result) in join_all(calls).await {
        match result {
            Ok(response) => {
                trace.record_step(target, vec![target.clone()], started_at, elapsed, Ok(vec![response.clone()]));
                responses.push(response);
            }
            Err(e) => {
                trace.record_step(target, vec![target.clone()], started_at, elapsed, Err(e.to_string()));
                failures.push(CallFailure {
                    system: target.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    (responses, failures)
}

pub async fn parallel(
    dispatcher: &Dispatcher,
    targets: &[String],
    request: &SubsystemRequest,
    trace: &ExecutionTrace,
) -> OrchestrationResult<StrategyOutcome> {
    let (responses, failures) = fan_out(dispatcher, targets, request, trace).await;
    debug!(successes = responses.len(), failures = failures.len(), "Parallel batch settled");
    let Some(best) = best_response(&responses) else {
        return Ok(StrategyOutcome {
            content: String::new(),
            confidence: 0.0,
            responses,
            failures,
            agreement: None,
        });
    };
    Ok(StrategyOutcome {
        content: best.content.clone(),
        confidence: mean_confidence(&responses),
        responses,
        failures,
        agreement: None,
    })
}

/// Knowledge first, then reasoning over what it found
pub async fn hybrid(
    dispatcher: &Dispatcher,
    targets: &[String],
    request: &SubsystemRequest,
    trace: &ExecutionTrace,
) -> OrchestrationResult<StrategyOutcome> {
    let (knowledge, reasoning) = hybrid_pair(dispatcher, targets)?;

    let retrieved = dispatcher
        .call_step("retrieve", &knowledge, request, trace)
        .await?;

    let mut reasoning_request = request.clone();
    reasoning_request.set("knowledge", json!(retrieved.content));
    reasoning_request.set("knowledge_confidence", json!(retrieved.confidence));
    if retrieved.documents.is_empty() {
        reasoning_request.sources.push(retrieved.content.clone());
    } else {
        reasoning_request
            .sources
            .extend(retrieved.documents.iter().map(|d| d.content.clone()));
    }

    let reasoned = dispatcher
        .call_step("reason", &reasoning, &reasoning_request, trace)
        .await?;

    Ok(StrategyOutcome {
        content: reasoned.content.clone(),
        confidence: retrieved.confidence.min(reasoned.confidence),
        responses: vec![retrieved, reasoned],
        failures: Vec::new(),
        agreement: None,
    })
}

fn hybrid_pair(dispatcher: &Dispatcher, targets: &[String]) -> OrchestrationResult<(String, String)> {
    if let [knowledge, reasoning] = targets {
        return Ok((knowledge.clone(), reasoning.clone()));
    }
    let registry = dispatcher.registry();
    let knowledge = registry.first_of_kind(SubsystemKind::Knowledge);
    let reasoning = registry.first_of_kind(SubsystemKind::Reasoning);
    match (knowledge, reasoning) {
        (Some(k), Some(r)) => Ok((k, r)),
        _ => Err(OrchestrationError::InvalidTask(
            "hybrid needs a knowledge and a reasoning subsystem".to_string(),
        )),
    }
}

/// Majority vote over normalized answers.
///
/// A group holding more than half of the targets wins with
/// `agreement = group / targets`. Otherwise the most confident answer wins
/// and reports its own group's share.
pub async fn consensus(
    dispatcher: &Dispatcher,
    targets: &[String],
    request: &SubsystemRequest,
    trace: &ExecutionTrace,
) -> OrchestrationResult<StrategyOutcome> {
    let (responses, failures) = fan_out(dispatcher, targets, request, trace).await;
    let answered: Vec<&SubsystemResponse> = responses
        .iter()
        .filter(|r| !r.content.trim().is_empty())
        .collect();
    if answered.is_empty() {
        return Err(OrchestrationError::NoResults { failures });
    }

    // Groups in first-appearance order
    let mut groups: Vec<(String, Vec<&SubsystemResponse>)> = Vec::new();
    for response in answered.iter().copied() {
        let key = normalize_answer(&response.content);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(response),
            None => groups.push((key, vec![response])),
        }
    }

    let total = targets.len();
    let majority = groups
        .iter()
        .filter(|(_, members)| members.len() * 2 > total)
        .max_by_key(|(_, members)| members.len());

    let (content, confidence, group_size) = match majority {
        Some((_, members)) => {
            let representative = members
                .iter()
                .copied()
                .reduce(|best, r| if r.confidence > best.confidence { r } else { best })
                .unwrap_or(members[0]);
            let mean = members.iter().map(|r| r.confidence).sum::<f64>() / members.len() as f64;
            (representative.content.clone(), mean, members.len())
        }
        None => {
            let best = answered
                .iter()
                .copied()
                .reduce(|best, r| if r.confidence > best.confidence { r } else { best })
                .unwrap_or(answered[0]);
            let key = normalize_answer(&best.content);
            let size = groups
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, m)| m.len())
                .unwrap_or(1);
            debug!(groups = groups.len(), "No majority, using most confident answer");
            (best.content.clone(), best.confidence, size)
        }
    };

    let agreement = group_size as f64 / total as f64;
    debug!(agreement, group_size, total, "Consensus settled");
    Ok(StrategyOutcome {
        content,
        confidence,
        responses,
        failures,
        agreement: Some(agreement),
    })
}

/// Collapse whitespace and lowercase
pub fn normalize_answer(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn best_response(responses: &[SubsystemResponse]) -> Option<&SubsystemResponse> {
    responses
        .iter()
        .reduce(|best, r| if r.confidence > best.confidence { r } else { best })
}

fn mean_confidence(responses: &[SubsystemResponse]) -> f64 {
    if responses.is_empty() {
        return 0.0;
    }
    responses.iter().map(|r| r.confidence).sum::<f64>() / responses.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::{Subsystem, SubsystemRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Echo {
        name: String,
        kind: SubsystemKind,
        answer: String,
        confidence: f64,
    }

    #[async_trait]
    impl Subsystem for Echo {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> SubsystemKind {
            self.kind
        }

        async fn invoke(&self, request: &SubsystemRequest) -> SubsystemResult<SubsystemResponse> {
            let mut content = self.answer.clone();
            if let Some(prev) = request.context.get("previous_output").and_then(|v| v.as_str()) {
                content = format!("{} after {}", content, prev);
            }
            Ok(SubsystemResponse::new(&self.name, self.kind, content, self.confidence))
        }
    }

    struct Flaky {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl Subsystem for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn kind(&self) -> SubsystemKind {
            SubsystemKind::Reasoning
        }

        async fn invoke(&self, _request: &SubsystemRequest) -> SubsystemResult<SubsystemResponse> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(SubsystemError::failed("flaky", "transient"));
            }
            Ok(SubsystemResponse::new("flaky", SubsystemKind::Reasoning, "ok", 0.9))
        }
    }

    fn echo(name: &str, kind: SubsystemKind, answer: &str, confidence: f64) -> Arc<dyn Subsystem> {
        Arc::new(Echo {
            name: name.to_string(),
            kind,
            answer: answer.to_string(),
            confidence,
        })
    }

    fn dispatcher(registry: SubsystemRegistry, retries: u32) -> Dispatcher {
        Dispatcher::new(
            registry.shared(),
            Arc::new(SubsystemHealth::default()),
            Duration::from_secs(5),
            retries,
        )
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_sequential_chains_output() {
        let d = dispatcher(
            SubsystemRegistry::new()
                .with(echo("knowledge", SubsystemKind::Knowledge, "facts", 0.9))
                .with(echo("reasoning", SubsystemKind::Reasoning, "answer", 0.7)),
            0,
        );
        let trace = ExecutionTrace::new();
        let out = sequential(&d, &names(&["knowledge", "reasoning"]), &SubsystemRequest::new("q"), &trace)
            .await
            .unwrap();
        assert_eq!(out.content, "answer after facts");
        assert_eq!(out.responses.len(), 2);
        assert_eq!(trace.steps().len(), 2);
    }

    #[tokio::test]
    async fn test_parallel_captures_failures() {
        let d = dispatcher(
            SubsystemRegistry::new().with(echo("knowledge", SubsystemKind::Knowledge, "facts", 0.8)),
            0,
        );
        let trace = ExecutionTrace::new();
        let out = parallel(&d, &names(&["knowledge", "missing"]), &SubsystemRequest::new("q"), &trace)
            .await
            .unwrap();
        assert_eq!(out.responses.len(), 1);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].system, "missing");

        let none = parallel(&d, &names(&["missing", "absent"]), &SubsystemRequest::new("q"), &trace)
            .await
            .unwrap();
        assert!(none.responses.is_empty());
        assert_eq!(none.confidence, 0.0);
        let failed: Vec<&str> = none.failures.iter().map(|f| f.system.as_str()).collect();
        assert_eq!(failed, vec!["missing", "absent"]);
    }

    #[tokio::test]
    async fn test_hybrid_takes_minimum_confidence() {
        let d = dispatcher(
            SubsystemRegistry::new()
                .with(echo("knowledge", SubsystemKind::Knowledge, "facts", 0.9))
                .with(echo("reasoning", SubsystemKind::Reasoning, "answer", 0.6)),
            0,
        );
        let out = hybrid(&d, &[], &SubsystemRequest::new("q"), &ExecutionTrace::new())
            .await
            .unwrap();
        assert_eq!(out.content, "answer");
        assert_eq!(out.confidence, 0.6);
    }

    #[tokio::test]
    async fn test_consensus_majority() {
        let mut registry = SubsystemRegistry::new();
        for (i, answer) in ["Paris", "paris ", "PARIS", "Lyon", "Nice"].iter().enumerate() {
            registry.register(echo(&format!("r{}", i), SubsystemKind::Reasoning, answer, 0.5 + i as f64 * 0.1));
        }
        let d = dispatcher(registry, 0);
        let targets = names(&["r0", "r1", "r2", "r3", "r4"]);
        let out = consensus(&d, &targets, &SubsystemRequest::new("capital?"), &ExecutionTrace::new())
            .await
            .unwrap();
        assert_eq!(out.agreement, Some(0.6));
        assert_eq!(normalize_answer(&out.content), "paris");
    }

    #[tokio::test]
    async fn test_consensus_without_majority_uses_confidence() {
        let mut registry = SubsystemRegistry::new();
        registry.register(echo("a", SubsystemKind::Reasoning, "yes", 0.9));
        registry.register(echo("b", SubsystemKind::Reasoning, "no", 0.4));
        registry.register(echo("c", SubsystemKind::Reasoning, "maybe", 0.3));
        registry.register(echo("d", SubsystemKind::Reasoning, "no", 0.2));
        let d = dispatcher(registry, 0);
        let out = consensus(&d, &names(&["a", "b", "c", "d"]), &SubsystemRequest::new("q"), &ExecutionTrace::new())
            .await
            .unwrap();
        assert_eq!(out.content, "yes");
        assert_eq!(out.agreement, Some(0.25));
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let flaky = Arc::new(Flaky {
            failures_left: AtomicU32::new(1),
        });
        let d = dispatcher(SubsystemRegistry::new().with(flaky), 1);
        let trace = ExecutionTrace::new();
        let out = single(&d, "flaky", &SubsystemRequest::new("q"), &trace).await.unwrap();
        assert_eq!(out.content, "ok");
        assert_eq!(trace.calls().get("flaky"), Some(&2));

        let flaky = Arc::new(Flaky {
            failures_left: AtomicU32::new(5),
        });
        let d = dispatcher(SubsystemRegistry::new().with(flaky), 1);
        let trace = ExecutionTrace::new();
        assert!(single(&d, "flaky", &SubsystemRequest::new("q"), &trace).await.is_err());
        assert_eq!(trace.calls().get("flaky"), Some(&2));
    }

    #[test]
    fn test_targets_for_hybrid() {
        let (strategy, targets) = targets_for(RouteTarget::Hybrid);
        assert_eq!(strategy, ExecutionStrategy::Hybrid);
        assert_eq!(targets, vec!["knowledge", "reasoning"]);
    }
}
