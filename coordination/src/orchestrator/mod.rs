//! Execution orchestrator
//!
//! Runs tasks against the registered subsystems under a named strategy or a
//! named workflow, and owns every task from admission to its terminal state.
//!
//! ```text
//! execute_task ──▶ resolve targets ──▶ admission ──┬─ permit ──────────┐
//!   (router when      (strategy,        (limit +    └─ queue ─▶ drain ─┤
//!    none given)       targets)          FIFO)                         ▼
//!                                              spawn work ◀── select ──┬─ cancel token
//!                                                   │                  └─ deadline
//!                                                   ▼
//!                               completed | failed | cancelled ──▶ history, stats, events
//! ```
//!
//! Work runs on a spawned tokio task. Cancellation, an expired deadline or
//! a caller that stops waiting all abort that task and raise its stop
//! signal, so no further step or call is started. A subsystem call already
//! in flight finishes on its own and its result is dropped.

pub mod admission;
pub mod stats;
pub mod strategy;
pub mod task;
pub mod workflow;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::events::{CoordinationEvent, SharedEventBus};
use crate::router::{RoutingDecision, SharedRouter};
use crate::scheduler::Scheduler;
use crate::subsystems::{SharedRegistry, SubsystemError, SubsystemHealth, SubsystemRequest};

use admission::{Admission, Ticket};
use stats::StatsRecorder;
use strategy::{targets_for, Dispatcher, ExecutionTrace, StrategyOutcome};

pub use stats::OrchestratorStats;
pub use strategy::normalize_answer;
pub use task::{
    CallFailure, ExecutionStrategy, StepRecord, Task, TaskId, TaskOptions, TaskResult, TaskStatus,
};
pub use workflow::{
    builtin_workflows, StepAction, WorkflowCatalog, WorkflowDefinition, WorkflowStep,
};

/// Errors from orchestration entry points
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Subsystem(#[from] SubsystemError),

    #[error("Workflow '{workflow}' failed at step {index} ({step}): {message}")]
    WorkflowStepFailure {
        workflow: String,
        step: String,
        index: usize,
        message: String,
    },

    #[error("Workflow '{workflow}' exceeded its {timeout_ms}ms deadline")]
    WorkflowTimeout { workflow: String, timeout_ms: u64 },

    #[error("Task {task_id} exceeded its {timeout_ms}ms deadline")]
    TaskTimeout { task_id: TaskId, timeout_ms: u64 },

    #[error("Task {0} was cancelled")]
    Cancelled(TaskId),

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Workflow already registered: {0}")]
    DuplicateWorkflow(String),

    #[error("Invalid workflow '{name}': {reason}")]
    InvalidWorkflow { name: String, reason: String },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Task queue is full ({capacity} waiting)")]
    QueueFull { capacity: usize },

    #[error("All {} subsystem calls failed", failures.len())]
    NoResults { failures: Vec<CallFailure> },
}

impl OrchestrationError {
    /// Whether submitting the same work again could succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Subsystem(e) => e.is_retriable(),
            Self::TaskTimeout { .. } | Self::WorkflowTimeout { .. } | Self::QueueFull { .. } => true,
            Self::NoResults { .. } => true,
            _ => false,
        }
    }
}

/// Result type for orchestration
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

struct ActiveTask {
    task: Task,
    cancel: CancellationToken,
}

/// Cancels a task that is still active when its caller goes away
struct ActiveGuard<'a> {
    orchestrator: &'a ExecutionOrchestrator,
    task_id: TaskId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if self.orchestrator.cancel_task(&self.task_id) {
            warn!(task_id = %self.task_id, "Caller stopped waiting, task cancelled");
        }
    }
}

/// Stops the spawned work of a task on every exit path
struct WorkGuard {
    abort: AbortHandle,
    stop: CancellationToken,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.stop.cancel();
        self.abort.abort();
    }
}

/// What a run hands back to the bookkeeping code
struct RunOutput {
    outcome: StrategyOutcome,
    decision: Option<RoutingDecision>,
}

struct Inner {
    config: OrchestratorConfig,
    dispatcher: Dispatcher,
    router: SharedRouter,
    admission: Arc<Admission>,
    workflows: RwLock<BTreeMap<String, workflow::WorkflowDefinition>>,
    active: Mutex<HashMap<TaskId, ActiveTask>>,
    history: Mutex<VecDeque<Task>>,
    stats: StatsRecorder,
    events: OnceLock<SharedEventBus>,
}

/// Cheaply cloneable handle; clones share all state
#[derive(Clone)]
pub struct ExecutionOrchestrator {
    inner: Arc<Inner>,
}

impl ExecutionOrchestrator {
    pub fn new(config: OrchestratorConfig, registry: SharedRegistry, router: SharedRouter) -> Self {
        let health = Arc::new(SubsystemHealth::new(
            config.failure_threshold,
            Duration::from_secs(config.cooldown_secs),
        ));
        Self::with_health(config, registry, router, health)
    }

    pub fn with_health(
        config: OrchestratorConfig,
        registry: SharedRegistry,
        router: SharedRouter,
        health: Arc<SubsystemHealth>,
    ) -> Self {
        let dispatcher = Dispatcher::new(registry, health, config.call_timeout(), config.call_retries);
        let workflows = builtin_workflows()
            .into_iter()
            .map(|w| (w.name.clone(), w))
            .collect();
        Self {
            inner: Arc::new(Inner {
                admission: Admission::new(config.max_concurrent_tasks, config.max_queue_size),
                config,
                dispatcher,
                router,
                workflows: RwLock::new(workflows),
                active: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                stats: StatsRecorder::new(),
                events: OnceLock::new(),
            }),
        }
    }

    pub fn with_events(self, bus: SharedEventBus) -> Self {
        if self.inner.events.set(bus).is_err() {
            warn!("Event bus already attached to orchestrator");
        }
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn health(&self) -> &Arc<SubsystemHealth> {
        self.inner.dispatcher.health()
    }

    /// Drain the overflow queue every `queue_poll_interval`
    pub fn start(&self, scheduler: &Scheduler) {
        let orchestrator = self.clone();
        scheduler.spawn_periodic(
            "orchestrator-queue-drain",
            self.inner.config.queue_poll_interval(),
            move || {
                let orchestrator = orchestrator.clone();
                async move {
                    orchestrator.drain_queue();
                }
            },
        );
    }

    /// Admit queued tasks into free slots
    pub fn drain_queue(&self) -> usize {
        let admitted = self.inner.admission.drain();
        if admitted > 0 {
            debug!(admitted, "Drained task queue");
        }
        admitted
    }

    // ── Entry points ────────────────────────────────────────────────

    /// Run `request` under a strategy.
    ///
    /// With no targets the request is routed first; a hybrid decision runs
    /// knowledge then reasoning with the hybrid strategy.
    pub async fn execute_task(
        &self,
        request: &str,
        options: TaskOptions,
    ) -> OrchestrationResult<TaskResult> {
        let (strategy, targets, decision) = self.resolve(request, &options);
        let mut task = Task::new(request, strategy);
        task.targets = targets.clone();
        task.context = options.context.clone();

        let deadline = options
            .timeout()
            .unwrap_or_else(|| self.inner.config.default_task_timeout());
        let timeout_error = OrchestrationError::TaskTimeout {
            task_id: task.id.clone(),
            timeout_ms: deadline.as_millis() as u64,
        };

        let dispatcher = self.inner.dispatcher.clone();
        let subsystem_request =
            SubsystemRequest::new(request).with_context(options.context.clone());
        self.run_tracked(task, deadline, timeout_error, move |trace| async move {
            let outcome =
                strategy::run(&dispatcher, strategy, &targets, &subsystem_request, &trace).await?;
            if outcome.responses.is_empty() {
                return Err(OrchestrationError::NoResults {
                    failures: outcome.failures,
                });
            }
            Ok(RunOutput { outcome, decision })
        })
        .await
    }

    /// Run a registered workflow
    pub async fn execute_workflow(
        &self,
        name: &str,
        request: &str,
        options: TaskOptions,
    ) -> OrchestrationResult<TaskResult> {
        let definition = self
            .inner
            .workflows
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestrationError::UnknownWorkflow(name.to_string()))?;

        let mut task = Task::new(request, ExecutionStrategy::Sequential);
        task.workflow = Some(definition.name.clone());
        task.context = options.context.clone();

        let workflow_deadline = Duration::from_millis(definition.timeout_ms);
        let (deadline, timeout_error) = match options.timeout() {
            Some(limit) if limit < workflow_deadline => (
                limit,
                OrchestrationError::TaskTimeout {
                    task_id: task.id.clone(),
                    timeout_ms: limit.as_millis() as u64,
                },
            ),
            _ => (
                workflow_deadline,
                OrchestrationError::WorkflowTimeout {
                    workflow: definition.name.clone(),
                    timeout_ms: definition.timeout_ms,
                },
            ),
        };

        let dispatcher = self.inner.dispatcher.clone();
        let router = self.inner.router.clone();
        let subsystem_request =
            SubsystemRequest::new(request).with_context(options.context.clone());
        self.run_tracked(task, deadline, timeout_error, move |trace| async move {
            let output =
                workflow::run_workflow(&dispatcher, &router, &definition, &subsystem_request, &trace)
                    .await?;
            Ok(RunOutput {
                outcome: output.outcome,
                decision: output.decision,
            })
        })
        .await
    }

    /// Cancel an active or queued task. Returns false if the task is
    /// unknown or already finished.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let entry = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
        let Some(ActiveTask { mut task, cancel }) = entry else {
            return false;
        };
        cancel.cancel();
        self.inner.admission.cancel_queued(task_id);

        if let Err(e) = task.transition(TaskStatus::Cancelled) {
            warn!(task_id, error = %e, "Cancelled task had an unexpected status");
        }
        info!(task_id, "Task cancelled");
        self.publish(CoordinationEvent::TaskCancelled {
            task_id: task.id.clone(),
            timestamp: Utc::now(),
        });
        self.finish(task, &BTreeMap::new());
        true
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Admit, run under deadline and cancellation, then record the outcome.
    ///
    /// Whoever removes the task from the active map records it: this path
    /// on completion, or `cancel_task` on cancellation. Dropping the
    /// returned future cancels the task.
    async fn run_tracked<F, Fut>(
        &self,
        task: Task,
        deadline: Duration,
        timeout_error: OrchestrationError,
        work: F,
    ) -> OrchestrationResult<TaskResult>
    where
        F: FnOnce(Arc<ExecutionTrace>) -> Fut,
        Fut: Future<Output = OrchestrationResult<RunOutput>> + Send + 'static,
    {
        let task_id = task.id.clone();
        let cancel = CancellationToken::new();
        let ticket = self.inner.admission.try_admit(&task_id)?;

        self.inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                task_id.clone(),
                ActiveTask {
                    task,
                    cancel: cancel.clone(),
                },
            );
        let _active = ActiveGuard {
            orchestrator: self,
            task_id: task_id.clone(),
        };

        let _permit = match ticket {
            Ticket::Ready(permit) => permit,
            Ticket::Queued(rx) => {
                debug!(task_id = %task_id, "Waiting for a free slot");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(OrchestrationError::Cancelled(task_id)),
                    permit = rx => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            let e = OrchestrationError::InvalidTask("admission queue closed".to_string());
                            self.fail_before_start(&task_id, &e);
                            return Err(e);
                        }
                    },
                }
            }
        };

        let Some((strategy, targets)) = self.start_running(&task_id)? else {
            return Err(OrchestrationError::Cancelled(task_id));
        };
        self.publish(CoordinationEvent::TaskStarted {
            task_id: task_id.clone(),
            strategy,
            targets,
            timestamp: Utc::now(),
        });

        let stop = cancel.child_token();
        let trace = Arc::new(ExecutionTrace::with_stop(stop.clone()));
        let handle = tokio::spawn(work(trace.clone()));
        let work_guard = WorkGuard {
            abort: handle.abort_handle(),
            stop,
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestrationError::Cancelled(task_id)),
            joined = tokio::time::timeout(deadline, handle) => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(OrchestrationError::InvalidTask(format!(
                    "task execution aborted: {}",
                    join_error
                ))),
                Err(_) => {
                    warn!(task_id = %task_id, deadline_ms = deadline.as_millis() as u64, "Task deadline exceeded");
                    Err(timeout_error)
                }
            },
        };
        drop(work_guard);

        let entry = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
        let Some(ActiveTask { mut task, .. }) = entry else {
            // Cancelled after the work finished but before we got here.
            return Err(OrchestrationError::Cancelled(task_id));
        };

        task.steps = trace.steps();
        let calls = trace.calls();
        match result {
            Ok(output) => {
                for response in &output.outcome.responses {
                    task.results
                        .insert(response.subsystem.clone(), response.clone());
                }
                task.transition(TaskStatus::Completed)?;
                let task_result = TaskResult {
                    task_id: task.id.clone(),
                    status: task.status,
                    strategy: task.strategy,
                    workflow: task.workflow.clone(),
                    content: output.outcome.content,
                    confidence: output.outcome.confidence,
                    successes: output.outcome.responses.len(),
                    responses: output.outcome.responses,
                    failures: output.outcome.failures,
                    agreement: output.outcome.agreement,
                    decision: output.decision,
                    steps: task.steps.clone(),
                    duration_ms: task.duration_ms(),
                };
                info!(
                    task_id = %task.id,
                    strategy = %task.strategy,
                    confidence = task_result.confidence,
                    duration_ms = task_result.duration_ms,
                    "Task completed"
                );
                self.publish(CoordinationEvent::TaskCompleted {
                    task_id: task.id.clone(),
                    strategy: task.strategy,
                    duration_ms: task_result.duration_ms,
                    confidence: task_result.confidence,
                    timestamp: Utc::now(),
                });
                self.finish(task, &calls);
                Ok(task_result)
            }
            Err(e) => {
                task.error = Some(e.to_string());
                task.transition(TaskStatus::Failed)?;
                error!(task_id = %task.id, error = %e, "Task failed");
                self.publish(CoordinationEvent::TaskFailed {
                    task_id: task.id.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                self.finish(task, &calls);
                Err(e)
            }
        }
    }

    /// Move an admitted task to running; `None` if it was cancelled meanwhile
    fn start_running(
        &self,
        task_id: &str,
    ) -> OrchestrationResult<Option<(ExecutionStrategy, Vec<String>)>> {
        let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = active.get_mut(task_id) else {
            return Ok(None);
        };
        entry.task.transition(TaskStatus::Running)?;
        Ok(Some((entry.task.strategy, entry.task.targets.clone())))
    }

    fn fail_before_start(&self, task_id: &str, e: &OrchestrationError) {
        let entry = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
        if let Some(ActiveTask { mut task, .. }) = entry {
            task.error = Some(e.to_string());
            if task.transition(TaskStatus::Failed).is_ok() {
                self.finish(task, &BTreeMap::new());
            }
        }
    }

    /// Record a terminal task in history and stats
    fn finish(&self, task: Task, calls: &BTreeMap<String, u64>) {
        self.inner.stats.record_terminal(&task, calls);

        if let Some(workflow) = &task.workflow {
            self.publish(CoordinationEvent::WorkflowCompleted {
                task_id: task.id.clone(),
                workflow: workflow.clone(),
                status: task.status,
                steps_completed: task.steps.iter().filter(|s| s.success).count(),
                timestamp: Utc::now(),
            });
        }

        let mut history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() >= self.inner.config.history_size.max(1) {
            history.pop_front();
        }
        history.push_back(task);
    }

    fn publish(&self, event: CoordinationEvent) {
        if let Some(bus) = self.inner.events.get() {
            bus.publish(event);
        }
    }

    /// Strategy, targets and (when routed) the routing decision for a request
    fn resolve(
        &self,
        request: &str,
        options: &TaskOptions,
    ) -> (ExecutionStrategy, Vec<String>, Option<RoutingDecision>) {
        if !options.targets.is_empty() {
            let strategy = options
                .strategy
                .unwrap_or(self.inner.config.default_strategy);
            return (strategy, options.targets.clone(), None);
        }
        if options.strategy == Some(ExecutionStrategy::Consensus) {
            let targets = if self.inner.config.consensus_targets.is_empty() {
                self.inner.dispatcher.registry().names()
            } else {
                self.inner.config.consensus_targets.clone()
            };
            return (ExecutionStrategy::Consensus, targets, None);
        }

        let decision = self.inner.router.route(request, &options.context);
        let (routed_strategy, targets) = targets_for(decision.target);
        let strategy = options.strategy.unwrap_or(routed_strategy);
        debug!(target = %decision.target, strategy = %strategy, "Targets derived from routing");
        (strategy, targets, Some(decision))
    }

    // ── Workflows ───────────────────────────────────────────────────

    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> OrchestrationResult<()> {
        definition.validate()?;
        let mut workflows = self.inner.workflows.write().await;
        if workflows.contains_key(&definition.name) {
            return Err(OrchestrationError::DuplicateWorkflow(definition.name));
        }
        info!(workflow = %definition.name, steps = definition.steps.len(), "Workflow registered");
        workflows.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Register every workflow of a YAML catalog. Nothing is registered if
    /// any name is already taken.
    pub async fn load_workflows_yaml(&self, yaml: &str) -> OrchestrationResult<usize> {
        let catalog = WorkflowCatalog::from_yaml_str(yaml)?;
        let mut workflows = self.inner.workflows.write().await;
        let mut seen = std::collections::HashSet::new();
        for definition in &catalog.workflows {
            if workflows.contains_key(&definition.name) || !seen.insert(definition.name.as_str()) {
                return Err(OrchestrationError::DuplicateWorkflow(definition.name.clone()));
            }
        }
        let count = catalog.workflows.len();
        for definition in catalog.workflows {
            workflows.insert(definition.name.clone(), definition);
        }
        Ok(count)
    }

    pub async fn list_workflows(&self) -> Vec<String> {
        self.inner.workflows.read().await.keys().cloned().collect()
    }

    pub async fn get_workflow(&self, name: &str) -> Option<WorkflowDefinition> {
        self.inner.workflows.read().await.get(name).cloned()
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Snapshot of tasks that have not finished, oldest first
    pub fn active_tasks(&self) -> Vec<Task> {
        let active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        let mut tasks: Vec<Task> = active.values().map(|a| a.task.clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn queued_len(&self) -> usize {
        self.inner.admission.queued()
    }

    /// Most recent finished tasks, newest last
    pub fn get_history(&self, limit: usize) -> Vec<Task> {
        let history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn get_stats(&self) -> OrchestratorStats {
        let admission = &self.inner.admission;
        self.inner
            .stats
            .snapshot(admission.running(), admission.queued(), admission.peak())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::router::Router;
    use crate::subsystems::{
        Subsystem, SubsystemKind, SubsystemRegistry, SubsystemResponse, SubsystemResult,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        kind: SubsystemKind,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, kind: SubsystemKind, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                kind,
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Subsystem for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> SubsystemKind {
            self.kind
        }

        async fn invoke(&self, request: &SubsystemRequest) -> SubsystemResult<SubsystemResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(SubsystemResponse::new(
                self.name,
                self.kind,
                format!("{} answer to {}", self.name, request.text),
                0.8,
            ))
        }
    }

    fn orchestrator(delay: Duration, config: OrchestratorConfig) -> ExecutionOrchestrator {
        counted(delay, config).0
    }

    /// Orchestrator plus its knowledge and reasoning subsystems
    fn counted(
        delay: Duration,
        config: OrchestratorConfig,
    ) -> (ExecutionOrchestrator, Arc<Fixed>, Arc<Fixed>) {
        let knowledge = Fixed::new("knowledge", SubsystemKind::Knowledge, delay);
        let reasoning = Fixed::new("reasoning", SubsystemKind::Reasoning, delay);
        let registry = SubsystemRegistry::new()
            .with(knowledge.clone())
            .with(reasoning.clone());
        let orchestrator = ExecutionOrchestrator::new(
            config,
            registry.shared(),
            Router::new(RouterConfig::default()).shared(),
        );
        (orchestrator, knowledge, reasoning)
    }

    #[tokio::test]
    async fn test_single_task_completes() {
        let orch = orchestrator(Duration::ZERO, OrchestratorConfig::default());
        let result = orch
            .execute_task("hello", TaskOptions::default().with_targets(["reasoning"]))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.content, "reasoning answer to hello");
        assert_eq!(result.steps.len(), 1);

        let stats = orch.get_stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.subsystem_calls.get("reasoning"), Some(&1));
        assert!(orch.active_tasks().is_empty());
        assert_eq!(orch.get_history(10).len(), 1);
    }

    #[tokio::test]
    async fn test_routed_task_records_decision() {
        let orch = orchestrator(Duration::ZERO, OrchestratorConfig::default());
        let result = orch
            .execute_task("What is the capital of France?", TaskOptions::default())
            .await
            .unwrap();
        let decision = result.decision.unwrap();
        assert!(!result.responses.is_empty());
        assert_eq!(result.strategy, targets_for(decision.target).0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_marks_failed() {
        let orch = orchestrator(Duration::from_secs(10), OrchestratorConfig::default());
        let err = orch
            .execute_task(
                "slow",
                TaskOptions::default()
                    .with_targets(["reasoning"])
                    .with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::TaskTimeout { timeout_ms: 100, .. }));
        assert!(err.is_retriable());
        let history = orch.get_history(1);
        assert_eq!(history[0].status, TaskStatus::Failed);
        assert_eq!(orch.get_stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_task() {
        let orch = orchestrator(Duration::from_secs(10), OrchestratorConfig::default());
        let runner = orch.clone();
        let handle = tokio::spawn(async move {
            runner
                .execute_task("slow", TaskOptions::default().with_targets(["knowledge"]))
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = orch.active_tasks()[0].id.clone();
        assert!(orch.cancel_task(&id));
        assert!(!orch.cancel_task(&id));

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, OrchestrationError::Cancelled(_)));
        let history = orch.get_history(1);
        assert_eq!(history[0].status, TaskStatus::Cancelled);
        assert_eq!(orch.get_stats().cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_remaining_workflow_steps() {
        let (orch, knowledge, reasoning) =
            counted(Duration::from_millis(100), OrchestratorConfig::default());
        let err = orch
            .execute_workflow(
                "research",
                "rust",
                TaskOptions::default().with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::TaskTimeout { timeout_ms: 50, .. }));
        assert_eq!(knowledge.calls(), 1);
        assert_eq!(reasoning.calls(), 0);

        // the in-flight knowledge call settles; the reasoning step never starts
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(knowledge.calls(), 1);
        assert_eq!(reasoning.calls(), 0);
        assert_eq!(orch.get_history(1)[0].status, TaskStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_remaining_workflow_steps() {
        let (orch, knowledge, reasoning) =
            counted(Duration::from_millis(100), OrchestratorConfig::default());
        let runner = orch.clone();
        let handle = tokio::spawn(async move {
            runner
                .execute_workflow("research", "rust", TaskOptions::default())
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = orch.active_tasks()[0].id.clone();
        assert!(orch.cancel_task(&id));
        assert!(matches!(
            handle.await.unwrap(),
            Err(OrchestrationError::Cancelled(_))
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(knowledge.calls(), 1);
        assert_eq!(reasoning.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_cancels_task() {
        let orch = orchestrator(Duration::from_secs(10), OrchestratorConfig::default());
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            orch.execute_task("slow", TaskOptions::default().with_targets(["knowledge"])),
        )
        .await;
        assert!(abandoned.is_err());

        assert!(orch.active_tasks().is_empty());
        let history = orch.get_history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TaskStatus::Cancelled);
        let stats = orch.get_stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.running, 0);
    }

    #[tokio::test]
    async fn test_parallel_with_no_successes_reports_failures() {
        let orch = orchestrator(Duration::ZERO, OrchestratorConfig::default());
        let err = orch
            .execute_task(
                "q",
                TaskOptions::default()
                    .with_strategy(ExecutionStrategy::Parallel)
                    .with_targets(["missing", "absent"]),
            )
            .await
            .unwrap_err();
        let OrchestrationError::NoResults { failures } = err else {
            panic!("expected NoResults, got {:?}", err);
        };
        assert_eq!(failures.len(), 2);

        let history = orch.get_history(1);
        assert_eq!(history[0].status, TaskStatus::Failed);
        assert_eq!(history[0].steps.len(), 2);
        assert!(history[0].steps.iter().all(|step| !step.success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_waits_for_drain() {
        let config = OrchestratorConfig {
            max_concurrent_tasks: 1,
            ..Default::default()
        };
        let orch = orchestrator(Duration::from_millis(50), config);
        let scheduler = Scheduler::new();
        orch.start(&scheduler);

        let first = tokio::spawn({
            let orch = orch.clone();
            async move {
                orch.execute_task("one", TaskOptions::default().with_targets(["knowledge"]))
                    .await
            }
        });
        let second = tokio::spawn({
            let orch = orch.clone();
            async move {
                orch.execute_task("two", TaskOptions::default().with_targets(["knowledge"]))
                    .await
            }
        });

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        let stats = orch.get_stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.peak_concurrency, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let orch = orchestrator(Duration::ZERO, OrchestratorConfig::default());
        let err = orch
            .execute_workflow("nope", "hi", TaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::UnknownWorkflow(_)));
        assert_eq!(orch.list_workflows().await.len(), 4);
    }

    #[tokio::test]
    async fn test_research_workflow_chains() {
        let orch = orchestrator(Duration::ZERO, OrchestratorConfig::default());
        let result = orch
            .execute_workflow("research", "rust", TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(result.workflow.as_deref(), Some("research"));
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.content, "reasoning answer to rust");
    }

    #[tokio::test]
    async fn test_duplicate_workflow_rejected() {
        let orch = orchestrator(Duration::ZERO, OrchestratorConfig::default());
        let err = orch
            .register_workflow(WorkflowDefinition::new(
                "research",
                "",
                vec![WorkflowStep::invoke("a", &["knowledge"])],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::DuplicateWorkflow(_)));
    }
}
