//! Coordination service facade
//!
//! Wires the router, orchestrator, deliberation engine and synthesizer to one
//! event bus and one scheduler, and exposes the public entry points.
//!
//! ```text
//!                 ┌──────────────── CoordinationService ───────────────┐
//!   route ───────▶│ Router ◀── RequestClassifier                       │
//!   execute_task ▶│ ExecutionOrchestrator ──▶ SubsystemRegistry        │
//!   workflow ────▶│        │                   ├─ knowledge            │
//!                 │        │                   ├─ reasoning            │
//!                 │        ▼                   └─ deliberation (engine)│
//!   synthesize ──▶│ ResponseSynthesizer                                │
//!                 │                EventBus ◀── every component        │
//!                 └────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::classifier::RequestContext;
use crate::config::{ConfigError, CoordinationConfig};
use crate::deliberation::{
    DeliberationEngine, DeliberationOutcome, DeliberationStats, SharedDeliberationEngine,
    SharedParticipant,
};
use crate::events::{EventBus, EventReceiver, EventStats, SharedEventBus};
use crate::orchestrator::{
    ExecutionOrchestrator, OrchestrationError, OrchestratorStats, Task, TaskOptions, TaskResult,
};
use crate::router::{Router, RouterError, RouterStats, RoutingDecision, RoutingRecord, SharedRouter};
use crate::scheduler::Scheduler;
use crate::subsystems::{HealthSnapshot, SubsystemRegistry};
use crate::synthesizer::{
    ResponseSynthesizer, SynthesisInput, SynthesisOptions, SynthesizedResponse,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Router(#[from] RouterError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Orchestrated task plus the synthesized answer built from its responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatedResponse {
    pub task: TaskResult,
    pub synthesis: SynthesizedResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub router: RouterStats,
    pub orchestrator: OrchestratorStats,
    pub deliberation: DeliberationStats,
    pub events: EventStats,
    pub health: Vec<HealthSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHistory {
    pub routing: Vec<RoutingRecord>,
    pub tasks: Vec<Task>,
}

pub struct CoordinationService {
    config: CoordinationConfig,
    events: SharedEventBus,
    router: SharedRouter,
    orchestrator: ExecutionOrchestrator,
    deliberation: SharedDeliberationEngine,
    synthesizer: ResponseSynthesizer,
    scheduler: Arc<Scheduler>,
}

impl CoordinationService {
    /// Build every component. The deliberation engine is registered under
    /// `deliberation` unless the registry already has that name.
    pub fn new(
        config: CoordinationConfig,
        registry: SubsystemRegistry,
        participants: Vec<SharedParticipant>,
    ) -> ServiceResult<Self> {
        Self::with_scheduler(config, registry, participants, Arc::new(Scheduler::new()))
    }

    pub fn with_scheduler(
        config: CoordinationConfig,
        mut registry: SubsystemRegistry,
        participants: Vec<SharedParticipant>,
        scheduler: Arc<Scheduler>,
    ) -> ServiceResult<Self> {
        config.validate()?;

        let events = EventBus::with_capacity(
            config.events.channel_capacity,
            config.events.history_size,
        )
        .shared();
        let router = Router::new(config.router.clone())
            .with_events(events.clone())
            .shared();
        let synthesizer =
            ResponseSynthesizer::new(config.synthesizer.clone()).with_events(events.clone());
        let deliberation = DeliberationEngine::new(participants, config.deliberation.clone())
            .with_events(events.clone())
            .shared();

        if !registry.contains(crate::subsystems::DELIBERATION) {
            registry.register(deliberation.clone());
        }
        let orchestrator = ExecutionOrchestrator::new(
            config.orchestrator.clone(),
            registry.shared(),
            router.clone(),
        )
        .with_events(events.clone());

        Ok(Self {
            config,
            events,
            router,
            orchestrator,
            deliberation,
            synthesizer,
            scheduler,
        })
    }

    /// Start the router cache sweep and the orchestrator queue drain
    pub fn initialize(&self) {
        let router = self.router.clone();
        self.scheduler.spawn_periodic(
            "router-cache-sweep",
            self.config.router.cache_sweep_interval(),
            move || {
                let router = router.clone();
                async move {
                    router.sweep_cache();
                }
            },
        );
        self.orchestrator.start(&self.scheduler);
        info!(loops = self.scheduler.task_count(), "Coordination service initialized");
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        info!("Coordination service stopped");
    }

    // ── Entry points ────────────────────────────────────────────────

    pub fn route(&self, text: &str, context: &RequestContext) -> RoutingDecision {
        self.router.route(text, context)
    }

    /// Execute a task, then synthesize its responses into one answer
    pub async fn execute_task(
        &self,
        request: &str,
        options: TaskOptions,
    ) -> ServiceResult<CoordinatedResponse> {
        let task = self.orchestrator.execute_task(request, options).await?;
        let synthesis = self.synthesize_task(request, &task);
        Ok(CoordinatedResponse { task, synthesis })
    }

    pub async fn execute_workflow(
        &self,
        name: &str,
        request: &str,
        options: TaskOptions,
    ) -> ServiceResult<CoordinatedResponse> {
        let task = self
            .orchestrator
            .execute_workflow(name, request, options)
            .await?;
        let synthesis = self.synthesize_task(request, &task);
        Ok(CoordinatedResponse { task, synthesis })
    }

    pub fn synthesize(
        &self,
        inputs: &[SynthesisInput],
        options: &SynthesisOptions,
    ) -> SynthesizedResponse {
        self.synthesizer.synthesize(inputs, options)
    }

    pub async fn deliberate(&self, input: &str, context: &Map<String, Value>) -> DeliberationOutcome {
        self.deliberation.process(input, context).await
    }

    pub fn cancel_task(&self, task_id: &str) -> bool {
        self.orchestrator.cancel_task(task_id)
    }

    fn synthesize_task(&self, request: &str, task: &TaskResult) -> SynthesizedResponse {
        let inputs: Vec<SynthesisInput> = task
            .responses
            .iter()
            .cloned()
            .map(SynthesisInput::from)
            .collect();
        self.synthesizer
            .synthesize(&inputs, &SynthesisOptions::default().with_query(request))
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn router(&self) -> &SharedRouter {
        &self.router
    }

    pub fn orchestrator(&self) -> &ExecutionOrchestrator {
        &self.orchestrator
    }

    pub fn deliberation(&self) -> &SharedDeliberationEngine {
        &self.deliberation
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn get_stats(&self) -> ServiceStats {
        ServiceStats {
            router: self.router.stats(),
            orchestrator: self.orchestrator.get_stats(),
            deliberation: self.deliberation.stats(),
            events: self.events.history().stats(),
            health: self.orchestrator.health().snapshot(),
        }
    }

    pub fn get_history(&self, limit: usize) -> ServiceHistory {
        ServiceHistory {
            routing: self.router.history(limit),
            tasks: self.orchestrator.get_history(limit),
        }
    }
}
