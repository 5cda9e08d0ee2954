//! Integration tests for the ExecutionOrchestrator
//!
//! Strategies, workflows, cancellation and circuit breaking run end-to-end
//! against in-process subsystems.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{broken, default_registry, StubSubsystem};
use meridian_coordination::subsystems::{ReasoningInput, ReasoningOptions, ReasoningOutput};
use meridian_coordination::{
    EventBus, ExecutionOrchestrator, ExecutionStrategy, OrchestrationError, OrchestratorConfig,
    ReasoningEngine, ReasoningSubsystem, Router, RouterConfig, SubsystemError, SubsystemKind,
    SubsystemRegistry, SubsystemResult, TaskOptions, TaskStatus, WorkflowDefinition, WorkflowStep,
};
use mockall::mock;

fn orchestrator(registry: SubsystemRegistry, config: OrchestratorConfig) -> ExecutionOrchestrator {
    ExecutionOrchestrator::new(
        config,
        registry.shared(),
        Router::new(RouterConfig::default()).shared(),
    )
}

fn consensus_registry() -> SubsystemRegistry {
    let mut registry = SubsystemRegistry::new();
    for (i, answer) in ["Paris", "paris", " PARIS ", "Lyon", "Marseille"]
        .iter()
        .enumerate()
    {
        registry.register(StubSubsystem::new(
            &format!("backend-{}", i),
            SubsystemKind::Reasoning,
            answer,
            0.6 + i as f64 * 0.05,
        ));
    }
    registry
}

#[tokio::test]
async fn test_consensus_three_of_five_agree() {
    let orch = orchestrator(consensus_registry(), OrchestratorConfig::default());
    let result = orch
        .execute_task(
            "What is the capital of France?",
            TaskOptions::default().with_strategy(ExecutionStrategy::Consensus),
        )
        .await
        .unwrap();

    assert_eq!(result.strategy, ExecutionStrategy::Consensus);
    assert_eq!(result.agreement, Some(0.6));
    assert_eq!(result.content.trim().to_lowercase(), "paris");
    assert_eq!(result.successes, 5);
    assert!(result.failures.is_empty());
    assert!(result.decision.is_none());
}

#[tokio::test]
async fn test_consensus_uses_configured_targets() {
    let config = OrchestratorConfig {
        consensus_targets: vec![
            "backend-0".to_string(),
            "backend-3".to_string(),
            "backend-4".to_string(),
        ],
        ..Default::default()
    };
    let orch = orchestrator(consensus_registry(), config);
    let result = orch
        .execute_task(
            "capital?",
            TaskOptions::default().with_strategy(ExecutionStrategy::Consensus),
        )
        .await
        .unwrap();

    // Three different answers: no majority, the most confident one wins
    assert_eq!(result.content, "Marseille");
    let agreement = result.agreement.unwrap();
    assert!((agreement - 1.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_parallel_partial_failure_is_reported() {
    let mut registry = default_registry();
    registry.register(broken("flaky"));
    let orch = orchestrator(registry, OrchestratorConfig::default());

    let result = orch
        .execute_task(
            "boiling point",
            TaskOptions::default()
                .with_strategy(ExecutionStrategy::Parallel)
                .with_targets(["knowledge", "reasoning", "flaky"]),
        )
        .await
        .unwrap();

    assert_eq!(result.successes, 2);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].system, "flaky");
    assert!((result.confidence - 0.85).abs() < 1e-9);
    assert_eq!(result.steps.len(), 3);
}

#[tokio::test]
async fn test_workflow_fails_at_second_of_four_steps() {
    let mut registry = default_registry();
    registry.register(broken("auditor"));
    let orch = orchestrator(registry, OrchestratorConfig::default());
    orch.register_workflow(WorkflowDefinition::new(
        "audit",
        "Four step audit",
        vec![
            WorkflowStep::invoke("gather", &["knowledge"]),
            WorkflowStep::invoke("audit", &["auditor"]),
            WorkflowStep::invoke("reason", &["reasoning"]),
            WorkflowStep::invoke("confirm", &["knowledge"]),
        ],
    ))
    .await
    .unwrap();

    let err = orch
        .execute_workflow("audit", "check the ledger", TaskOptions::default())
        .await
        .unwrap_err();
    match err {
        OrchestrationError::WorkflowStepFailure {
            workflow,
            step,
            index,
            ..
        } => {
            assert_eq!(workflow, "audit");
            assert_eq!(step, "audit");
            assert_eq!(index, 1);
        }
        other => panic!("unexpected error: {other}"),
    }

    let task = orch.get_history(1).pop().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.steps.len(), 2);
    assert!(task.steps[0].success);
    assert!(!task.steps[1].success);
    assert!(task.error.is_some());
}

#[tokio::test]
async fn test_adaptive_workflow_routes_then_executes() {
    let orch = orchestrator(default_registry(), OrchestratorConfig::default());
    let result = orch
        .execute_workflow(
            "adaptive",
            "What is the boiling point of water?",
            TaskOptions::default(),
        )
        .await
        .unwrap();

    let decision = result.decision.unwrap();
    assert_eq!(decision.rule_matched.as_deref(), Some("factual_lookup"));
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.steps[1].targets, vec!["knowledge"]);
    assert_eq!(
        result.content,
        "Water boils at 100 degrees Celsius at sea level."
    );
}

#[tokio::test]
async fn test_workflows_from_yaml() {
    let orch = orchestrator(default_registry(), OrchestratorConfig::default());
    let loaded = orch
        .load_workflows_yaml(
            r#"
workflows:
  - name: double_check
    steps:
      - name: first
        type: invoke
        targets: [reasoning]
      - name: second
        type: invoke
        targets: [knowledge, reasoning]
        parallel: true
"#,
        )
        .await
        .unwrap();
    assert_eq!(loaded, 1);
    assert!(orch.list_workflows().await.contains(&"double_check".to_string()));

    let result = orch
        .execute_workflow("double_check", "q", TaskOptions::default())
        .await
        .unwrap();
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.responses.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_workflow_deadline() {
    let registry = SubsystemRegistry::new().with(StubSubsystem::slow(
        "knowledge",
        SubsystemKind::Knowledge,
        Duration::from_secs(10),
    ));
    let orch = orchestrator(registry, OrchestratorConfig::default());
    orch.register_workflow(
        WorkflowDefinition::new("slow", "", vec![WorkflowStep::invoke("fetch", &["knowledge"])])
            .with_timeout_ms(500),
    )
    .await
    .unwrap();

    let err = orch
        .execute_workflow("slow", "q", TaskOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestrationError::WorkflowTimeout { timeout_ms: 500, .. }
    ));
    assert_eq!(orch.get_history(1)[0].status, TaskStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_publishes_event() {
    let bus = EventBus::new().shared();
    let registry = SubsystemRegistry::new().with(StubSubsystem::slow(
        "reasoning",
        SubsystemKind::Reasoning,
        Duration::from_secs(30),
    ));
    let orch = orchestrator(registry, OrchestratorConfig::default()).with_events(bus.clone());

    let handle = tokio::spawn({
        let orch = orch.clone();
        async move {
            orch.execute_task("think", TaskOptions::default().with_targets(["reasoning"]))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    let active = orch.active_tasks();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].status, TaskStatus::Running);
    assert!(orch.cancel_task(&active[0].id));

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, OrchestrationError::Cancelled(_)));
    assert!(orch.active_tasks().is_empty());
    assert_eq!(bus.history().of_type("task_cancelled", 10).len(), 1);
    assert_eq!(bus.history().of_type("task_started", 10).len(), 1);
    assert!(bus.history().of_type("task_completed", 10).is_empty());
}

#[tokio::test]
async fn test_queue_full_rejects() {
    let config = OrchestratorConfig {
        max_concurrent_tasks: 1,
        max_queue_size: 0,
        ..Default::default()
    };
    let registry = SubsystemRegistry::new().with(StubSubsystem::slow(
        "reasoning",
        SubsystemKind::Reasoning,
        Duration::from_millis(200),
    ));
    let orch = orchestrator(registry, config);

    let first = tokio::spawn({
        let orch = orch.clone();
        async move {
            orch.execute_task("one", TaskOptions::default().with_targets(["reasoning"]))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = orch
        .execute_task("two", TaskOptions::default().with_targets(["reasoning"]))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::QueueFull { capacity: 0 }));
    assert!(err.is_retriable());
    assert!(first.await.unwrap().is_ok());
}

mock! {
    pub Engine {}

    #[async_trait]
    impl ReasoningEngine for Engine {
        async fn process(
            &self,
            input: &ReasoningInput,
            options: &ReasoningOptions,
        ) -> SubsystemResult<ReasoningOutput>;
    }
}

#[tokio::test]
async fn test_open_circuit_skips_calls() {
    let mut engine = MockEngine::new();
    engine
        .expect_process()
        .times(2)
        .returning(|_, _| Err(SubsystemError::failed("reasoning", "overloaded")));

    let registry = SubsystemRegistry::new().with(Arc::new(ReasoningSubsystem::new(
        "reasoning",
        Arc::new(engine),
    )));
    let config = OrchestratorConfig {
        failure_threshold: 2,
        ..Default::default()
    };
    let orch = orchestrator(registry, config);

    for _ in 0..2 {
        let err = orch
            .execute_task("q", TaskOptions::default().with_targets(["reasoning"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::Subsystem(SubsystemError::Failed { .. })
        ));
    }

    let err = orch
        .execute_task("q", TaskOptions::default().with_targets(["reasoning"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestrationError::Subsystem(SubsystemError::Unavailable(_))
    ));
    assert!(!err.is_retriable());

    let stats = orch.get_stats();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.subsystem_calls.get("reasoning"), Some(&2));
}

#[tokio::test]
async fn test_retry_recovers_from_one_failure() {
    let mut engine = MockEngine::new();
    let mut seq = mockall::Sequence::new();
    engine
        .expect_process()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Err(SubsystemError::failed("reasoning", "blip")));
    engine
        .expect_process()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|input, _| {
            Ok(ReasoningOutput {
                response: format!("answer to {}", input.text),
                confidence: 0.7,
                ..Default::default()
            })
        });

    let registry = SubsystemRegistry::new().with(Arc::new(ReasoningSubsystem::new(
        "reasoning",
        Arc::new(engine),
    )));
    let config = OrchestratorConfig {
        call_retries: 1,
        ..Default::default()
    };
    let orch = orchestrator(registry, config);

    let result = orch
        .execute_task("q", TaskOptions::default().with_targets(["reasoning"]))
        .await
        .unwrap();
    assert_eq!(result.content, "answer to q");
    assert_eq!(orch.get_stats().subsystem_calls.get("reasoning"), Some(&2));
}
