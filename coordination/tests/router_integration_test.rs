//! Integration tests for routing: rule packs, fallback and the decision cache

use std::sync::Arc;
use std::time::Duration;

use meridian_coordination::{
    EventBus, ManualClock, RequestClassifier, RequestContext, RouteTarget, Router, RouterConfig,
    RoutingRule,
};
use serde_json::json;

const PACK: &str = r#"
rules:
  - id: incident_triage
    description: Production incidents need several roles
    target: deliberation
    base_confidence: 0.9
    patterns:
      - "(?i)\\b(outage|incident|sev[0-9])\\b"
  - id: glossary
    target: knowledge
    base_confidence: 0.7
    patterns:
      - "(?i)\\bglossary\\b"
"#;

#[test]
fn test_rule_pack_extends_table() {
    let router = Router::new(RouterConfig::default());
    assert_eq!(router.load_rule_pack(PACK).unwrap(), 2);
    assert_eq!(router.list_rules().len(), 9);
    assert_eq!(router.list_rules()[7], "incident_triage");

    let decision = router.route("We had an outage last night", &RequestContext::new());
    assert_eq!(decision.target, RouteTarget::Deliberation);
    assert_eq!(decision.rule_matched.as_deref(), Some("incident_triage"));
    assert!(router.known_targets().contains(&RouteTarget::Deliberation));
}

#[test]
fn test_invalid_pattern_rejected() {
    let router = Router::new(RouterConfig::default());
    let err = router
        .load_rule_pack(
            r#"
rules:
  - id: broken
    target: knowledge
    base_confidence: 0.7
    patterns: ["(unclosed"]
"#,
        )
        .unwrap_err();
    assert!(err.to_string().contains("broken"));
    assert_eq!(router.list_rules().len(), 7);
}

#[test]
fn test_configured_fallback_target() {
    let router = Router::new(RouterConfig {
        fallback_target: RouteTarget::Knowledge,
        fallback_confidence: 0.2,
        ..Default::default()
    });
    let decision = router.route("zzz", &RequestContext::new());
    assert!(decision.fallback);
    assert_eq!(decision.target, RouteTarget::Knowledge);
    assert_eq!(decision.confidence, 0.2);
}

#[test]
fn test_cache_key_ignores_irrelevant_context() {
    let router = Router::new(RouterConfig::default());
    let mut first = RequestContext::new();
    first.insert("domain".into(), json!("chemistry"));
    first.insert("request_id".into(), json!("a"));
    let mut second = first.clone();
    second.insert("request_id".into(), json!("b"));
    let mut other_domain = first.clone();
    other_domain.insert("domain".into(), json!("physics"));

    router.route("Explain covalent bonds", &first);
    router.route("Explain covalent bonds", &second);
    router.route("Explain covalent bonds", &other_domain);

    let stats = router.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 2);
    assert_eq!(router.cache_len(), 2);
}

#[test]
fn test_cache_bounded_and_swept() {
    let clock = Arc::new(ManualClock::new());
    let bus = EventBus::new().shared();
    let router = Router::with_clock(
        RouterConfig {
            max_cache_entries: 2,
            ..Default::default()
        },
        clock.clone(),
    )
    .with_events(bus.clone());

    for text in ["Why a?", "Why b?", "Why c?"] {
        router.route(text, &RequestContext::new());
    }
    assert_eq!(router.cache_len(), 2);

    clock.advance(Duration::from_secs(301));
    assert_eq!(router.sweep_cache(), 2);
    assert_eq!(bus.history().of_type("routing_cache_evicted", 10).len(), 1);
}

#[test]
fn test_added_rule_wins_over_fallback() {
    let router = Router::new(RouterConfig::default());
    assert!(router.route("ping the pager", &RequestContext::new()).fallback);

    router
        .add_rule(RoutingRule::new("pager", RouteTarget::Reasoning, 0.9, &[r"(?i)\bpager\b"]).unwrap())
        .unwrap();
    let decision = router.route("ping the pager", &RequestContext::new());
    assert!(!decision.fallback);
    assert_eq!(decision.rule_matched.as_deref(), Some("pager"));
}

#[test]
fn test_classification_feeds_scoring() {
    let classification =
        RequestClassifier::new().classify("Why does the build fail?", &RequestContext::new());
    assert!(classification.complexity >= 0.0 && classification.complexity <= 1.0);

    let router = Router::new(RouterConfig::default());
    let decision = router.route("Why does the build fail?", &RequestContext::new());
    assert_eq!(decision.target, RouteTarget::Reasoning);
}
