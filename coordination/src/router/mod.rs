//! Request router
//!
//! Picks the subsystem (or the knowledge+reasoning hybrid) that should
//! handle a request, with a confidence score.
//!
//! ```text
//! text, context
//!      │
//!      ├──▶ cache_key ──▶ DecisionCache ── hit ──────────────────────┐
//!      │                                                             │
//!      └──▶ RequestClassifier ──▶ rule table (all matches scored)    │
//!                                   │                                │
//!                          best ≥ threshold? ── no ──▶ fallback      │
//!                                   │ yes              │             │
//!                                   ▼                  ▼             ▼
//!                               decision ──────▶ cache + history + event
//! ```

pub mod cache;
pub mod rules;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classifier::{RequestClassifier, RequestContext};
use crate::config::RouterConfig;
use crate::events::{CoordinationEvent, SharedEventBus};
use crate::scheduler::{SharedClock, SystemClock};

pub use cache::{cache_key, DecisionCache};
pub use rules::{default_rules, RoutingRule, RulePack, RuleSpec};

/// Errors from rule-table management
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Rule '{0}' already exists")]
    DuplicateRule(String),

    #[error("Rule '{0}' not found")]
    UnknownRule(String),

    #[error("Invalid rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },

    #[error("Failed to parse rule pack: {0}")]
    RulePack(String),
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Where a request should go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    Knowledge,
    Reasoning,
    Deliberation,
    /// Knowledge retrieval feeding the reasoning subsystem
    Hybrid,
}

impl RouteTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteTarget::Knowledge => "knowledge",
            RouteTarget::Reasoning => "reasoning",
            RouteTarget::Deliberation => "deliberation",
            RouteTarget::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of routing one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub target: RouteTarget,
    pub confidence: f64,
    /// Human-readable account of how the decision was reached
    pub reasoning: String,
    /// Id of the winning rule; `None` for fallback decisions
    pub rule_matched: Option<String>,
    pub fallback: bool,
}

/// One entry of the decision history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub cache_key: String,
    pub decision: RoutingDecision,
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
}

/// Router counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fallbacks: u64,
    pub decisions_by_target: HashMap<RouteTarget, u64>,
}

impl RouterStats {
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_requests as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fallbacks: AtomicU64,
}

/// Shared reference to a router
pub type SharedRouter = Arc<Router>;

/// Rule-based request router with a decision cache
pub struct Router {
    config: RouterConfig,
    classifier: RequestClassifier,
    rules: RwLock<Vec<RoutingRule>>,
    cache: DecisionCache,
    counters: Counters,
    by_target: Mutex<HashMap<RouteTarget, u64>>,
    history: Mutex<VecDeque<RoutingRecord>>,
    events: Option<SharedEventBus>,
}

impl Router {
    /// Router with the built-in rules and the system clock
    pub fn new(config: RouterConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RouterConfig, clock: SharedClock) -> Self {
        let cache = DecisionCache::new(config.cache_ttl(), config.max_cache_entries, clock);
        Self {
            classifier: RequestClassifier::new(),
            rules: RwLock::new(default_rules()),
            cache,
            counters: Counters::default(),
            by_target: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            events: None,
            config,
        }
    }

    /// Publish decisions and cache activity on `bus`
    pub fn with_events(mut self, bus: SharedEventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn shared(self) -> SharedRouter {
        Arc::new(self)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Route a request.
    ///
    /// Never fails: with no matching rule, or a winner below the confidence
    /// threshold, the configured fallback target is returned.
    pub fn route(&self, text: &str, context: &RequestContext) -> RoutingDecision {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        let key = cache_key(text, context, &self.config.context_fields);

        if self.config.cache_enabled {
            if let Some(decision) = self.cache.get(&key) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(cache_key = %key, target = %decision.target, "Routing cache hit");
                self.publish(CoordinationEvent::RoutingCacheHit {
                    cache_key: key.clone(),
                    timestamp: Utc::now(),
                });
                self.record(&key, &decision, true);
                return decision;
            }
            self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let decision = self.decide(text, context);

        if decision.fallback {
            self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        if self.config.cache_enabled {
            let evicted = self.cache.insert(key.clone(), decision.clone());
            if evicted > 0 {
                self.publish(CoordinationEvent::RoutingCacheEvicted {
                    evicted,
                    remaining: self.cache.len(),
                    timestamp: Utc::now(),
                });
            }
        }
        self.record(&key, &decision, false);
        decision
    }

    fn decide(&self, text: &str, context: &RequestContext) -> RoutingDecision {
        let classification = self.classifier.classify(text, context);
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());

        // Strictly greater wins, so earlier rules take ties.
        let mut best: Option<(&RoutingRule, f64)> = None;
        let mut matched = 0usize;
        for rule in rules.iter().filter(|r| r.matches(text)) {
            matched += 1;
            let score = rule.score(&classification);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((rule, score));
            }
        }

        match best {
            Some((rule, score)) if score >= self.config.confidence_threshold => {
                debug!(
                    rule = rule.id(),
                    target = %rule.target(),
                    confidence = score,
                    candidates = matched,
                    "Rule selected"
                );
                RoutingDecision {
                    target: rule.target(),
                    confidence: score,
                    reasoning: format!(
                        "rule '{}' matched (intent {}, complexity {:.2}, urgency {:.2}) with confidence {:.2}",
                        rule.id(),
                        classification.intent,
                        classification.complexity,
                        classification.urgency,
                        score
                    ),
                    rule_matched: Some(rule.id().to_string()),
                    fallback: false,
                }
            }
            Some((rule, score)) => {
                info!(
                    rule = rule.id(),
                    confidence = score,
                    threshold = self.config.confidence_threshold,
                    fallback = %self.config.fallback_target,
                    "Best rule below threshold, falling back"
                );
                self.fallback(format!(
                    "best rule '{}' scored {:.2}, below threshold {:.2}; falling back to {}",
                    rule.id(),
                    score,
                    self.config.confidence_threshold,
                    self.config.fallback_target
                ))
            }
            None => {
                info!(fallback = %self.config.fallback_target, "No rule matched, falling back");
                self.fallback(format!(
                    "no rule matched; falling back to {}",
                    self.config.fallback_target
                ))
            }
        }
    }

    fn fallback(&self, reasoning: String) -> RoutingDecision {
        RoutingDecision {
            target: self.config.fallback_target,
            confidence: self.config.fallback_confidence,
            reasoning,
            rule_matched: None,
            fallback: true,
        }
    }

    fn record(&self, key: &str, decision: &RoutingDecision, cached: bool) {
        *self
            .by_target
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(decision.target)
            .or_insert(0) += 1;

        let timestamp = Utc::now();
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() >= self.config.history_size.max(1) {
                history.pop_front();
            }
            history.push_back(RoutingRecord {
                cache_key: key.to_string(),
                decision: decision.clone(),
                cached,
                timestamp,
            });
        }

        self.publish(CoordinationEvent::DecisionMade {
            cache_key: key.to_string(),
            target: decision.target,
            confidence: decision.confidence,
            rule_matched: decision.rule_matched.clone(),
            fallback: decision.fallback,
            cached,
            timestamp,
        });
    }

    fn publish(&self, event: CoordinationEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Add a rule at the end of the table. Clears the cache.
    pub fn add_rule(&self, rule: RoutingRule) -> RouterResult<()> {
        {
            let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
            if rules.iter().any(|r| r.id() == rule.id()) {
                return Err(RouterError::DuplicateRule(rule.id().to_string()));
            }
            info!(rule = rule.id(), target = %rule.target(), "Routing rule added");
            rules.push(rule);
        }
        self.cache.clear();
        Ok(())
    }

    /// Remove a rule by id. Clears the cache.
    pub fn remove_rule(&self, id: &str) -> RouterResult<RoutingRule> {
        let removed = {
            let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
            let index = rules
                .iter()
                .position(|r| r.id() == id)
                .ok_or_else(|| RouterError::UnknownRule(id.to_string()))?;
            rules.remove(index)
        };
        info!(rule = id, "Routing rule removed");
        self.cache.clear();
        Ok(removed)
    }

    /// Parse a YAML rule pack and append its rules.
    ///
    /// Rejected as a whole if any rule is invalid or collides with an
    /// existing id.
    pub fn load_rule_pack(&self, yaml: &str) -> RouterResult<usize> {
        let new_rules = RulePack::from_yaml_str(yaml)?.compile()?;
        let count = new_rules.len();
        {
            let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
            for (i, rule) in new_rules.iter().enumerate() {
                let clashes_existing = rules.iter().any(|r| r.id() == rule.id());
                let clashes_pack = new_rules[..i].iter().any(|r| r.id() == rule.id());
                if clashes_existing || clashes_pack {
                    warn!(rule = rule.id(), "Rule pack rejected: duplicate id");
                    return Err(RouterError::DuplicateRule(rule.id().to_string()));
                }
            }
            rules.extend(new_rules);
        }
        self.cache.clear();
        info!(rules = count, "Rule pack loaded");
        Ok(count)
    }

    /// Rule ids in declaration order
    pub fn list_rules(&self) -> Vec<String> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| r.id().to_string())
            .collect()
    }

    /// Every target a decision can name: rule targets plus the fallback
    pub fn known_targets(&self) -> Vec<RouteTarget> {
        let mut targets: Vec<RouteTarget> = Vec::new();
        for rule in self.rules.read().unwrap_or_else(|e| e.into_inner()).iter() {
            if !targets.contains(&rule.target()) {
                targets.push(rule.target());
            }
        }
        if !targets.contains(&self.config.fallback_target) {
            targets.push(self.config.fallback_target);
        }
        targets
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Drop expired cache entries; returns the number removed
    pub fn sweep_cache(&self) -> usize {
        let evicted = self.cache.sweep();
        if evicted > 0 {
            debug!(evicted, "Routing cache swept");
            self.publish(CoordinationEvent::RoutingCacheEvicted {
                evicted,
                remaining: self.cache.len(),
                timestamp: Utc::now(),
            });
        }
        evicted
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            decisions_by_target: self
                .by_target
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    /// Most recent decisions, newest last
    pub fn history(&self, limit: usize) -> Vec<RoutingRecord> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::scheduler::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    fn router() -> Router {
        Router::new(RouterConfig::default())
    }

    #[test]
    fn test_factual_question_goes_to_knowledge() {
        let decision = router().route("What is the boiling point of water?", &RequestContext::new());
        assert_eq!(decision.target, RouteTarget::Knowledge);
        assert_eq!(decision.rule_matched.as_deref(), Some("factual_lookup"));
        assert!(!decision.fallback);
    }

    #[test]
    fn test_multi_perspective_goes_to_deliberation() {
        let decision = router().route(
            "Weigh the stakeholder perspectives on the merger",
            &RequestContext::new(),
        );
        assert_eq!(decision.target, RouteTarget::Deliberation);
        assert_eq!(decision.rule_matched.as_deref(), Some("multi_perspective"));
    }

    #[test]
    fn test_no_match_falls_back() {
        let decision = router().route("Hello there", &RequestContext::new());
        assert_eq!(decision.target, RouteTarget::Reasoning);
        assert_eq!(decision.confidence, 0.3);
        assert!(decision.fallback);
        assert!(decision.rule_matched.is_none());
        assert!(decision.reasoning.contains("no rule matched"));
    }

    #[test]
    fn test_low_confidence_falls_back() {
        let router = Router::new(RouterConfig {
            confidence_threshold: 0.95,
            ..Default::default()
        });
        let decision = router.route("Explain recursion", &RequestContext::new());
        assert!(decision.fallback);
        assert!(decision.reasoning.contains("below threshold"));
        assert_eq!(router.stats().fallbacks, 1);
    }

    #[test]
    fn test_ties_go_to_earlier_rule() {
        let router = router();
        router
            .add_rule(RoutingRule::new("second", RouteTarget::Deliberation, 0.8, &["zebra"]).unwrap())
            .unwrap();
        router
            .add_rule(RoutingRule::new("third", RouteTarget::Knowledge, 0.8, &["zebra"]).unwrap())
            .unwrap();
        let decision = router.route("zebra crossing", &RequestContext::new());
        assert_eq!(decision.rule_matched.as_deref(), Some("second"));
    }

    #[test]
    fn test_cache_hit_is_identical() {
        let bus = EventBus::new().shared();
        let router = router().with_events(bus.clone());
        let mut context = RequestContext::new();
        context.insert("domain".into(), json!("physics"));

        let first = router.route("Why is the sky blue?", &context);
        context.insert("session".into(), json!("other"));
        let second = router.route("Why is the sky blue?", &context);

        assert_eq!(first, second);
        let stats = router.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(bus.history().of_type("routing_cache_hit", 10).len(), 1);
        assert!(router.history(10)[1].cached);
    }

    #[test]
    fn test_cache_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new());
        let router = Router::with_clock(RouterConfig::default(), clock.clone());
        router.route("Why is the sky blue?", &RequestContext::new());
        clock.advance(Duration::from_secs(301));
        router.route("Why is the sky blue?", &RequestContext::new());
        assert_eq!(router.stats().cache_hits, 0);

        clock.advance(Duration::from_secs(301));
        assert_eq!(router.sweep_cache(), 1);
        assert_eq!(router.cache_len(), 0);
    }

    #[test]
    fn test_rule_changes_clear_cache() {
        let router = router();
        router.route("Why is the sky blue?", &RequestContext::new());
        assert_eq!(router.cache_len(), 1);

        router.remove_rule("analytical_reasoning").unwrap();
        assert_eq!(router.cache_len(), 0);
        assert!(matches!(
            router.remove_rule("analytical_reasoning"),
            Err(RouterError::UnknownRule(_))
        ));
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let router = router();
        let err = router
            .add_rule(RoutingRule::new("documentation", RouteTarget::Knowledge, 0.5, &["x"]).unwrap())
            .unwrap_err();
        assert!(matches!(err, RouterError::DuplicateRule(id) if id == "documentation"));
        assert_eq!(router.list_rules().len(), 7);
    }

    #[test]
    fn test_rule_pack_with_duplicate_is_rejected_whole() {
        let router = router();
        let err = router
            .load_rule_pack(
                r#"
rules:
  - id: fresh
    target: knowledge
    base_confidence: 0.9
    patterns: ["fresh"]
  - id: fresh
    target: reasoning
    base_confidence: 0.9
    patterns: ["again"]
"#,
            )
            .unwrap_err();
        assert!(matches!(err, RouterError::DuplicateRule(_)));
        assert!(!router.list_rules().contains(&"fresh".to_string()));
    }

    #[test]
    fn test_history_is_bounded() {
        let router = Router::new(RouterConfig {
            history_size: 2,
            cache_enabled: false,
            ..Default::default()
        });
        for text in ["a", "b", "c"] {
            router.route(text, &RequestContext::new());
        }
        let history = router.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(router.stats().total_requests, 3);
    }
}
