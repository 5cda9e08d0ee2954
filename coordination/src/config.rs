//! Configuration for the coordination layer
//!
//! One struct per component, each field with a documented default. Values
//! come from (lowest to highest precedence) the defaults below, a TOML file,
//! and `MERIDIAN_*` environment variables. [`CoordinationConfig::validate`]
//! runs after every layer is applied.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::ExecutionStrategy;
use crate::router::RouteTarget;
use crate::synthesizer::SynthesisStrategy;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub router: RouterConfig,
    pub orchestrator: OrchestratorConfig,
    pub deliberation: DeliberationConfig,
    pub synthesizer: SynthesizerConfig,
    pub events: EventConfig,
    pub endpoints: EndpointsConfig,
}

/// Router and decision-cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Decisions scoring below this are replaced by the fallback (default 0.5)
    pub confidence_threshold: f64,
    /// Target used when no rule matches or confidence is too low (default reasoning)
    pub fallback_target: RouteTarget,
    /// Confidence attached to fallback decisions (default 0.3)
    pub fallback_confidence: f64,
    /// Memoize decisions (default true)
    pub cache_enabled: bool,
    /// Lifetime of a cached decision (default 300s)
    pub cache_ttl_secs: u64,
    /// Period of the background sweep (default 60s)
    pub cache_sweep_interval_secs: u64,
    /// Upper bound on cached decisions; oldest evicted first (default 1000)
    pub max_cache_entries: usize,
    /// Context keys that participate in the cache key
    pub context_fields: Vec<String>,
    /// Decisions kept for `history()` (default 100)
    pub history_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            fallback_target: RouteTarget::Reasoning,
            fallback_confidence: 0.3,
            cache_enabled: true,
            cache_ttl_secs: 300,
            cache_sweep_interval_secs: 60,
            max_cache_entries: 1000,
            context_fields: vec![
                "domain".to_string(),
                "deadline".to_string(),
                "priority".to_string(),
                "language".to_string(),
            ],
            history_size: 100,
        }
    }
}

impl RouterConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }
}

/// Task execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Tasks allowed to run at once; the rest queue (default 10)
    pub max_concurrent_tasks: usize,
    /// Tasks allowed to wait in the overflow queue (default 100)
    pub max_queue_size: usize,
    /// How often the overflow queue is drained (default 100ms)
    pub queue_poll_interval_ms: u64,
    /// Per subsystem call deadline (default 30s)
    pub call_timeout_ms: u64,
    /// Whole-task deadline when the caller gives none (default 120s)
    pub default_task_timeout_secs: u64,
    /// Extra attempts for a retriable subsystem failure (default 0)
    pub call_retries: u32,
    /// Finished tasks kept for `get_history()` (default 100)
    pub history_size: usize,
    /// Strategy used when the caller names none (default single)
    pub default_strategy: ExecutionStrategy,
    /// Targets for the consensus strategy when the caller names none;
    /// empty means every registered subsystem
    pub consensus_targets: Vec<String>,
    /// Consecutive failures before a subsystem's circuit opens (default 3)
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before allowing a probe (default 30)
    pub cooldown_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            max_queue_size: 100,
            queue_poll_interval_ms: 100,
            call_timeout_ms: 30_000,
            default_task_timeout_secs: 120,
            call_retries: 0,
            history_size: 100,
            default_strategy: ExecutionStrategy::Single,
            consensus_targets: Vec::new(),
            failure_threshold: 3,
            cooldown_secs: 30,
        }
    }
}

impl OrchestratorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }
}

/// Council settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliberationConfig {
    /// Deadline for each participant's phase contribution (default 10s)
    pub phase_timeout_ms: u64,
    /// Deadline for each participant's vote (default 5s)
    pub vote_timeout_ms: u64,
    /// Fraction of participants that must answer for a phase to count (default 0.6)
    pub phase_success_ratio: f64,
    /// Consensus score needed for "achieved" (default 0.7)
    pub consensus_threshold: f64,
    /// Consensus score below which a conflict is declared (default 0.5)
    pub conflict_threshold: f64,
    /// Broadcasts kept for inspection (default 200)
    pub broadcast_history_size: usize,
    /// Discussions allowed in flight (default 50)
    pub max_active_discussions: usize,
}

impl Default for DeliberationConfig {
    fn default() -> Self {
        Self {
            phase_timeout_ms: 10_000,
            vote_timeout_ms: 5_000,
            phase_success_ratio: 0.6,
            consensus_threshold: 0.7,
            conflict_threshold: 0.5,
            broadcast_history_size: 200,
            max_active_discussions: 50,
        }
    }
}

impl DeliberationConfig {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }

    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }
}

/// Response merging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesizerConfig {
    pub default_strategy: SynthesisStrategy,
    /// Maximum characters of merged content before the citations block (default 4000)
    pub max_length: usize,
    pub include_attribution: bool,
    pub include_citations: bool,
    pub compute_quality: bool,
    /// Weighted-merge entries at or below this weight are dropped (default 0.1)
    pub min_weight: f64,
    /// Jaccard overlap at which two sentences agree (default 0.3)
    pub agreement_threshold: f64,
    /// Hierarchical ordering, most trusted first
    pub source_priority: Vec<String>,
    /// Reliability multiplier per source name
    pub source_reliability: BTreeMap<String, f64>,
    /// Reliability for sources absent from the table (default 0.7)
    pub default_reliability: f64,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        let mut source_reliability = BTreeMap::new();
        source_reliability.insert("knowledge".to_string(), 0.9);
        source_reliability.insert("reasoning".to_string(), 0.85);
        source_reliability.insert("deliberation".to_string(), 0.8);
        Self {
            default_strategy: SynthesisStrategy::WeightedMerge,
            max_length: 4000,
            include_attribution: true,
            include_citations: true,
            compute_quality: true,
            min_weight: 0.1,
            agreement_threshold: 0.3,
            source_priority: vec![
                "deliberation".to_string(),
                "reasoning".to_string(),
                "knowledge".to_string(),
            ],
            source_reliability,
            default_reliability: 0.7,
        }
    }
}

impl SynthesizerConfig {
    /// Reliability constant for a source name
    pub fn reliability(&self, source: &str) -> f64 {
        self.source_reliability
            .get(source)
            .copied()
            .unwrap_or(self.default_reliability)
    }
}

/// Notification bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub channel_capacity: usize,
    pub history_size: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            history_size: 256,
        }
    }
}

/// HTTP collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub knowledge_url: Option<String>,
    pub reasoning_url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            knowledge_url: None,
            reasoning_url: None,
            api_key: None,
            request_timeout_secs: 30,
        }
    }
}

impl CoordinationConfig {
    /// Parse a TOML document; missing sections take their defaults
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MERIDIAN_*` environment variables
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MERIDIAN_MAX_CONCURRENT_TASKS") {
            self.orchestrator.max_concurrent_tasks = parse_var("MERIDIAN_MAX_CONCURRENT_TASKS", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_CALL_TIMEOUT_MS") {
            self.orchestrator.call_timeout_ms = parse_var("MERIDIAN_CALL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_CALL_RETRIES") {
            self.orchestrator.call_retries = parse_var("MERIDIAN_CALL_RETRIES", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_ROUTER_CONFIDENCE_THRESHOLD") {
            self.router.confidence_threshold =
                parse_var("MERIDIAN_ROUTER_CONFIDENCE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_ROUTER_CACHE_TTL_SECS") {
            self.router.cache_ttl_secs = parse_var("MERIDIAN_ROUTER_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_CONSENSUS_THRESHOLD") {
            self.deliberation.consensus_threshold = parse_var("MERIDIAN_CONSENSUS_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_KNOWLEDGE_URL") {
            self.endpoints.knowledge_url = Some(v);
        }
        if let Some(v) = lookup("MERIDIAN_REASONING_URL") {
            self.endpoints.reasoning_url = Some(v);
        }
        if let Some(v) = lookup("MERIDIAN_API_KEY") {
            self.endpoints.api_key = Some(v);
        }
        Ok(())
    }

    /// Reject values no component can work with
    pub fn validate(&self) -> ConfigResult<()> {
        check_unit("router.confidence_threshold", self.router.confidence_threshold)?;
        check_unit("router.fallback_confidence", self.router.fallback_confidence)?;
        check_positive("router.cache_ttl_secs", self.router.cache_ttl_secs)?;
        check_positive(
            "router.cache_sweep_interval_secs",
            self.router.cache_sweep_interval_secs,
        )?;
        check_positive("router.max_cache_entries", self.router.max_cache_entries as u64)?;

        check_positive(
            "orchestrator.max_concurrent_tasks",
            self.orchestrator.max_concurrent_tasks as u64,
        )?;
        check_positive(
            "orchestrator.queue_poll_interval_ms",
            self.orchestrator.queue_poll_interval_ms,
        )?;
        check_positive("orchestrator.call_timeout_ms", self.orchestrator.call_timeout_ms)?;
        check_positive(
            "orchestrator.default_task_timeout_secs",
            self.orchestrator.default_task_timeout_secs,
        )?;
        check_positive(
            "orchestrator.failure_threshold",
            self.orchestrator.failure_threshold as u64,
        )?;

        check_positive("deliberation.phase_timeout_ms", self.deliberation.phase_timeout_ms)?;
        check_positive("deliberation.vote_timeout_ms", self.deliberation.vote_timeout_ms)?;
        check_unit(
            "deliberation.phase_success_ratio",
            self.deliberation.phase_success_ratio,
        )?;
        check_unit(
            "deliberation.consensus_threshold",
            self.deliberation.consensus_threshold,
        )?;
        check_unit(
            "deliberation.conflict_threshold",
            self.deliberation.conflict_threshold,
        )?;
        check_positive(
            "deliberation.max_active_discussions",
            self.deliberation.max_active_discussions as u64,
        )?;

        check_positive("synthesizer.max_length", self.synthesizer.max_length as u64)?;
        check_unit("synthesizer.min_weight", self.synthesizer.min_weight)?;
        check_unit(
            "synthesizer.agreement_threshold",
            self.synthesizer.agreement_threshold,
        )?;
        check_unit(
            "synthesizer.default_reliability",
            self.synthesizer.default_reliability,
        )?;
        for (source, value) in &self.synthesizer.source_reliability {
            check_unit(&format!("synthesizer.source_reliability.{}", source), *value)?;
        }

        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        field: key.to_string(),
        reason: format!("cannot parse '{}'", value),
    })
}

fn check_unit(field: &str, value: f64) -> ConfigResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("{} is outside [0, 1]", value),
        });
    }
    Ok(())
}

fn check_positive(field: &str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field: field.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.router.confidence_threshold, 0.5);
        assert_eq!(config.deliberation.consensus_threshold, 0.7);
        assert_eq!(config.synthesizer.min_weight, 0.1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CoordinationConfig::from_toml_str(
            r#"
            [router]
            confidence_threshold = 0.6
            fallback_target = "knowledge"

            [orchestrator]
            max_concurrent_tasks = 4
            default_strategy = "parallel"
            "#,
        )
        .unwrap();

        assert_eq!(config.router.confidence_threshold, 0.6);
        assert_eq!(config.router.fallback_target, RouteTarget::Knowledge);
        assert_eq!(config.router.cache_ttl_secs, 300);
        assert_eq!(config.orchestrator.max_concurrent_tasks, 4);
        assert_eq!(
            config.orchestrator.default_strategy,
            ExecutionStrategy::Parallel
        );
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let err = CoordinationConfig::from_toml_str(
            r#"
            [deliberation]
            consensus_threshold = 1.5
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "deliberation.consensus_threshold"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = CoordinationConfig::default();
        config.orchestrator.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_applied() {
        let vars: HashMap<&str, &str> = [
            ("MERIDIAN_MAX_CONCURRENT_TASKS", "3"),
            ("MERIDIAN_REASONING_URL", "http://localhost:9000"),
        ]
        .into_iter()
        .collect();

        let mut config = CoordinationConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.orchestrator.max_concurrent_tasks, 3);
        assert_eq!(
            config.endpoints.reasoning_url.as_deref(),
            Some("http://localhost:9000")
        );
    }

    #[test]
    fn test_unparseable_override_rejected() {
        let mut config = CoordinationConfig::default();
        let err = config
            .apply_overrides(|k| (k == "MERIDIAN_CALL_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("MERIDIAN_CALL_TIMEOUT_MS"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[synthesizer]\nmax_length = 120\ndefault_strategy = \"hierarchical\"").unwrap();

        let config = CoordinationConfig::load(file.path()).unwrap();
        assert_eq!(config.synthesizer.max_length, 120);
        assert_eq!(
            config.synthesizer.default_strategy,
            SynthesisStrategy::Hierarchical
        );
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = CoordinationConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_reliability_lookup() {
        let config = SynthesizerConfig::default();
        assert_eq!(config.reliability("knowledge"), 0.9);
        assert_eq!(config.reliability("unknown"), 0.7);
    }
}
