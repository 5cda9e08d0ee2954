//! Builds the service from configuration: HTTP-backed subsystems, the
//! council, optional rule packs and workflow catalogs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use meridian_coordination::{
    CoordinationConfig, CoordinationService, HttpKnowledgeClient, HttpReasoningClient,
    KnowledgeSubsystem, ReasoningEngine, ReasoningParticipant, ReasoningSubsystem,
    SharedParticipant, SubsystemRegistry,
};
use tracing::{info, warn};

/// Config file if given, otherwise defaults; `MERIDIAN_*` overrides apply
/// either way.
pub fn load_config(path: Option<&Path>) -> Result<CoordinationConfig> {
    match path {
        Some(path) => CoordinationConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => {
            let mut config = CoordinationConfig::default();
            config
                .apply_env_overrides()
                .context("applying MERIDIAN_* overrides")?;
            config.validate().context("validating default config")?;
            Ok(config)
        }
    }
}

/// Registry and council backed by the configured endpoints
pub fn build_collaborators(
    config: &CoordinationConfig,
) -> Result<(SubsystemRegistry, Vec<SharedParticipant>)> {
    let endpoints = &config.endpoints;
    let timeout = Duration::from_secs(endpoints.request_timeout_secs);
    let mut registry = SubsystemRegistry::new();
    let mut participants = Vec::new();

    if let Some(url) = &endpoints.knowledge_url {
        let client = HttpKnowledgeClient::new(url, timeout, endpoints.api_key.clone())
            .context("creating knowledge client")?;
        registry.register(Arc::new(KnowledgeSubsystem::new("knowledge", Arc::new(client))));
        info!(url = %url, "Knowledge subsystem configured");
    }

    if let Some(url) = &endpoints.reasoning_url {
        let client = HttpReasoningClient::new(url, timeout, endpoints.api_key.clone())
            .context("creating reasoning client")?;
        let engine: Arc<dyn ReasoningEngine> = Arc::new(client);
        registry.register(Arc::new(ReasoningSubsystem::new("reasoning", engine.clone())));
        participants = ReasoningParticipant::council(engine);
        info!(url = %url, council = participants.len(), "Reasoning subsystem configured");
    }

    if registry.is_empty() {
        warn!("No endpoints configured; set MERIDIAN_KNOWLEDGE_URL or MERIDIAN_REASONING_URL");
    }
    Ok((registry, participants))
}

pub fn build_service(config: CoordinationConfig, rules: Option<&Path>) -> Result<CoordinationService> {
    let (registry, participants) = build_collaborators(&config)?;
    let service = CoordinationService::new(config, registry, participants)
        .context("building coordination service")?;

    if let Some(path) = rules {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading rule pack {}", path.display()))?;
        let added = service
            .router()
            .load_rule_pack(&yaml)
            .with_context(|| format!("loading rule pack {}", path.display()))?;
        info!(rules = added, "Rule pack loaded");
    }
    Ok(service)
}

/// Register the workflows of a YAML catalog
pub async fn load_workflows(service: &CoordinationService, path: &Path) -> Result<usize> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow catalog {}", path.display()))?;
    let count = service
        .orchestrator()
        .load_workflows_yaml(&yaml)
        .await
        .with_context(|| format!("loading workflow catalog {}", path.display()))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_no_endpoints_builds_empty_registry() {
        let (registry, participants) = build_collaborators(&CoordinationConfig::default()).unwrap();
        assert!(registry.is_empty());
        assert!(participants.is_empty());
    }

    #[test]
    fn test_endpoints_register_subsystems() {
        let mut config = CoordinationConfig::default();
        config.endpoints.knowledge_url = Some("http://localhost:9001".to_string());
        config.endpoints.reasoning_url = Some("http://localhost:9002".to_string());
        let (registry, participants) = build_collaborators(&config).unwrap();
        assert_eq!(registry.names(), vec!["knowledge", "reasoning"]);
        assert_eq!(participants.len(), 7);
    }

    #[test]
    fn test_bad_rule_pack_path_is_reported() {
        let err = build_service(
            CoordinationConfig::default(),
            Some(Path::new("/nonexistent/rules.yaml")),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("reading rule pack"));
    }

    #[test]
    fn test_config_file_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[orchestrator]\nmax_concurrent_tasks = 3").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.orchestrator.max_concurrent_tasks, 3);
    }
}
