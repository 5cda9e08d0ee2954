//! HTTP clients for the knowledge and reasoning collaborators.
//!
//! Both speak JSON over POST:
//!
//! - `POST {base}/retrieve` `{query, max_results, threshold}` →
//!   `{documents, confidence, sources}`
//! - `POST {base}/process` `{input: {text, context, sources}, options}` →
//!   `{response, confidence, reasoning, layers_used}`

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    KnowledgeRetriever, ReasoningEngine, ReasoningInput, ReasoningOptions, ReasoningOutput,
    RetrievalOptions, RetrievalResult, SubsystemError, SubsystemResult, KNOWLEDGE, REASONING,
};

struct JsonEndpoint {
    name: &'static str,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl JsonEndpoint {
    fn new(
        name: &'static str,
        base_url: &str,
        timeout: Duration,
        api_key: Option<String>,
    ) -> SubsystemResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SubsystemError::failed(name, format!("client setup: {}", e)))?;
        Ok(Self {
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout,
            client,
        })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> SubsystemResult<T> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(subsystem = self.name, url = %url, "POST");

        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SubsystemError::failed(
                self.name,
                format!("HTTP {}: {}", status, body),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SubsystemError::InvalidResponse {
                subsystem: self.name.to_string(),
                message: e.to_string(),
            })
    }

    fn map_error(&self, e: reqwest::Error) -> SubsystemError {
        if e.is_timeout() {
            SubsystemError::Timeout {
                subsystem: self.name.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            SubsystemError::failed(self.name, e.to_string())
        }
    }
}

/// Knowledge retrieval over HTTP
pub struct HttpKnowledgeClient {
    endpoint: JsonEndpoint,
}

impl HttpKnowledgeClient {
    pub fn new(base_url: &str, timeout: Duration, api_key: Option<String>) -> SubsystemResult<Self> {
        Ok(Self {
            endpoint: JsonEndpoint::new(KNOWLEDGE, base_url, timeout, api_key)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.endpoint.base_url
    }
}

#[async_trait]
impl KnowledgeRetriever for HttpKnowledgeClient {
    async fn retrieve(
        &self,
        query: &str,
        options: &RetrievalOptions,
    ) -> SubsystemResult<RetrievalResult> {
        let body = serde_json::json!({
            "query": query,
            "max_results": options.max_results,
            "threshold": options.threshold,
        });
        self.endpoint.post("retrieve", &body).await
    }
}

/// Reasoning over HTTP
pub struct HttpReasoningClient {
    endpoint: JsonEndpoint,
}

impl HttpReasoningClient {
    pub fn new(base_url: &str, timeout: Duration, api_key: Option<String>) -> SubsystemResult<Self> {
        Ok(Self {
            endpoint: JsonEndpoint::new(REASONING, base_url, timeout, api_key)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.endpoint.base_url
    }
}

#[async_trait]
impl ReasoningEngine for HttpReasoningClient {
    async fn process(
        &self,
        input: &ReasoningInput,
        options: &ReasoningOptions,
    ) -> SubsystemResult<ReasoningOutput> {
        let body = serde_json::json!({
            "input": input,
            "options": options,
        });
        let output: ReasoningOutput = self.endpoint.post("process", &body).await?;
        if output.response.trim().is_empty() {
            return Err(SubsystemError::InvalidResponse {
                subsystem: self.endpoint.name.to_string(),
                message: "empty response".to_string(),
            });
        }
        Ok(output)
    }
}
