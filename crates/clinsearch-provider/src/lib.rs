//! HTTP adapter for the external vector-similarity service.
//!
//! The index itself (creation, upsert, nearest-neighbor retrieval) is an
//! external collaborator; this crate only wraps its search endpoint behind
//! the [`VectorIndex`] trait with an explicit timeout. Response parsing is
//! split out so it can be exercised offline against JSON fixtures.

use std::time::Duration;

use clinsearch_core::RetrievalHit;
use clinsearch_pipeline::{CollaboratorError, VectorIndex};
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_VECTOR_SERVICE_URL: &str = "http://localhost:8000/v1";
pub const DEFAULT_VECTOR_TIMEOUT: Duration = Duration::from_secs(5);

const URL_ENV_VAR: &str = "VECTOR_SERVICE_URL";
const TIMEOUT_ENV_VAR: &str = "VECTOR_SERVICE_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorServiceConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for VectorServiceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_VECTOR_SERVICE_URL.to_string(),
            timeout: DEFAULT_VECTOR_TIMEOUT,
        }
    }
}

impl VectorServiceConfig {
    /// Read `VECTOR_SERVICE_URL` and `VECTOR_SERVICE_TIMEOUT_SECS`,
    /// falling back to the defaults for anything absent or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let base_url =
            std::env::var(URL_ENV_VAR).unwrap_or_else(|_| DEFAULT_VECTOR_SERVICE_URL.to_string());
        let timeout = std::env::var(TIMEOUT_ENV_VAR)
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .map_or(DEFAULT_VECTOR_TIMEOUT, Duration::from_secs);
        Self { base_url, timeout }
    }
}

/// Synchronous client for the vector service search endpoint.
pub struct VectorServiceClient {
    agent: ureq::Agent,
    base_url: String,
}

impl VectorServiceClient {
    #[must_use]
    pub fn new(config: &VectorServiceConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self { agent, base_url: config.base_url.trim_end_matches('/').to_string() }
    }
}

impl VectorIndex for VectorServiceClient {
    fn search(&self, vector: &[f32], count: usize) -> Result<Vec<RetrievalHit>, CollaboratorError> {
        let url = format!("{}/search", self.base_url);
        debug!(%url, count, "querying vector service");
        let response = self
            .agent
            .post(&url)
            .send_json(serde_json::json!({ "vector": vector, "top_k": count }))
            .map_err(map_ureq_error)?;
        let body: Value = response
            .into_json()
            .map_err(|error| CollaboratorError::InvalidResponse(error.to_string()))?;
        parse_search_results(&body)
    }
}

fn map_ureq_error(error: ureq::Error) -> CollaboratorError {
    match error {
        ureq::Error::Status(code, _) => {
            CollaboratorError::Transport(format!("vector service returned status {code}"))
        }
        ureq::Error::Transport(transport) => CollaboratorError::Transport(transport.to_string()),
    }
}

/// Decode a search response body into retrieval hits.
///
/// # Errors
/// Returns [`CollaboratorError::InvalidResponse`] when the `results`
/// array is missing or an element does not fit the hit shape.
pub fn parse_search_results(body: &Value) -> Result<Vec<RetrievalHit>, CollaboratorError> {
    let results = body.get("results").and_then(Value::as_array).ok_or_else(|| {
        CollaboratorError::InvalidResponse("missing `results` array".to_string())
    })?;

    let mut hits = Vec::with_capacity(results.len());
    for result in results {
        let hit: RetrievalHit = serde_json::from_value(result.clone())
            .map_err(|error| CollaboratorError::InvalidResponse(error.to_string()))?;
        hits.push(hit);
    }
    Ok(hits)
}
