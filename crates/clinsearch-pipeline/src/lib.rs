//! Request orchestration for clinical semantic search.
//!
//! The pipeline sequences the pure ranking core between two blocking
//! external collaborators (vector search and narrative generation),
//! then cross-checks the generated narrative with the hallucination
//! guard and emits a best-effort audit entry. Collaborators are
//! constructor-injected so the whole flow runs in tests with no network
//! and no external service.

pub mod audit;
pub mod prompts;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clinsearch_core::{
    evaluate, validate_synthesis, CoreError, DifferentialEntry, EncounterId, Evaluation,
    RankingOptions, RetrievalHit, ScoredMatch, SynthesisResult, ValidationReport,
    DEFAULT_HALF_LIFE_DAYS, DEFAULT_TOP_K,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

/// Failure reported by an external collaborator. Distinct from an empty
/// result: collaborators signal "nothing found" with `Ok` values.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum CollaboratorError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

/// Produces the query vector for a prompt. Embedding model choice is
/// entirely the implementation's concern.
pub trait Embedder: Send + Sync {
    /// # Errors
    /// Returns [`CollaboratorError`] when the embedding backend fails.
    fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError>;
}

/// Nearest-neighbor search over the external vector index.
pub trait VectorIndex: Send + Sync {
    /// # Errors
    /// Returns [`CollaboratorError`] on timeout or transport failure;
    /// an empty hit list is a successful result.
    fn search(&self, vector: &[f32], count: usize) -> Result<Vec<RetrievalHit>, CollaboratorError>;
}

/// Read-only lookup of stored encounter payloads.
pub trait RecordStore: Send + Sync {
    /// A missing record is `Ok(None)`, never an error; the corresponding
    /// hit is dropped silently upstream.
    ///
    /// # Errors
    /// Returns [`CollaboratorError`] when the store itself fails.
    fn fetch(&self, encounter_id: &str) -> Result<Option<Value>, CollaboratorError>;
}

/// External narrative generation over the ranked matches.
pub trait NarrativeGenerator: Send + Sync {
    /// # Errors
    /// Returns [`CollaboratorError`] when generation fails or the output
    /// cannot be shaped into a [`SynthesisResult`].
    fn synthesize(
        &self,
        query: &str,
        matches: &[ScoredMatch],
    ) -> Result<SynthesisResult, CollaboratorError>;
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("query MUST be non-empty")]
    EmptyQuery,
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("embedding failed: {0}")]
    Embedding(#[source] CollaboratorError),
    #[error("vector search failed: {0}")]
    Retrieval(#[source] CollaboratorError),
    #[error("record store lookup failed: {0}")]
    RecordStore(#[source] CollaboratorError),
    #[error("narrative generation failed: {0}")]
    Generation(#[source] CollaboratorError),
}

/// One search request as received from the embedding service surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub specialty: Option<String>,
    /// Owning-institution allow-list; empty means unfiltered.
    #[serde(default)]
    pub allowed_institutions: Vec<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub half_life_days: Option<f64>,
    /// Caller identity for the audit trail; absent callers are recorded
    /// under the anonymous marker.
    #[serde(default)]
    pub subject_id: Option<String>,
    /// Evaluation instant; defaults to now. Pinning it keeps replays and
    /// tests deterministic.
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
}

impl SearchRequest {
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            specialty: None,
            allowed_institutions: Vec::new(),
            top_k: None,
            half_life_days: None,
            subject_id: None,
            as_of: None,
        }
    }
}

/// Assembled response for one search request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchOutcome {
    pub synthesis: SynthesisResult,
    pub guard: ValidationReport,
    pub differentials: Vec<DifferentialEntry>,
    pub matches: Vec<ScoredMatch>,
    pub prompt: String,
    pub specialty: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Matches surfaced when the request does not override top-K.
    pub default_top_k: usize,
    /// Candidate over-fetch factor ahead of filtering and truncation.
    pub retrieval_multiplier: usize,
    /// Temporal half-life applied when the request does not override it.
    pub half_life_days: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_top_k: DEFAULT_TOP_K,
            retrieval_multiplier: 3,
            half_life_days: DEFAULT_HALF_LIFE_DAYS,
        }
    }
}

impl PipelineConfig {
    /// # Errors
    /// Returns [`CoreError::Validation`] for zero counts or a
    /// non-positive half-life.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.default_top_k == 0 {
            return Err(CoreError::Validation("default_top_k MUST be >= 1".to_string()));
        }
        if self.retrieval_multiplier == 0 {
            return Err(CoreError::Validation("retrieval_multiplier MUST be >= 1".to_string()));
        }
        if !self.half_life_days.is_finite() || self.half_life_days <= 0.0 {
            return Err(CoreError::Validation(
                "half_life_days MUST be positive and finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// The per-request orchestrator.
pub struct SearchPipeline {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn RecordStore>,
    generator: Arc<dyn NarrativeGenerator>,
    audit_sink: Option<Arc<dyn audit::AuditSink>>,
    config: PipelineConfig,
}

impl SearchPipeline {
    #[must_use]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn RecordStore>,
        generator: Arc<dyn NarrativeGenerator>,
    ) -> Self {
        Self {
            embedder,
            index,
            store,
            generator,
            audit_sink: None,
            config: PipelineConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn audit::AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Run the full sequence for one request: prompt, embed, retrieve,
    /// resolve, rank, synthesize, guard, audit.
    ///
    /// # Errors
    /// Returns [`PipelineError`] for an empty query, rejected options, or
    /// a collaborator failure. Guard findings are data in the outcome,
    /// never errors, and an audit-write failure never fails the request.
    pub fn run(&self, request: &SearchRequest) -> Result<SearchOutcome, PipelineError> {
        if request.query.trim().is_empty() {
            return Err(PipelineError::EmptyQuery);
        }
        self.config.validate()?;

        let top_k = request.top_k.unwrap_or(self.config.default_top_k);
        let options = RankingOptions::new(request.as_of.unwrap_or_else(Utc::now))
            .with_top_k(top_k)
            .with_half_life_days(request.half_life_days.unwrap_or(self.config.half_life_days))
            .with_allowed_institutions(request.allowed_institutions.clone());
        options.validate()?;

        let prompt = prompts::build_specialty_prompt(&request.query, request.specialty.as_deref());
        let vector = self.embedder.embed(&prompt).map_err(PipelineError::Embedding)?;
        let fetch_count = top_k.saturating_mul(self.config.retrieval_multiplier);
        let hits = self.index.search(&vector, fetch_count).map_err(PipelineError::Retrieval)?;
        debug!(hits = hits.len(), fetch_count, "vector search returned candidates");

        let mut records: BTreeMap<String, Value> = BTreeMap::new();
        for hit in &hits {
            // Skip store lookups for hits the institution filter will drop.
            if !request.allowed_institutions.is_empty() {
                match hit.institution() {
                    Some(institution)
                        if request
                            .allowed_institutions
                            .iter()
                            .any(|allowed| allowed == institution) => {}
                    _ => continue,
                }
            }
            let encounter_id = EncounterId::from_hit_id(&hit.id);
            if records.contains_key(encounter_id.as_str()) {
                continue;
            }
            let Some(payload) =
                self.store.fetch(encounter_id.as_str()).map_err(PipelineError::RecordStore)?
            else {
                continue;
            };
            records.insert(encounter_id.into_string(), payload);
        }

        let Evaluation { matches, differentials } = evaluate(&hits, &records, &options)?;
        let synthesis =
            self.generator.synthesize(&request.query, &matches).map_err(PipelineError::Generation)?;
        let guard = validate_synthesis(&synthesis, &matches);
        info!(
            matches = matches.len(),
            differentials = differentials.len(),
            guard_passes = guard.passes,
            risk = guard.risk_level.as_str(),
            "search request evaluated"
        );

        let outcome = SearchOutcome {
            synthesis,
            guard,
            differentials,
            matches,
            prompt,
            specialty: request.specialty.clone(),
        };

        // Side channel: composed after the response, failures logged only.
        if let Some(sink) = self.audit_sink.as_deref() {
            let entry = audit::AuditEntry::for_search(request, &outcome);
            audit::record_best_effort(sink, &entry);
        }

        Ok(outcome)
    }

    /// Re-run the hallucination guard over an existing synthesis and the
    /// match list it was generated from.
    #[must_use]
    pub fn validate(
        &self,
        synthesis: &SynthesisResult,
        matches: &[ScoredMatch],
    ) -> ValidationReport {
        validate_synthesis(synthesis, matches)
    }
}
