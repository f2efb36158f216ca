//! Audit-entry assembly and the best-effort write side channel.
//!
//! The pipeline composes an [`AuditEntry`] after the response is built
//! and hands it to an [`AuditSink`]. Writes must never change the
//! response given to the caller: failures are logged and swallowed.
//! Durable retention and expiration of entries is the sink owner's
//! concern, not this module's.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::{SearchOutcome, SearchRequest};

/// Action name recorded for the advanced-search flow.
pub const SEARCH_ACTION: &str = "search_advanced";

/// Subject marker for requests without a caller identity.
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

/// Number of differential labels summarized per entry.
const TOP_DIFFERENTIAL_COUNT: usize = 5;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("failed to acquire lock")]
    LockFailed,
}

/// Redacted view of the originating request. Only the fields listed here
/// are ever written; free-form record content never reaches the trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRequest {
    pub query: String,
    pub specialty: Option<String>,
    pub hospital_ids: Vec<String>,
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditResult {
    pub matches_returned: usize,
    pub top_differentials: Vec<String>,
    pub guard_passes: bool,
}

/// Write-once audit record content. Persistence with expiration is an
/// external concern; this core only produces the entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub audit_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub user_id: String,
    pub request: AuditRequest,
    pub result: AuditResult,
}

impl AuditEntry {
    #[must_use]
    pub fn for_search(request: &SearchRequest, outcome: &SearchOutcome) -> Self {
        Self {
            audit_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: SEARCH_ACTION.to_string(),
            user_id: request
                .subject_id
                .clone()
                .unwrap_or_else(|| ANONYMOUS_SUBJECT.to_string()),
            request: AuditRequest {
                query: request.query.clone(),
                specialty: request.specialty.clone(),
                hospital_ids: request.allowed_institutions.clone(),
                top_k: request.top_k,
            },
            result: AuditResult {
                matches_returned: outcome.matches.len(),
                top_differentials: outcome
                    .differentials
                    .iter()
                    .take(TOP_DIFFERENTIAL_COUNT)
                    .map(|entry| entry.diagnosis.clone())
                    .collect(),
                guard_passes: outcome.guard.passes,
            },
        }
    }
}

pub trait AuditSink: Send + Sync {
    /// # Errors
    /// Returns [`AuditError`] when the entry cannot be recorded.
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// Record an entry, logging and swallowing any sink failure.
pub fn record_best_effort(sink: &dyn AuditSink, entry: &AuditEntry) {
    if let Err(error) = sink.record(entry) {
        warn!(audit_id = %entry.audit_id, %error, "audit write failed");
    }
}

/// Append-only JSON-lines sink, one entry per line.
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

impl AuditSink for JsonLinesSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|error| AuditError::Io(error.to_string()))?;

        let mut writer = BufWriter::new(file);
        let line = serde_json::to_string(entry)
            .map_err(|error| AuditError::Serialization(error.to_string()))?;
        writeln!(writer, "{line}").map_err(|error| AuditError::Io(error.to_string()))?;
        writer.flush().map_err(|error| AuditError::Io(error.to_string()))?;
        Ok(())
    }
}

/// In-memory sink for tests and embedding hosts.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemorySink {
    /// Snapshot of everything recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().map(|entries| entries.clone()).unwrap_or_default()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.entries
            .lock()
            .map_err(|_| AuditError::LockFailed)?
            .push(entry.clone());
        Ok(())
    }
}
