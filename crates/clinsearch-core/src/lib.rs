//! Pure ranking and validation core for clinical semantic search.
//!
//! Everything in this crate operates on in-memory values already retrieved
//! by external collaborators: raw similarity hits, stored encounter
//! payloads, and generated narrative syntheses. There is no I/O and no
//! clock access; callers supply `as_of` so results are reproducible.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Default temporal half-life applied when the caller does not override it.
pub const DEFAULT_HALF_LIFE_DAYS: f64 = 365.0;

/// Default number of matches surfaced to the caller.
pub const DEFAULT_TOP_K: usize = 5;

/// Prefix carried by vector-index identifiers for encounter entries.
pub const ENCOUNTER_VECTOR_PREFIX: &str = "encounter:";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EncounterId(pub String);

impl EncounterId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Build an id from a vector-index hit id, stripping the
    /// `encounter:` prefix when present.
    #[must_use]
    pub fn from_hit_id(hit_id: &str) -> Self {
        Self(hit_id.strip_prefix(ENCOUNTER_VECTOR_PREFIX).unwrap_or(hit_id).to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for EncounterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Date fields tried in order when normalizing an encounter payload.
/// The first field that is present AND parseable wins; unparsable values
/// are skipped, never fatal.
const DATE_FIELD_PRIORITY: &[&str] =
    &["encounter_date", "admission_date", "visit_date", "timestamp", "created_at", "date"];

/// Normalized, typed view of a stored encounter payload.
///
/// Stored encounters arrive as dynamic JSON with several tolerated shapes
/// (diagnosis as scalar or list, a handful of alternative date field
/// names). All of that tolerance lives in [`EncounterRecord::from_value`];
/// the rest of the crate only ever sees this struct. Records are read-only
/// to this core; the ingestion path that creates them is external.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncounterRecord {
    pub encounter_id: EncounterId,
    pub institution_id: Option<String>,
    pub chief_complaint: Option<String>,
    pub treatment: Option<String>,
    pub outcome: Option<String>,
    /// Union of the singular, plural, and final diagnosis fields, with
    /// empty and literal `unknown` values dropped. Original spelling is
    /// retained for display.
    pub diagnoses: Vec<String>,
    pub effective_date: Option<DateTime<Utc>>,
}

impl EncounterRecord {
    #[must_use]
    pub fn from_value(encounter_id: EncounterId, payload: &Value) -> Self {
        let Some(fields) = payload.as_object() else {
            return Self {
                encounter_id,
                institution_id: None,
                chief_complaint: None,
                treatment: None,
                outcome: None,
                diagnoses: Vec::new(),
                effective_date: None,
            };
        };

        Self {
            encounter_id,
            institution_id: string_field(fields, "hospital_id"),
            chief_complaint: string_field(fields, "chief_complaint"),
            treatment: string_field(fields, "treatment"),
            outcome: string_field(fields, "outcome"),
            diagnoses: extract_diagnoses(fields),
            effective_date: extract_effective_date(fields),
        }
    }
}

fn string_field(fields: &serde_json::Map<String, Value>, name: &str) -> Option<String> {
    fields.get(name).and_then(Value::as_str).filter(|text| !text.is_empty()).map(str::to_string)
}

fn extract_effective_date(fields: &serde_json::Map<String, Value>) -> Option<DateTime<Utc>> {
    DATE_FIELD_PRIORITY.iter().find_map(|field| fields.get(*field).and_then(parse_date_value))
}

fn parse_date_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_date_text(text),
        Value::Number(number) => {
            let seconds = number.as_i64().or_else(|| number.as_f64().map(|secs| secs as i64))?;
            Utc.timestamp_opt(seconds, 0).single()
        }
        _ => None,
    }
}

fn parse_date_text(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&parsed));
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| Utc.from_utc_datetime(&datetime))
}

fn extract_diagnoses(fields: &serde_json::Map<String, Value>) -> Vec<String> {
    let mut labels = Vec::new();
    if let Some(value) = fields.get("diagnosis") {
        push_diagnosis(&mut labels, value);
    }
    if let Some(value) = fields.get("diagnoses") {
        match value {
            Value::Array(items) => {
                for item in items {
                    push_diagnosis(&mut labels, item);
                }
            }
            scalar => push_diagnosis(&mut labels, scalar),
        }
    }
    if let Some(value) = fields.get("final_diagnosis") {
        push_diagnosis(&mut labels, value);
    }
    labels
}

fn push_diagnosis(labels: &mut Vec<String>, value: &Value) {
    let label = match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        _ => return,
    };
    if label.is_empty() || label == "unknown" {
        return;
    }
    labels.push(label);
}

fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

/// One raw result from the external vector-similarity search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalHit {
    /// Index-side identifier; may carry the `encounter:` prefix.
    pub id: String,
    /// Raw similarity score, unbounded but typically in [0, 1].
    #[serde(default)]
    pub score: f64,
    /// Opaque index metadata. The owning institution is read from
    /// `hospital_id` when present.
    #[serde(default)]
    pub metadata: Value,
}

impl RetrievalHit {
    #[must_use]
    pub fn institution(&self) -> Option<&str> {
        self.metadata.get("hospital_id").and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Temporal weighting
// ---------------------------------------------------------------------------

/// Exponential recency decay for a record of the given effective date.
///
/// Undated records are treated as maximally recent rather than penalized.
/// The result is clamped to [0.01, 1.0]: a once-relevant record never
/// reaches zero weight, and a future-dated record never exceeds full
/// weight. Callers must supply a positive, finite `half_life_days`.
#[must_use]
pub fn decay_factor(
    effective_date: Option<DateTime<Utc>>,
    as_of: DateTime<Utc>,
    half_life_days: f64,
) -> f64 {
    let Some(date) = effective_date else {
        return 1.0;
    };
    let age_days = (as_of - date).num_days();
    let decay = 0.5_f64.powf(age_days as f64 / half_life_days);
    decay.clamp(0.01, 1.0)
}

// ---------------------------------------------------------------------------
// Confidence calibration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    High,
    Moderate,
    Low,
    VeryLow,
}

impl ConfidenceTier {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 4,
            Self::Moderate => 3,
            Self::Low => 2,
            Self::VeryLow => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Moderate => "moderate",
            Self::Low => "low",
            Self::VeryLow => "very_low",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceAssessment {
    pub tier: ConfidenceTier,
    /// Originating score, rounded to 3 decimals.
    pub score: f64,
    pub interpretation: String,
    pub clinical_guidance: String,
}

/// Map a similarity score to a clinical-confidence tier.
///
/// Total over all real inputs, including negatives and values above 1.
/// Thresholds are checked most-specific first.
#[must_use]
pub fn calibrate(score: f64) -> ConfidenceAssessment {
    let (tier, interpretation, clinical_guidance) = if score >= 0.85 {
        (
            ConfidenceTier::High,
            "Strong similarity - high confidence in relevance",
            "Consider as primary reference",
        )
    } else if score >= 0.70 {
        (
            ConfidenceTier::Moderate,
            "Moderate similarity - useful reference",
            "Review carefully for applicability",
        )
    } else if score >= 0.55 {
        (
            ConfidenceTier::Low,
            "Low similarity - consider with caution",
            "May provide limited insight",
        )
    } else {
        (
            ConfidenceTier::VeryLow,
            "Minimal similarity - likely not relevant",
            "Use only for broad context",
        )
    };

    ConfidenceAssessment {
        tier,
        score: round3(score),
        interpretation: interpretation.to_string(),
        clinical_guidance: clinical_guidance.to_string(),
    }
}

/// The core working unit: one retrieval hit joined with its stored record.
///
/// Only constructed when the record lookup succeeds; hits without a
/// resolvable record are dropped, never surfaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredMatch {
    pub encounter_id: EncounterId,
    pub raw_score: f64,
    pub weighted_score: f64,
    pub encounter: EncounterRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<ConfidenceAssessment>,
}

// ---------------------------------------------------------------------------
// Differential aggregation
// ---------------------------------------------------------------------------

// Composite ranking weights. Heuristic, tuned for result sets of roughly
// twenty matches or fewer; the x10 scale keeps the [0, 1] similarity terms
// comparable with the unbounded occurrence count. Tunable, not load-bearing.
const FREQUENCY_WEIGHT: f64 = 0.4;
const AVERAGE_WEIGHT: f64 = 0.4;
const MAX_WEIGHT: f64 = 0.2;
const SIMILARITY_SCALE: f64 = 10.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DifferentialEntry {
    /// Display label: the first-seen original spelling.
    pub diagnosis: String,
    pub count: usize,
    pub average_similarity: f64,
    pub max_similarity: f64,
    pub composite_score: f64,
    /// Contributing encounter ids, one per occurrence, in first-seen order.
    pub encounter_ids: Vec<EncounterId>,
}

struct DiagnosisStats {
    label: String,
    count: usize,
    total_score: f64,
    max_score: f64,
    encounter_ids: Vec<EncounterId>,
}

/// Group and rank the diagnoses mentioned across a match list.
///
/// Aggregation keys are trimmed, case-folded labels. The sort is stable and
/// descending on the rounded composite score, so entries with equal
/// composites keep first-seen order. Defined for an empty match list.
#[must_use]
pub fn rank_differentials(matches: &[ScoredMatch]) -> Vec<DifferentialEntry> {
    let mut order: Vec<DiagnosisStats> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for matched in matches {
        for label in &matched.encounter.diagnoses {
            let key = normalize_label(label);
            let slot = *index.entry(key).or_insert_with(|| {
                order.push(DiagnosisStats {
                    label: label.clone(),
                    count: 0,
                    total_score: 0.0,
                    max_score: 0.0,
                    encounter_ids: Vec::new(),
                });
                order.len() - 1
            });
            let stats = &mut order[slot];
            stats.count += 1;
            stats.total_score += matched.weighted_score;
            if matched.weighted_score > stats.max_score {
                stats.max_score = matched.weighted_score;
            }
            stats.encounter_ids.push(matched.encounter_id.clone());
        }
    }

    let mut ranked: Vec<DifferentialEntry> = order
        .into_iter()
        .map(|stats| {
            let average = stats.total_score / stats.count as f64;
            let composite = stats.count as f64 * FREQUENCY_WEIGHT
                + average * SIMILARITY_SCALE * AVERAGE_WEIGHT
                + stats.max_score * SIMILARITY_SCALE * MAX_WEIGHT;
            DifferentialEntry {
                diagnosis: stats.label,
                count: stats.count,
                average_similarity: round3(average),
                max_similarity: round3(stats.max_score),
                composite_score: round3(composite),
                encounter_ids: stats.encounter_ids,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.composite_score.partial_cmp(&a.composite_score).unwrap_or(Ordering::Equal)
    });
    ranked
}

// ---------------------------------------------------------------------------
// Hallucination guard
// ---------------------------------------------------------------------------

/// Summary block of a generated synthesis. Untrusted input: every field
/// defaults when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SynthesisSummary {
    #[serde(default)]
    pub matches_found: usize,
    #[serde(default)]
    pub confidence: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SimilarCase {
    #[serde(default)]
    pub encounter_id: Option<String>,
}

/// Externally generated narrative, treated as untrusted input to the guard.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SynthesisResult {
    #[serde(default)]
    pub summary: SynthesisSummary,
    #[serde(default)]
    pub clinical_insights: Vec<String>,
    #[serde(default)]
    pub management_outcomes: Vec<String>,
    #[serde(default)]
    pub suggested_next_steps: Vec<String>,
    #[serde(default)]
    pub similar_cases: Vec<SimilarCase>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

const RECOMMEND_PASS: &str = "Safe to present to clinician";
const RECOMMEND_FAIL: &str = "Review carefully - potential hallucinations detected";

/// Number of leading characters of an insight quoted in grounding warnings.
const INSIGHT_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub passes: bool,
    pub risk_level: RiskLevel,
    /// Fail-causing findings.
    pub concerns: Vec<String>,
    /// Non-fail-causing findings.
    pub warnings: Vec<String>,
    pub recommendation: String,
    pub source_match_count: usize,
}

/// Cross-check a generated synthesis against the exact match list it was
/// generated from.
///
/// All checks run independently; warnings never fail the report. Defined
/// for an empty match list without caller special-casing.
#[must_use]
pub fn validate_synthesis(
    synthesis: &SynthesisResult,
    source_matches: &[ScoredMatch],
) -> ValidationReport {
    let mut concerns = Vec::new();
    let mut warnings = Vec::new();
    let actual = source_matches.len();

    let claimed = synthesis.summary.matches_found;
    if claimed != actual {
        concerns.push(format!("Claimed {claimed} matches but {actual} provided"));
    }

    let known_ids: BTreeSet<&str> =
        source_matches.iter().map(|matched| matched.encounter_id.as_str()).collect();
    for case in &synthesis.similar_cases {
        let cited = case.encounter_id.as_deref().unwrap_or("<missing>");
        if !known_ids.contains(cited) {
            concerns.push(format!("Referenced non-existent encounter: {cited}"));
        }
    }

    if synthesis.summary.confidence == "high" && actual < 3 {
        warnings.push("High confidence claimed with fewer than 3 matches".to_string());
    }

    if actual == 0
        && (!synthesis.clinical_insights.is_empty() || !synthesis.management_outcomes.is_empty())
    {
        concerns.push("Generated insights with no matching encounters".to_string());
    }

    let grounded: BTreeSet<String> = source_matches
        .iter()
        .flat_map(|matched| matched.encounter.diagnoses.iter())
        .map(|label| normalize_label(label))
        .collect();
    for insight in &synthesis.clinical_insights {
        let lowered = insight.to_lowercase();
        if !lowered.contains("diagnosed") && !lowered.contains("diagnosis") {
            continue;
        }
        if grounded.is_empty() || grounded.iter().any(|label| lowered.contains(label.as_str())) {
            continue;
        }
        let leading: String = insight.chars().take(INSIGHT_PREVIEW_CHARS).collect();
        warnings.push(format!("Insight mentions diagnosis not found in sources: {leading}..."));
    }

    let passes = concerns.is_empty();
    let risk_level = if passes && warnings.is_empty() {
        RiskLevel::Low
    } else if passes {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    };

    ValidationReport {
        passes,
        risk_level,
        concerns,
        warnings,
        recommendation: if passes { RECOMMEND_PASS } else { RECOMMEND_FAIL }.to_string(),
        source_match_count: actual,
    }
}

// ---------------------------------------------------------------------------
// Composed evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankingOptions {
    /// Temporal half-life in days; must be positive and finite.
    pub half_life_days: f64,
    /// Matches surfaced after truncation; must be at least 1.
    pub top_k: usize,
    /// Owning-institution allow-list; empty means unfiltered.
    pub allowed_institutions: Vec<String>,
    pub as_of: DateTime<Utc>,
}

impl RankingOptions {
    #[must_use]
    pub fn new(as_of: DateTime<Utc>) -> Self {
        Self {
            half_life_days: DEFAULT_HALF_LIFE_DAYS,
            top_k: DEFAULT_TOP_K,
            allowed_institutions: Vec::new(),
            as_of,
        }
    }

    #[must_use]
    pub fn with_half_life_days(mut self, half_life_days: f64) -> Self {
        self.half_life_days = half_life_days;
        self
    }

    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    #[must_use]
    pub fn with_allowed_institutions(mut self, allowed_institutions: Vec<String>) -> Self {
        self.allowed_institutions = allowed_institutions;
        self
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] for a non-positive or non-finite
    /// half-life, or a zero `top_k`.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.half_life_days.is_finite() || self.half_life_days <= 0.0 {
            return Err(CoreError::Validation(
                "half_life_days MUST be positive and finite".to_string(),
            ));
        }
        if self.top_k == 0 {
            return Err(CoreError::Validation("top_k MUST be >= 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Evaluation {
    pub matches: Vec<ScoredMatch>,
    pub differentials: Vec<DifferentialEntry>,
}

/// Rank retrieval hits against their stored records.
///
/// Hits outside the institution allow-list (when one is supplied) and hits
/// whose record id does not resolve in `records` are dropped silently.
/// Survivors are decay-weighted, sorted descending on weighted score
/// (stable), truncated to `top_k`, calibrated, and aggregated into a
/// differential ranking.
///
/// # Errors
/// Returns [`CoreError::Validation`] when the options are rejected.
pub fn evaluate(
    hits: &[RetrievalHit],
    records: &BTreeMap<String, Value>,
    options: &RankingOptions,
) -> Result<Evaluation, CoreError> {
    options.validate()?;
    let allowed: BTreeSet<&str> =
        options.allowed_institutions.iter().map(String::as_str).collect();

    let mut matches = Vec::new();
    for hit in hits {
        if !allowed.is_empty() {
            match hit.institution() {
                Some(institution) if allowed.contains(institution) => {}
                _ => continue,
            }
        }
        let encounter_id = EncounterId::from_hit_id(&hit.id);
        let Some(payload) = records.get(encounter_id.as_str()) else {
            continue;
        };
        let encounter = EncounterRecord::from_value(encounter_id.clone(), payload);
        let decay = decay_factor(encounter.effective_date, options.as_of, options.half_life_days);
        matches.push(ScoredMatch {
            encounter_id,
            raw_score: hit.score,
            weighted_score: hit.score * decay,
            encounter,
            confidence: None,
        });
    }

    matches.sort_by(|a, b| {
        b.weighted_score.partial_cmp(&a.weighted_score).unwrap_or(Ordering::Equal)
    });
    matches.truncate(options.top_k);
    for matched in &mut matches {
        matched.confidence = Some(calibrate(matched.weighted_score));
    }

    let differentials = rank_differentials(&matches);
    Ok(Evaluation { matches, differentials })
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
