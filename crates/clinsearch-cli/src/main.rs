//! Offline CLI for the clinical semantic-search core.
//!
//! Operates on JSON files so every ranking and validation path can be
//! driven without a vector service or a generation backend: `evaluate`
//! and `validate` run the pure core, `replay` runs the full pipeline
//! against recorded collaborator outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use clinsearch_core::{
    calibrate, decay_factor, evaluate, validate_synthesis, RankingOptions, RetrievalHit,
    ScoredMatch, SynthesisResult, DEFAULT_HALF_LIFE_DAYS, DEFAULT_TOP_K,
};
use clinsearch_pipeline::audit::JsonLinesSink;
use clinsearch_pipeline::{
    CollaboratorError, Embedder, NarrativeGenerator, RecordStore, SearchPipeline, SearchRequest,
    VectorIndex,
};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "clinsearch")]
#[command(about = "Clinical semantic-search evidence ranking and validation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Rank retrieval hits against stored records.
    Evaluate(EvaluateArgs),
    /// Check a generated synthesis against its evidence.
    Validate(ValidateArgs),
    /// Calibrate a single similarity score.
    Calibrate(CalibrateArgs),
    /// Compute a temporal decay factor.
    Decay(DecayArgs),
    /// Run the full pipeline against recorded collaborator outputs.
    Replay(ReplayArgs),
}

#[derive(Debug, Args)]
struct EvaluateArgs {
    /// JSON array of retrieval hits.
    #[arg(long)]
    hits: PathBuf,
    /// JSON object mapping encounter ids to stored payloads.
    #[arg(long)]
    records: PathBuf,
    #[arg(long, default_value_t = DEFAULT_TOP_K)]
    top_k: usize,
    #[arg(long, default_value_t = DEFAULT_HALF_LIFE_DAYS)]
    half_life_days: f64,
    /// Owning-institution allow-list entry; repeatable. Empty means
    /// unfiltered.
    #[arg(long = "institution")]
    institutions: Vec<String>,
    /// Evaluation instant (RFC 3339); defaults to now.
    #[arg(long)]
    as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    /// Generated synthesis JSON.
    #[arg(long)]
    synthesis: PathBuf,
    /// JSON array of the scored matches it was generated from.
    #[arg(long)]
    matches: PathBuf,
}

#[derive(Debug, Args)]
struct CalibrateArgs {
    #[arg(long)]
    score: f64,
}

#[derive(Debug, Args)]
struct DecayArgs {
    /// Record date (RFC 3339); omitted dates score full weight.
    #[arg(long)]
    date: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = DEFAULT_HALF_LIFE_DAYS)]
    half_life_days: f64,
    #[arg(long)]
    as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Args)]
struct ReplayArgs {
    #[arg(long)]
    query: String,
    #[arg(long)]
    hits: PathBuf,
    #[arg(long)]
    records: PathBuf,
    /// Recorded narrative synthesis to replay through the guard.
    #[arg(long)]
    synthesis: PathBuf,
    #[arg(long)]
    specialty: Option<String>,
    #[arg(long)]
    top_k: Option<usize>,
    #[arg(long)]
    half_life_days: Option<f64>,
    #[arg(long = "institution")]
    institutions: Vec<String>,
    #[arg(long)]
    subject_id: Option<String>,
    #[arg(long)]
    as_of: Option<DateTime<Utc>>,
    /// Append audit entries to this JSON-lines file.
    #[arg(long)]
    audit_log: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Evaluate(args) => run_evaluate(&args),
        Command::Validate(args) => run_validate(&args),
        Command::Calibrate(args) => run_calibrate(&args),
        Command::Decay(args) => run_decay(&args),
        Command::Replay(args) => run_replay(&args),
    }
}

fn run_evaluate(args: &EvaluateArgs) -> Result<()> {
    let hits: Vec<RetrievalHit> = read_json(&args.hits)?;
    let records: BTreeMap<String, Value> = read_json(&args.records)?;

    let options = RankingOptions::new(args.as_of.unwrap_or_else(Utc::now))
        .with_top_k(args.top_k)
        .with_half_life_days(args.half_life_days)
        .with_allowed_institutions(args.institutions.clone());
    let evaluation = evaluate(&hits, &records, &options)?;

    emit_json(serde_json::json!({
        "matches": evaluation.matches,
        "differentials": evaluation.differentials,
    }))
}

fn run_validate(args: &ValidateArgs) -> Result<()> {
    let synthesis: SynthesisResult = read_json(&args.synthesis)?;
    let matches: Vec<ScoredMatch> = read_json(&args.matches)?;
    let report = validate_synthesis(&synthesis, &matches);
    emit_json(serde_json::to_value(report)?)
}

fn run_calibrate(args: &CalibrateArgs) -> Result<()> {
    emit_json(serde_json::to_value(calibrate(args.score))?)
}

fn run_decay(args: &DecayArgs) -> Result<()> {
    if !args.half_life_days.is_finite() || args.half_life_days <= 0.0 {
        bail!("--half-life-days MUST be positive and finite");
    }
    let as_of = args.as_of.unwrap_or_else(Utc::now);
    let factor = decay_factor(args.date, as_of, args.half_life_days);
    emit_json(serde_json::json!({
        "decay_factor": factor,
        "half_life_days": args.half_life_days,
        "as_of": as_of.to_rfc3339(),
    }))
}

fn run_replay(args: &ReplayArgs) -> Result<()> {
    let hits: Vec<RetrievalHit> = read_json(&args.hits)?;
    let records: BTreeMap<String, Value> = read_json(&args.records)?;
    let synthesis: SynthesisResult = read_json(&args.synthesis)?;

    let mut pipeline = SearchPipeline::new(
        Arc::new(ReplayEmbedder),
        Arc::new(ReplayIndex { hits }),
        Arc::new(ReplayStore { records }),
        Arc::new(ReplayGenerator { synthesis }),
    );
    if let Some(path) = &args.audit_log {
        pipeline = pipeline.with_audit_sink(Arc::new(JsonLinesSink::new(path)));
    }

    let request = SearchRequest {
        query: args.query.clone(),
        specialty: args.specialty.clone(),
        allowed_institutions: args.institutions.clone(),
        top_k: args.top_k,
        half_life_days: args.half_life_days,
        subject_id: args.subject_id.clone(),
        as_of: args.as_of,
    };
    let outcome = pipeline.run(&request)?;
    emit_json(serde_json::to_value(outcome)?)
}

/// Embedder stand-in for replays: the recorded hit list already fixes the
/// retrieval outcome, so the vector itself is irrelevant.
struct ReplayEmbedder;

impl Embedder for ReplayEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>, CollaboratorError> {
        Ok(Vec::new())
    }
}

struct ReplayIndex {
    hits: Vec<RetrievalHit>,
}

impl VectorIndex for ReplayIndex {
    fn search(&self, _vector: &[f32], count: usize) -> Result<Vec<RetrievalHit>, CollaboratorError> {
        Ok(self.hits.iter().take(count).cloned().collect())
    }
}

struct ReplayStore {
    records: BTreeMap<String, Value>,
}

impl RecordStore for ReplayStore {
    fn fetch(&self, encounter_id: &str) -> Result<Option<Value>, CollaboratorError> {
        Ok(self.records.get(encounter_id).cloned())
    }
}

struct ReplayGenerator {
    synthesis: SynthesisResult,
}

impl NarrativeGenerator for ReplayGenerator {
    fn synthesize(
        &self,
        _query: &str,
        _matches: &[ScoredMatch],
    ) -> Result<SynthesisResult, CollaboratorError> {
        Ok(self.synthesis.clone())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("failed to parse {}", path.display()))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}
