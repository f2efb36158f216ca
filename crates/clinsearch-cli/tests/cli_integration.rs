use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_clinsearch<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_clinsearch"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute clinsearch binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_clinsearch(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "clinsearch command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn write_json(dir: &Path, name: &str, value: &Value) -> PathBuf {
    let path = dir.join(name);
    let body = serde_json::to_string_pretty(value)
        .unwrap_or_else(|err| panic!("failed to serialize fixture {name}: {err}"));
    fs::write(&path, body)
        .unwrap_or_else(|err| panic!("failed to write fixture {}: {err}", path.display()));
    path
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn fixture_hits() -> Value {
    json!([
        {
            "id": "encounter:A",
            "score": 0.9,
            "metadata": { "hospital_id": "CITY_GEN_01" }
        },
        {
            "id": "encounter:B",
            "score": 0.72,
            "metadata": { "hospital_id": "CITY_GEN_01" }
        },
        {
            "id": "encounter:C",
            "score": 0.4,
            "metadata": { "hospital_id": "WEST_NEURO_05" }
        }
    ])
}

fn fixture_records() -> Value {
    json!({
        "A": { "diagnosis": "sepsis", "chief_complaint": "fever and hypotension" },
        "B": { "diagnosis": "sepsis" },
        "C": { "diagnosis": "flu" }
    })
}

// Test IDs: TCLI-001
#[test]
fn evaluate_ranks_and_calibrates_fixture_hits() {
    let dir = unique_temp_dir("clinsearch-evaluate");
    let hits = write_json(&dir, "hits.json", &fixture_hits());
    let records = write_json(&dir, "records.json", &fixture_records());

    let payload = run_json([
        "evaluate",
        "--hits",
        path_str(&hits),
        "--records",
        path_str(&records),
        "--as-of",
        "2025-06-01T00:00:00Z",
    ]);

    assert_eq!(as_str(&payload, "contract_version"), "cli.v1");

    let matches = payload
        .get("matches")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing matches array: {payload}"));
    assert_eq!(matches.len(), 3);
    assert_eq!(as_str(&matches[0], "encounter_id"), "A");

    let tiers: Vec<&str> = matches
        .iter()
        .map(|m| {
            m.get("confidence")
                .and_then(|c| c.get("tier"))
                .and_then(Value::as_str)
                .unwrap_or_else(|| panic!("missing confidence tier: {m}"))
        })
        .collect();
    assert_eq!(tiers, vec!["high", "moderate", "very_low"]);

    let differentials = payload
        .get("differentials")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing differentials array: {payload}"));
    assert_eq!(as_str(&differentials[0], "diagnosis"), "sepsis");
    assert_eq!(as_str(&differentials[1], "diagnosis"), "flu");

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-002
#[test]
fn evaluate_applies_half_life_decay_with_pinned_as_of() {
    let dir = unique_temp_dir("clinsearch-decay-eval");
    let hits = write_json(
        &dir,
        "hits.json",
        &json!([{ "id": "encounter:A", "score": 1.0 }]),
    );
    let records = write_json(
        &dir,
        "records.json",
        &json!({ "A": { "encounter_date": "2024-06-01T00:00:00Z", "diagnosis": "sepsis" } }),
    );

    let payload = run_json([
        "evaluate",
        "--hits",
        path_str(&hits),
        "--records",
        path_str(&records),
        "--as-of",
        "2025-06-01T00:00:00Z",
    ]);

    let weighted = payload
        .pointer("/matches/0/weighted_score")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| panic!("missing weighted_score: {payload}"));
    assert!(
        (weighted - 0.5).abs() < 0.01,
        "one half-life should decay to ~0.5, got {weighted}"
    );

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-003
#[test]
fn validate_flags_citations_outside_the_evidence() {
    let dir = unique_temp_dir("clinsearch-validate");
    let synthesis = write_json(
        &dir,
        "synthesis.json",
        &json!({
            "summary": { "matches_found": 0, "confidence": "low" },
            "similar_cases": [{ "encounter_id": "GHOST" }]
        }),
    );
    let matches = write_json(&dir, "matches.json", &json!([]));

    let payload = run_json([
        "validate",
        "--synthesis",
        path_str(&synthesis),
        "--matches",
        path_str(&matches),
    ]);

    assert_eq!(payload.get("passes"), Some(&Value::Bool(false)));
    assert_eq!(as_str(&payload, "risk_level"), "high");
    let concerns = payload
        .get("concerns")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing concerns: {payload}"));
    assert_eq!(concerns.len(), 1);
    assert!(concerns[0]
        .as_str()
        .unwrap_or_else(|| panic!("concern should be a string"))
        .contains("GHOST"));

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-004
#[test]
fn calibrate_and_decay_report_core_outputs() {
    let payload = run_json(["calibrate", "--score", "0.9"]);
    assert_eq!(as_str(&payload, "tier"), "high");
    assert_eq!(as_str(&payload, "clinical_guidance"), "Consider as primary reference");

    let payload = run_json(["decay", "--half-life-days", "365"]);
    let factor = payload
        .get("decay_factor")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| panic!("missing decay_factor: {payload}"));
    assert!((factor - 1.0).abs() < f64::EPSILON, "undated decay should be 1.0, got {factor}");
}

// Test IDs: TCLI-005
#[test]
fn replay_runs_the_pipeline_and_writes_the_audit_trail() {
    let dir = unique_temp_dir("clinsearch-replay");
    let hits = write_json(&dir, "hits.json", &fixture_hits());
    let records = write_json(&dir, "records.json", &fixture_records());
    let synthesis = write_json(
        &dir,
        "synthesis.json",
        &json!({
            "summary": { "matches_found": 3, "confidence": "moderate" },
            "clinical_insights": ["Most similar cases were diagnosed with sepsis"],
            "similar_cases": [
                { "encounter_id": "A" },
                { "encounter_id": "B" },
                { "encounter_id": "C" }
            ]
        }),
    );
    let audit_log = dir.join("audit.jsonl");

    let payload = run_json([
        "replay",
        "--query",
        "febrile patient with hypotension",
        "--hits",
        path_str(&hits),
        "--records",
        path_str(&records),
        "--synthesis",
        path_str(&synthesis),
        "--specialty",
        "infectious",
        "--as-of",
        "2025-06-01T00:00:00Z",
        "--audit-log",
        path_str(&audit_log),
    ]);

    assert_eq!(payload.pointer("/guard/passes"), Some(&Value::Bool(true)));
    assert_eq!(
        payload.pointer("/guard/risk_level").and_then(Value::as_str),
        Some("low")
    );
    assert_eq!(
        payload.pointer("/differentials/0/diagnosis").and_then(Value::as_str),
        Some("sepsis")
    );

    let audit_body = fs::read_to_string(&audit_log)
        .unwrap_or_else(|err| panic!("audit log should exist: {err}"));
    let lines: Vec<&str> = audit_body.lines().collect();
    assert_eq!(lines.len(), 1);
    let entry: Value = serde_json::from_str(lines[0])
        .unwrap_or_else(|err| panic!("audit line is not valid JSON: {err}"));
    assert_eq!(as_str(&entry, "action"), "search_advanced");
    assert_eq!(as_str(&entry, "user_id"), "anonymous");
    assert_eq!(entry.pointer("/result/guard_passes"), Some(&Value::Bool(true)));

    let _ = fs::remove_dir_all(&dir);
}
