use chrono::{TimeZone, Utc};
use criterion::{criterion_group, criterion_main, Criterion};
use std::collections::BTreeMap;

use clinsearch_core::{evaluate, rank_differentials, RankingOptions, RetrievalHit, ScoredMatch};

const DIAGNOSES: &[&str] = &[
    "Acute Myocardial Infarction (STEMI)",
    "Congestive Heart Failure (CHF)",
    "Migraine with Aura",
    "Community-Acquired Pneumonia",
    "Sepsis",
];

fn mk_hits(count: usize) -> Vec<RetrievalHit> {
    (0..count)
        .map(|index| RetrievalHit {
            id: format!("encounter:E{index}"),
            score: 0.5 + (index % 50) as f64 / 100.0,
            metadata: serde_json::json!({ "hospital_id": format!("H{}", index % 4) }),
        })
        .collect()
}

fn mk_records(count: usize) -> BTreeMap<String, serde_json::Value> {
    (0..count)
        .map(|index| {
            (
                format!("E{index}"),
                serde_json::json!({
                    "encounter_date": "2024-11-10",
                    "diagnosis": DIAGNOSES[index % DIAGNOSES.len()],
                    "chief_complaint": "benchmark fixture",
                }),
            )
        })
        .collect()
}

fn mk_matches(count: usize) -> Vec<ScoredMatch> {
    let hits = mk_hits(count);
    let records = mk_records(count);
    let as_of = Utc
        .with_ymd_and_hms(2025, 6, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(|| unreachable!());
    let options = RankingOptions::new(as_of).with_top_k(count.max(1));
    evaluate(&hits, &records, &options)
        .map(|evaluation| evaluation.matches)
        .unwrap_or_else(|_| unreachable!())
}

fn bench_evaluate(c: &mut Criterion) {
    let hits = mk_hits(300);
    let records = mk_records(300);
    let as_of = Utc
        .with_ymd_and_hms(2025, 6, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(|| unreachable!());
    let options = RankingOptions::new(as_of).with_top_k(20);

    c.bench_function("evaluate_300_hits_top_20", |b| {
        b.iter(|| evaluate(&hits, &records, &options));
    });
}

fn bench_rank_differentials(c: &mut Criterion) {
    let matches = mk_matches(100);

    c.bench_function("rank_differentials_100_matches", |b| {
        b.iter(|| rank_differentials(&matches));
    });
}

criterion_group!(benches, bench_evaluate, bench_rank_differentials);
criterion_main!(benches);
