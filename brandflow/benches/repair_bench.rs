//! Benchmarks for output repair and error classification.

use brandflow::errors::{classify, Failure};
use brandflow::pipeline::{JsonRepair, OutputRepair};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn opportunities(n: usize) -> String {
    let entries: Vec<String> = (1..=n)
        .map(|i| format!("  {{\"title\": \"Opportunity {i}\", \"score\": {i}}}"))
        .collect();
    format!("```json\n{{\"opportunities\": [\n{}\n],}}\n```", entries.join("\n"))
}

fn repair_benchmark(c: &mut Criterion) {
    let repairer = JsonRepair::new();
    let valid = r#"{"opportunities": [{"title": "a"}, {"title": "b"}]}"#;
    let broken = opportunities(5);

    c.bench_function("repair_valid_passthrough", |b| {
        b.iter(|| repairer.repair(black_box(valid)));
    });
    c.bench_function("repair_fenced_missing_separators", |b| {
        b.iter(|| repairer.repair(black_box(&broken)));
    });
}

fn classify_benchmark(c: &mut Criterion) {
    let messages = [
        Failure::new("OpenRouter returned 429: rate limit exceeded"),
        Failure::new("Failed to extract text from PDF"),
        Failure::new("something nobody anticipated"),
        Failure::timeout("generation provider call timed out after 120000ms"),
    ];

    c.bench_function("classify_mixed", |b| {
        b.iter(|| {
            for failure in &messages {
                black_box(classify(black_box(failure), 2));
            }
        });
    });
}

criterion_group!(benches, repair_benchmark, classify_benchmark);
criterion_main!(benches);
