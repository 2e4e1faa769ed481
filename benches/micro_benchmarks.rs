//! # Micro Benchmarks
//!
//! Hashing, dedup and payload parsing on the ingest side.
//!
//! Run with: `cargo bench --bench micro_benchmarks`

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeMap;
use std::sync::Arc;
use tweetpace::{current_time_ms, DedupSet, RawHash, TweetIngestor, TweetRecord};

fn payload(entries: usize) -> Vec<u8> {
    let data: Vec<String> = (0..entries)
        .map(|i| {
            format!(
                r#"{{"id":"{}","author_id":"{}","created_at":"2024-05-13T09:30:00Z","text":"post number {}","public_metrics":{{"like_count":{},"retweet_count":1}}}}"#,
                i,
                i % 7,
                i,
                i * 3
            )
        })
        .collect();
    let users: Vec<String> = (0..7)
        .map(|i| format!(r#"{{"id":"{}","username":"user{}"}}"#, i, i))
        .collect();
    format!(
        r#"{{"data":[{}],"includes":{{"users":[{}]}},"meta":{{"next_token":"abc"}}}}"#,
        data.join(","),
        users.join(",")
    )
    .into_bytes()
}

fn record(i: usize) -> TweetRecord {
    let id = i.to_string();
    TweetRecord {
        raw_hash: RawHash::of(id.as_bytes()),
        id,
        author_id: "1".to_string(),
        username: None,
        created_at: Utc::now(),
        text: "bench".to_string(),
        engagement_metrics: BTreeMap::new(),
        is_retweet: false,
        is_quote: false,
        scraped_at: Utc::now(),
    }
}

fn bench_hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("raw_hash");

    for size in [64usize, 512, 4096] {
        let bytes = vec![b'x'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| black_box(RawHash::of(bytes)));
        });
    }

    group.finish();
}

fn bench_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup");
    let records: Vec<TweetRecord> = (0..1000).map(record).collect();

    group.throughput(Throughput::Elements(records.len() as u64));
    group.bench_function("insert_fresh", |b| {
        b.iter_batched(
            DedupSet::new,
            |set| {
                for record in &records {
                    black_box(set.try_insert(record));
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("insert_duplicate", |b| {
        let set = DedupSet::new();
        for record in &records {
            set.try_insert(record);
        }
        b.iter(|| {
            for record in &records {
                black_box(set.try_insert(record));
            }
        });
    });

    group.bench_function("insert_with_eviction", |b| {
        b.iter_batched(
            || DedupSet::with_capacity(100),
            |set| {
                for record in &records {
                    black_box(set.try_insert(record));
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");

    for entries in [10usize, 100] {
        let body = payload(entries);
        group.throughput(Throughput::Elements(entries as u64));
        group.bench_with_input(BenchmarkId::from_parameter(entries), &body, |b, body| {
            b.iter_batched(
                || TweetIngestor::new(Arc::new(DedupSet::new())),
                |ingestor| black_box(ingestor.ingest(body)),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_export(c: &mut Criterion) {
    let ingestor = TweetIngestor::new(Arc::new(DedupSet::new()));
    let batch = ingestor.ingest(&payload(1)).unwrap();
    let record = batch.records[0].clone();

    c.bench_function("export_row_json", |b| {
        b.iter(|| black_box(serde_json::to_string(&record.to_export_map())))
    });
}

fn bench_clock(c: &mut Criterion) {
    c.bench_function("current_time_ms", |b| b.iter(|| black_box(current_time_ms())));
}

criterion_group!(
    benches,
    bench_hashing,
    bench_dedup,
    bench_ingest,
    bench_export,
    bench_clock,
);
criterion_main!(benches);
