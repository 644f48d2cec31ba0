//! Benchmarks for the admission limiter and the in-memory job store.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use chrono::Utc;
use relay_core::config::RateLimitSettings;
use relay_core::jobs::{InMemoryJobStore, JobStore, NewJob, RetryPolicy};
use relay_core::limiter::{AdmissionLimiter, InMemoryWindowStore, WindowStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn bench_window_try_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_try_acquire");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for keys in [1u64, 100, 10_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(keys), &keys, |b, &keys| {
            let store = InMemoryWindowStore::new();
            let counter = AtomicU64::new(0);
            b.to_async(&rt).iter(|| {
                let key = format!("tenant-{}", counter.fetch_add(1, Ordering::Relaxed) % keys);
                let store = &store;
                async move {
                    black_box(store.try_acquire(&key, u32::MAX, Duration::from_secs(1), Utc::now().timestamp_millis()).await.unwrap());
                }
            });
        });
    }
    group.finish();
}

fn bench_limiter_fast_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("limiter_fast_path");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = AdmissionLimiter::in_memory("bench", RateLimitSettings { requests: u32::MAX, window_ms: 1000 });
    let counter = AtomicU64::new(0);
    group.bench_function("acquire_distinct_keys", |b| {
        b.to_async(&rt).iter(|| {
            let key = format!("tenant-{}", counter.fetch_add(1, Ordering::Relaxed) % 1000);
            let limiter = limiter.clone();
            async move { black_box(limiter.acquire(&key).await) }
        });
    });
    group.finish();
}

fn bench_job_store_enqueue_lease(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_store");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryJobStore::new();
    let counter = AtomicU64::new(0);
    group.bench_function("enqueue_then_lease", |b| {
        b.to_async(&rt).iter(|| {
            let key = format!("fax-{}", counter.fetch_add(1, Ordering::Relaxed));
            let store = &store;
            async move {
                let now = Utc::now();
                let job = NewJob { job_type: "fax".to_string(), idempotency_key: key, payload: serde_json::json!({}), max_attempts: 3 };
                store.enqueue(job, now).await.unwrap();
                black_box(store.lease("fax", "bench", Duration::from_secs(30), now).await.unwrap());
            }
        });
    });
    group.finish();
}

fn bench_retry_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(300));
    c.bench_function("retry_backoff_for", |b| { b.iter(|| { for attempts in 1..=10 { black_box(policy.backoff_for(black_box(attempts))); } }); });
}

criterion_group!(benches, bench_window_try_acquire, bench_limiter_fast_path, bench_job_store_enqueue_lease, bench_retry_backoff);
criterion_main!(benches);
