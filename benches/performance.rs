use agent_relay::{
    AuthMethod, RateTracker, ResponseCache, Router, estimate_tokens, fingerprint, truncate_middle,
};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

// Benchmark: fingerprint computation with varying prompt sizes
fn bench_fingerprint_by_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint_by_size");

    for size in [10, 100, 1000, 10000].iter() {
        let prompt = "a".repeat(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &prompt, |b, p| {
            b.iter(|| fingerprint(black_box(p), black_box("gemini-2.5-flash")));
        });
    }

    group.finish();
}

// Benchmark: cache get/set with LRU promotion at varying fill levels
fn bench_cache_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_operations");

    for entries in [10, 50, 100].iter() {
        let mut cache = ResponseCache::new(100, 3600);
        for i in 0..*entries {
            cache.set(&format!("prompt {}", i), "gemini-2.5-flash", "response", None);
        }
        group.bench_with_input(
            BenchmarkId::new("get_hit", entries),
            &entries,
            |b, _| {
                b.iter(|| cache.get(black_box("prompt 0"), black_box("gemini-2.5-flash")));
            },
        );
    }

    group.finish();
}

// Benchmark: full set-with-eviction cycle on a bounded cache
fn bench_cache_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_eviction");

    group.bench_function("set_evicting", |b| {
        let mut cache = ResponseCache::new(50, 3600);
        let mut i = 0u64;
        b.iter(|| {
            cache.set(&format!("prompt {}", i), "gemini-2.5-flash", "response", None);
            i += 1;
        });
    });

    group.finish();
}

// Benchmark: complexity classification over varying task text
fn bench_router_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("router_classify");
    let router = Router::default();

    let cases = [
        ("trivial", "what is 2+2"),
        ("standard", "summarize the changes in this repository"),
        (
            "complex",
            "refactor the storage layer to use a distributed consensus protocol",
        ),
    ];
    for (name, task) in cases {
        group.bench_with_input(BenchmarkId::from_parameter(name), &task, |b, t| {
            b.iter(|| router.classify(black_box(t), None));
        });
    }

    group.finish();
}

// Benchmark: full selection including the tracker read
fn bench_router_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("router_select");
    let router = Router::default();

    group.bench_function("select_trivial", |b| {
        let mut tracker = RateTracker::default();
        b.iter(|| {
            router.select(
                black_box("what is 2+2"),
                Some("ask_gemini"),
                None,
                false,
                AuthMethod::OAuth,
                &mut tracker,
            )
        });
    });

    group.finish();
}

// Benchmark: token estimation and mid-truncation on large payloads
fn bench_text_shaping(c: &mut Criterion) {
    let mut group = c.benchmark_group("text_shaping");

    for size in [1000, 10000, 100000].iter() {
        let text = "x".repeat(*size);
        group.bench_with_input(BenchmarkId::new("estimate", size), &text, |b, t| {
            b.iter(|| estimate_tokens(black_box(t)));
        });
        group.bench_with_input(BenchmarkId::new("truncate_middle", size), &text, |b, t| {
            b.iter(|| truncate_middle(black_box(t), black_box(2000)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_fingerprint_by_size,
    bench_cache_operations,
    bench_cache_eviction,
    bench_router_classify,
    bench_router_select,
    bench_text_shaping,
);
criterion_main!(benches);
