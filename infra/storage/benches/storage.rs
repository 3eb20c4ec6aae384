use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use lockbox_storage::locking::{decode_marker_name, marker_file_name};
use lockbox_storage::{Compression, Storage};
use std::hint::black_box;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Benchmark: Key Resolution & Marker Naming
// ============================================================================

fn bench_key_mapping(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_mapping");

    let temp = TempDir::new().unwrap();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let storage = rt.block_on(async { Storage::builder().root(temp.path()).connect().await.unwrap() });

    group.bench_function("resolve_nested", |b| {
        b.iter(|| {
            black_box(storage.filename("certificates/acme/example.com/example.com.crt").unwrap());
        });
    });

    group.bench_function("marker_name", |b| {
        b.iter(|| black_box(marker_file_name(black_box("issue_cert_*.Example.com"))));
    });

    let encoded = marker_file_name("issue_cert_*.Example.com");
    group.bench_function("marker_decode", |b| {
        b.iter(|| black_box(decode_marker_name(black_box(&encoded))));
    });

    group.finish();
}

// ============================================================================
// Benchmark: Value I/O
// ============================================================================

fn bench_value_io(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_io");
    group.measurement_time(Duration::from_secs(10));

    let temp = TempDir::new().unwrap();
    let rt = tokio::runtime::Runtime::new().unwrap();

    let sizes = [("1KB", 1024), ("10KB", 10 * 1024), ("100KB", 100 * 1024)];

    for (compression, label) in [(Compression::None, "plain"), (Compression::Lz4, "lz4")] {
        let storage = rt.block_on(async {
            Storage::builder()
                .root(temp.path().join(label))
                .compression(compression)
                .connect()
                .await
                .unwrap()
        });

        for (name, size) in sizes {
            let data: Vec<u8> = (0..size).map(|i| u8::try_from(i % 256).unwrap()).collect();
            group.throughput(Throughput::Bytes(u64::try_from(size).unwrap_or(u64::MAX)));

            let key = format!("bench/{name}.dat");
            group.bench_with_input(BenchmarkId::new(format!("store_{label}"), name), &data, |b, data| {
                b.to_async(&rt).iter(|| async { storage.store(&key, data).await.unwrap() });
            });

            group.bench_function(BenchmarkId::new(format!("load_{label}"), name), |b| {
                b.to_async(&rt).iter(|| async { black_box(storage.load(&key).await.unwrap()) });
            });
        }
    }

    group.finish();
}

// ============================================================================
// Benchmark: Lock Round Trips
// ============================================================================

fn bench_locking(c: &mut Criterion) {
    let mut group = c.benchmark_group("locking");

    let temp = TempDir::new().unwrap();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let storage = rt.block_on(async { Storage::builder().root(temp.path()).connect().await.unwrap() });

    group.bench_function("lock_unlock", |b| {
        b.to_async(&rt).iter(|| async {
            storage.lock("cert/example.com").await.unwrap();
            storage.unlock("cert/example.com").unwrap();
        });
    });

    group.bench_function("list_markers", |b| {
        rt.block_on(async {
            for i in 0..32 {
                storage.lock(&format!("held/{i}")).await.unwrap();
            }
        });
        b.to_async(&rt).iter(|| async { black_box(storage.locks().await.unwrap()) });
        storage.unlock_all_obtained();
    });

    group.finish();
}

criterion_group!(benches, bench_key_mapping, bench_value_io, bench_locking);
criterion_main!(benches);
