//! Benchmarks for artifact encoding and checkpoint publish throughput

use bytes::Bytes;
use checkpoint::{artifact, ArtifactManifest, CheckpointManager};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mesh::{AxisRule, MeshAxis, MeshSpec, RuleTable};
use runtime_core::config::CheckpointSettings;
use std::sync::Arc;
use storage::{LocalStorage, StorageBackend};
use tempfile::TempDir;

fn bench_manifest() -> ArtifactManifest {
    let mesh = MeshSpec::build(
        vec![
            MeshAxis::new("data", 4).unwrap(),
            MeshAxis::new("model", 2).unwrap(),
        ],
        8,
    )
    .unwrap();
    let rules = RuleTable::new(vec![AxisRule::new("batch", vec!["data".to_string()])]);
    ArtifactManifest::new("bench", &mesh, &rules, Vec::new())
}

fn artifact_encode_benchmark(c: &mut Criterion) {
    let manifest = bench_manifest();
    let mut group = c.benchmark_group("artifact_encode");

    for size in [1_000_000usize, 10_000_000, 100_000_000] {
        let payload = vec![7u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{}MB", size / 1_000_000), |b| {
            b.iter(|| artifact::encode(1000, &manifest, &payload).unwrap());
        });
    }

    group.finish();
}

fn artifact_decode_benchmark(c: &mut Criterion) {
    let manifest = bench_manifest();
    let mut group = c.benchmark_group("artifact_decode");

    for size in [1_000_000usize, 10_000_000, 100_000_000] {
        let payload = vec![7u8; size];
        let encoded = artifact::encode(1000, &manifest, &payload).unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{}MB", size / 1_000_000), |b| {
            b.iter(|| artifact::decode("bench.ckpt", &encoded).unwrap());
        });
    }

    group.finish();
}

fn checkpoint_publish_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let manifest = bench_manifest();

    let mut group = c.benchmark_group("checkpoint_publish");
    group.sample_size(10);

    for size in [1_000_000usize, 10_000_000] {
        let payload = Bytes::from(vec![7u8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("publish", format!("{}MB", size / 1_000_000)),
            &payload,
            |b, payload| {
                b.to_async(&rt).iter(|| async {
                    let dir = TempDir::new().unwrap();
                    let storage: Arc<dyn StorageBackend> =
                        Arc::new(LocalStorage::new(dir.path()));
                    let manager = CheckpointManager::open(
                        "bench/checkpoints",
                        CheckpointSettings::default(),
                        storage,
                    )
                    .await
                    .unwrap();
                    manager.save(1000, &manifest, payload).await.unwrap();
                    manager.close().await.unwrap();
                });
            },
        );
    }

    group.finish();
}

fn directory_scan_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let manifest = bench_manifest();

    let mut group = c.benchmark_group("directory_scan");
    group.sample_size(10);

    for count in [10u64, 100] {
        // Seed a directory with `count` published artifacts.
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
        rt.block_on(async {
            let manager = CheckpointManager::open(
                "bench/checkpoints",
                CheckpointSettings {
                    max_to_keep: 0,
                    ..CheckpointSettings::default()
                },
                storage.clone(),
            )
            .await
            .unwrap();
            for step in 1..=count {
                manager
                    .save(step * 1000, &manifest, &[7u8; 4096])
                    .await
                    .unwrap();
            }
            manager.close().await.unwrap();
        });

        group.bench_with_input(
            BenchmarkId::from_parameter(count),
            &count,
            |b, _count| {
                b.to_async(&rt).iter(|| async {
                    let manager = CheckpointManager::open(
                        "bench/checkpoints",
                        CheckpointSettings {
                            max_to_keep: 0,
                            ..CheckpointSettings::default()
                        },
                        storage.clone(),
                    )
                    .await
                    .unwrap();
                    manager.close().await.unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    artifact_encode_benchmark,
    artifact_decode_benchmark,
    checkpoint_publish_benchmark,
    directory_scan_benchmark,
);
criterion_main!(benches);
