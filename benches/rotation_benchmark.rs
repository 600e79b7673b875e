//! Cost of key lifecycle operations.
//!
//! Rotation is dominated by capability key generation, so it is measured
//! per modulus size. Re-wrapping a DEK onto a new KEK never touches the
//! payload and should stay in the microsecond range regardless of size.
//!
//! Run with: `cargo bench --bench rotation_benchmark`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode};
use genvault::{EnvelopeCodec, EnvelopeKeyManager, ManagerConfig, PaillierScheme, Value};

fn benchmark_rotate(c: &mut Criterion) {
    let mut group = c.benchmark_group("rotate");
    group.sampling_mode(SamplingMode::Flat);
    group.sample_size(10);

    for bits in [512usize, 1024, 2048] {
        let manager = EnvelopeKeyManager::new(
            ManagerConfig::default(),
            Arc::new(PaillierScheme::with_modulus_bits(bits)),
        )
        .unwrap();
        group.bench_function(BenchmarkId::from_parameter(bits), |b| {
            b.iter(|| manager.rotate().unwrap())
        });
    }
    group.finish();
}

fn benchmark_reencrypt(c: &mut Criterion) {
    let manager = EnvelopeKeyManager::new(
        ManagerConfig::default(),
        Arc::new(PaillierScheme::with_modulus_bits(512)),
    )
    .unwrap();
    manager.rotate().unwrap();

    let codec = EnvelopeCodec::default();
    let package = codec
        .seal(&Value::Text("y".repeat(10 * 1024)), &manager)
        .unwrap();
    manager.rotate().unwrap();

    c.bench_function("reencrypt_dek_10kb_payload", |b| {
        b.iter(|| manager.reencrypt_dek(black_box(package.wrapped_dek())).unwrap())
    });
}

criterion_group!(benches, benchmark_rotate, benchmark_reencrypt);
criterion_main!(benches);
