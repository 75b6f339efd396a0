use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use keyimport::{
    encrypt_compact, export_public_key_as_jwk, generate_wrapping_key, KeyWrapServer,
    ProtocolConfig, SymmetricKey,
};

// Benchmark: full server phase (JWK decode, CEK transport, TEK wrap, DER encode)
fn bench_wrap_for_import(c: &mut Criterion) {
    let mut group = c.benchmark_group("wrap_for_import");
    let server = KeyWrapServer::new();
    let config = ProtocolConfig::default();

    for bits in [2048usize, 3072, 4096].iter() {
        let private_key = generate_wrapping_key(*bits).expect("Failed to generate wrapping key");
        let jwk = export_public_key_as_jwk("bench", &private_key.to_public_key())
            .expect("Failed to export JWK");
        let tek = SymmetricKey::generate(256).expect("Failed to generate TEK");

        group.bench_with_input(BenchmarkId::from_parameter(bits), bits, |b, _| {
            b.iter(|| {
                server
                    .wrap_for_import(black_box(&jwk), &tek, &config)
                    .expect("Failed to wrap")
            });
        });
    }

    group.finish();
}

// Benchmark: JWE compact encryption per key size
fn bench_jwe_encrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("jwe_encrypt");
    let message = b"Hello from Server! 2024-01-01T00:00:00+00:00";

    for bits in [128usize, 192, 256].iter() {
        let key = SymmetricKey::generate(*bits).expect("Failed to generate key");
        group.bench_with_input(BenchmarkId::from_parameter(bits), bits, |b, _| {
            b.iter(|| encrypt_compact(black_box(message), key.as_slice()).expect("Failed to encrypt"));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_wrap_for_import, bench_jwe_encrypt);
criterion_main!(benches);
