use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use utils::test_utils::generate_random_batch;
use vq::quantizer::{VectorQuantizer, VectorQuantizerConfig};

fn bench_forward(c: &mut Criterion) {
    env_logger::init();
    let mut group = c.benchmark_group("VQ Forward");
    for dim in [16, 64].iter() {
        for num_codes in [64, 256].iter() {
            for use_rotation in [false, true].iter() {
                let mut quantizer = VectorQuantizer::new(VectorQuantizerConfig {
                    num_codes: *num_codes,
                    dim: *dim,
                    commitment_cost: 0.25,
                    use_rotation: *use_rotation,
                    ema_decay: 0.99,
                })
                .expect("Failed to build VectorQuantizer");
                let batch = generate_random_batch(64, *dim);

                group.bench_with_input(
                    BenchmarkId::new(
                        &format!("forward_{}_{}", *dim, *num_codes),
                        &format!("rotation_{}", *use_rotation),
                    ),
                    use_rotation,
                    |bencher, _| {
                        bencher.iter(|| quantizer.forward(black_box(batch.view())))
                    },
                );
            }
        }
    }
    group.finish();
}

criterion_group!(benches, bench_forward);
criterion_main!(benches);
