use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use metricforge::{no_grad, Distance, Tensor, TripletSampling, Variable};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn random_batch(n: usize, d: usize, rng: &mut StdRng) -> Variable {
    let data = (0..n * d).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Variable::constant(Tensor::from_vec(data, &[n, d]).unwrap())
}

fn bench_pdist(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);
    let mut group = c.benchmark_group("pdist");
    for &n in &[16usize, 64, 128] {
        let x = random_batch(n, 128, &mut rng);
        for distance in [Distance::Cosine, Distance::Euclidean] {
            group.bench_with_input(BenchmarkId::new(distance.metric_name(), n), &x, |b, x| {
                b.iter(|| no_grad(|| distance.pdist(black_box(x)).unwrap()))
            });
        }
    }
    group.finish();
}

fn bench_sampling(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let mut group = c.benchmark_group("select_triplets");
    for &n in &[16usize, 64] {
        let x = random_batch(n, 32, &mut rng);
        let condensed = no_grad(|| Distance::Euclidean.pdist(&x).unwrap()).tensor();
        let labels: Vec<usize> = (0..n).map(|i| i % 4).collect();
        for sampling in [
            TripletSampling::BatchAll,
            TripletSampling::HardestNegative,
            TripletSampling::HardestPositiveNegative,
        ] {
            group.bench_with_input(BenchmarkId::new(sampling.name(), n), &condensed, |b, condensed| {
                b.iter(|| sampling.select_triplets(black_box(&labels), condensed.data()).unwrap())
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_pdist, bench_sampling);
criterion_main!(benches);
