use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use incluster::{ClusterRegistry, Config, MemoryRegistry, PendingItem, Pipeline, assign};

fn random_unit_vec(dim: usize, seed: u64) -> Vec<f32> {
    let mut v = Vec::with_capacity(dim);
    let mut state = seed;
    for _ in 0..dim {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        v.push(((state >> 33) as f32) / (u32::MAX as f32) - 0.5);
    }
    normalize(&mut v);
    v
}

fn normalize(v: &mut [f32]) {
    let norm: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    if norm > 0.0 {
        let s = (1.0 / norm) as f32;
        for x in v {
            *x *= s;
        }
    }
}

fn make_blob(centroid: &[f32], n: usize, noise: f32, base_seed: u64) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| {
            let r = random_unit_vec(centroid.len(), base_seed.wrapping_add(i as u64 * 997));
            let mut v: Vec<f32> = centroid.iter().zip(&r).map(|(c, x)| c + x * noise).collect();
            normalize(&mut v);
            v
        })
        .collect()
}

fn bench_assign(c: &mut Criterion) {
    let dim = 1536;
    let reg = MemoryRegistry::new(dim, "cluster");
    for seed in 1..=50 {
        reg.add_cluster(random_unit_vec(dim, seed), 10, "").unwrap();
    }
    let snapshot = reg.snapshot();
    let probe = random_unit_vec(dim, 999);

    c.bench_function("incluster_assign_1536d_50clusters", |b| {
        b.iter(|| {
            let _ = black_box(assign(black_box(&probe), &snapshot, 0.6));
        });
    });
}

fn bench_reconcile(c: &mut Criterion) {
    let dim = 256;
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut batch = Vec::new();
    for (k, seed) in [10u64, 20, 30].into_iter().enumerate() {
        let centroid = random_unit_vec(dim, seed);
        for (i, emb) in make_blob(&centroid, 30, 0.05, seed * 100).into_iter().enumerate() {
            batch.push(PendingItem::new(format!("{k}-{i}"), emb));
        }
    }

    c.bench_function("incluster_reconcile_256d_90items_3clusters", |b| {
        b.to_async(&rt).iter_batched(
            || {
                let p = Pipeline::new(Config::new(dim)).unwrap();
                for item in batch.clone() {
                    p.assign(item).unwrap();
                }
                p
            },
            |p| async move {
                let _ = black_box(p.reconcile().await);
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_assign, bench_reconcile);
criterion_main!(benches);
