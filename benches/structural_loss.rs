use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{Array2, Array3};

use foldloss::codec::NUM_ANGLES;
use foldloss::config::{LossConfig, Parallelism};
use foldloss::geometry::BackboneGeometry;
use foldloss::loss::structural_loss_report;
use foldloss::nerf::build_backbone;
use foldloss::synthetic::{perturb_batch, random_angle_batch};

fn make_pair(batch: usize, len: usize, seed: u64) -> (Array3<f32>, Array3<f32>) {
    let (gold, lens) = random_angle_batch(batch, len, len / 2, seed).unwrap();
    let pred = perturb_batch(&gold, &lens, 0.3, seed + 1).unwrap();
    (pred, gold)
}

fn bench_nerf(c: &mut Criterion) {
    let mut group = c.benchmark_group("nerf_build");
    let geom = BackboneGeometry::default();
    for &len in &[64usize, 256, 1024] {
        let angles = Array2::<f32>::from_shape_fn((len, NUM_ANGLES), |(i, k)| {
            0.3 * ((i * 7 + k * 3) % 11) as f32 - 1.5
        });
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| build_backbone(black_box(&angles.view()), &geom).unwrap())
        });
    }
    group.finish();
}

fn bench_batch_loss(c: &mut Criterion) {
    let mut group = c.benchmark_group("structural_loss_batch");
    group.sample_size(20);

    for &(batch, len) in &[(8usize, 64usize), (32, 64), (32, 128)] {
        let (pred, gold) = make_pair(batch, len, 17);
        for (name, parallelism) in [
            ("sequential", Parallelism::Sequential),
            ("rayon", Parallelism::Rayon),
        ] {
            let cfg = LossConfig {
                parallelism,
                ..LossConfig::default()
            };
            group.bench_with_input(
                BenchmarkId::new(name, format!("b{batch}_l{len}")),
                &(batch, len),
                |b, _| {
                    b.iter(|| {
                        structural_loss_report(&pred.view(), &gold.view(), None, &cfg).unwrap()
                    })
                },
            );
        }
    }
    group.finish();
}

#[cfg(feature = "burn")]
fn bench_burn_loss(c: &mut Criterion) {
    use burn_core::tensor::backend::Backend;
    use burn_ndarray::NdArray;
    use foldloss::burn_structure::{ndarray_to_burn_3, structural_loss};
    use foldloss::burn_train::BurnBackend;

    let mut group = c.benchmark_group("burn_structural_loss");
    group.sample_size(10);
    let geom = BackboneGeometry::default();

    for &(batch, len) in &[(8usize, 32usize), (8, 64)] {
        let (pred, gold) = make_pair(batch, len, 29);

        let device = <NdArray<f32> as Backend>::Device::default();
        group.bench_with_input(
            BenchmarkId::new("forward", format!("b{batch}_l{len}")),
            &(batch, len),
            |b, _| {
                b.iter(|| {
                    let p = ndarray_to_burn_3::<NdArray<f32>>(&device, &pred);
                    let g = ndarray_to_burn_3::<NdArray<f32>>(&device, &gold);
                    structural_loss(p, g, &geom, &device).unwrap()
                })
            },
        );

        let device = <BurnBackend as Backend>::Device::default();
        group.bench_with_input(
            BenchmarkId::new("forward_backward", format!("b{batch}_l{len}")),
            &(batch, len),
            |b, _| {
                b.iter(|| {
                    let p = ndarray_to_burn_3::<BurnBackend>(&device, &pred).require_grad();
                    let g = ndarray_to_burn_3::<BurnBackend>(&device, &gold);
                    structural_loss(p, g, &geom, &device).unwrap().backward()
                })
            },
        );
    }
    group.finish();
}

#[cfg(feature = "burn")]
criterion_group!(benches, bench_nerf, bench_batch_loss, bench_burn_loss);
#[cfg(not(feature = "burn"))]
criterion_group!(benches, bench_nerf, bench_batch_loss);
criterion_main!(benches);
