use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use gpr_engine::kernels::GaussianKernel;
use gpr_engine::{GaussianProcessRegressor, InversionMethod};
use ndarray::{Array1, Array2};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;
use std::sync::Arc;

fn training_gp(nt: usize, dim: usize) -> GaussianProcessRegressor<f64> {
    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let xt = Array2::random_using((nt, dim), Uniform::new(0., 5.), &mut rng);
    let yt = xt.map_axis(ndarray::Axis(1), |x| x.mapv(f64::sin).sum());
    let mut gp = GaussianProcessRegressor::new(Arc::new(GaussianKernel::new(1., 1.)));
    gp.set_sigma(1e-2).expect("valid noise");
    for (x, y) in xt.rows().into_iter().zip(yt.iter()) {
        gp.add_sample(&x, &Array1::from_elem(1, *y))
            .expect("sample added");
    }
    gp
}

fn bench_learning(c: &mut Criterion) {
    let mut group = c.benchmark_group("gpr_learning");
    group.sample_size(10);

    let nt = 200;
    for method in [
        InversionMethod::Direct,
        InversionMethod::HighAccuracySvd,
        InversionMethod::FastSvd,
        InversionMethod::SymmetricEigen,
    ] {
        let mut gp = training_gp(nt, 3);
        gp.set_inversion_method(method);
        group.bench_function(BenchmarkId::new(method.to_string(), nt), |b| {
            b.iter(|| gp.compute_regression_vectors().expect("GP learning"));
        });
    }
    group.finish();
}

fn bench_prediction(c: &mut Criterion) {
    let mut group = c.benchmark_group("gpr_prediction");

    for nt in [50, 200, 500] {
        let mut gp = training_gp(nt, 3);
        gp.initialize().expect("GP initialized");
        let x = Array1::from_elem(3, 2.5);
        group.bench_function(BenchmarkId::new("predict", nt), |b| {
            b.iter(|| gp.predict(&x).expect("GP prediction"));
        });
        group.bench_function(BenchmarkId::new("predict_derivative", nt), |b| {
            b.iter(|| gp.predict_derivative(&x).expect("GP derivative prediction"));
        });
        group.bench_function(BenchmarkId::new("credible_interval", nt), |b| {
            b.iter(|| gp.credible_interval(&x).expect("GP credible interval"));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_learning, bench_prediction);
criterion_main!(benches);
