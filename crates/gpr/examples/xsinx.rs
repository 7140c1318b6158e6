use gpr_engine::kernels::GaussianKernel;
use gpr_engine::{GaussianProcessRegressor, InversionMethod};
use linfa::prelude::*;
use ndarray::{arr2, concatenate, Array, Array2, Axis};
use std::sync::Arc;

fn xsinx(x: &Array2<f64>) -> Array2<f64> {
    (x - 3.5) * ((x - 3.5) / std::f64::consts::PI).mapv(|v| v.sin())
}

fn main() {
    let env = env_logger::Env::new().filter_or("GPR_LOG", "info");
    env_logger::Builder::from_env(env).init();

    let xt = arr2(&[[0.0], [5.0], [10.0], [15.0], [18.0], [20.0], [25.0]]);
    let yt = xsinx(&xt);

    println!("Train GP regressor of 'xsinx' at {}", xt.column(0));
    let mut gp = GaussianProcessRegressor::params(Arc::new(GaussianKernel::new(4., 10.)))
        .sigma(1e-8)
        .inversion_method(InversionMethod::SymmetricEigen)
        .fit(&Dataset::new(xt, yt))
        .expect("GP fitting");
    println!("{gp}");

    let xtest = Array::linspace(0., 25., 26).insert_axis(Axis(1));
    let ytest = xsinx(&xtest);
    let ypred = gp.predict_batch(&xtest).expect("GP prediction");
    let ysigma = xtest
        .rows()
        .into_iter()
        .map(|x| gp.credible_interval(&x).expect("GP credible interval"))
        .collect::<Array<f64, _>>()
        .insert_axis(Axis(1));

    println!("Compute prediction errors (x, err(x), sigma(x))");
    println!("{}", concatenate![Axis(1), xtest, ypred - ytest, ysigma]);

    let (_, dy) = gp
        .predict_derivative(&ndarray::array![12.5])
        .expect("GP derivative prediction");
    println!("Derivative approximation at x=12.5: {}", dy[[0, 0]]);
}
