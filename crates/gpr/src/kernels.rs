//! A module for the kernel functions consumed by the GP regression engine.
//!
//! A kernel is a symmetric positive semi-definite similarity function between
//! two input vectors, parameterized by a fixed-size parameter vector.
//! The engine holds kernels behind a shared `Arc<dyn Kernel<F>>` handle.
//!
//! The following kernels are implemented and registered for model loading:
//! * gaussian (squared exponential) kernel, 2 parameters `[sigma, scale]`,
//! * periodic (exp-sine-squared) kernel, 3 parameters `[scale, period, sigma]`.

use crate::errors::{GprError, Result};
use linfa::Float;
use ndarray::{array, Array1, ArrayView1, Zip};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Kernel type names known by the model loader with their expected number of parameters
pub const KERNEL_REGISTRY: [(&str, usize); 2] = [("GaussianKernel", 2), ("PeriodicKernel", 3)];

/// A trait for using a kernel function in GP regression.
///
/// The `Display` implementation must return the type-identifying name used
/// in the parameter file (see [`KERNEL_REGISTRY`]).
pub trait Kernel<F: Float>: fmt::Display + fmt::Debug + Send + Sync {
    /// Compute `k(x, y)`. Implementations must be symmetric and deterministic.
    fn value(&self, x: ArrayView1<F>, y: ArrayView1<F>) -> F;

    /// Ordered parameter vector of the kernel
    fn parameters(&self) -> Array1<F>;

    /// Compute the derivatives of `k(x, y)` wrt each kernel parameter,
    /// in the order given by [`Kernel::parameters`].
    fn parameter_derivatives(&self, x: ArrayView1<F>, y: ArrayView1<F>) -> Array1<F>;

    /// Kernel equality: same type name and exactly the same parameters
    fn same_as(&self, other: &dyn Kernel<F>) -> bool {
        self.to_string() == other.to_string() && self.parameters() == other.parameters()
    }
}

impl<F: Float> PartialEq for dyn Kernel<F> + '_ {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

fn squared_distance<F: Float>(x: ArrayView1<F>, y: ArrayView1<F>) -> F {
    let mut r2 = F::zero();
    Zip::from(&x).and(&y).for_each(|xi, yi| {
        let d = *xi - *yi;
        r2 += d * d;
    });
    r2
}

/// Gaussian kernel
///
/// `k(x, y) = scale * exp( -0.5 * |x - y|^2 / sigma^2 )`
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct GaussianKernel<F: Float> {
    sigma: F,
    scale: F,
}

impl<F: Float> Default for GaussianKernel<F> {
    fn default() -> Self {
        Self::new(F::one(), F::one())
    }
}

impl<F: Float> GaussianKernel<F> {
    /// Constructor given the length scale `sigma` and the amplitude `scale`
    pub fn new(sigma: F, scale: F) -> Self {
        GaussianKernel { sigma, scale }
    }

    /// Length scale
    pub fn sigma(&self) -> F {
        self.sigma
    }

    /// Amplitude
    pub fn scale(&self) -> F {
        self.scale
    }
}

impl<F: Float> Kernel<F> for GaussianKernel<F> {
    fn value(&self, x: ArrayView1<F>, y: ArrayView1<F>) -> F {
        let r2 = squared_distance(x, y);
        self.scale * F::exp(F::cast(-0.5) * r2 / (self.sigma * self.sigma))
    }

    fn parameters(&self) -> Array1<F> {
        array![self.sigma, self.scale]
    }

    fn parameter_derivatives(&self, x: ArrayView1<F>, y: ArrayView1<F>) -> Array1<F> {
        let r2 = squared_distance(x, y);
        let e = F::exp(F::cast(-0.5) * r2 / (self.sigma * self.sigma));
        let d_sigma = self.scale * e * r2 / (self.sigma * self.sigma * self.sigma);
        array![d_sigma, e]
    }
}

impl<F: Float> fmt::Display for GaussianKernel<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GaussianKernel")
    }
}

/// Periodic kernel
///
/// ```text
///                            d
/// k(x, y) = scale^2 * exp( -2 sum sin^2(pi * (x_i - y_i) / period) / sigma^2 )
///                           i=1
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct PeriodicKernel<F: Float> {
    scale: F,
    period: F,
    sigma: F,
}

impl<F: Float> Default for PeriodicKernel<F> {
    fn default() -> Self {
        Self::new(F::one(), F::one(), F::one())
    }
}

impl<F: Float> PeriodicKernel<F> {
    /// Constructor given the amplitude `scale`, the `period` and the length scale `sigma`
    pub fn new(scale: F, period: F, sigma: F) -> Self {
        PeriodicKernel {
            scale,
            period,
            sigma,
        }
    }

    /// Returns (sum sin^2(a_i), sum sin(2 a_i) * (x_i - y_i)) with a_i = pi * (x_i - y_i) / period
    fn sine_terms(&self, x: ArrayView1<F>, y: ArrayView1<F>) -> (F, F) {
        let b = F::cast(std::f64::consts::PI) / self.period;
        let mut s = F::zero();
        let mut ds = F::zero();
        Zip::from(&x).and(&y).for_each(|xi, yi| {
            let d = *xi - *yi;
            let a = b * d;
            let sa = a.sin();
            s += sa * sa;
            ds += F::cast(2.) * sa * a.cos() * d;
        });
        (s, ds)
    }
}

impl<F: Float> Kernel<F> for PeriodicKernel<F> {
    fn value(&self, x: ArrayView1<F>, y: ArrayView1<F>) -> F {
        let (s, _) = self.sine_terms(x, y);
        self.scale * self.scale * F::exp(F::cast(-2.) * s / (self.sigma * self.sigma))
    }

    fn parameters(&self) -> Array1<F> {
        array![self.scale, self.period, self.sigma]
    }

    fn parameter_derivatives(&self, x: ArrayView1<F>, y: ArrayView1<F>) -> Array1<F> {
        let (s, ds) = self.sine_terms(x, y);
        let sigma2 = self.sigma * self.sigma;
        let e = F::exp(F::cast(-2.) * s / sigma2);
        let k = self.scale * self.scale * e;
        let pi = F::cast(std::f64::consts::PI);
        // ds/dperiod = -pi / period^2 * sum sin(2 a_i) (x_i - y_i)
        let ds_dperiod = -pi / (self.period * self.period) * ds;
        let d_scale = F::cast(2.) * self.scale * e;
        let d_period = k * F::cast(-2.) / sigma2 * ds_dperiod;
        let d_sigma = k * F::cast(4.) * s / (sigma2 * self.sigma);
        array![d_scale, d_period, d_sigma]
    }
}

impl<F: Float> fmt::Display for PeriodicKernel<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PeriodicKernel")
    }
}

/// Build a kernel from its type name and parameters as found in a parameter file.
///
/// Fails with [`GprError::UnrecognizedKernel`] when the name is not in [`KERNEL_REGISTRY`]
/// or when the number of parameters does not match the expected one.
pub fn kernel_from_parameters<F: Float + 'static>(
    name: &str,
    params: &[F],
) -> Result<Arc<dyn Kernel<F>>> {
    let expected = KERNEL_REGISTRY
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, nparams)| *nparams)
        .ok_or_else(|| GprError::UnrecognizedKernel(format!("kernel {name} not recognized")))?;
    if params.len() != expected {
        return Err(GprError::UnrecognizedKernel(format!(
            "wrong number of parameters for {name}: expected {expected}, got {}",
            params.len()
        )));
    }
    let kernel: Arc<dyn Kernel<F>> = match name {
        "GaussianKernel" => Arc::new(GaussianKernel::new(params[0], params[1])),
        _ => Arc::new(PeriodicKernel::new(params[0], params[1], params[2])),
    };
    Ok(kernel)
}
