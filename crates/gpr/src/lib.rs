//! This library implements a [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process) regression
//! engine: given input/output vector pairs and a positive definite kernel function, it learns a
//! non-parametric regressor able to predict the output at new inputs, the derivatives of the
//! prediction wrt the input and a credible interval quantifying the prediction uncertainty.
//!
//! The GP regressor is implemented by [GaussianProcessRegressor] which can be parameterized
//! and fitted on a [linfa](https://github.com/rust-ml/linfa) dataset through [GprParams]
//! or fed incrementally sample by sample.
//!
//! Kernel functions are defined in the [kernels] module, the algorithms available
//! to invert the regularized kernel matrix are listed in [InversionMethod].
//!
//! A learned model can be saved as text files and loaded back, see
//! [GaussianProcessRegressor::save] and [GaussianProcessRegressor::load].
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
mod errors;
mod inversion;
pub mod kernels;
mod persistence;

mod parameters;
pub mod utils;

pub use algorithm::*;
pub use errors::*;
pub use inversion::*;
pub use parameters::*;
