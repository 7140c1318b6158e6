use crate::errors::{GprError, Result};
use crate::inversion::{
    invert_kernel_matrix, invert_kernel_matrix_with_determinant,
    invert_kernel_matrix_with_log_determinant, InversionMethod, LogDeterminant,
};
use crate::kernels::Kernel;
use crate::parameters::{check_sigma, GprParams, GprValidParams};
use crate::utils::differences;

use linfa::prelude::{DatasetBase, Fit, Float};
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, Data, Ix1, Ix2, Zip};
use rayon::prelude::*;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// A GP regression engine learning a non-parametric regressor from
/// input/output vector pairs given a positive definite kernel function `k(x, x')`.
///
/// Given `n` samples `x_i` and labels `y_i`, learning computes the regression
/// vectors
///
/// `alpha = (K + sigma.I)^-1 . Y`
///
/// where:
/// * `K` is the `(n, n)` kernel matrix `K_ij = k(x_i, x_j)`,
/// * `sigma` is the noise added as is (not squared) to the kernel matrix diagonal,
/// * `Y` is the `(n, output_dim)` matrix of labels stacked as rows.
///
/// The prediction at `x` is then `k(x)^t . alpha` where `k(x)_i = k(x, x_i)`.
///
/// # Implementation
///
/// * Based on [ndarray](https://github.com/rust-ndarray/ndarray)
///   and [linfa](https://github.com/rust-ml/linfa)
/// * Kernel matrix, label matrix and kernel vectors are built in parallel using [rayon](https://github.com/rayon-rs/rayon)
/// * The regularized kernel matrix inversion algorithm is selected with [`InversionMethod`]
/// * Learning is lazy: adding samples or changing the kernel or the noise invalidates
///   the learned state which is recomputed on next prediction.
///
/// # Example
///
/// ```no_run
/// use gpr_engine::{kernels::GaussianKernel, GaussianProcessRegressor};
/// use ndarray::array;
/// use std::sync::Arc;
///
/// let mut gp = GaussianProcessRegressor::<f64>::new(Arc::new(GaussianKernel::new(1., 1.)));
/// gp.set_sigma(1e-6).expect("valid noise");
/// gp.add_sample(&array![0.], &array![0.]).expect("sample added");
/// gp.add_sample(&array![1.], &array![1.]).expect("sample added");
/// gp.add_sample(&array![2.], &array![4.]).expect("sample added");
///
/// let y = gp.predict(&array![1.5]).expect("GP prediction");
/// let (y, jac) = gp.predict_derivative(&array![1.5]).expect("GP derivative prediction");
/// let ci = gp.credible_interval(&array![1.5]).expect("GP credible interval");
/// ```
#[derive(Debug)]
pub struct GaussianProcessRegressor<F: Float> {
    /// Kernel function, shared
    kernel: Arc<dyn Kernel<F>>,
    /// Noise on sample data
    sigma: F,
    /// Training inputs, all of `input_dim` components
    sample_vectors: Vec<Array1<F>>,
    /// Training outputs, all of `output_dim` components
    label_vectors: Vec<Array1<F>>,
    /// One regression vector per output dimension (n, output_dim)
    regression_vectors: Array2<F>,
    /// Inverse of the regularized kernel matrix, dropped in efficient storage mode
    core_matrix: Option<Array2<F>>,
    initialized: bool,
    input_dim: usize,
    output_dim: usize,
    /// Not persisted
    inversion_method: InversionMethod,
    /// Not persisted
    stable_inversion: bool,
    /// Not persisted
    efficient_storage: bool,
    debug: bool,
    /// Caller-side lock, never acquired internally
    lock: Arc<Mutex<()>>,
}

impl<F: Float> Clone for GaussianProcessRegressor<F> {
    fn clone(&self) -> Self {
        Self {
            kernel: self.kernel.clone(),
            sigma: self.sigma,
            sample_vectors: self.sample_vectors.clone(),
            label_vectors: self.label_vectors.clone(),
            regression_vectors: self.regression_vectors.to_owned(),
            core_matrix: self.core_matrix.clone(),
            initialized: self.initialized,
            input_dim: self.input_dim,
            output_dim: self.output_dim,
            inversion_method: self.inversion_method,
            stable_inversion: self.stable_inversion,
            efficient_storage: self.efficient_storage,
            debug: self.debug,
            lock: Arc::new(Mutex::new(())),
        }
    }
}

impl<F: Float> fmt::Display for GaussianProcessRegressor<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let params = self
            .kernel
            .parameters()
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "---------------------------------------")?;
        writeln!(f, "Gaussian Process")?;
        writeln!(f, " - initialized:\t\t{}", self.initialized)?;
        writeln!(f, " - # samples:\t\t{}", self.sample_vectors.len())?;
        writeln!(f, " - # labels:\t\t{}", self.label_vectors.len())?;
        writeln!(f, " - noise:\t\t{}", self.sigma)?;
        writeln!(f, " - input dimension:\t{}", self.input_dim)?;
        writeln!(f, " - output dimension:\t{}", self.output_dim)?;
        writeln!(f, " - inversion method:\t{}", self.inversion_method)?;
        writeln!(f, " - Kernel:")?;
        writeln!(f, "       - Type:\t\t{}", self.kernel)?;
        writeln!(f, "       - Parameter:\t{params}")?;
        write!(f, "---------------------------------------")
    }
}

impl<F: Float> PartialEq for GaussianProcessRegressor<F> {
    /// Exact structural equality: regression vectors, samples, labels, kernel,
    /// noise, initialization state, dimensions and debug flag are compared in turn.
    fn eq(&self, other: &Self) -> bool {
        let mismatch = |what: &str| {
            self.log_step(format!("GP comparison: {what} not equal"));
            false
        };
        if self.regression_vectors.shape() != other.regression_vectors.shape()
            || self.regression_vectors != other.regression_vectors
        {
            return mismatch("regression vectors");
        }
        if self.sample_vectors.len() != other.sample_vectors.len() {
            return mismatch("number of sample vectors");
        }
        if self.sample_vectors != other.sample_vectors {
            return mismatch("sample vectors");
        }
        if self.label_vectors.len() != other.label_vectors.len() {
            return mismatch("number of label vectors");
        }
        if self.label_vectors != other.label_vectors {
            return mismatch("label vectors");
        }
        if *self.kernel != *other.kernel {
            return mismatch("kernel");
        }
        if self.sigma != other.sigma {
            return mismatch("sigma");
        }
        if self.initialized != other.initialized {
            return mismatch("initialization state");
        }
        if self.input_dim != other.input_dim {
            return mismatch("input dimension");
        }
        if self.output_dim != other.output_dim {
            return mismatch("output dimension");
        }
        if self.debug != other.debug {
            return mismatch("debug state");
        }
        self.log_step("GP comparison: is equal");
        true
    }
}

impl<F: Float> GaussianProcessRegressor<F> {
    /// GP regression parameters constructor
    pub fn params(kernel: Arc<dyn Kernel<F>>) -> GprParams<F> {
        GprParams::new(kernel)
    }

    /// Constructor of an empty GP regressor with zero noise and default inversion method
    pub fn new(kernel: Arc<dyn Kernel<F>>) -> Self {
        Self {
            kernel,
            sigma: F::zero(),
            sample_vectors: Vec::new(),
            label_vectors: Vec::new(),
            regression_vectors: Array2::zeros((0, 0)),
            core_matrix: None,
            initialized: false,
            input_dim: 0,
            output_dim: 0,
            inversion_method: InversionMethod::default(),
            stable_inversion: false,
            efficient_storage: false,
            debug: false,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Constructor of an empty GP regressor configured with validated parameters
    pub fn from_params(params: &GprValidParams<F>) -> Self {
        let mut gp = Self::new(params.kernel().clone());
        gp.sigma = params.sigma();
        gp.inversion_method = params.inversion_method();
        gp.stable_inversion = params.stable_inversion();
        gp.efficient_storage = params.efficient_storage();
        gp.debug = params.debug();
        gp
    }

    pub(crate) fn log_step<M: fmt::Display>(&self, msg: M) {
        if self.debug {
            info!("{msg}");
        } else {
            debug!("{msg}");
        }
    }

    /// Drop the learned state
    fn invalidate(&mut self) {
        self.initialized = false;
        self.core_matrix = None;
    }

    /// Add a new sample/label pair.
    ///
    /// The first call defines input and output dimensions. A pair whose dimensions
    /// disagree is rejected with [`GprError::DimensionMismatch`] and the engine is left unchanged.
    pub fn add_sample(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix1>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        let (input_dim, output_dim) = self.expected_dims(x.len(), y.len())?;
        check_dimension(x.len(), input_dim, "add_sample: input")?;
        check_dimension(y.len(), output_dim, "add_sample: output")?;

        self.input_dim = input_dim;
        self.output_dim = output_dim;
        self.sample_vectors.push(x.to_owned());
        self.label_vectors.push(y.to_owned());
        self.invalidate();
        Ok(())
    }

    /// Add `n` sample/label pairs given as rows of `x` (n, input_dim) and `y` (n, output_dim).
    ///
    /// Either all pairs are added or none.
    pub fn add_samples(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<()> {
        if x.nrows() != y.nrows() {
            return Err(GprError::DimensionMismatch(format!(
                "add_samples: number of samples ({}) and labels ({}) differ",
                x.nrows(),
                y.nrows()
            )));
        }
        if x.nrows() == 0 {
            return Ok(());
        }
        let (input_dim, output_dim) = self.expected_dims(x.ncols(), y.ncols())?;
        check_dimension(x.ncols(), input_dim, "add_samples: input")?;
        check_dimension(y.ncols(), output_dim, "add_samples: output")?;

        self.input_dim = input_dim;
        self.output_dim = output_dim;
        self.sample_vectors
            .extend(x.rows().into_iter().map(|row| row.to_owned()));
        self.label_vectors
            .extend(y.rows().into_iter().map(|row| row.to_owned()));
        self.invalidate();
        Ok(())
    }

    /// Dimensions a new pair should have: the established ones or, for the first pair, its own
    fn expected_dims(&self, x_len: usize, y_len: usize) -> Result<(usize, usize)> {
        if !self.sample_vectors.is_empty() {
            return Ok((self.input_dim, self.output_dim));
        }
        if x_len == 0 || y_len == 0 {
            return Err(GprError::DimensionMismatch(
                "first sample defines dimensions, input and output vectors should not be empty"
                    .to_string(),
            ));
        }
        Ok((x_len, y_len))
    }

    fn check_input_dimension(&self, x_len: usize, context: &str) -> Result<()> {
        check_dimension(x_len, self.input_dim, context)
    }

    /// Learning step, only performed if sample data, kernel or noise changed
    /// since last learning.
    ///
    /// Fails with [`GprError::InvalidState`] if there is no sample.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if self.sample_vectors.is_empty() {
            return Err(GprError::InvalidState(
                "initialize: no input samples defined".to_string(),
            ));
        }
        if self.label_vectors.is_empty() {
            return Err(GprError::InvalidState(
                "initialize: no output labels defined".to_string(),
            ));
        }
        self.compute_regression_vectors()
    }

    /// Compute regression vectors `(K + sigma.I)^-1 . Y` from scratch and mark the engine initialized.
    ///
    /// On failure the previous learned state is left unchanged.
    pub fn compute_regression_vectors(&mut self) -> Result<()> {
        let now = Instant::now();
        self.log_step("compute_regression_vectors: building kernel matrix...");
        let mut k = self.compute_kernel_matrix()?;
        self.add_noise_to_kernel_matrix(&mut k);
        let y = self.compute_label_matrix()?;

        self.log_step(format!(
            "compute_regression_vectors: inverting kernel matrix ({}) with {}...",
            k.nrows(),
            self.inversion_method
        ));
        let core = invert_kernel_matrix(&k, self.inversion_method, self.stable_inversion)?;
        self.regression_vectors = core.dot(&y);
        self.core_matrix = if self.efficient_storage {
            None
        } else {
            Some(core)
        };
        self.initialized = true;
        self.log_step(format!(
            "compute_regression_vectors: done in {} ms",
            now.elapsed().as_millis()
        ));
        Ok(())
    }

    /// Predict output vector at given `x` point of `input_dim` components.
    ///
    /// Learning is performed first if needed.
    pub fn predict(&mut self, x: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array1<F>> {
        self.initialize()?;
        self.check_input_dimension(x.len(), "predict")?;
        Ok(self.predict_initialized(x.view()))
    }

    /// Predict output vectors at n given `x` points specified as a (n, input_dim) matrix.
    /// Returns a (n, output_dim) matrix.
    pub fn predict_batch(&mut self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        self.initialize()?;
        self.check_input_dimension(x.ncols(), "predict_batch")?;
        let mut y = Array2::zeros((x.nrows(), self.output_dim));
        Zip::from(y.rows_mut())
            .and(x.rows())
            .for_each(|mut yi, xi| yi.assign(&self.predict_initialized(xi)));
        Ok(y)
    }

    fn predict_initialized(&self, x: ArrayView1<F>) -> Array1<F> {
        let kx = self.kernel_vector(x);
        kx.dot(&self.regression_vectors)
    }

    /// Predict output vector at `x` together with its derivatives wrt `x` as a
    /// (input_dim, output_dim) jacobian matrix `D` where
    ///
    /// `D[:, j] = -X^t . (k(x) * alpha_j)`
    ///
    /// with `X` the (n, input_dim) difference matrix `X_i = x - x_i`.
    /// This is the exact gradient for a stationary gaussian kernel with unit length scale.
    pub fn predict_derivative(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<(Array1<F>, Array2<F>)> {
        self.initialize()?;
        self.check_input_dimension(x.len(), "predict_derivative")?;
        Ok(self.predict_derivative_initialized(x.view()))
    }

    fn predict_derivative_initialized(&self, x: ArrayView1<F>) -> (Array1<F>, Array2<F>) {
        let kx = self.kernel_vector(x);
        let diffs = differences(&x, &self.sample_vectors);

        let mut jac = Array2::zeros((self.input_dim, self.output_dim));
        Zip::from(jac.columns_mut())
            .and(self.regression_vectors.columns())
            .for_each(|mut jac_j, alpha_j| {
                let weights = &kx * &alpha_j;
                jac_j.assign(&diffs.t().dot(&weights).mapv(|v| -v));
            });
        (kx.dot(&self.regression_vectors), jac)
    }

    /// Returns the positive credible interval at `x`, namely the posterior standard deviation
    ///
    /// `sqrt(k(x, x) - k(x)^t . (K + sigma.I)^-1 . k(x))`
    ///
    /// When the inverted kernel matrix is not retained it is recomputed with the current
    /// inversion method, then cached unless efficient storage is on.
    pub fn credible_interval(&mut self, x: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<F> {
        self.initialize()?;
        self.check_input_dimension(x.len(), "credible_interval")?;
        let x = x.view();
        let kx = self.kernel_vector(x);
        let variance = match &self.core_matrix {
            Some(core) => self.kernel.value(x, x) - kx.dot(&core.dot(&kx)),
            None => {
                self.log_step("credible_interval: recomputing core matrix");
                let core = self.compute_core_matrix()?;
                let variance = self.kernel.value(x, x) - kx.dot(&core.dot(&kx));
                if !self.efficient_storage {
                    self.core_matrix = Some(core);
                }
                variance
            }
        };
        // Variance might be slightly negative depending on machine precision
        Ok(if variance < F::zero() {
            F::zero()
        } else {
            variance.sqrt()
        })
    }

    /// Returns the scalar product between `x` and `y` in the RKHS of this GP,
    /// that is `k(x, y)`.
    pub fn inner_product(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix1>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<F> {
        if !self.sample_vectors.is_empty() {
            self.check_input_dimension(x.len(), "inner_product: first vector")?;
            self.check_input_dimension(y.len(), "inner_product: second vector")?;
        } else {
            check_dimension(y.len(), x.len(), "inner_product: second vector")?;
        }
        Ok(self.kernel.value(x.view(), y.view()))
    }

    fn kernel_vector(&self, x: ArrayView1<F>) -> Array1<F> {
        let kernel = &self.kernel;
        let samples = &self.sample_vectors;
        let mut kx = Array1::zeros(self.regression_vectors.nrows());
        Zip::indexed(&mut kx).par_for_each(|i, kxi| *kxi = kernel.value(x, samples[i].view()));
        kx
    }

    fn check_samples(&self, context: &str) -> Result<()> {
        if self.sample_vectors.is_empty() {
            return Err(GprError::InvalidState(format!(
                "{context}: no input samples defined"
            )));
        }
        Ok(())
    }
}

/// Interface used by hyperparameters optimization components (e.g. likelihood computation)
/// which need the internal matrices of the engine.
impl<F: Float> GaussianProcessRegressor<F> {
    /// Compute the (n, n) kernel matrix `K_ij = k(x_i, x_j)`.
    ///
    /// As the matrix is symmetric only the upper triangle is evaluated.
    pub fn compute_kernel_matrix(&self) -> Result<Array2<F>> {
        self.check_samples("compute_kernel_matrix")?;
        let n = self.sample_vectors.len();
        let kernel = &self.kernel;
        let samples = &self.sample_vectors;
        let mut k = Array2::zeros((n, n));
        Zip::indexed(k.rows_mut()).par_for_each(|i, mut row| {
            for j in i..n {
                row[j] = kernel.value(samples[i].view(), samples[j].view());
            }
        });
        for i in 1..n {
            for j in 0..i {
                k[[i, j]] = k[[j, i]];
            }
        }
        Ok(k)
    }

    /// Add noise `sigma` (not squared) to each diagonal element of `k`
    pub fn add_noise_to_kernel_matrix(&self, k: &mut Array2<F>) {
        let sigma = self.sigma;
        k.diag_mut().mapv_inplace(|v| v + sigma);
    }

    /// Returns the trace of the kernel matrix `sum k(x_i, x_i)` without building it
    pub fn compute_kernel_matrix_trace(&self) -> Result<F> {
        self.check_samples("compute_kernel_matrix_trace")?;
        Ok(self
            .sample_vectors
            .iter()
            .fold(F::zero(), |acc, x| acc + self.kernel.value(x.view(), x.view())))
    }

    /// Compute the derivative kernel matrix wrt the m kernel parameters as the
    /// stacked (m * n, n) matrix `[D_0; ...; D_m-1]` where `D_p = dK / dtheta_p`.
    pub fn compute_derivative_kernel_matrix(&self) -> Result<Array2<F>> {
        self.check_samples("compute_derivative_kernel_matrix")?;
        let n = self.sample_vectors.len();
        let m = self.kernel.parameters().len();
        let kernel = &self.kernel;
        let samples = &self.sample_vectors;
        let upper_rows: Vec<Vec<Array1<F>>> = (0..n)
            .into_par_iter()
            .map(|i| {
                (i..n)
                    .map(|j| kernel.parameter_derivatives(samples[i].view(), samples[j].view()))
                    .collect()
            })
            .collect();

        let mut d = Array2::zeros((m * n, n));
        for (i, row) in upper_rows.into_iter().enumerate() {
            for (offset, derivs) in row.into_iter().enumerate() {
                let j = i + offset;
                for (p, v) in derivs.iter().enumerate().take(m) {
                    d[[p * n + i, j]] = *v;
                    d[[p * n + j, i]] = *v;
                }
            }
        }
        Ok(d)
    }

    /// Returns the trace of each derivative kernel matrix `sum dk(x_i, x_i) / dtheta_p`
    pub fn compute_derivative_kernel_matrix_trace(&self) -> Result<Array1<F>> {
        self.check_samples("compute_derivative_kernel_matrix_trace")?;
        let m = self.kernel.parameters().len();
        Ok(self.sample_vectors.iter().fold(Array1::zeros(m), |acc, x| {
            acc + self.kernel.parameter_derivatives(x.view(), x.view())
        }))
    }

    /// Bring the label vectors in a (n, output_dim) matrix form, labels as rows
    pub fn compute_label_matrix(&self) -> Result<Array2<F>> {
        if self.label_vectors.is_empty() {
            return Err(GprError::InvalidState(
                "compute_label_matrix: no output labels defined".to_string(),
            ));
        }
        let labels = &self.label_vectors;
        let mut y = Array2::zeros((labels.len(), self.output_dim));
        Zip::indexed(y.rows_mut()).par_for_each(|i, mut row| row.assign(&labels[i]));
        Ok(y)
    }

    /// Compute the kernel vector `k(x)_i = k(x, x_i)`. Requires an initialized engine.
    pub fn compute_kernel_vector(&self, x: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array1<F>> {
        if !self.initialized {
            return Err(GprError::InvalidState(
                "compute_kernel_vector: gaussian process is not initialized".to_string(),
            ));
        }
        self.check_input_dimension(x.len(), "compute_kernel_vector")?;
        Ok(self.kernel_vector(x.view()))
    }

    /// Compute difference matrix `X = [x - x_0, x - x_1, ..., x - x_n-1]^t`
    pub fn compute_difference_matrix(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Array2<F>> {
        self.check_samples("compute_difference_matrix")?;
        self.check_input_dimension(x.len(), "compute_difference_matrix")?;
        Ok(differences(x, &self.sample_vectors))
    }

    /// Compute the core matrix `(K + sigma.I)^-1` with the current inversion method
    pub fn compute_core_matrix(&self) -> Result<Array2<F>> {
        let mut k = self.compute_kernel_matrix()?;
        self.add_noise_to_kernel_matrix(&mut k);
        invert_kernel_matrix(&k, self.inversion_method, self.stable_inversion)
    }

    /// Compute the core matrix `(K + sigma.I)^-1` and the determinant of `K + sigma.I`
    /// both from the same decomposition
    pub fn compute_core_matrix_with_determinant(&self) -> Result<(Array2<F>, F)> {
        let mut k = self.compute_kernel_matrix()?;
        self.add_noise_to_kernel_matrix(&mut k);
        invert_kernel_matrix_with_determinant(&k, self.inversion_method, self.stable_inversion)
    }

    /// Compute the core matrix `(K + sigma.I)^-1` and the log-determinant of `K + sigma.I`
    /// both from the same decomposition.
    ///
    /// Prefer this to [`Self::compute_core_matrix_with_determinant`] for likelihood
    /// computations: the plain determinant underflows to zero with a hundred or so samples.
    pub fn compute_core_matrix_with_log_determinant(
        &self,
    ) -> Result<(Array2<F>, LogDeterminant<F>)> {
        let mut k = self.compute_kernel_matrix()?;
        self.add_noise_to_kernel_matrix(&mut k);
        invert_kernel_matrix_with_log_determinant(&k, self.inversion_method, self.stable_inversion)
    }
}

/// Accessors
impl<F: Float> GaussianProcessRegressor<F> {
    /// Shared kernel
    pub fn kernel(&self) -> &Arc<dyn Kernel<F>> {
        &self.kernel
    }

    /// Set kernel, learned state is invalidated
    pub fn set_kernel(&mut self, kernel: Arc<dyn Kernel<F>>) {
        self.kernel = kernel;
        self.invalidate();
    }

    /// Noise value added to the kernel matrix diagonal
    pub fn sigma(&self) -> F {
        self.sigma
    }

    /// Squared noise value. Beware the kernel matrix is regularized with [`Self::sigma`].
    pub fn sigma_squared(&self) -> F {
        self.sigma * self.sigma
    }

    /// Set noise, learned state is invalidated.
    ///
    /// Fails with [`GprError::InvalidValueError`] if `sigma` is negative or not finite,
    /// the engine is then left unchanged.
    pub fn set_sigma(&mut self, sigma: F) -> Result<()> {
        check_sigma(sigma)?;
        self.sigma = sigma;
        self.invalidate();
        Ok(())
    }

    /// Inversion method
    pub fn inversion_method(&self) -> InversionMethod {
        self.inversion_method
    }

    /// Set inversion method used at next learning
    pub fn set_inversion_method(&mut self, method: InversionMethod) {
        self.inversion_method = method;
    }

    /// Whether near-zero singular values are clipped during inversion
    pub fn stable_inversion(&self) -> bool {
        self.stable_inversion
    }

    /// Set stable inversion used at next learning
    pub fn set_stable_inversion(&mut self, stable: bool) {
        self.stable_inversion = stable;
    }

    /// Whether only regression vectors are retained after learning
    pub fn efficient_storage(&self) -> bool {
        self.efficient_storage
    }

    /// Set efficient storage mode, enabling it drops the retained core matrix
    pub fn set_efficient_storage(&mut self, efficient_storage: bool) {
        self.efficient_storage = efficient_storage;
        if efficient_storage {
            self.core_matrix = None;
        }
    }

    /// Debug flag
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Set debug flag: learning steps and comparisons are logged at info level
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Whether regression vectors are up to date
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of samples
    pub fn n_samples(&self) -> usize {
        self.sample_vectors.len()
    }

    /// Input dimension, 0 until the first sample is added
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Output dimension, 0 until the first sample is added
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// Training inputs in insertion order
    pub fn samples(&self) -> &[Array1<F>] {
        &self.sample_vectors
    }

    /// Training outputs in insertion order
    pub fn labels(&self) -> &[Array1<F>] {
        &self.label_vectors
    }

    /// Regression vectors (n, output_dim), meaningful only when initialized
    pub fn regression_vectors(&self) -> &Array2<F> {
        &self.regression_vectors
    }

    /// Retained core matrix `(K + sigma.I)^-1` if any
    pub fn core_matrix(&self) -> Option<&Array2<F>> {
        self.core_matrix.as_ref()
    }

    /// Acquire the caller-side lock guarding a whole sequence of operations
    /// against concurrent use. The engine never acquires it itself.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle on the caller-side lock, allowing to hold it while mutating the engine
    pub fn lock_handle(&self) -> Arc<Mutex<()>> {
        self.lock.clone()
    }

    /// Set all state at once, used when loading a model
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn replace_state(
        &mut self,
        kernel: Arc<dyn Kernel<F>>,
        sigma: F,
        sample_vectors: Vec<Array1<F>>,
        label_vectors: Vec<Array1<F>>,
        regression_vectors: Array2<F>,
        input_dim: usize,
        output_dim: usize,
        debug: bool,
    ) {
        self.kernel = kernel;
        self.sigma = sigma;
        self.sample_vectors = sample_vectors;
        self.label_vectors = label_vectors;
        self.regression_vectors = regression_vectors;
        self.core_matrix = None;
        self.input_dim = input_dim;
        self.output_dim = output_dim;
        self.debug = debug;
        self.initialized = true;
    }
}

fn check_dimension(actual: usize, expected: usize, context: &str) -> Result<()> {
    if actual != expected {
        return Err(GprError::DimensionMismatch(format!(
            "{context}: vector dimension ({actual}) does not correspond to the expected dimension ({expected})"
        )));
    }
    Ok(())
}

impl<F: Float, D: Data<Elem = F>> Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix2>, GprError>
    for GprValidParams<F>
{
    type Object = GaussianProcessRegressor<F>;

    /// Learn GP regressor from (n, input_dim) records and (n, output_dim) targets
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix2>>,
    ) -> Result<Self::Object> {
        let mut gp = GaussianProcessRegressor::from_params(self);
        gp.add_samples(dataset.records(), dataset.targets())?;
        gp.initialize()?;
        debug!(
            "GP fitted on {} samples ({} -> {})",
            gp.n_samples(),
            gp.input_dim(),
            gp.output_dim()
        );
        Ok(gp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{GaussianKernel, PeriodicKernel};
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use linfa::prelude::Dataset;
    use ndarray::{array, Array};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use paste::paste;
    use rand_xoshiro::Xoshiro256Plus;

    fn gaussian(sigma: f64, scale: f64) -> Arc<dyn Kernel<f64>> {
        Arc::new(GaussianKernel::new(sigma, scale))
    }

    fn xsinx(x: &Array2<f64>) -> Array2<f64> {
        (x - 3.5) * ((x - 3.5) / std::f64::consts::PI).mapv(|v| v.sin())
    }

    fn quadratic_gp(sigma: f64) -> GaussianProcessRegressor<f64> {
        let mut gp = GaussianProcessRegressor::new(gaussian(1., 1.));
        gp.set_sigma(sigma).unwrap();
        gp.add_sample(&array![0.], &array![0.]).unwrap();
        gp.add_sample(&array![1.], &array![1.]).unwrap();
        gp.add_sample(&array![2.], &array![4.]).unwrap();
        gp
    }

    #[test]
    fn test_quadratic_interpolation() {
        env_logger::builder().is_test(true).try_init().ok();
        let mut gp = quadratic_gp(1e-6);
        assert!(!gp.is_initialized());
        assert_abs_diff_eq!(1., gp.predict(&array![1.]).unwrap()[0], epsilon = 1e-4);
        assert!(gp.is_initialized());
        assert_eq!((3, 1), gp.regression_vectors().dim());
        assert!(gp.credible_interval(&array![1.]).unwrap() < 1e-2);
        assert!(gp.credible_interval(&array![10.]).unwrap() > 0.9);

        let (y, jac) = gp.predict_derivative(&array![1.]).unwrap();
        assert_abs_diff_eq!(1., y[0], epsilon = 1e-4);
        assert_eq!((1, 1), jac.dim());
        assert!(jac[[0, 0]].is_finite());
    }

    macro_rules! test_interpolation {
        ($method:ident) => {
            paste! {
                #[test]
                fn [<test_interpolation_ $method:snake>]() {
                    let xt = array![[0.], [1.], [2.], [3.], [4.]];
                    let yt = xsinx(&xt);
                    let mut gp = GaussianProcessRegressor::params(gaussian(1., 1.))
                        .inversion_method(InversionMethod::$method)
                        .fit(&Dataset::new(xt.to_owned(), yt.to_owned()))
                        .expect("GP fitted");
                    assert!(gp.is_initialized());
                    assert_eq!(InversionMethod::$method, gp.inversion_method());

                    let ypred = gp.predict_batch(&xt).expect("GP prediction");
                    assert_abs_diff_eq!(yt, ypred, epsilon = 1e-8);
                    for x in xt.rows() {
                        let ci = gp.credible_interval(&x).expect("credible interval");
                        assert_abs_diff_eq!(0., ci, epsilon = 1e-5);
                    }
                }
            }
        };
    }

    test_interpolation!(Direct);
    test_interpolation!(HighAccuracySvd);
    test_interpolation!(FastSvd);
    test_interpolation!(SymmetricEigen);

    #[test]
    fn test_inversion_methods_agree() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let xt = Array::random_using((20, 2), Uniform::new(0., 5.), &mut rng);
        let yt = Array::random_using((20, 3), Uniform::new(-1., 1.), &mut rng);
        let mut gp = GaussianProcessRegressor::new(gaussian(1.5, 2.));
        gp.set_sigma(1e-2).unwrap();
        gp.add_samples(&xt, &yt).unwrap();
        gp.initialize().unwrap();
        let reference = gp.regression_vectors().to_owned();

        for method in [
            InversionMethod::HighAccuracySvd,
            InversionMethod::FastSvd,
            InversionMethod::SymmetricEigen,
        ] {
            gp.set_inversion_method(method);
            gp.compute_regression_vectors().unwrap();
            assert_abs_diff_eq!(reference, *gp.regression_vectors(), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_multi_output_prediction() {
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let xt = Array::random_using((8, 2), Uniform::new(-2., 2.), &mut rng);
        let mut gp = GaussianProcessRegressor::new(gaussian(1., 1.));
        for x in xt.rows() {
            gp.add_sample(&x, &array![x[0] + x[1], x[0] * x[1]]).unwrap();
        }
        let y = gp.predict(&xt.row(3)).unwrap();
        assert_eq!(2, y.len());
        assert_abs_diff_eq!(xt[[3, 0]] + xt[[3, 1]], y[0], epsilon = 1e-6);
        assert_abs_diff_eq!(xt[[3, 0]] * xt[[3, 1]], y[1], epsilon = 1e-6);
    }

    #[test]
    fn test_predict_derivative() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let xt = Array::random_using((10, 2), Uniform::new(0., 3.), &mut rng);
        let mut gp = GaussianProcessRegressor::new(gaussian(1., 2.));
        gp.set_sigma(1e-3).unwrap();
        for x in xt.rows() {
            gp.add_sample(&x, &array![x[0].sin() * x[1], x[0] - x[1] * x[1]])
                .unwrap();
        }
        let x = array![1.2, 0.7];
        let (y, jac) = gp.predict_derivative(&x).unwrap();
        assert_eq!((2, 2), jac.dim());
        assert_eq!(gp.predict(&x).unwrap(), y);

        for j in 0..2 {
            let f = |v: &Vec<f64>| -> f64 {
                gp.predict_initialized(Array1::from(v.clone()).view())[j]
            };
            let fdiff = x.to_vec().central_diff(&f);
            for i in 0..2 {
                assert_abs_diff_eq!(fdiff[i], jac[[i, j]], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_add_sample_dimension_mismatch() {
        let mut gp = GaussianProcessRegressor::new(gaussian(1., 1.));
        gp.add_sample(&array![0., 1.], &array![2.]).unwrap();
        gp.initialize().unwrap();

        let res = gp.add_sample(&array![0.], &array![2.]);
        assert!(matches!(res, Err(GprError::DimensionMismatch(_))));
        let res = gp.add_sample(&array![1., 1.], &array![2., 3.]);
        assert!(matches!(res, Err(GprError::DimensionMismatch(_))));
        let res = gp.add_samples(&array![[1., 1.], [2., 2.]], &array![[1.], [2.], [3.]]);
        assert!(matches!(res, Err(GprError::DimensionMismatch(_))));
        assert_eq!(1, gp.n_samples());
        assert_eq!(2, gp.input_dim());
        assert_eq!(1, gp.output_dim());
        assert!(gp.is_initialized());

        let res = gp.predict(&array![1.]);
        assert!(matches!(res, Err(GprError::DimensionMismatch(_))));
        assert!(res.unwrap_err().is_precondition_violation());

        let mut empty = GaussianProcessRegressor::new(gaussian(1., 1.));
        let res = empty.add_sample(&Array1::<f64>::zeros(0), &array![1.]);
        assert!(matches!(res, Err(GprError::DimensionMismatch(_))));
        assert_eq!(0, empty.n_samples());
    }

    #[test]
    fn test_invalid_state() {
        let mut gp = GaussianProcessRegressor::new(gaussian(1., 1.));
        assert!(matches!(gp.initialize(), Err(GprError::InvalidState(_))));
        assert!(matches!(gp.predict(&array![1.]), Err(GprError::InvalidState(_))));
        assert!(matches!(
            gp.predict_derivative(&array![1.]),
            Err(GprError::InvalidState(_))
        ));
        assert!(matches!(
            gp.credible_interval(&array![1.]),
            Err(GprError::InvalidState(_))
        ));
        assert!(matches!(
            gp.compute_kernel_matrix(),
            Err(GprError::InvalidState(_))
        ));
        assert!(matches!(
            gp.compute_label_matrix(),
            Err(GprError::InvalidState(_))
        ));

        gp.add_sample(&array![1.], &array![1.]).unwrap();
        assert!(matches!(
            gp.compute_kernel_vector(&array![1.]),
            Err(GprError::InvalidState(_))
        ));
    }

    #[test]
    fn test_invalidation() {
        let mut gp = quadratic_gp(1e-6);
        gp.initialize().unwrap();
        let rv = gp.regression_vectors().to_owned();
        gp.initialize().unwrap();
        assert_eq!(rv, *gp.regression_vectors());
        gp.compute_regression_vectors().unwrap();
        assert_eq!(rv, *gp.regression_vectors());

        gp.set_sigma(0.1).unwrap();
        assert!(!gp.is_initialized());
        assert!(gp.core_matrix().is_none());
        gp.initialize().unwrap();
        assert_ne!(rv, *gp.regression_vectors());

        gp.set_kernel(Arc::new(PeriodicKernel::new(1., 3., 1.)));
        assert!(!gp.is_initialized());
        gp.initialize().unwrap();

        gp.add_sample(&array![3.], &array![9.]).unwrap();
        assert!(!gp.is_initialized());
        gp.predict(&array![3.]).unwrap();
        assert_eq!(4, gp.n_samples());
        assert_eq!((4, 1), gp.regression_vectors().dim());
    }

    #[test]
    fn test_singular_kernel_matrix() {
        env_logger::builder().is_test(true).try_init().ok();
        let mut gp = GaussianProcessRegressor::new(gaussian(1., 1.));
        gp.add_sample(&array![1.], &array![1.]).unwrap();
        gp.add_sample(&array![1.], &array![2.]).unwrap();
        for method in [
            InversionMethod::Direct,
            InversionMethod::HighAccuracySvd,
            InversionMethod::FastSvd,
            InversionMethod::SymmetricEigen,
        ] {
            gp.set_inversion_method(method);
            let res = gp.initialize();
            assert!(matches!(res, Err(GprError::SingularMatrix(_))));
            assert!(!gp.is_initialized());
        }

        gp.set_stable_inversion(true);
        gp.initialize().unwrap();
        // duplicated inputs: the mean of the labels is predicted
        assert_abs_diff_eq!(1.5, gp.predict(&array![1.]).unwrap()[0], epsilon = 1e-10);
    }

    #[test]
    fn test_kernel_matrices() {
        let mut gp = quadratic_gp(0.5);
        let k = gp.compute_kernel_matrix().unwrap();
        assert_eq!(k, k.t());
        assert_abs_diff_eq!(f64::exp(-0.5), k[[0, 1]], epsilon = 1e-12);
        assert_abs_diff_eq!(f64::exp(-2.), k[[2, 0]], epsilon = 1e-12);
        assert_abs_diff_eq!(3., gp.compute_kernel_matrix_trace().unwrap());

        let mut kn = k.to_owned();
        gp.add_noise_to_kernel_matrix(&mut kn);
        assert_abs_diff_eq!(Array2::<f64>::eye(3) * 0.5, kn - &k, epsilon = 1e-15);
        assert_eq!(0.25, gp.sigma_squared());

        let y = gp.compute_label_matrix().unwrap();
        assert_eq!(array![[0.], [1.], [4.]], y);

        let (core, det) = gp.compute_core_matrix_with_determinant().unwrap();
        let mut reg = k.to_owned();
        gp.add_noise_to_kernel_matrix(&mut reg);
        assert_abs_diff_eq!(Array2::<f64>::eye(3), reg.dot(&core), epsilon = 1e-10);
        assert!(det > 0.);
        assert_abs_diff_eq!(core, gp.compute_core_matrix().unwrap(), epsilon = 1e-12);

        gp.initialize().unwrap();
        let x = array![0.5];
        let kx = gp.compute_kernel_vector(&x).unwrap();
        assert_abs_diff_eq!(f64::exp(-0.125), kx[0], epsilon = 1e-12);
        assert_abs_diff_eq!(f64::exp(-1.125), kx[2], epsilon = 1e-12);
        assert_eq!(
            array![[0.5], [-0.5], [-1.5]],
            gp.compute_difference_matrix(&x).unwrap()
        );
        assert_abs_diff_eq!(
            f64::exp(-0.125),
            gp.inner_product(&array![0.], &x).unwrap(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_derivative_kernel_matrix() {
        let gp = quadratic_gp(0.);
        let n = gp.n_samples();
        let d = gp.compute_derivative_kernel_matrix().unwrap();
        assert_eq!((2 * n, n), d.dim());

        let kernel = gp.kernel().clone();
        for i in 0..n {
            for j in 0..n {
                let expected = kernel
                    .parameter_derivatives(gp.samples()[i].view(), gp.samples()[j].view());
                assert_eq!(expected[0], d[[i, j]]);
                assert_eq!(expected[1], d[[n + i, j]]);
            }
        }
        // d(scale * exp(..))/dscale = exp(..) which is 1 on the diagonal
        assert_abs_diff_eq!(
            array![0., 3.],
            gp.compute_derivative_kernel_matrix_trace().unwrap(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_efficient_storage() {
        let mut gp = quadratic_gp(1e-3);
        gp.initialize().unwrap();
        assert!(gp.core_matrix().is_some());
        let x = array![1.7];
        let ci = gp.credible_interval(&x).unwrap();

        let mut efficient = quadratic_gp(1e-3);
        efficient.set_efficient_storage(true);
        efficient.initialize().unwrap();
        assert!(efficient.core_matrix().is_none());
        assert_abs_diff_eq!(ci, efficient.credible_interval(&x).unwrap(), epsilon = 1e-10);
        assert_eq!(
            efficient.credible_interval(&x).unwrap(),
            efficient.credible_interval(&x).unwrap()
        );
        assert!(efficient.core_matrix().is_none());

        // recomputed core matrix is retained once efficient storage is off
        efficient.set_efficient_storage(false);
        assert_abs_diff_eq!(ci, efficient.credible_interval(&x).unwrap(), epsilon = 1e-10);
        assert_abs_diff_eq!(
            *gp.core_matrix().unwrap(),
            *efficient.core_matrix().unwrap(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_set_sigma_validation() {
        let mut gp = quadratic_gp(1e-3);
        gp.initialize().unwrap();
        for sigma in [-1e-3, f64::NAN, f64::INFINITY] {
            let res = gp.set_sigma(sigma);
            assert!(matches!(res, Err(GprError::InvalidValueError(_))));
            assert!(res.unwrap_err().is_precondition_violation());
            assert_eq!(1e-3, gp.sigma());
            assert!(gp.is_initialized());
        }
        gp.set_sigma(0.).unwrap();
        assert_eq!(0., gp.sigma());
        assert!(!gp.is_initialized());
    }

    #[test]
    fn test_log_determinant_large_kernel_matrix() {
        let n = 120;
        let mut gp = GaussianProcessRegressor::new(gaussian(1., 1.));
        gp.set_sigma(1e-4).unwrap();
        for x in Array::linspace(0., 10., n).iter() {
            gp.add_sample(&array![*x], &array![x.sin()]).unwrap();
        }

        gp.set_inversion_method(InversionMethod::Direct);
        let (_, det) = gp.compute_core_matrix_with_determinant().unwrap();
        let (core, logdet) = gp.compute_core_matrix_with_log_determinant().unwrap();
        // the plain product of factors underflows
        assert_eq!(0., det);
        assert_eq!(1., logdet.sign);
        assert!(logdet.ln_abs.is_finite());
        assert_abs_diff_eq!(
            core,
            gp.compute_core_matrix().unwrap(),
            epsilon = 1e-12
        );

        gp.set_inversion_method(InversionMethod::SymmetricEigen);
        let (_, eigen_logdet) = gp.compute_core_matrix_with_log_determinant().unwrap();
        assert_eq!(1., eigen_logdet.sign);
        assert_abs_diff_eq!(logdet.ln_abs, eigen_logdet.ln_abs, epsilon = 1e-6);
    }

    #[test]
    #[allow(clippy::eq_op)]
    fn test_equality() {
        let mut gp = quadratic_gp(1e-6);
        gp.set_debug(true);
        assert!(gp == gp);
        let mut other = gp.clone();
        assert!(gp == other);

        gp.initialize().unwrap();
        assert!(gp != other);
        other.initialize().unwrap();
        assert!(gp == other);

        other.set_sigma(1e-5).unwrap();
        other.initialize().unwrap();
        assert!(gp != other);

        let mut other = gp.clone();
        other.set_kernel(gaussian(1., 1.));
        other.initialize().unwrap();
        assert!(gp == other);
        other.set_kernel(gaussian(1., 2.));
        other.initialize().unwrap();
        assert!(gp != other);

        let mut other = gp.clone();
        other.set_debug(false);
        assert!(gp != other);
    }

    #[test]
    fn test_display() {
        let mut gp = quadratic_gp(1e-6);
        gp.initialize().unwrap();
        let dump = gp.to_string();
        assert!(dump.contains("initialized:\t\ttrue"));
        assert!(dump.contains("# samples:\t\t3"));
        assert!(dump.contains("GaussianKernel"));
        assert!(dump.contains("Parameter:\t1, 1"));
    }

    #[test]
    fn test_lock() {
        let mut gp = quadratic_gp(1e-6);
        let handle = gp.lock_handle();
        {
            let _guard = handle.lock().unwrap();
            assert!(handle.try_lock().is_err());
            gp.add_sample(&array![3.], &array![9.]).unwrap();
            gp.initialize().unwrap();
        }
        let _guard = gp.lock();
        assert!(handle.try_lock().is_err());
    }
}
