use crate::errors::{GprError, Result};
use crate::inversion::InversionMethod;
use crate::kernels::Kernel;
use linfa::{Float, ParamGuard};
use std::sync::Arc;

/// A set of validated GP regression parameters.
#[derive(Clone, Debug)]
pub struct GprValidParams<F: Float> {
    /// Kernel function shared with the built regressor
    pub(crate) kernel: Arc<dyn Kernel<F>>,
    /// Noise added as is to the kernel matrix diagonal
    pub(crate) sigma: F,
    /// Algorithm used to invert the regularized kernel matrix
    pub(crate) inversion_method: InversionMethod,
    /// Clip near-zero singular values or eigenvalues instead of failing
    pub(crate) stable_inversion: bool,
    /// Only keep regression vectors, not the inverted kernel matrix
    pub(crate) efficient_storage: bool,
    /// Verbose diagnostics
    pub(crate) debug: bool,
}

impl<F: Float> GprValidParams<F> {
    /// Get kernel k(x, x')
    pub fn kernel(&self) -> &Arc<dyn Kernel<F>> {
        &self.kernel
    }

    /// Get noise value
    pub fn sigma(&self) -> F {
        self.sigma
    }

    /// Get inversion method
    pub fn inversion_method(&self) -> InversionMethod {
        self.inversion_method
    }

    /// Whether near-zero singular values are clipped during inversion
    pub fn stable_inversion(&self) -> bool {
        self.stable_inversion
    }

    /// Whether the inverted kernel matrix is dropped after learning
    pub fn efficient_storage(&self) -> bool {
        self.efficient_storage
    }

    /// Get debug flag
    pub fn debug(&self) -> bool {
        self.debug
    }
}

#[derive(Clone, Debug)]
/// The set of parameters that can be specified to build a
/// [GP regressor](crate::GaussianProcessRegressor).
pub struct GprParams<F: Float>(GprValidParams<F>);

impl<F: Float> GprParams<F> {
    /// A constructor for GP regression parameters given a kernel,
    /// noise is zero, inversion method is [`InversionMethod::Direct`].
    pub fn new(kernel: Arc<dyn Kernel<F>>) -> GprParams<F> {
        Self(GprValidParams {
            kernel,
            sigma: F::zero(),
            inversion_method: InversionMethod::default(),
            stable_inversion: false,
            efficient_storage: false,
            debug: false,
        })
    }

    /// Set kernel.
    pub fn kernel(mut self, kernel: Arc<dyn Kernel<F>>) -> Self {
        self.0.kernel = kernel;
        self
    }

    /// Set noise.
    ///
    /// Note: `sigma` is added as is (not squared) to the kernel matrix diagonal.
    pub fn sigma(mut self, sigma: F) -> Self {
        self.0.sigma = sigma;
        self
    }

    /// Set inversion method.
    pub fn inversion_method(mut self, inversion_method: InversionMethod) -> Self {
        self.0.inversion_method = inversion_method;
        self
    }

    /// Set stable inversion: near-zero singular values (resp. eigenvalues)
    /// are discarded instead of raising a singular matrix error.
    /// This is no-op with [`InversionMethod::Direct`].
    pub fn stable_inversion(mut self, stable: bool) -> Self {
        self.0.stable_inversion = stable;
        self
    }

    /// Set efficient storage mode.
    ///
    /// When set, only regression vectors are kept after learning. Keep in mind
    /// that recomputing the inverted kernel matrix later on may give a
    /// numerically different matrix.
    pub fn efficient_storage(mut self, efficient_storage: bool) -> Self {
        self.0.efficient_storage = efficient_storage;
        self
    }

    /// Set debug mode.
    pub fn debug(mut self, debug: bool) -> Self {
        self.0.debug = debug;
        self
    }
}

/// Noise should be finite and non negative
pub(crate) fn check_sigma<F: Float>(sigma: F) -> Result<()> {
    if !num_traits::Float::is_finite(sigma) || sigma < F::zero() {
        return Err(GprError::InvalidValueError(format!(
            "noise should be a finite positive value, got {sigma}"
        )));
    }
    Ok(())
}

impl<F: Float> From<GprValidParams<F>> for GprParams<F> {
    fn from(valid: GprValidParams<F>) -> Self {
        GprParams(valid)
    }
}

impl<F: Float> ParamGuard for GprParams<F> {
    type Checked = GprValidParams<F>;
    type Error = GprError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        check_sigma(self.0.sigma)?;
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
