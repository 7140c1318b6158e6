use thiserror::Error;

/// A result type for GP regression engine
pub type Result<T> = std::result::Result<T, GprError>;

/// An error when using [`GaussianProcessRegressor`](crate::GaussianProcessRegressor)
#[derive(Error, Debug)]
pub enum GprError {
    /// When a sample, label or query vector size disagrees with the established dimensions
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    /// When an operation requires samples, labels or an initialized state which are absent
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// When a persistence file is absent or is a directory
    #[error("Missing artifact: {0}")]
    MissingArtifact(String),
    /// When a persistence file fails to parse
    #[error("Corrupt state: {0}")]
    CorruptState(String),
    /// When a kernel type name is unknown or has a wrong number of parameters
    #[error("Unrecognized kernel: {0}")]
    UnrecognizedKernel(String),
    /// When the selected inversion method cannot produce a meaningful inverse
    #[error("Singular matrix: {0}")]
    SingularMatrix(String),
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When reading or writing a persistence file fails
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    /// When error due to a bad parameter value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}

impl GprError {
    /// Tells whether the error comes from a caller precondition violation
    /// (bad dimensions, bad configuration, missing samples or initialization)
    /// as opposed to a data or environment failure (files, parsing, numerics).
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            GprError::DimensionMismatch(_)
                | GprError::InvalidState(_)
                | GprError::InvalidValueError(_)
        )
    }
}
