use thiserror::Error;

/// A result type for semiseparable GP operations
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when using a [`GaussianProcess`](crate::GaussianProcess) or the
/// underlying semiseparable matrix operations
#[derive(Error, Debug)]
pub enum GpError {
    /// When input dimensions disagree
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    /// When the covariance matrix is not positive definite
    #[error("Matrix is not positive definite (failed at row {row})")]
    NotPositiveDefinite {
        /// Index of the first row with a non positive pivot
        row: usize,
    },
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
    /// When the model is used before being computed
    #[error("Model is not computed, call compute() first")]
    NotComputed,
    /// When the kernel changed after the last factorization
    #[error("Factorization is stale after a kernel change, call recompute()")]
    StaleFactorization,
}
