//! Crate-wide error type
//!
//! All estimator entry points return `Result<T>`; errors are fatal to the
//! current call. Under multi-worker execution an error on any worker must
//! abort the whole computation before the next collective call, otherwise
//! the remaining workers deadlock in a reduction.

use thiserror::Error;

use crate::grid::GridStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Grid is in the wrong state for the requested operation.
    #[error("grid is in {found:?} state but the operation requires {expected:?}")]
    StateMismatch { expected: GridStatus, found: GridStatus },

    /// Unrecognized density assignment kernel or smoothing filter name.
    #[error("unknown kernel or filter '{0}'")]
    UnknownKernel(String),

    /// Filter is not defined for this dimension.
    #[error("{what} is not implemented for dimension {dim}")]
    UnsupportedDim { what: &'static str, dim: usize },

    /// Inconsistent binning parameters.
    #[error("invalid binning: {0}")]
    BadBinning(String),

    /// Zero-length line-of-sight vector.
    #[error("invalid line of sight: {0}")]
    BadLineOfSight(String),

    /// A method precondition was violated.
    #[error("precondition violated: {0}")]
    Precondition(String),
}
