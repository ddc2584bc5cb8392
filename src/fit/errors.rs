//! Errors raised by the kernel fit.
//!
//! Numerical degeneracy at a single grid point (too few neighbours, singular
//! weighted design) is never an error: it is recorded as NaN in the field.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    /// Inputs are inconsistent; raised before any grid point is processed.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Unknown parameter or value name in a statistic lookup.
    #[error("unknown statistic name '{0}'")]
    UnknownName(String),
}
