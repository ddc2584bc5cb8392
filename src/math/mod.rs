//! Numerical utilities: weighted least squares and residual diagnostics.

pub mod durbin_watson;
pub mod ols;

pub use durbin_watson::*;
pub use ols::*;
