//! Kernel-weighted local regression.
//!
//! Responsibilities:
//!
//! - select the local support of every grid point (radius cutoff + Gaussian weights)
//! - solve the weighted regression with an interchangeable backend
//! - assemble the statistic tensor and its symbolic lookups

pub mod backend;
pub mod engine;
pub mod errors;
pub mod neighborhood;

pub use backend::*;
pub use engine::*;
pub use errors::*;
pub use neighborhood::*;
