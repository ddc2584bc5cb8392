//! Interchangeable per-point regression backends.
//!
//! Both backends implement the same contract and must produce the same
//! numbers up to floating point tolerance:
//!
//! - `Fast`: Cholesky of the normal equations, evaluated for all grid points
//!   in parallel (points share no mutable state).
//! - `Reference`: SVD of the weighted design, evaluated serially. It is the
//!   yardstick the fast backend is validated against and also exposes the
//!   goodness-of-fit diagnostics of each local model.

use clap::ValueEnum;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::math::{WlsEstimate, WlsSummary, wls_normal_equations, wls_summary, wls_svd};

/// Solves one local weighted regression.
pub trait FitBackend: Sync {
    fn name(&self) -> &'static str;

    /// Whether grid points may be fitted concurrently.
    fn parallel(&self) -> bool;

    /// `None` when the weighted design cannot be solved at this point.
    fn fit_point(&self, x: &DMatrix<f64>, y: &DVector<f64>, w: &DVector<f64>) -> Option<WlsEstimate>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FastBackend;

impl FitBackend for FastBackend {
    fn name(&self) -> &'static str {
        "fast"
    }

    fn parallel(&self) -> bool {
        true
    }

    fn fit_point(&self, x: &DMatrix<f64>, y: &DVector<f64>, w: &DVector<f64>) -> Option<WlsEstimate> {
        wls_normal_equations(x, y, w)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    /// Estimate plus diagnostics of one local model.
    pub fn fit_point_summary(
        &self,
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        w: &DVector<f64>,
    ) -> Option<(WlsEstimate, WlsSummary)> {
        let est = wls_svd(x, y, w)?;
        let summary = wls_summary(y, w, &est);
        Some((est, summary))
    }
}

impl FitBackend for ReferenceBackend {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn parallel(&self) -> bool {
        false
    }

    fn fit_point(&self, x: &DMatrix<f64>, y: &DVector<f64>, w: &DVector<f64>) -> Option<WlsEstimate> {
        wls_svd(x, y, w)
    }
}

/// Backend selector used in configuration and persisted results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Fast,
    Reference,
}

impl Backend {
    pub fn implementation(self) -> &'static dyn FitBackend {
        match self {
            Backend::Fast => &FastBackend,
            Backend::Reference => &ReferenceBackend,
        }
    }
}
