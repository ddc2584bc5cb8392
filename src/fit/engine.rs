//! Kernel-weighted local regression over a coordinate grid.
//!
//! Given:
//! - coordinates `c_p` (one per grid point, optionally restricted by a mask)
//! - observations `(position_i, y_i)` and a design row `x_i` per observation
//! - a Gaussian kernel scale `σ` and a hard radius `r`
//!
//! we solve, for each grid point:
//! - a weighted least squares problem over the observations within `r` of
//!   `c_p`, weighted by `exp(-d² / 2σ²)`
//! - point estimates, standard errors, t-statistics, mse and degrees of freedom
//!   (plus the Durbin–Watson statistic of the time-ordered residuals if asked)
//!
//! and write them into a `StatisticTensor`. Points with too little local
//! support or a degenerate weighted design stay NaN.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{
    CoordinateGrid, Coordinates, DesignMatrix, IndexBox, Mask, Observation, ParameterIndex,
    PointStats, SliceAxis, StatisticTensor, ValueIndex,
};
use crate::fit::backend::FitBackend;
use crate::fit::errors::FitError;
use crate::fit::neighborhood::Neighborhood;
use crate::math::durbin_watson;

/// Default minimum local sample count.
///
/// A point needs strictly more retained observations than this to be fitted,
/// which keeps the residual degrees of freedom comfortably positive for the
/// small designs used in practice.
pub const DEFAULT_MIN_SAMPLES: usize = 120;

/// Kernel hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KernelParams {
    /// Standard deviation `σ` of the Gaussian kernel.
    pub scale: f64,
    /// Hard cutoff `r`; observations with `d² ≥ r²` are ignored.
    pub radius: f64,
    pub min_samples: usize,
    pub durbin_watson: bool,
    /// Slice acquisition axis, used to order residuals for Durbin–Watson.
    pub slice_axis: SliceAxis,
}

impl KernelParams {
    pub fn new(scale: f64, radius: f64) -> Self {
        Self {
            scale,
            radius,
            min_samples: DEFAULT_MIN_SAMPLES,
            durbin_watson: false,
            slice_axis: SliceAxis::default(),
        }
    }

    pub fn with_durbin_watson(mut self, slice_axis: SliceAxis) -> Self {
        self.durbin_watson = true;
        self.slice_axis = slice_axis;
        self
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }
}

/// Statistic field plus the lookups needed to address it by name.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFit {
    pub statistics: StatisticTensor,
    pub parameter_index: ParameterIndex,
    pub value_index: ValueIndex,
}

impl FieldFit {
    pub fn extract(&self, value: &str, param: &str) -> Result<Vec<f64>, FitError> {
        crate::domain::extract(
            &self.statistics,
            &self.value_index,
            &self.parameter_index,
            value,
            param,
        )
    }
}

/// Fit the local model at every (masked) grid point.
pub fn fit_field(
    coordinates: &Coordinates,
    mask: Option<&Mask>,
    observations: &[Observation],
    design: &DesignMatrix,
    params: &KernelParams,
    backend: &dyn FitBackend,
) -> Result<FieldFit, FitError> {
    validate(coordinates, mask, observations, design, params)?;

    let mut statistics = StatisticTensor::new_nan(coordinates.shape(), design.ncols());

    let fit_one = |(flat, center): (usize, &[f64; 3])| -> Option<(usize, PointStats)> {
        if let Some(m) = mask {
            if !m.get(flat) {
                return None;
            }
        }
        fit_point(center, observations, design, params, backend).map(|s| (flat, s))
    };

    let fitted: Vec<(usize, PointStats)> = if backend.parallel() {
        coordinates
            .points()
            .par_iter()
            .enumerate()
            .filter_map(fit_one)
            .collect()
    } else {
        coordinates.points().iter().enumerate().filter_map(fit_one).collect()
    };

    debug!(
        backend = backend.name(),
        points = coordinates.len(),
        fitted = fitted.len(),
        "kernel fit finished"
    );

    for (flat, stats) in &fitted {
        statistics.set_point(*flat, stats);
    }

    Ok(FieldFit {
        statistics,
        parameter_index: ParameterIndex::new(design.names(), params.durbin_watson),
        value_index: ValueIndex::default(),
    })
}

/// Fit only on the sub-box `region` of `grid`.
///
/// The returned tensor has the shape of `region`.
pub fn fit_field_in_box(
    grid: &CoordinateGrid,
    region: &IndexBox,
    mask: Option<&Mask>,
    observations: &[Observation],
    design: &DesignMatrix,
    params: &KernelParams,
    backend: &dyn FitBackend,
) -> Result<FieldFit, FitError> {
    let coordinates = grid.coordinates_in(region)?;
    let sub_mask = match mask {
        Some(m) => {
            if m.shape() != grid.shape {
                return Err(FitError::ContractViolation(format!(
                    "mask shape {:?} differs from grid shape {:?}",
                    m.shape(),
                    grid.shape
                )));
            }
            Some(m.restrict(region)?)
        }
        None => None,
    };
    fit_field(
        &coordinates,
        sub_mask.as_ref(),
        observations,
        design,
        params,
        backend,
    )
}

fn validate(
    coordinates: &Coordinates,
    mask: Option<&Mask>,
    observations: &[Observation],
    design: &DesignMatrix,
    params: &KernelParams,
) -> Result<(), FitError> {
    if let Some(m) = mask {
        if m.shape() != coordinates.shape() {
            return Err(FitError::ContractViolation(format!(
                "shapes of coordinates {:?} and mask {:?} do not match",
                coordinates.shape(),
                m.shape()
            )));
        }
    }
    if observations.len() != design.nrows() {
        return Err(FitError::ContractViolation(format!(
            "{} observations but design has {} rows",
            observations.len(),
            design.nrows()
        )));
    }
    if !(params.scale.is_finite() && params.scale > 0.0) {
        return Err(FitError::ContractViolation(format!(
            "kernel scale must be finite and > 0, got {}",
            params.scale
        )));
    }
    if !(params.radius.is_finite() && params.radius > 0.0) {
        return Err(FitError::ContractViolation(format!(
            "radius must be finite and > 0, got {}",
            params.radius
        )));
    }
    Ok(())
}

fn fit_point(
    center: &[f64; 3],
    observations: &[Observation],
    design: &DesignMatrix,
    params: &KernelParams,
    backend: &dyn FitBackend,
) -> Option<PointStats> {
    let hood = Neighborhood::around(center, observations, params.radius, params.scale);
    if hood.len() <= params.min_samples {
        return None;
    }

    let (x, y, w) = hood.system(observations, design);
    let est = backend.fit_point(&x, &y, &w)?;

    let dw = if params.durbin_watson {
        let reweighted: Vec<f64> = hood
            .acquisition_order(observations, params.slice_axis)
            .into_iter()
            .map(|pos| w[pos] * est.residuals[pos])
            .collect();
        Some(durbin_watson(&reweighted))
    } else {
        None
    };

    Some(PointStats {
        params: est.params.iter().copied().collect(),
        stderr: est.stderr.iter().copied().collect(),
        tvalues: est.tvalues.iter().copied().collect(),
        mse: est.mse,
        df: est.df,
        durbin_watson: dw,
    })
}
