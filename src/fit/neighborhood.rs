//! Local support of one grid point.
//!
//! Observations at squared distance `≥ r²` are dropped before weighting, so
//! the per-point regression only sees the local samples.

use nalgebra::{DMatrix, DVector};

use crate::domain::{DesignMatrix, Observation, SliceAxis};

/// Observations retained for one grid point, with their kernel weights.
#[derive(Debug, Clone)]
pub struct Neighborhood {
    pub indices: Vec<usize>,
    pub weights: Vec<f64>,
}

impl Neighborhood {
    /// Collect observations with squared distance strictly below `radius²`.
    pub fn around(center: &[f64; 3], observations: &[Observation], radius: f64, scale: f64) -> Self {
        let r2 = radius * radius;
        let s = -2.0 * scale * scale;
        let mut indices = Vec::new();
        let mut weights = Vec::new();
        for (i, obs) in observations.iter().enumerate() {
            let d2 = obs.squared_distance(center);
            if d2 < r2 {
                indices.push(i);
                weights.push((d2 / s).exp());
            }
        }
        Self { indices, weights }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Local design `X`, response `y` and weights `w`.
    pub fn system(
        &self,
        observations: &[Observation],
        design: &DesignMatrix,
    ) -> (DMatrix<f64>, DVector<f64>, DVector<f64>) {
        let n = self.len();
        let p = design.ncols();
        let mut x = DMatrix::<f64>::zeros(n, p);
        let mut y = DVector::<f64>::zeros(n);
        for (row, &i) in self.indices.iter().enumerate() {
            for (j, v) in design.row(i).iter().enumerate() {
                x[(row, j)] = *v;
            }
            y[row] = observations[i].response;
        }
        let w = DVector::from_column_slice(&self.weights);
        (x, y, w)
    }

    /// Positions into `self.indices` sorted by acquisition time, ties broken by
    /// spatial index in the order implied by the slice axis.
    pub fn acquisition_order(&self, observations: &[Observation], axis: SliceAxis) -> Vec<usize> {
        let order = axis.tie_break_order();
        let mut positions: Vec<usize> = (0..self.len()).collect();
        positions.sort_by(|&a, &b| {
            let oa = &observations[self.indices[a]];
            let ob = &observations[self.indices[b]];
            let ia = oa.spatial_index();
            let ib = ob.spatial_index();
            oa.time
                .total_cmp(&ob.time)
                .then_with(|| ia[order[0]].cmp(&ib[order[0]]))
                .then_with(|| ia[order[1]].cmp(&ib[order[1]]))
                .then_with(|| ia[order[2]].cmp(&ib[order[2]]))
        });
        positions
    }
}
