//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during fitting
//! - persisted inside artifacts (sessions, population maps, fit results)
//! - reloaded later by a subsequent pipeline stage

use std::fmt;

use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::fit::FitError;

/// Identity of one subject session (one row of the protocol).
///
/// Two artifacts belong to the same record iff their identifiers are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    pub cohort: String,
    pub id: u32,
    pub datetime: NaiveDateTime,
    pub paradigm: String,
}

impl Identifier {
    pub fn new(
        cohort: impl Into<String>,
        id: u32,
        datetime: NaiveDateTime,
        paradigm: impl Into<String>,
    ) -> Self {
        Self {
            cohort: cohort.into(),
            id,
            datetime,
            paradigm: paradigm.into(),
        }
    }

    /// Short display form used in per-record log lines: `cohort-0001-paradigm`.
    pub fn name(&self) -> String {
        format!("{}-{:04}-{}", self.cohort, self.id, self.paradigm)
    }

    /// Long form including the acquisition timestamp.
    pub fn full_name(&self) -> String {
        format!(
            "{}-{:04}-{}-{}",
            self.cohort,
            self.id,
            self.paradigm,
            self.datetime.format("%Y-%m-%d-%H%M")
        )
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A single spatiotemporal observation.
///
/// `position` is given in the index space of the subject grid, so rounding it
/// yields the voxel the sample was acquired in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub position: [f64; 3],
    pub response: f64,
    pub time: f64,
    /// Task (stimulus/control) label active at acquisition time.
    pub task: u32,
    /// Block number of the experimental design.
    pub block: u32,
    pub scan_cycle: usize,
    pub slice: usize,
}

impl Observation {
    /// Nearest integer voxel index of the observation.
    pub fn spatial_index(&self) -> [i64; 3] {
        [
            self.position[0].round() as i64,
            self.position[1].round() as i64,
            self.position[2].round() as i64,
        ]
    }

    pub fn squared_distance(&self, point: &[f64; 3]) -> f64 {
        let dx = self.position[0] - point[0];
        let dy = self.position[1] - point[1];
        let dz = self.position[2] - point[2];
        dx * dx + dy * dy + dz * dz
    }
}

/// Physical axis along which slices were acquired.
///
/// Determines the tie-break ordering of residuals with equal acquisition time
/// when computing the Durbin–Watson statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SliceAxis {
    I,
    J,
    #[default]
    K,
}

impl SliceAxis {
    pub fn from_index(axis: usize) -> Option<Self> {
        match axis {
            0 => Some(SliceAxis::I),
            1 => Some(SliceAxis::J),
            2 => Some(SliceAxis::K),
            _ => None,
        }
    }

    /// Order in which spatial indices break ties after time.
    pub fn tie_break_order(self) -> [usize; 3] {
        match self {
            SliceAxis::I => [0, 1, 2],
            SliceAxis::J => [1, 2, 0],
            SliceAxis::K => [2, 0, 1],
        }
    }
}

/// Half-open box `[start, end)` in grid index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBox {
    pub start: [usize; 3],
    pub end: [usize; 3],
}

impl IndexBox {
    pub fn shape(&self) -> [usize; 3] {
        [
            self.end[0].saturating_sub(self.start[0]),
            self.end[1].saturating_sub(self.start[1]),
            self.end[2].saturating_sub(self.start[2]),
        ]
    }

    pub fn fits_within(&self, shape: [usize; 3]) -> bool {
        (0..3).all(|a| self.start[a] < self.end[a] && self.end[a] <= shape[a])
    }
}

pub fn shape_len(shape: [usize; 3]) -> usize {
    shape[0] * shape[1] * shape[2]
}

/// Flat C-order index (`k` varies fastest).
pub fn ravel(shape: [usize; 3], index: [usize; 3]) -> usize {
    (index[0] * shape[1] + index[1]) * shape[2] + index[2]
}

pub fn unravel(shape: [usize; 3], flat: usize) -> [usize; 3] {
    let k = flat % shape[2];
    let j = (flat / shape[2]) % shape[1];
    let i = flat / (shape[1] * shape[2]);
    [i, j, k]
}

/// A 3-D index lattice plus an affine map into physical space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateGrid {
    pub shape: [usize; 3],
    /// Row-major homogeneous 4×4 affine.
    pub affine: [[f64; 4]; 4],
}

impl CoordinateGrid {
    pub fn new(shape: [usize; 3], affine: [[f64; 4]; 4]) -> Self {
        Self { shape, affine }
    }

    /// Grid whose physical coordinates equal its indices.
    pub fn identity(shape: [usize; 3]) -> Self {
        let mut affine = [[0.0; 4]; 4];
        for (d, row) in affine.iter_mut().enumerate() {
            row[d] = 1.0;
        }
        Self { shape, affine }
    }

    pub fn len(&self) -> usize {
        shape_len(self.shape)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn apply(&self, index: [usize; 3]) -> [f64; 3] {
        let v = [index[0] as f64, index[1] as f64, index[2] as f64];
        let mut out = [0.0; 3];
        for (r, o) in out.iter_mut().enumerate() {
            let row = &self.affine[r];
            *o = row[0] * v[0] + row[1] * v[1] + row[2] * v[2] + row[3];
        }
        out
    }

    /// Physical coordinates of every grid point in C order.
    pub fn coordinates(&self) -> Coordinates {
        let points = (0..self.len())
            .map(|flat| self.apply(unravel(self.shape, flat)))
            .collect();
        Coordinates {
            shape: self.shape,
            points,
        }
    }

    /// Physical coordinates of the points inside `region`.
    pub fn coordinates_in(&self, region: &IndexBox) -> Result<Coordinates, FitError> {
        if !region.fits_within(self.shape) {
            return Err(FitError::ContractViolation(format!(
                "index box {:?}..{:?} does not fit into grid of shape {:?}",
                region.start, region.end, self.shape
            )));
        }
        let shape = region.shape();
        let points = (0..shape_len(shape))
            .map(|flat| {
                let local = unravel(shape, flat);
                self.apply([
                    region.start[0] + local[0],
                    region.start[1] + local[1],
                    region.start[2] + local[2],
                ])
            })
            .collect();
        Ok(Coordinates { shape, points })
    }
}

/// Coordinates at which local models are fitted (grid shape plus one 3-vector
/// per grid point).
#[derive(Debug, Clone, PartialEq)]
pub struct Coordinates {
    shape: [usize; 3],
    points: Vec<[f64; 3]>,
}

impl Coordinates {
    pub fn new(shape: [usize; 3], points: Vec<[f64; 3]>) -> Result<Self, FitError> {
        if points.len() != shape_len(shape) {
            return Err(FitError::ContractViolation(format!(
                "{} coordinates supplied for grid of shape {:?}",
                points.len(),
                shape
            )));
        }
        Ok(Self { shape, points })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Boolean field over a grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMask")]
pub struct Mask {
    shape: [usize; 3],
    values: Vec<bool>,
}

#[derive(Deserialize)]
struct RawMask {
    shape: [usize; 3],
    values: Vec<bool>,
}

impl TryFrom<RawMask> for Mask {
    type Error = FitError;

    fn try_from(raw: RawMask) -> Result<Self, Self::Error> {
        Mask::new(raw.shape, raw.values)
    }
}

impl Mask {
    pub fn new(shape: [usize; 3], values: Vec<bool>) -> Result<Self, FitError> {
        if values.len() != shape_len(shape) {
            return Err(FitError::ContractViolation(format!(
                "mask has {} entries but shape {:?}",
                values.len(),
                shape
            )));
        }
        Ok(Self { shape, values })
    }

    pub fn full(shape: [usize; 3]) -> Self {
        Self {
            shape,
            values: vec![true; shape_len(shape)],
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn get(&self, flat: usize) -> bool {
        self.values.get(flat).copied().unwrap_or(false)
    }

    pub fn set(&mut self, index: [usize; 3], value: bool) {
        let flat = ravel(self.shape, index);
        if let Some(v) = self.values.get_mut(flat) {
            *v = value;
        }
    }

    pub fn count(&self) -> usize {
        self.values.iter().filter(|v| **v).count()
    }

    /// Sub-mask over `region`.
    pub fn restrict(&self, region: &IndexBox) -> Result<Mask, FitError> {
        if !region.fits_within(self.shape) {
            return Err(FitError::ContractViolation(format!(
                "index box {:?}..{:?} does not fit into mask of shape {:?}",
                region.start, region.end, self.shape
            )));
        }
        let shape = region.shape();
        let values = (0..shape_len(shape))
            .map(|flat| {
                let local = unravel(shape, flat);
                self.get(ravel(
                    self.shape,
                    [
                        region.start[0] + local[0],
                        region.start[1] + local[1],
                        region.start[2] + local[2],
                    ],
                ))
            })
            .collect();
        Ok(Mask { shape, values })
    }
}

/// Numeric design matrix, one row per observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDesignMatrix")]
pub struct DesignMatrix {
    names: Vec<String>,
    rows: usize,
    /// Row-major values.
    values: Vec<f64>,
}

#[derive(Deserialize)]
struct RawDesignMatrix {
    names: Vec<String>,
    rows: usize,
    values: Vec<f64>,
}

impl TryFrom<RawDesignMatrix> for DesignMatrix {
    type Error = FitError;

    fn try_from(raw: RawDesignMatrix) -> Result<Self, Self::Error> {
        DesignMatrix::new(raw.names, raw.rows, raw.values)
    }
}

impl DesignMatrix {
    pub fn new(names: Vec<String>, rows: usize, values: Vec<f64>) -> Result<Self, FitError> {
        if names.is_empty() {
            return Err(FitError::ContractViolation(
                "design matrix needs at least one column".to_string(),
            ));
        }
        if values.len() != rows * names.len() {
            return Err(FitError::ContractViolation(format!(
                "design matrix with {} rows and {} columns holds {} values",
                rows,
                names.len(),
                values.len()
            )));
        }
        Ok(Self {
            names,
            rows,
            values,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.names.len()
    }

    pub fn row(&self, i: usize) -> &[f64] {
        let p = self.ncols();
        &self.values[i * p..(i + 1) * p]
    }

    /// Keep only the rows listed in `rows` (in that order).
    pub fn select_rows(&self, rows: &[usize]) -> DesignMatrix {
        let mut values = Vec::with_capacity(rows.len() * self.ncols());
        for &r in rows {
            values.extend_from_slice(self.row(r));
        }
        DesignMatrix {
            names: self.names.clone(),
            rows: rows.len(),
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn ravel_and_unravel_are_inverse() {
        let shape = [3, 4, 5];
        for flat in 0..shape_len(shape) {
            assert_eq!(ravel(shape, unravel(shape, flat)), flat);
        }
        assert_eq!(unravel(shape, 1), [0, 0, 1]);
        assert_eq!(unravel(shape, 5), [0, 1, 0]);
    }

    #[test]
    fn affine_is_applied_to_indices() {
        let mut grid = CoordinateGrid::identity([2, 2, 2]);
        grid.affine[0][0] = 2.0;
        grid.affine[2][3] = -1.0;
        assert_eq!(grid.apply([1, 1, 1]), [2.0, 1.0, 0.0]);

        let coords = grid.coordinates();
        assert_eq!(coords.len(), 8);
        assert_eq!(coords.points()[7], [2.0, 1.0, 0.0]);
    }

    #[test]
    fn sub_box_coordinates_and_mask_line_up() {
        let grid = CoordinateGrid::identity([4, 4, 4]);
        let region = IndexBox {
            start: [1, 0, 2],
            end: [3, 1, 4],
        };
        let coords = grid.coordinates_in(&region).unwrap();
        assert_eq!(coords.shape(), [2, 1, 2]);
        assert_eq!(coords.points()[0], [1.0, 0.0, 2.0]);
        assert_eq!(coords.points()[3], [2.0, 0.0, 3.0]);

        let mut mask = Mask::full([4, 4, 4]);
        mask.set([2, 0, 3], false);
        let sub = mask.restrict(&region).unwrap();
        assert_eq!(sub.count(), 3);
        assert!(!sub.get(3));

        let outside = IndexBox {
            start: [0, 0, 0],
            end: [5, 1, 1],
        };
        assert!(grid.coordinates_in(&outside).is_err());
    }

    #[test]
    fn design_matrix_checks_dimensions() {
        assert!(DesignMatrix::new(vec!["a".into()], 2, vec![1.0]).is_err());
        assert!(DesignMatrix::new(vec![], 0, vec![]).is_err());

        let x = DesignMatrix::new(
            vec!["intercept".into(), "x".into()],
            3,
            vec![1.0, 0.0, 1.0, 1.0, 1.0, 2.0],
        )
        .unwrap();
        assert_eq!(x.row(2), &[1.0, 2.0]);
        let sub = x.select_rows(&[2, 0]);
        assert_eq!(sub.nrows(), 2);
        assert_eq!(sub.row(0), &[1.0, 2.0]);
    }

    #[test]
    fn loading_checks_dimensions_too() {
        let design = r#"{"names":["intercept","x"],"rows":3,"values":[1.0,0.0,1.0]}"#;
        assert!(serde_json::from_str::<DesignMatrix>(design).is_err());
        let design = r#"{"names":["intercept","x"],"rows":1,"values":[1.0,0.0]}"#;
        assert_eq!(serde_json::from_str::<DesignMatrix>(design).unwrap().row(0), &[1.0, 0.0]);

        let mask = r#"{"shape":[2,2,1],"values":[true,false]}"#;
        assert!(serde_json::from_str::<Mask>(mask).is_err());
        let round_trip: Mask = serde_json::from_str(&serde_json::to_string(&Mask::full([1, 2, 1])).unwrap()).unwrap();
        assert_eq!(round_trip.count(), 2);
    }

    #[test]
    fn identifier_names() {
        let dt = NaiveDate::from_ymd_opt(2017, 3, 4)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        let name = Identifier::new("ctl", 7, dt, "motor");
        assert_eq!(name.name(), "ctl-0007-motor");
        assert_eq!(name.full_name(), "ctl-0007-motor-2017-03-04-0930");
    }

    #[test]
    fn slice_axis_orders() {
        assert_eq!(SliceAxis::from_index(1), Some(SliceAxis::J));
        assert_eq!(SliceAxis::from_index(3), None);
        assert_eq!(SliceAxis::K.tie_break_order(), [2, 0, 1]);
    }
}
