//! Statistic tensor produced by the kernel fit and its symbolic lookup.
//!
//! Layout: `grid.shape + (4, max(p, 3))`. The second-to-last axis is the
//! statistic kind (point estimate, standard error, t-statistic, auxiliary), the
//! last axis is the parameter. The auxiliary row holds `mse`, the degrees of
//! freedom and (optionally) the Durbin–Watson statistic.
//!
//! NaN marks "not estimable here" and is a regular value, not an error. JSON
//! has no NaN, so values are persisted as `null`.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::domain::types::shape_len;
use crate::fit::FitError;

/// Position on the statistic-kind axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Point = 0,
    Stderr = 1,
    TStatistic = 2,
    Aux = 3,
}

pub const STAT_KINDS: usize = 4;

/// Positions inside the auxiliary row.
pub const AUX_MSE: usize = 0;
pub const AUX_DF: usize = 1;
pub const AUX_DURBIN_WATSON: usize = 2;

/// Statistics of one successfully fitted grid point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointStats {
    pub params: Vec<f64>,
    pub stderr: Vec<f64>,
    pub tvalues: Vec<f64>,
    pub mse: f64,
    pub df: f64,
    pub durbin_watson: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStatisticTensor")]
pub struct StatisticTensor {
    shape: [usize; 3],
    n_params: usize,
    #[serde(serialize_with = "nan_as_null")]
    values: Vec<f64>,
}

#[derive(Deserialize)]
struct RawStatisticTensor {
    shape: [usize; 3],
    n_params: usize,
    #[serde(deserialize_with = "null_as_nan")]
    values: Vec<f64>,
}

impl TryFrom<RawStatisticTensor> for StatisticTensor {
    type Error = FitError;

    fn try_from(raw: RawStatisticTensor) -> Result<Self, Self::Error> {
        let expected = shape_len(raw.shape) * STAT_KINDS * raw.n_params.max(3);
        if raw.values.len() != expected {
            return Err(FitError::ContractViolation(format!(
                "statistic tensor of shape {:?} with {} parameters holds {} values, expected {}",
                raw.shape,
                raw.n_params,
                raw.values.len(),
                expected
            )));
        }
        Ok(Self {
            shape: raw.shape,
            n_params: raw.n_params,
            values: raw.values,
        })
    }
}

impl StatisticTensor {
    /// All-NaN tensor for `n_params` design parameters.
    pub fn new_nan(shape: [usize; 3], n_params: usize) -> Self {
        let width = n_params.max(3);
        Self {
            shape,
            n_params,
            values: vec![f64::NAN; shape_len(shape) * STAT_KINDS * width],
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    /// Length of the parameter axis, `max(p, 3)`.
    pub fn width(&self) -> usize {
        self.n_params.max(3)
    }

    pub fn n_points(&self) -> usize {
        shape_len(self.shape)
    }

    /// Raw values, C order over `shape + (4, width)`.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    fn block_len(&self) -> usize {
        STAT_KINDS * self.width()
    }

    pub fn get(&self, flat: usize, kind: StatKind, param: usize) -> f64 {
        self.values[flat * self.block_len() + kind as usize * self.width() + param]
    }

    /// The `4 × width` block of one grid point, row-major.
    pub fn point(&self, flat: usize) -> &[f64] {
        let len = self.block_len();
        &self.values[flat * len..(flat + 1) * len]
    }

    pub fn point_is_nan(&self, flat: usize) -> bool {
        self.point(flat).iter().all(|v| v.is_nan())
    }

    pub fn is_all_nan(&self) -> bool {
        self.values.iter().all(|v| v.is_nan())
    }

    /// Number of grid points with at least one finite statistic.
    pub fn estimated_points(&self) -> usize {
        (0..self.n_points()).filter(|&p| !self.point_is_nan(p)).count()
    }

    pub fn set_point(&mut self, flat: usize, stats: &PointStats) {
        let width = self.width();
        let len = self.block_len();
        let block = &mut self.values[flat * len..(flat + 1) * len];
        for (j, v) in stats.params.iter().enumerate() {
            block[StatKind::Point as usize * width + j] = *v;
        }
        for (j, v) in stats.stderr.iter().enumerate() {
            block[StatKind::Stderr as usize * width + j] = *v;
        }
        for (j, v) in stats.tvalues.iter().enumerate() {
            block[StatKind::TStatistic as usize * width + j] = *v;
        }
        let aux = StatKind::Aux as usize * width;
        block[aux + AUX_MSE] = stats.mse;
        block[aux + AUX_DF] = stats.df;
        if let Some(dw) = stats.durbin_watson {
            block[aux + AUX_DURBIN_WATSON] = dw;
        }
    }

    /// Grid-shaped slice `field[..., kind, param]` in C order.
    pub fn slice(&self, kind: usize, param: usize) -> Vec<f64> {
        let width = self.width();
        let len = self.block_len();
        (0..self.n_points())
            .map(|p| self.values[p * len + kind * width + param])
            .collect()
    }
}

/// Maps symbolic parameter names to positions on the parameter axis.
///
/// Auxiliary names (`mse`, `df`, ...) address the auxiliary row, design
/// parameter names address the point/stderr/t rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterIndex {
    aux: BTreeMap<String, usize>,
    design: BTreeMap<String, usize>,
}

impl ParameterIndex {
    pub fn new(design_names: &[String], durbin_watson: bool) -> Self {
        let mut aux = BTreeMap::new();
        aux.insert("mse".to_string(), AUX_MSE);
        aux.insert("df".to_string(), AUX_DF);
        aux.insert("degrees_of_freedom".to_string(), AUX_DF);
        if durbin_watson {
            aux.insert("dw".to_string(), AUX_DURBIN_WATSON);
            aux.insert("durbin_watson".to_string(), AUX_DURBIN_WATSON);
        }
        let design = design_names
            .iter()
            .enumerate()
            .map(|(j, name)| (name.clone(), j))
            .collect();
        Self { aux, design }
    }

    pub fn aux(&self, name: &str) -> Option<usize> {
        self.aux.get(name).copied()
    }

    pub fn design(&self, name: &str) -> Option<usize> {
        self.design.get(name).copied()
    }

    pub fn design_names(&self) -> impl Iterator<Item = &str> {
        self.design.keys().map(String::as_str)
    }
}

/// Maps value-kind names to positions on the statistic-kind axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueIndex(BTreeMap<String, usize>);

impl Default for ValueIndex {
    fn default() -> Self {
        let entries = [
            ("point", StatKind::Point),
            ("stderr", StatKind::Stderr),
            ("tstatistic", StatKind::TStatistic),
            ("mse", StatKind::Aux),
            ("df", StatKind::Aux),
            ("degrees_of_freedom", StatKind::Aux),
            ("dw", StatKind::Aux),
            ("durbin_watson", StatKind::Aux),
        ];
        Self(
            entries
                .into_iter()
                .map(|(name, kind)| (name.to_string(), kind as usize))
                .collect(),
        )
    }
}

impl ValueIndex {
    pub fn get(&self, name: &str) -> Option<usize> {
        self.0.get(name).copied()
    }
}

/// Extract `field[..., value_index[value], parameter_index[param]]`.
pub fn extract(
    tensor: &StatisticTensor,
    value_index: &ValueIndex,
    parameter_index: &ParameterIndex,
    value: &str,
    param: &str,
) -> Result<Vec<f64>, FitError> {
    let kind = value_index
        .get(value)
        .ok_or_else(|| FitError::UnknownName(value.to_string()))?;
    let position = if kind == StatKind::Aux as usize {
        parameter_index.aux(param)
    } else {
        parameter_index.design(param)
    }
    .ok_or_else(|| FitError::UnknownName(param.to_string()))?;
    Ok(tensor.slice(kind, position))
}

fn nan_as_null<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
    let encoded: Vec<Option<f64>> = values
        .iter()
        .map(|v| if v.is_finite() { Some(*v) } else { None })
        .collect();
    encoded.serialize(serializer)
}

fn null_as_nan<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
    let encoded: Vec<Option<f64>> = Vec::deserialize(deserializer)?;
    Ok(encoded.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}
