//! Persisted per-subject artifacts.
//!
//! Every artifact is written to its own file by `io::store` and carries the
//! identifier of the record it belongs to, so a reader can tell whether the
//! file at a resolved path really is the one it expected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::statistics::{ParameterIndex, StatisticTensor, ValueIndex};
use crate::domain::types::{CoordinateGrid, DesignMatrix, Identifier, Mask, Observation, SliceAxis};
use crate::fit::{Backend, FitError, KernelParams};
use crate::io::store::Artifact;

/// Artifacts that belong to exactly one subject record.
pub trait Subject {
    fn subject(&self) -> &Identifier;
}

/// Raw observations of one FMRI session in subject space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub name: Identifier,
    pub observations: Vec<Observation>,
    pub slice_axis: SliceAxis,
    pub scan_cycles: usize,
}

/// Per-session reference information derived from the scans.
///
/// Only the scan-cycle outlier flags are used downstream: observations from
/// outlying scan cycles are excluded from the fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMaps {
    pub name: Identifier,
    pub outlying_scans: Vec<bool>,
}

impl ReferenceMaps {
    pub fn clean(name: Identifier, scan_cycles: usize) -> Self {
        Self {
            name,
            outlying_scans: vec![false; scan_cycles],
        }
    }

    pub fn is_outlying(&self, scan_cycle: usize) -> bool {
        self.outlying_scans.get(scan_cycle).copied().unwrap_or(false)
    }
}

/// Maps a population space onto a subject's reference space.
///
/// The registration producing the map is external; here it is the grid of
/// subject-space coordinates at which every population voxel is fitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationMap {
    /// Subject space the map points into.
    pub name: Identifier,
    pub population_space: String,
    pub diffeomorphism: String,
    pub grid: CoordinateGrid,
    pub mask: Option<Mask>,
}

/// Numeric design matrix aligned with a session's observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Design {
    pub name: Identifier,
    pub matrix: DesignMatrix,
}

/// Output of the kernel fit for one subject in population space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub name: Identifier,
    pub population_space: String,
    pub diffeomorphism: String,
    pub scale_type: String,
    pub kernel: KernelParams,
    pub backend: Backend,
    pub n_observations: usize,
    pub statistics: StatisticTensor,
    pub parameter_index: ParameterIndex,
    pub value_index: ValueIndex,
    pub created: DateTime<Utc>,
}

impl FitResult {
    /// `statistics[..., value, param]` by symbolic names.
    pub fn extract(&self, value: &str, param: &str) -> Result<Vec<f64>, FitError> {
        crate::domain::statistics::extract(
            &self.statistics,
            &self.value_index,
            &self.parameter_index,
            value,
            param,
        )
    }
}

impl Subject for Session {
    fn subject(&self) -> &Identifier {
        &self.name
    }
}

impl Subject for ReferenceMaps {
    fn subject(&self) -> &Identifier {
        &self.name
    }
}

impl Subject for PopulationMap {
    fn subject(&self) -> &Identifier {
        &self.name
    }
}

impl Subject for Design {
    fn subject(&self) -> &Identifier {
        &self.name
    }
}

impl Subject for FitResult {
    fn subject(&self) -> &Identifier {
        &self.name
    }
}

impl Artifact for Session {
    const KIND: &'static str = "session";
}

impl Artifact for ReferenceMaps {
    const KIND: &'static str = "reference_maps";
}

impl Artifact for PopulationMap {
    const KIND: &'static str = "population_map";
}

impl Artifact for Design {
    const KIND: &'static str = "design";
}

impl Artifact for FitResult {
    const KIND: &'static str = "result";
}
