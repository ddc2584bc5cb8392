//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - the coordinate/sample model (`CoordinateGrid`, `Observation`, `Mask`, `DesignMatrix`)
//! - the statistic tensor and its symbolic lookup (`StatisticTensor`, `ParameterIndex`)
//! - persisted per-subject artifacts (`Session`, `PopulationMap`, `FitResult`, ...)
//! - run configuration (`BatchConfig`)

pub mod artifacts;
pub mod config;
pub mod statistics;
pub mod types;

pub use artifacts::*;
pub use config::*;
pub use statistics::*;
pub use types::*;
