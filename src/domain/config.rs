//! Run configuration as understood by the batch pipeline.
//!
//! Derived from CLI flags (plus defaults) in `app`.

use std::path::PathBuf;

use clap::ValueEnum;

use crate::batch::JobFlags;
use crate::domain::types::IndexBox;
use crate::fit::{Backend, KernelParams};
use crate::io::layout::StageQualifiers;

/// Whether the population-map mask restricts where models are fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum MaskPolicy {
    #[default]
    Apply,
    Ignore,
}

/// Per-record fit settings shared by every job of a run.
#[derive(Debug, Clone)]
pub struct FitSettings {
    pub kernel: KernelParams,
    pub backend: Backend,
    pub mask: MaskPolicy,
    /// First scan cycle whose observations enter the fit.
    pub burn_in: usize,
    /// Fit only on a sub-box of the population grid.
    pub region: Option<IndexBox>,
}

/// A full batch run.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub study: PathBuf,
    pub root: PathBuf,
    pub qualifiers: StageQualifiers,
    pub fit: FitSettings,
    pub flags: JobFlags,
    /// Worker count; `None` uses every available thread.
    pub cores: Option<usize>,
    /// Where to write the study summary after a completed batch.
    pub out: Option<PathBuf>,
}
