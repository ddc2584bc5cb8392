//! The protocol table and its optional covariates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Identifier;
use crate::io::layout::{ArtifactRole, FileLayout, LayoutError};
use crate::io::store::{self, Artifact, Slot, StoreError};

fn default_valid() -> bool {
    true
}

/// One subject session of the study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEntry {
    pub cohort: String,
    pub id: u32,
    pub datetime: NaiveDateTime,
    pub paradigm: String,
    /// Cleared when a pipeline step fails for this record.
    #[serde(default = "default_valid")]
    pub valid: bool,
}

impl ProtocolEntry {
    pub fn new(name: &Identifier) -> Self {
        Self {
            cohort: name.cohort.clone(),
            id: name.id,
            datetime: name.datetime,
            paradigm: name.paradigm.clone(),
            valid: true,
        }
    }

    pub fn identifier(&self) -> Identifier {
        Identifier::new(self.cohort.clone(), self.id, self.datetime, self.paradigm.clone())
    }
}

/// Per-record covariates (age, scores, ...), keyed like the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateRow {
    pub cohort: String,
    pub id: u32,
    pub datetime: NaiveDateTime,
    pub paradigm: String,
    #[serde(default = "default_valid")]
    pub valid: bool,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
}

impl CovariateRow {
    pub fn identifier(&self) -> Identifier {
        Identifier::new(self.cohort.clone(), self.id, self.datetime, self.paradigm.clone())
    }
}

#[derive(Debug, Error)]
pub enum StudyError {
    #[error("cannot name {role} files: template field '{field}' is not supplied")]
    UnresolvedField { role: ArtifactRole, field: String },

    #[error(transparent)]
    Layout(LayoutError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no study at '{0}'")]
    NotFound(PathBuf),

    #[error("study '{0}' is locked by another process")]
    Locked(PathBuf),
}

impl From<LayoutError> for StudyError {
    fn from(e: LayoutError) -> Self {
        match e {
            LayoutError::UnresolvedField { role, field } => StudyError::UnresolvedField { role, field },
            other => StudyError::Layout(other),
        }
    }
}

/// Protocol, covariates and file layout of a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub protocol: Vec<ProtocolEntry>,
    #[serde(default)]
    pub covariates: Option<Vec<CovariateRow>>,
    #[serde(default)]
    pub layout: FileLayout,
}

impl Artifact for Study {
    const KIND: &'static str = "study";
}

impl Study {
    pub fn new(protocol: Vec<ProtocolEntry>) -> Self {
        Self {
            protocol,
            covariates: None,
            layout: FileLayout::default(),
        }
    }

    pub fn with_covariates(mut self, covariates: Vec<CovariateRow>) -> Self {
        self.covariates = Some(covariates);
        self
    }

    pub fn load(path: &Path) -> Result<Self, StudyError> {
        match store::load::<Study>(path)? {
            Slot::Ready(study) => Ok(study),
            Slot::Missing => Err(StudyError::NotFound(path.to_path_buf())),
            Slot::Locked(_) => Err(StudyError::Locked(path.to_path_buf())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StudyError> {
        Ok(store::save(path, self)?)
    }

    /// Covariate row of `name`, if covariates are attached and one matches.
    pub fn covariate_row(&self, name: &Identifier) -> Option<&CovariateRow> {
        self.covariates
            .as_ref()?
            .iter()
            .find(|row| row.identifier() == *name)
    }

    /// Whether protocol row `index` takes part in iteration.
    pub fn is_active(&self, index: usize) -> bool {
        let Some(entry) = self.protocol.get(index) else {
            return false;
        };
        if !entry.valid {
            return false;
        }
        match &self.covariates {
            None => true,
            Some(_) => self
                .covariate_row(&entry.identifier())
                .is_some_and(|row| row.valid),
        }
    }

    pub fn mark_invalid(&mut self, index: usize) {
        if let Some(entry) = self.protocol.get_mut(index) {
            entry.valid = false;
        }
    }
}
