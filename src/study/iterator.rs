//! Walking the protocol with resolved paths and loaded dependencies.
//!
//! `Study::iterate` takes two lists of roles:
//!
//! - dependencies, which are loaded eagerly and must be usable for the record
//!   to be valid
//! - targets, the outputs of the current step, which are only inspected
//!
//! Every path is resolved when the iterator is built, so a layout that cannot
//! name some artifact fails before any record is touched.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::domain::{Design, FitResult, Identifier, PopulationMap, ReferenceMaps, Session, Subject};
use crate::io::layout::{ArtifactRole, StageQualifiers};
use crate::io::lock::Lock;
use crate::io::store::{self, Artifact, Slot, StoreError};
use crate::study::protocol::{Study, StudyError};

/// Why a dependency could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemKind {
    Missing,
    Locked,
    Unreadable,
    WrongKind,
    /// The file belongs to another record or population space.
    Mismatch,
    /// A result whose statistics are NaN everywhere.
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadProblem {
    pub role: ArtifactRole,
    pub path: PathBuf,
    pub kind: ProblemKind,
    pub detail: String,
}

impl fmt::Display for LoadProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}': {:?}", self.role, self.path.display(), self.kind)?;
        if !self.detail.is_empty() {
            write!(f, " ({})", self.detail)?;
        }
        Ok(())
    }
}

/// State of a target path when the record was visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Missing,
    Locked,
    Present,
    Unreadable,
}

/// Loaded dependency artifacts of one record.
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    pub session: Option<Session>,
    pub reference_maps: Option<ReferenceMaps>,
    pub population_map: Option<PopulationMap>,
    pub design: Option<Design>,
    pub result: Option<FitResult>,
}

/// One protocol record ready for a pipeline step.
#[derive(Debug, Clone)]
pub struct StudyItem {
    /// Row of the record in `Study::protocol`.
    pub index: usize,
    pub name: Identifier,
    pub paths: BTreeMap<ArtifactRole, PathBuf>,
    pub dependencies: Dependencies,
    pub targets: BTreeMap<ArtifactRole, TargetState>,
    pub covariates: Option<BTreeMap<String, f64>>,
    pub problems: Vec<LoadProblem>,
}

impl StudyItem {
    /// Bare item with no resolved paths, e.g. for ad-hoc jobs.
    pub fn new(index: usize, name: Identifier) -> Self {
        Self {
            index,
            name,
            paths: BTreeMap::new(),
            dependencies: Dependencies::default(),
            targets: BTreeMap::new(),
            covariates: None,
            problems: Vec::new(),
        }
    }

    /// A record is valid when all its dependencies loaded cleanly.
    pub fn valid(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn path(&self, role: ArtifactRole) -> Option<&Path> {
        self.paths.get(&role).map(PathBuf::as_path)
    }
}

struct PendingRow {
    index: usize,
    name: Identifier,
    paths: BTreeMap<ArtifactRole, PathBuf>,
    covariates: Option<BTreeMap<String, f64>>,
}

pub struct StudyIterator {
    rows: std::vec::IntoIter<PendingRow>,
    dependencies: Vec<ArtifactRole>,
    targets: Vec<ArtifactRole>,
    qualifiers: StageQualifiers,
}

impl Study {
    /// Iterate over the active records of the study.
    ///
    /// Paths are resolved under `root`. Inactive rows (invalid, or without a
    /// valid covariate row when covariates are attached) are skipped.
    pub fn iterate(
        &self,
        root: &Path,
        dependencies: &[ArtifactRole],
        targets: &[ArtifactRole],
        qualifiers: &StageQualifiers,
    ) -> Result<StudyIterator, StudyError> {
        let roles: Vec<ArtifactRole> = dependencies.iter().chain(targets).copied().collect();
        for role in &roles {
            self.layout.check(*role, qualifiers)?;
        }

        let mut rows = Vec::new();
        for (index, entry) in self.protocol.iter().enumerate() {
            let name = entry.identifier();
            if !self.is_active(index) {
                debug!(record = %name, "record is not active, skipping");
                continue;
            }
            let mut paths = BTreeMap::new();
            for role in &roles {
                let path = self.layout.resolve(root, *role, &name, qualifiers)?;
                paths.insert(*role, path);
            }
            let covariates = self.covariate_row(&name).map(|row| row.values.clone());
            rows.push(PendingRow {
                index,
                name,
                paths,
                covariates,
            });
        }

        Ok(StudyIterator {
            rows: rows.into_iter(),
            dependencies: dependencies.to_vec(),
            targets: targets.to_vec(),
            qualifiers: qualifiers.clone(),
        })
    }
}

impl Iterator for StudyIterator {
    type Item = StudyItem;

    fn next(&mut self) -> Option<StudyItem> {
        let row = self.rows.next()?;
        let mut item = StudyItem {
            index: row.index,
            name: row.name,
            paths: row.paths,
            dependencies: Dependencies::default(),
            targets: BTreeMap::new(),
            covariates: row.covariates,
            problems: Vec::new(),
        };

        for role in &self.dependencies {
            load_dependency(&mut item, *role, &self.qualifiers);
        }
        for role in &self.targets {
            if let Some(path) = item.paths.get(role) {
                item.targets.insert(*role, inspect_target(path));
            }
        }

        for problem in &item.problems {
            warn!(record = %item.name, "{problem}");
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

fn inspect_target(path: &Path) -> TargetState {
    match store::peek_kind(path) {
        Ok(None) => TargetState::Missing,
        Ok(Some(kind)) if kind == Lock::KIND => TargetState::Locked,
        Ok(Some(_)) => TargetState::Present,
        Err(_) => TargetState::Unreadable,
    }
}

fn load_dependency(item: &mut StudyItem, role: ArtifactRole, qualifiers: &StageQualifiers) {
    let Some(path) = item.paths.get(&role).cloned() else {
        return;
    };
    match role {
        ArtifactRole::Session => {
            item.dependencies.session = load_checked(item, role, &path);
        }
        ArtifactRole::ReferenceMaps => {
            item.dependencies.reference_maps = load_checked(item, role, &path);
        }
        ArtifactRole::Design => {
            item.dependencies.design = load_checked(item, role, &path);
        }
        ArtifactRole::PopulationMap => {
            let Some(map) = load_checked::<PopulationMap>(item, role, &path) else {
                return;
            };
            match space_mismatch(&map, qualifiers) {
                Some(detail) => item.problems.push(LoadProblem {
                    role,
                    path,
                    kind: ProblemKind::Mismatch,
                    detail,
                }),
                None => item.dependencies.population_map = Some(map),
            }
        }
        ArtifactRole::Result => {
            let Some(result) = load_checked::<FitResult>(item, role, &path) else {
                return;
            };
            if result.statistics.is_all_nan() {
                item.problems.push(LoadProblem {
                    role,
                    path,
                    kind: ProblemKind::Empty,
                    detail: String::new(),
                });
            } else {
                item.dependencies.result = Some(result);
            }
        }
    }
}

fn space_mismatch(map: &PopulationMap, qualifiers: &StageQualifiers) -> Option<String> {
    let space_ok = qualifiers
        .space
        .as_ref()
        .is_none_or(|s| *s == map.population_space);
    let diffeo_ok = qualifiers
        .diffeomorphism
        .as_ref()
        .is_none_or(|d| *d == map.diffeomorphism);
    if space_ok && diffeo_ok {
        return None;
    }
    Some(format!(
        "maps {}/{}, expected {}/{}",
        map.population_space,
        map.diffeomorphism,
        qualifiers.space.as_deref().unwrap_or("*"),
        qualifiers.diffeomorphism.as_deref().unwrap_or("*"),
    ))
}

/// Load `T` and check that it belongs to the item's record.
fn load_checked<T: Artifact + Subject>(
    item: &mut StudyItem,
    role: ArtifactRole,
    path: &Path,
) -> Option<T> {
    let problem = |kind: ProblemKind, detail: String| LoadProblem {
        role,
        path: path.to_path_buf(),
        kind,
        detail,
    };
    match store::load::<T>(path) {
        Ok(Slot::Ready(artifact)) => {
            if *artifact.subject() == item.name {
                return Some(artifact);
            }
            let detail = format!("belongs to {}", artifact.subject().full_name());
            item.problems.push(problem(ProblemKind::Mismatch, detail));
        }
        Ok(Slot::Missing) => item.problems.push(problem(ProblemKind::Missing, String::new())),
        Ok(Slot::Locked(lock)) => {
            let detail = format!("held by {} (pid {})", lock.purpose, lock.pid);
            item.problems.push(problem(ProblemKind::Locked, detail));
        }
        Err(StoreError::WrongKind { found, .. }) => {
            item.problems.push(problem(ProblemKind::WrongKind, found));
        }
        Err(e) => item.problems.push(problem(ProblemKind::Unreadable, e.to_string())),
    }
    None
}
