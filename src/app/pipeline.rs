//! Shared "fit pipeline" logic used by the `fit` and `unlock` commands and by
//! the integration tests.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! study load -> record iteration -> per-record kernel fit under lock -> study summary
//!
//! The binary can then focus on presentation.

use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};

use crate::batch::{BatchError, BatchReport, JobError, JobOutcome, LockLedger, Orchestrator, run_job};
use crate::domain::{BatchConfig, FitResult, FitSettings, MaskPolicy, Observation};
use crate::error::AppError;
use crate::fit::{FitError, KernelParams, fit_field, fit_field_in_box};
use crate::io::layout::{ArtifactRole, StageQualifiers};
use crate::io::lock::Lock;
use crate::study::{Study, StudyItem, TargetState};

/// Lock purpose written by fit jobs.
pub const FIT_PURPOSE: &str = "fmrifit";

/// Artifacts a fit job reads.
pub const FIT_DEPENDENCIES: [ArtifactRole; 4] = [
    ArtifactRole::Session,
    ArtifactRole::ReferenceMaps,
    ArtifactRole::PopulationMap,
    ArtifactRole::Design,
];

/// All computed outputs of a single `fmrifit fit` run.
#[derive(Debug)]
pub struct FitRun {
    pub report: BatchReport,
    /// Study with the validity of failed records cleared.
    pub study: Study,
}

/// Execute the fit over every active record of the configured study.
pub fn run_fit_batch(config: &BatchConfig) -> Result<FitRun, AppError> {
    validate_kernel(&config.fit.kernel)?;

    let mut study = Study::load(&config.study)?;
    let items: Vec<StudyItem> = study
        .iterate(
            &config.root,
            &FIT_DEPENDENCIES,
            &[ArtifactRole::Result],
            &config.qualifiers,
        )?
        .collect();
    info!(
        records = items.len(),
        backend = config.fit.backend.implementation().name(),
        "fitting study"
    );

    let orchestrator = Orchestrator::new(config.cores);
    let report = match orchestrator.run(&items, |item, ledger| fit_record(item, config, ledger)) {
        Ok(report) => report,
        Err(BatchError::PoolAbort {
            reason,
            cleaned,
            report,
        }) => {
            // Failures seen before the abort still invalidate their records.
            report.apply_to(&mut study);
            write_summary(&study, config)?;
            return Err(BatchError::PoolAbort {
                reason,
                cleaned,
                report,
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    };

    report.apply_to(&mut study);
    write_summary(&study, config)?;

    Ok(FitRun { report, study })
}

fn write_summary(study: &Study, config: &BatchConfig) -> Result<(), AppError> {
    if let Some(out) = &config.out {
        study.save(out)?;
        info!(path = %out.display(), "wrote study summary");
    }
    Ok(())
}

fn fit_record(item: &StudyItem, config: &BatchConfig, ledger: &LockLedger) -> Result<JobOutcome, JobError> {
    let target = item
        .path(ArtifactRole::Result)
        .ok_or_else(|| JobError::Compute(format!("no result path for {}", item.name)))?;

    // Dependency problems are reported before the target is touched.
    if !item.valid() {
        let problems: Vec<String> = item.problems.iter().map(ToString::to_string).collect();
        return Err(JobError::Dependency(problems.join("; ")));
    }

    run_job(item, target, FIT_PURPOSE, config.flags, ledger, || {
        compute_fit(item, &config.fit, &config.qualifiers)
    })
}

/// Fit one record whose dependencies are loaded.
pub fn compute_fit(
    item: &StudyItem,
    settings: &FitSettings,
    qualifiers: &StageQualifiers,
) -> Result<FitResult, JobError> {
    let deps = &item.dependencies;
    let (Some(session), Some(reference), Some(population), Some(design)) = (
        &deps.session,
        &deps.reference_maps,
        &deps.population_map,
        &deps.design,
    ) else {
        return Err(JobError::Dependency(format!(
            "{} is missing loaded dependencies",
            item.name
        )));
    };

    if design.matrix.nrows() != session.observations.len() {
        return Err(FitError::ContractViolation(format!(
            "session has {} observations but design has {} rows",
            session.observations.len(),
            design.matrix.nrows()
        ))
        .into());
    }

    // Drop burn-in and outlying scan cycles.
    let rows: Vec<usize> = session
        .observations
        .iter()
        .enumerate()
        .filter(|(_, o)| o.scan_cycle >= settings.burn_in && !reference.is_outlying(o.scan_cycle))
        .map(|(i, _)| i)
        .collect();
    let observations: Vec<Observation> = rows.iter().map(|&i| session.observations[i]).collect();
    let matrix = design.matrix.select_rows(&rows);
    if rows.len() < session.observations.len() {
        info!(
            record = %item.name,
            kept = rows.len(),
            dropped = session.observations.len() - rows.len(),
            "excluded burn-in and outlying scans"
        );
    }

    let kernel = KernelParams {
        slice_axis: session.slice_axis,
        ..settings.kernel
    };
    let mask = match settings.mask {
        MaskPolicy::Apply => population.mask.as_ref(),
        MaskPolicy::Ignore => None,
    };
    let backend = settings.backend.implementation();

    let field = match &settings.region {
        Some(region) => fit_field_in_box(
            &population.grid,
            region,
            mask,
            &observations,
            &matrix,
            &kernel,
            backend,
        )?,
        None => fit_field(
            &population.grid.coordinates(),
            mask,
            &observations,
            &matrix,
            &kernel,
            backend,
        )?,
    };

    if field.statistics.is_all_nan() {
        warn!(record = %item.name, "no grid point had enough observations");
    }

    Ok(FitResult {
        name: item.name.clone(),
        population_space: population.population_space.clone(),
        diffeomorphism: population.diffeomorphism.clone(),
        scale_type: qualifiers.scale_type.clone().unwrap_or_default(),
        kernel,
        backend: settings.backend,
        n_observations: observations.len(),
        statistics: field.statistics,
        parameter_index: field.parameter_index,
        value_index: field.value_index,
        created: Utc::now(),
    })
}

/// Remove result locks of every active record; returns how many were removed.
///
/// Artifacts are never touched.
pub fn unlock_results(
    study: &Path,
    root: &Path,
    qualifiers: &StageQualifiers,
) -> Result<usize, AppError> {
    let study = Study::load(study)?;
    let mut removed = 0;
    for item in study.iterate(root, &[], &[ArtifactRole::Result], qualifiers)? {
        if item.targets.get(&ArtifactRole::Result) != Some(&TargetState::Locked) {
            continue;
        }
        let Some(path) = item.path(ArtifactRole::Result) else {
            continue;
        };
        if Lock::unlock(path)? {
            info!(record = %item.name, path = %path.display(), "removed lock");
            removed += 1;
        }
    }
    Ok(removed)
}

fn validate_kernel(kernel: &KernelParams) -> Result<(), AppError> {
    let positive = |v: f64| v.is_finite() && v > 0.0;
    if !positive(kernel.scale) {
        return Err(AppError::new(2, "Kernel scale must be finite and > 0."));
    }
    if !positive(kernel.radius) {
        return Err(AppError::new(2, "Kernel radius must be finite and > 0."));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::JobFlags;
    use crate::data::{SyntheticConfig, write_synthetic_study};
    use crate::domain::{IndexBox, StatKind};
    use crate::fit::Backend;
    use crate::io::store::{self, Slot};

    fn settings() -> FitSettings {
        FitSettings {
            kernel: KernelParams::new(2.0, 3.0),
            backend: Backend::Fast,
            mask: MaskPolicy::Apply,
            burn_in: 0,
            region: None,
        }
    }

    fn loaded_item(root: &std::path::Path, qualifiers: &StageQualifiers) -> StudyItem {
        let synthetic = SyntheticConfig {
            subjects: 1,
            ..SyntheticConfig::default()
        };
        let study = write_synthetic_study(root, &synthetic).unwrap();
        let mut items = study
            .iterate(root, &FIT_DEPENDENCIES, &[ArtifactRole::Result], qualifiers)
            .unwrap();
        items.next().unwrap()
    }

    fn qualifiers() -> StageQualifiers {
        let synthetic = SyntheticConfig::default();
        StageQualifiers {
            space: Some(synthetic.population_space.clone()),
            diffeomorphism: Some(synthetic.diffeomorphism.clone()),
            scale_type: Some("raw".into()),
        }
    }

    #[test]
    fn compute_fit_recovers_task_effect() {
        let dir = tempfile::tempdir().unwrap();
        let item = loaded_item(dir.path(), &qualifiers());
        assert!(item.valid(), "{:?}", item.problems);

        let result = compute_fit(&item, &settings(), &qualifiers()).unwrap();
        assert_eq!(result.scale_type, "raw");
        assert_eq!(result.statistics.estimated_points(), result.statistics.n_points());

        let t = result.extract("tstatistic", "task").unwrap();
        assert!(t.iter().all(|v| v.is_finite()));
        let df = result.extract("df", "df").unwrap();
        assert!(df.iter().all(|v| *v > 120.0));
    }

    #[test]
    fn burn_in_and_region_are_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let item = loaded_item(dir.path(), &qualifiers());
        let full = compute_fit(&item, &settings(), &qualifiers()).unwrap();

        let mut trimmed = settings();
        trimmed.burn_in = 10;
        let trimmed = compute_fit(&item, &trimmed, &qualifiers()).unwrap();
        assert!(trimmed.n_observations < full.n_observations);

        let mut boxed = settings();
        boxed.region = Some(IndexBox {
            start: [1, 1, 1],
            end: [3, 3, 2],
        });
        let boxed = compute_fit(&item, &boxed, &qualifiers()).unwrap();
        assert_eq!(boxed.statistics.shape(), [2, 2, 1]);
        let grid_shape = full.statistics.shape();
        let flat_full = crate::domain::ravel(grid_shape, [1, 2, 1]);
        let flat_box = crate::domain::ravel([2, 2, 1], [0, 1, 0]);
        let a = full.statistics.get(flat_full, StatKind::Point, 1);
        let b = boxed.statistics.get(flat_box, StatKind::Point, 1);
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn missing_dependencies_fail_without_touching_target() {
        let dir = tempfile::tempdir().unwrap();
        let item = loaded_item(dir.path(), &qualifiers());
        let session_path = item.path(ArtifactRole::Session).unwrap().to_path_buf();
        std::fs::remove_file(&session_path).unwrap();

        let study = Study::load(&dir.path().join("study.json")).unwrap();
        let item = study
            .iterate(dir.path(), &FIT_DEPENDENCIES, &[ArtifactRole::Result], &qualifiers())
            .unwrap()
            .next()
            .unwrap();
        assert!(!item.valid());

        let config = BatchConfig {
            study: dir.path().join("study.json"),
            root: dir.path().to_path_buf(),
            qualifiers: qualifiers(),
            fit: settings(),
            flags: JobFlags::default(),
            cores: Some(1),
            out: None,
        };
        let ledger = LockLedger::default();
        let outcome = fit_record(&item, &config, &ledger);
        assert!(matches!(outcome, Err(JobError::Dependency(_))));
        let target = item.path(ArtifactRole::Result).unwrap();
        assert_eq!(store::load::<FitResult>(target).unwrap(), Slot::Missing);
    }

    #[test]
    fn invalid_kernel_is_rejected_up_front() {
        let mut kernel = KernelParams::new(2.0, 3.0);
        kernel.radius = 0.0;
        assert_eq!(validate_kernel(&kernel).unwrap_err().exit_code(), 2);
        kernel.radius = 3.0;
        kernel.scale = f64::NAN;
        assert!(validate_kernel(&kernel).is_err());
    }
}
