//! Synthetic study generation.
//!
//! Each subject gets a small cubic grid scanned repeatedly. Every scan cycle
//! yields one observation per voxel:
//!
//! - position: voxel index plus Gaussian jitter
//! - time: cycle onset plus the slice offset along the slice axis
//! - task: an on/off block design (`block_length` cycles per block)
//! - response: baseline + task effect (a Gaussian blob around the grid
//!   centre) + noise
//!
//! The population map is the identity into subject space with a full mask, so
//! a fit recovers the planted effect directly.

use std::path::Path;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use tracing::debug;

use crate::domain::{
    CoordinateGrid, Design, DesignMatrix, Identifier, Mask, Observation, PopulationMap,
    ReferenceMaps, Session, SliceAxis,
};
use crate::error::AppError;
use crate::io::layout::{ArtifactRole, StageQualifiers};
use crate::io::store;
use crate::study::{ProtocolEntry, Study};

/// File name of the study written under the data root.
pub const STUDY_FILE: &str = "study.json";

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub subjects: usize,
    pub seed: u64,
    pub shape: [usize; 3],
    pub scan_cycles: usize,
    pub block_length: usize,
    /// Repetition time between scan cycles (seconds).
    pub repetition_time: f64,
    pub baseline: f64,
    /// Peak task effect at the grid centre.
    pub effect: f64,
    pub noise: f64,
    pub jitter: f64,
    pub paradigm: String,
    pub population_space: String,
    pub diffeomorphism: String,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            subjects: 4,
            seed: 42,
            shape: [4, 4, 4],
            scan_cycles: 40,
            block_length: 5,
            repetition_time: 2.0,
            baseline: 100.0,
            effect: 3.0,
            noise: 1.0,
            jitter: 0.15,
            paradigm: "motor".to_string(),
            population_space: "synthetic".to_string(),
            diffeomorphism: "identity".to_string(),
        }
    }
}

/// Everything generated for one subject.
#[derive(Debug, Clone)]
pub struct SyntheticSubject {
    pub session: Session,
    pub reference_maps: ReferenceMaps,
    pub population_map: PopulationMap,
    pub design: Design,
}

fn validate(config: &SyntheticConfig) -> Result<(), AppError> {
    if config.subjects == 0 {
        return Err(AppError::new(2, "Subject count must be > 0."));
    }
    if config.shape.contains(&0) {
        return Err(AppError::new(2, "Grid shape must be non-empty on every axis."));
    }
    if config.scan_cycles == 0 || config.block_length == 0 {
        return Err(AppError::new(2, "Scan cycles and block length must be > 0."));
    }
    if !(config.repetition_time.is_finite() && config.repetition_time > 0.0) {
        return Err(AppError::new(2, "Repetition time must be finite and > 0."));
    }
    if !(config.noise.is_finite() && config.noise >= 0.0 && config.jitter.is_finite() && config.jitter >= 0.0) {
        return Err(AppError::new(2, "Noise and jitter must be finite and >= 0."));
    }
    Ok(())
}

fn acquisition_time(index: usize) -> Result<NaiveDateTime, AppError> {
    let start = NaiveDate::from_ymd_opt(2020, 1, 6)
        .and_then(|d| d.and_hms_opt(9, 0, 0))
        .ok_or_else(|| AppError::new(4, "Invalid synthetic start date."))?;
    Ok(start + Duration::days(index as i64))
}

/// Generate one subject.
pub fn generate_subject(
    name: Identifier,
    config: &SyntheticConfig,
    rng: &mut StdRng,
) -> Result<SyntheticSubject, AppError> {
    let noise = Normal::new(0.0, config.noise)
        .map_err(|e| AppError::new(4, format!("Noise distribution error: {e}")))?;
    let jitter = Normal::new(0.0, config.jitter)
        .map_err(|e| AppError::new(4, format!("Jitter distribution error: {e}")))?;

    let [ni, nj, nk] = config.shape;
    let slice_axis = SliceAxis::K;
    let centre = [
        (ni as f64 - 1.0) / 2.0,
        (nj as f64 - 1.0) / 2.0,
        (nk as f64 - 1.0) / 2.0,
    ];
    let blob_width = (ni.max(nj).max(nk) as f64).max(1.0);
    let slice_time = config.repetition_time / nk as f64;

    let mut observations = Vec::with_capacity(config.scan_cycles * ni * nj * nk);
    let mut design = Vec::with_capacity(observations.capacity() * 2);
    for cycle in 0..config.scan_cycles {
        let block = cycle / config.block_length;
        let task = (block % 2) as u32;
        for i in 0..ni {
            for j in 0..nj {
                for k in 0..nk {
                    let position = [
                        i as f64 + rng.sample(jitter),
                        j as f64 + rng.sample(jitter),
                        k as f64 + rng.sample(jitter),
                    ];
                    let d2 = (0..3).map(|a| (position[a] - centre[a]).powi(2)).sum::<f64>();
                    let amplitude = config.effect * (-d2 / (2.0 * blob_width * blob_width)).exp();
                    let response =
                        config.baseline + amplitude * f64::from(task) + rng.sample(noise);
                    observations.push(Observation {
                        position,
                        response,
                        time: cycle as f64 * config.repetition_time + k as f64 * slice_time,
                        task,
                        block: block as u32,
                        scan_cycle: cycle,
                        slice: k,
                    });
                    design.push(1.0);
                    design.push(f64::from(task));
                }
            }
        }
    }

    let rows = observations.len();
    let matrix = DesignMatrix::new(vec!["intercept".to_string(), "task".to_string()], rows, design)
        .map_err(|e| AppError::new(4, format!("Synthetic design error: {e}")))?;

    Ok(SyntheticSubject {
        session: Session {
            name: name.clone(),
            observations,
            slice_axis,
            scan_cycles: config.scan_cycles,
        },
        reference_maps: ReferenceMaps::clean(name.clone(), config.scan_cycles),
        population_map: PopulationMap {
            name: name.clone(),
            population_space: config.population_space.clone(),
            diffeomorphism: config.diffeomorphism.clone(),
            grid: CoordinateGrid::identity(config.shape),
            mask: Some(Mask::full(config.shape)),
        },
        design: Design { name, matrix },
    })
}

/// Generate a study and write every subject artifact plus the study itself
/// under `root`.
pub fn write_synthetic_study(root: &Path, config: &SyntheticConfig) -> Result<Study, AppError> {
    validate(config)?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut protocol = Vec::with_capacity(config.subjects);
    for i in 0..config.subjects {
        let cohort = if i % 2 == 0 { "ctl" } else { "pat" };
        protocol.push(ProtocolEntry::new(&Identifier::new(
            cohort,
            (i + 1) as u32,
            acquisition_time(i)?,
            config.paradigm.clone(),
        )));
    }
    let study = Study::new(protocol);

    let qualifiers = StageQualifiers {
        space: Some(config.population_space.clone()),
        diffeomorphism: Some(config.diffeomorphism.clone()),
        scale_type: None,
    };
    for entry in &study.protocol {
        let name = entry.identifier();
        let subject = generate_subject(name.clone(), config, &mut rng)?;
        let path = |role| study.layout.resolve(root, role, &name, &qualifiers);

        store::save(&path(ArtifactRole::Session)?, &subject.session)?;
        store::save(&path(ArtifactRole::ReferenceMaps)?, &subject.reference_maps)?;
        store::save(&path(ArtifactRole::PopulationMap)?, &subject.population_map)?;
        store::save(&path(ArtifactRole::Design)?, &subject.design)?;
        debug!(record = %name, observations = subject.session.observations.len(), "wrote synthetic subject");
    }

    study.save(&root.join(STUDY_FILE))?;
    Ok(study)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_subject() {
        let config = SyntheticConfig::default();
        let name = Identifier::new("ctl", 1, acquisition_time(0).unwrap(), "motor");
        let a = generate_subject(name.clone(), &config, &mut StdRng::seed_from_u64(7)).unwrap();
        let b = generate_subject(name, &config, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a.session, b.session);
        assert_eq!(a.session.observations.len(), 40 * 64);
        assert_eq!(a.design.matrix.nrows(), a.session.observations.len());
    }

    #[test]
    fn block_design_alternates() {
        let config = SyntheticConfig::default();
        let name = Identifier::new("ctl", 1, acquisition_time(0).unwrap(), "motor");
        let subject = generate_subject(name, &config, &mut StdRng::seed_from_u64(1)).unwrap();
        let per_cycle = 64;
        let task_of = |cycle: usize| subject.session.observations[cycle * per_cycle].task;
        assert_eq!(task_of(0), 0);
        assert_eq!(task_of(4), 0);
        assert_eq!(task_of(5), 1);
        assert_eq!(task_of(10), 0);
        assert_eq!(subject.design.matrix.row(5 * per_cycle), &[1.0, 1.0]);
    }

    #[test]
    fn writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyntheticConfig {
            subjects: 2,
            scan_cycles: 4,
            ..SyntheticConfig::default()
        };
        let study = write_synthetic_study(dir.path(), &config).unwrap();
        assert_eq!(study.protocol.len(), 2);
        assert_eq!(Study::load(&dir.path().join(STUDY_FILE)).unwrap(), study);

        let qualifiers = StageQualifiers {
            space: Some("synthetic".into()),
            diffeomorphism: Some("identity".into()),
            scale_type: None,
        };
        let roles = [
            ArtifactRole::Session,
            ArtifactRole::ReferenceMaps,
            ArtifactRole::PopulationMap,
            ArtifactRole::Design,
        ];
        let items: Vec<_> = study
            .iterate(dir.path(), &roles, &[], &qualifiers)
            .unwrap()
            .collect();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| item.valid()));
        assert_eq!(items[1].name.cohort, "pat");
    }

    #[test]
    fn rejects_empty_study() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyntheticConfig {
            subjects: 0,
            ..SyntheticConfig::default()
        };
        assert_eq!(write_synthetic_study(dir.path(), &config).unwrap_err().exit_code(), 2);
    }
}
