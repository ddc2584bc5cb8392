//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments
//! - sets up logging
//! - turns arguments into a `BatchConfig`
//! - runs the batch fit (or data generation / lock cleanup)
//! - prints the run summary

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::batch::JobFlags;
use crate::cli::{Command, FitArgs, SimulateArgs, StudyArgs};
use crate::data::{STUDY_FILE, SyntheticConfig, write_synthetic_study};
use crate::domain::{BatchConfig, FitSettings};
use crate::error::AppError;
use crate::fit::KernelParams;
use crate::io::layout::StageQualifiers;

pub mod pipeline;

/// Entry point for the `fmrifit` binary.
pub fn run() -> Result<(), AppError> {
    let cli = crate::cli::Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Fit(args) => handle_fit(args),
        Command::Simulate(args) => handle_simulate(args),
        Command::Unlock(args) => handle_unlock(args),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // A subscriber may already be installed (tests driving `run`).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn handle_fit(args: FitArgs) -> Result<(), AppError> {
    let config = batch_config_from_args(&args);
    let run = pipeline::run_fit_batch(&config)?;

    println!("{}", crate::report::format_batch_summary(&run.report, &config));
    println!("{}", crate::report::format_record_table(&run.report));

    if run.report.failed() > 0 {
        return Err(AppError::new(
            4,
            format!("{} of {} records failed.", run.report.failed(), run.report.records.len()),
        ));
    }
    Ok(())
}

fn handle_simulate(args: SimulateArgs) -> Result<(), AppError> {
    let config = SyntheticConfig {
        subjects: args.subjects,
        seed: args.seed,
        shape: [args.size; 3],
        scan_cycles: args.scan_cycles,
        effect: args.effect,
        noise: args.noise,
        ..SyntheticConfig::default()
    };
    let study = write_synthetic_study(&args.root, &config)?;
    println!(
        "Wrote {} subjects to {} (study: {}, space={}, diffeomorphism={})",
        study.protocol.len(),
        args.root.display(),
        args.root.join(STUDY_FILE).display(),
        config.population_space,
        config.diffeomorphism,
    );
    Ok(())
}

fn handle_unlock(args: StudyArgs) -> Result<(), AppError> {
    let qualifiers = qualifiers_from_args(&args);
    let removed = pipeline::unlock_results(&args.study, &args.root, &qualifiers)?;
    println!("Removed {removed} result locks.");
    Ok(())
}

fn qualifiers_from_args(args: &StudyArgs) -> StageQualifiers {
    StageQualifiers {
        space: Some(args.space.clone()),
        diffeomorphism: Some(args.diffeomorphism.clone()),
        scale_type: Some(args.scale_type.clone()),
    }
}

pub fn batch_config_from_args(args: &FitArgs) -> BatchConfig {
    let mut kernel = KernelParams::new(args.scale, args.radius).with_min_samples(args.min_samples);
    // The slice axis is taken from each session when the fit runs.
    kernel.durbin_watson = args.durbin_watson;

    BatchConfig {
        study: args.study.study.clone(),
        root: args.study.root.clone(),
        qualifiers: qualifiers_from_args(&args.study),
        fit: FitSettings {
            kernel,
            backend: args.backend,
            mask: args.mask,
            burn_in: args.burn_in,
            region: args.region,
        },
        flags: JobFlags {
            remove_lock: args.remove_lock,
            ignore_lock: args.ignore_lock,
            force: args.force,
            skip: args.skip,
        },
        cores: args.cores,
        out: args.out.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;

    #[test]
    fn fit_args_become_batch_config() {
        let cli = Cli::parse_from([
            "fmrifit", "fit", "--study", "s.json", "--root", "data", "--space", "mni",
            "--diffeomorphism", "affine", "--scale-type", "max", "--scale", "2.5", "--radius",
            "6", "--min-samples", "50", "--durbin-watson", "-r", "-s", "--region", "0:2,0:2,1:3",
        ]);
        let Command::Fit(args) = cli.command else {
            panic!("expected fit");
        };
        let config = batch_config_from_args(&args);
        assert_eq!(config.fit.kernel.scale, 2.5);
        assert_eq!(config.fit.kernel.min_samples, 50);
        assert!(config.fit.kernel.durbin_watson);
        assert!(config.flags.remove_lock && config.flags.skip);
        assert!(!config.flags.force && !config.flags.ignore_lock);
        assert_eq!(config.qualifiers.space.as_deref(), Some("mni"));
        assert_eq!(config.fit.region.map(|r| r.shape()), Some([2, 2, 2]));
    }
}
