//! Command-line parsing for the kernel field fitter.
//!
//! The goal of this module is to keep **argument parsing** and **command dispatch**
//! separate from the fitting and batch code.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::domain::{IndexBox, MaskPolicy};
use crate::fit::{Backend, DEFAULT_MIN_SAMPLES};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "fmrifit", version, about = "Kernel-weighted voxelwise regression over FMRI studies")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit the kernel regression for every active record of a study.
    Fit(FitArgs),
    /// Write a synthetic study (sessions, reference maps, population maps, designs).
    Simulate(SimulateArgs),
    /// Remove result locks left behind by dead fit jobs.
    Unlock(StudyArgs),
}

/// Which study to process and how to name its files.
#[derive(Debug, Args, Clone)]
pub struct StudyArgs {
    /// Study JSON (protocol, covariates, file layout).
    #[arg(long, value_name = "JSON")]
    pub study: PathBuf,

    /// Data root the layout templates are resolved against.
    #[arg(long, value_name = "DIR")]
    pub root: PathBuf,

    /// Population space name.
    #[arg(long)]
    pub space: String,

    /// Diffeomorphism family used to map the population space.
    #[arg(long)]
    pub diffeomorphism: String,

    /// Scale type tag of the results (part of the result path).
    #[arg(long = "scale-type")]
    pub scale_type: String,
}

/// Options for fitting.
#[derive(Debug, Args, Clone)]
pub struct FitArgs {
    #[command(flatten)]
    pub study: StudyArgs,

    /// Gaussian kernel standard deviation (subject index units).
    #[arg(long)]
    pub scale: f64,

    /// Hard neighbourhood radius (subject index units).
    #[arg(long)]
    pub radius: f64,

    /// A grid point needs more than this many observations in its radius.
    #[arg(long, default_value_t = DEFAULT_MIN_SAMPLES)]
    pub min_samples: usize,

    /// Also compute the Durbin-Watson statistic of the local residuals.
    #[arg(long)]
    pub durbin_watson: bool,

    #[arg(long, value_enum, default_value_t = Backend::Fast)]
    pub backend: Backend,

    /// Whether the population-map mask restricts the fit.
    #[arg(long, value_enum, default_value_t = MaskPolicy::Apply)]
    pub mask: MaskPolicy,

    /// Drop observations of the first N scan cycles.
    #[arg(long, default_value_t = 0)]
    pub burn_in: usize,

    /// Fit only a sub-box of the population grid: `i0:i1,j0:j1,k0:k1`.
    #[arg(long, value_parser = parse_region)]
    pub region: Option<IndexBox>,

    /// Remove locks at result paths and skip those records.
    #[arg(short = 'r', long, conflicts_with = "ignore_lock")]
    pub remove_lock: bool,

    /// Remove locks at result paths and fit anyway.
    #[arg(short = 'i', long)]
    pub ignore_lock: bool,

    /// Refit records whose result already exists.
    #[arg(short = 'f', long, conflicts_with = "skip")]
    pub force: bool,

    /// Dry run: report what would be done.
    #[arg(short = 's', long)]
    pub skip: bool,

    /// Number of worker threads (default: all cores).
    #[arg(short = 'j', long)]
    pub cores: Option<usize>,

    /// Write the study with updated validity here after the batch.
    #[arg(long, value_name = "JSON")]
    pub out: Option<PathBuf>,
}

/// Options for synthetic data generation.
#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    /// Directory the study and its artifacts are written to.
    #[arg(long, value_name = "DIR")]
    pub root: PathBuf,

    #[arg(short = 'n', long, default_value_t = 4)]
    pub subjects: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Scan cycles per session.
    #[arg(long, default_value_t = 40)]
    pub scan_cycles: usize,

    /// Edge length of the cubic subject grid.
    #[arg(long, default_value_t = 4)]
    pub size: usize,

    /// Peak task effect.
    #[arg(long, default_value_t = 3.0)]
    pub effect: f64,

    /// Noise standard deviation.
    #[arg(long, default_value_t = 1.0)]
    pub noise: f64,
}

/// Parse `i0:i1,j0:j1,k0:k1` into a half-open index box.
pub fn parse_region(s: &str) -> Result<IndexBox, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return Err(format!("expected three ranges 'i0:i1,j0:j1,k0:k1', got '{s}'"));
    }
    let mut start = [0usize; 3];
    let mut end = [0usize; 3];
    for (axis, part) in parts.iter().enumerate() {
        let (a, b) = part
            .split_once(':')
            .ok_or_else(|| format!("range '{part}' is not of the form start:end"))?;
        start[axis] = a.trim().parse().map_err(|_| format!("invalid start in '{part}'"))?;
        end[axis] = b.trim().parse().map_err(|_| format!("invalid end in '{part}'"))?;
        if end[axis] <= start[axis] {
            return Err(format!("empty range '{part}'"));
        }
    }
    Ok(IndexBox { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_parsing() {
        assert_eq!(
            parse_region("0:2, 1:3,0:4").unwrap(),
            IndexBox {
                start: [0, 1, 0],
                end: [2, 3, 4]
            }
        );
        assert!(parse_region("0:2,1:3").is_err());
        assert!(parse_region("0:2,3:3,0:1").is_err());
        assert!(parse_region("a:2,0:1,0:1").is_err());
    }

    #[test]
    fn lock_and_rerun_flags_are_exclusive() {
        let base = [
            "fmrifit", "fit", "--study", "s.json", "--root", "data", "--space", "mni",
            "--diffeomorphism", "affine", "--scale-type", "max", "--scale", "2", "--radius", "5",
        ];
        let with = |extra: &[&'static str]| {
            Cli::try_parse_from(base.iter().chain(extra).copied().collect::<Vec<_>>())
        };
        assert!(with(&["-r", "-i"]).is_err());
        assert!(with(&["-f", "-s"]).is_err());
        assert!(with(&["-r", "-f"]).is_ok());
        assert!(with(&["-i", "-s"]).is_ok());
    }

    #[test]
    fn fit_flags_parse() {
        let cli = Cli::parse_from([
            "fmrifit", "-v", "fit", "--study", "s.json", "--root", "data", "--space", "mni",
            "--diffeomorphism", "affine", "--scale-type", "max", "--scale", "2", "--radius", "5",
            "-f", "-j", "3", "--backend", "reference", "--mask", "ignore",
        ]);
        assert_eq!(cli.verbose, 1);
        let Command::Fit(args) = cli.command else {
            panic!("expected fit");
        };
        assert!(args.force && !args.skip && !args.remove_lock);
        assert_eq!(args.cores, Some(3));
        assert_eq!(args.backend, Backend::Reference);
        assert_eq!(args.mask, MaskPolicy::Ignore);
        assert_eq!(args.min_samples, DEFAULT_MIN_SAMPLES);
        assert_eq!(args.study.scale_type, "max");
    }
}
