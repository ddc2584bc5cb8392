//! Formatted terminal output for batch runs.
//!
//! We keep formatting code in one place so:
//! - the fitting and batch code stays clean and testable
//! - output changes are localized

use crate::batch::{BatchReport, SkipReason};
use crate::domain::{BatchConfig, MaskPolicy};

/// Format the run header and outcome counts.
pub fn format_batch_summary(report: &BatchReport, config: &BatchConfig) -> String {
    let mut out = String::new();
    let kernel = &config.fit.kernel;

    out.push_str("=== fmrifit - kernel field fit ===\n");
    out.push_str(&format!("Study: {}\n", config.study.display()));
    out.push_str(&format!(
        "Space: {} | diffeomorphism={} | scale type={}\n",
        config.qualifiers.space.as_deref().unwrap_or("-"),
        config.qualifiers.diffeomorphism.as_deref().unwrap_or("-"),
        config.qualifiers.scale_type.as_deref().unwrap_or("-"),
    ));
    out.push_str(&format!(
        "Kernel: scale={:.3} radius={:.3} min_samples={} durbin_watson={}\n",
        kernel.scale, kernel.radius, kernel.min_samples, kernel.durbin_watson
    ));
    out.push_str(&format!(
        "Backend: {} | mask={} | burn-in={}\n",
        config.fit.backend.implementation().name(),
        match config.fit.mask {
            MaskPolicy::Apply => "apply",
            MaskPolicy::Ignore => "ignore",
        },
        config.fit.burn_in,
    ));

    out.push_str(&format!(
        "\nRecords: n={} | completed={} | failed={}\n",
        report.records.len(),
        report.completed(),
        report.failed()
    ));
    for (reason, label) in [
        (SkipReason::Exists, "exists"),
        (SkipReason::Locked, "locked"),
        (SkipReason::LockRemoved, "lock removed"),
        (SkipReason::DryRun, "dry run"),
    ] {
        let n = report.skipped(reason);
        if n > 0 {
            out.push_str(&format!("  skipped ({label}): {n}\n"));
        }
    }

    out
}

/// Format one line per record.
pub fn format_record_table(report: &BatchReport) -> String {
    let mut out = String::new();
    out.push_str(format!("{:<32} {:<24} {}\n", "record", "outcome", "detail").trim_end());
    out.push('\n');
    out.push_str(format!("{:-<32} {:-<24} {:-<6}\n", "", "", "").trim_end());
    out.push('\n');

    for record in &report.records {
        let (outcome, detail) = match &record.result {
            Ok(outcome) => (outcome.to_string(), String::new()),
            Err(e) => ("failed".to_string(), truncate(&e.to_string(), 60)),
        };
        out.push_str(
            format!(
                "{:<32} {:<24} {}\n",
                truncate(&record.name.full_name(), 32),
                outcome,
                detail
            )
            .trim_end(),
        );
        out.push('\n');
    }

    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out = String::new();
    for (i, ch) in s.chars().enumerate() {
        if i + 1 >= max {
            break;
        }
        out.push(ch);
    }
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{JobError, JobFlags, JobOutcome, RecordReport};
    use crate::domain::{FitSettings, Identifier};
    use crate::fit::{Backend, KernelParams};
    use crate::io::layout::StageQualifiers;
    use chrono::NaiveDate;

    fn report() -> BatchReport {
        let dt = NaiveDate::from_ymd_opt(2022, 4, 1)
            .unwrap()
            .and_hms_opt(7, 45, 0)
            .unwrap();
        let record = |index: u32, result| RecordReport {
            index: index as usize,
            name: Identifier::new("ctl", index, dt, "motor"),
            result,
        };
        BatchReport {
            records: vec![
                record(1, Ok(JobOutcome::Completed)),
                record(2, Ok(JobOutcome::Skipped(SkipReason::Exists))),
                record(3, Err(JobError::Dependency("Session missing".into()))),
            ],
        }
    }

    #[test]
    fn summary_counts_outcomes() {
        let config = BatchConfig {
            study: "study.json".into(),
            root: "data".into(),
            qualifiers: StageQualifiers {
                space: Some("mni".into()),
                diffeomorphism: Some("affine".into()),
                scale_type: Some("max".into()),
            },
            fit: FitSettings {
                kernel: KernelParams::new(2.0, 5.0),
                backend: Backend::Fast,
                mask: MaskPolicy::Apply,
                burn_in: 3,
                region: None,
            },
            flags: JobFlags::default(),
            cores: None,
            out: None,
        };
        let text = format_batch_summary(&report(), &config);
        assert!(text.contains("Records: n=3 | completed=1 | failed=1"));
        assert!(text.contains("skipped (exists): 1"));
        assert!(!text.contains("skipped (locked)"));
        assert!(text.contains("Backend: fast | mask=apply | burn-in=3"));
    }

    #[test]
    fn record_table_lists_failures() {
        let table = format_record_table(&report());
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[2].starts_with("ctl-0001-motor-2022-04-01-0745"));
        assert!(lines[2].contains("completed"));
        assert!(lines[4].contains("failed"));
        assert!(lines[4].contains("Session missing"));
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("abcdef", 10), "abcdef");
        assert_eq!(truncate("abcdef", 4), "abc.");
    }
}
