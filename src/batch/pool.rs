//! Running one job per record on a bounded worker pool.
//!
//! Jobs share nothing but the `LockLedger`, where each job lists the lock it
//! currently holds. Whatever is still listed when the pool winds down (a
//! worker panicked, or the run was aborted) belongs to a job that never
//! finished, so the orchestrator removes those locks before returning.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rayon::prelude::*;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::batch::job::{JobError, JobOutcome, SkipReason};
use crate::domain::Identifier;
use crate::io::lock::Lock;
use crate::study::{Study, StudyItem};

/// Locks held by the jobs of one run, keyed by record index.
#[derive(Debug, Default)]
pub struct LockLedger {
    held: Mutex<BTreeMap<usize, PathBuf>>,
}

impl LockLedger {
    fn entries(&self) -> MutexGuard<'_, BTreeMap<usize, PathBuf>> {
        // A panicking job cannot leave the map half-updated.
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn hold(&self, index: usize, path: &Path) {
        self.entries().insert(index, path.to_path_buf());
    }

    pub fn release(&self, index: usize) {
        self.entries().remove(&index);
    }

    pub fn holds(&self, index: usize, path: &Path) -> bool {
        self.entries().get(&index).is_some_and(|p| p == path)
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Remove every lock still listed; returns how many files were removed.
    pub fn cleanup(&self) -> usize {
        let held = std::mem::take(&mut *self.entries());
        let mut removed = 0;
        for (index, path) in held {
            match Lock::unlock(&path) {
                Ok(true) => {
                    info!(record = index, path = %path.display(), "removed lock of unfinished job");
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove lock"),
            }
        }
        removed
    }
}

/// Cancels a running batch.
///
/// Jobs already running finish; jobs not yet started are not started.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    /// Records that finished before the abort are kept in `report`.
    #[error("batch aborted: {reason} ({cleaned} locks removed)")]
    PoolAbort {
        reason: String,
        cleaned: usize,
        report: BatchReport,
    },

    #[error("cannot start worker pool: {0}")]
    ThreadPool(String),
}

/// Outcome of one record.
#[derive(Debug)]
pub struct RecordReport {
    pub index: usize,
    pub name: Identifier,
    pub result: Result<JobOutcome, JobError>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub records: Vec<RecordReport>,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.count(|r| matches!(r, Ok(JobOutcome::Completed)))
    }

    pub fn skipped(&self, reason: SkipReason) -> usize {
        self.count(|r| matches!(r, Ok(JobOutcome::Skipped(s)) if *s == reason))
    }

    pub fn failed(&self) -> usize {
        self.count(Result::is_err)
    }

    fn count(&self, pred: impl Fn(&Result<JobOutcome, JobError>) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.result)).count()
    }

    /// Mark every failed record invalid in `study`.
    pub fn apply_to(&self, study: &mut Study) {
        for record in self.records.iter().filter(|r| r.result.is_err()) {
            study.mark_invalid(record.index);
        }
    }
}

/// Runs jobs over study items.
#[derive(Debug, Clone, Default)]
pub struct Orchestrator {
    cores: Option<usize>,
    abort: AbortHandle,
}

impl Orchestrator {
    /// `None` uses every thread rayon would use by default.
    pub fn new(cores: Option<usize>) -> Self {
        Self {
            cores,
            abort: AbortHandle::default(),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run `job` once per item.
    ///
    /// With one core or at most one item the jobs run on the calling thread.
    /// A panicking job stops the run like an abort; its record is reported as
    /// failed.
    pub fn run<F>(&self, items: &[StudyItem], job: F) -> Result<BatchReport, BatchError>
    where
        F: Fn(&StudyItem, &LockLedger) -> Result<JobOutcome, JobError> + Sync,
    {
        let ledger = LockLedger::default();
        let panicked = AtomicBool::new(false);
        let sequential = self.cores == Some(1) || items.len() <= 1;

        let run_one = |item: &StudyItem| -> Option<RecordReport> {
            if self.abort.is_aborted() || panicked.load(Ordering::SeqCst) {
                return None;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| job(item, &ledger)))
                .unwrap_or_else(|_| {
                    panicked.store(true, Ordering::SeqCst);
                    Err(JobError::Compute("job panicked".to_string()))
                });
            match &result {
                Ok(outcome) => info!(record = %item.name, "{outcome}"),
                Err(e) => error!(record = %item.name, error = %e, "failed"),
            }
            Some(RecordReport {
                index: item.index,
                name: item.name.clone(),
                result,
            })
        };

        let mut records: Vec<RecordReport> = if sequential {
            items.iter().filter_map(run_one).collect()
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.cores.unwrap_or(0))
                .build()
                .map_err(|e| BatchError::ThreadPool(e.to_string()))?;
            pool.install(|| items.par_iter().filter_map(run_one).collect())
        };
        records.sort_by_key(|r| r.index);
        let report = BatchReport { records };

        let cleaned = ledger.cleanup();
        let reason = if panicked.load(Ordering::SeqCst) {
            "a worker panicked"
        } else if self.abort.is_aborted() {
            "abort requested"
        } else {
            return Ok(report);
        };
        Err(BatchError::PoolAbort {
            reason: reason.to_string(),
            cleaned,
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::job::{JobFlags, run_job};
    use crate::io::store::{self, Artifact, Slot};
    use crate::study::ProtocolEntry;
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Output {
        record: usize,
        payload: Vec<u32>,
    }

    impl Artifact for Output {
        const KIND: &'static str = "output";
    }

    fn items(n: usize) -> Vec<StudyItem> {
        (0..n)
            .map(|i| {
                let dt = NaiveDate::from_ymd_opt(2021, 6, 1)
                    .unwrap()
                    .and_hms_opt(10, i as u32, 0)
                    .unwrap();
                StudyItem::new(i, Identifier::new("ctl", i as u32, dt, "motor"))
            })
            .collect()
    }

    #[test]
    fn concurrent_jobs_on_one_path_leave_one_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("shared.out");
        let orchestrator = Orchestrator::new(Some(4));

        let report = orchestrator
            .run(&items(8), |item, ledger| {
                run_job(item, &target, "test", JobFlags { ignore_lock: true, force: true, ..JobFlags::default() }, ledger, || {
                    Ok(Output {
                        record: item.index,
                        payload: vec![item.index as u32; 10_000],
                    })
                })
            })
            .unwrap();

        assert_eq!(report.records.len(), 8);
        assert_eq!(report.failed(), 0, "{:?}", report.records);
        match store::load::<Output>(&target).unwrap() {
            Slot::Ready(out) => assert!(out.payload.iter().all(|v| *v as usize == out.record)),
            other => panic!("expected one complete artifact, got {other:?}"),
        }
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn panicking_worker_aborts_and_cleans_locks() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(Some(1));

        let result = orchestrator.run(&items(3), |item, ledger| {
            let target = dir.path().join(format!("{}.out", item.index));
            run_job::<Output, _>(item, &target, "test", JobFlags::default(), ledger, || {
                if item.index == 1 {
                    panic!("worker died");
                }
                Ok(Output {
                    record: item.index,
                    payload: Vec::new(),
                })
            })
        });

        match result {
            Err(BatchError::PoolAbort { cleaned, report, .. }) => {
                assert_eq!(cleaned, 1);
                assert_eq!(report.completed(), 1);
                assert_eq!(report.failed(), 1);

                let mut study =
                    Study::new(items(3).iter().map(|i| ProtocolEntry::new(&i.name)).collect());
                report.apply_to(&mut study);
                let valid: Vec<bool> = study.protocol.iter().map(|e| e.valid).collect();
                assert_eq!(valid, vec![true, false, true]);
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert!(store::load::<Output>(&dir.path().join("0.out")).unwrap().ready().is_some());
        assert!(!dir.path().join("1.out").exists());
    }

    fn no_locks_left(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().all(|entry| {
            let path = entry.unwrap().path();
            store::peek_kind(&path).unwrap().as_deref() != Some(Lock::KIND)
        })
    }

    #[test]
    fn panicking_worker_on_thread_pool_cleans_locks() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(Some(4));

        let result = orchestrator.run(&items(12), |item, ledger| {
            let target = dir.path().join(format!("{}.out", item.index));
            run_job::<Output, _>(item, &target, "test", JobFlags::default(), ledger, || {
                if item.index == 3 {
                    panic!("worker died");
                }
                Ok(Output {
                    record: item.index,
                    payload: vec![1; 100],
                })
            })
        });

        let (cleaned, report) = match result {
            Err(BatchError::PoolAbort { cleaned, report, .. }) => (cleaned, report),
            other => panic!("expected abort, got {other:?}"),
        };
        assert_eq!(cleaned, 1);
        assert!(no_locks_left(dir.path()));
        assert!(!dir.path().join("3.out").exists());

        let failed = report.records.iter().find(|r| r.index == 3).unwrap();
        assert!(failed.result.is_err());
        for record in report.records.iter().filter(|r| r.result.is_ok()) {
            let path = dir.path().join(format!("{}.out", record.index));
            let out = store::load::<Output>(&path).unwrap().ready().unwrap();
            assert_eq!(out.record, record.index);
        }
        assert_eq!(report.completed() + report.failed(), report.records.len());
    }

    #[test]
    fn abort_on_thread_pool_keeps_finished_results() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(Some(4));
        let handle = orchestrator.abort_handle();

        let result = orchestrator.run(&items(16), |item, ledger| {
            if item.index == 0 {
                handle.abort();
            }
            let target = dir.path().join(format!("{}.out", item.index));
            run_job(item, &target, "test", JobFlags::default(), ledger, || {
                Ok(Output {
                    record: item.index,
                    payload: Vec::new(),
                })
            })
        });

        let (cleaned, report) = match result {
            Err(BatchError::PoolAbort { cleaned, report, .. }) => (cleaned, report),
            other => panic!("expected abort, got {other:?}"),
        };
        assert_eq!(cleaned, 0);
        assert!(no_locks_left(dir.path()));
        assert_eq!(report.failed(), 0);
        assert!(report.records.iter().any(|r| r.index == 0));
        for record in &report.records {
            let path = dir.path().join(format!("{}.out", record.index));
            assert!(store::load::<Output>(&path).unwrap().ready().is_some());
        }
    }

    #[test]
    fn abort_handle_stops_new_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(Some(1));
        let handle = orchestrator.abort_handle();
        let started = AtomicUsize::new(0);

        let result = orchestrator.run(&items(5), |item, ledger| {
            started.fetch_add(1, Ordering::SeqCst);
            let target = dir.path().join(format!("{}.out", item.index));
            let outcome = run_job(item, &target, "test", JobFlags::default(), ledger, || {
                Ok(Output {
                    record: item.index,
                    payload: Vec::new(),
                })
            });
            if item.index == 1 {
                handle.abort();
            }
            outcome
        });

        assert!(matches!(result, Err(BatchError::PoolAbort { cleaned: 0, .. })));
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failures_mark_records_invalid() {
        let orchestrator = Orchestrator::new(Some(2));
        let report = orchestrator
            .run(&items(4), |item, _ledger| {
                if item.index % 2 == 1 {
                    Err(JobError::Compute("no".into()))
                } else {
                    Ok(JobOutcome::Skipped(SkipReason::Exists))
                }
            })
            .unwrap();
        assert_eq!(report.failed(), 2);
        assert_eq!(report.skipped(SkipReason::Exists), 2);
        assert_eq!(report.completed(), 0);

        let mut study = Study::new(items(4).iter().map(|i| ProtocolEntry::new(&i.name)).collect());
        report.apply_to(&mut study);
        let valid: Vec<bool> = study.protocol.iter().map(|e| e.valid).collect();
        assert_eq!(valid, vec![true, false, true, false]);
    }
}
