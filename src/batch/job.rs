//! The per-record lock protocol.
//!
//! `run_job` wraps one computation that produces the artifact at `target`.
//! In order:
//!
//! 1. a lock at the target is removed when asked to (`remove_lock` /
//!    `ignore_lock`), otherwise the record is skipped
//! 2. an existing artifact is kept unless `force` is set
//! 3. a dry run (`skip`) stops here
//! 4. the lock is written, the computation runs and its artifact replaces
//!    the lock
//!
//! A failing computation never leaves its own lock behind.

use std::fmt;
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use crate::batch::pool::LockLedger;
use crate::fit::FitError;
use crate::io::lock::Lock;
use crate::io::store::{self, Artifact, StoreError};
use crate::study::StudyItem;

/// How a job treats existing locks and artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFlags {
    /// Remove a lock at the target and skip the record.
    pub remove_lock: bool,
    /// Remove a lock at the target and carry on as if there was none.
    pub ignore_lock: bool,
    /// Recompute even when the artifact exists.
    pub force: bool,
    /// Dry run: report what would happen without computing.
    pub skip: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Locked,
    LockRemoved,
    Exists,
    DryRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Skipped(SkipReason),
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Completed => f.write_str("completed"),
            JobOutcome::Skipped(SkipReason::Locked) => f.write_str("skipped (locked)"),
            JobOutcome::Skipped(SkipReason::LockRemoved) => f.write_str("skipped (lock removed)"),
            JobOutcome::Skipped(SkipReason::Exists) => f.write_str("skipped (exists)"),
            JobOutcome::Skipped(SkipReason::DryRun) => f.write_str("skipped (dry run)"),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fit(#[from] FitError),

    #[error("unusable dependencies: {0}")]
    Dependency(String),

    #[error("{0}")]
    Compute(String),
}

/// What the target path held when the job looked at it.
enum TargetSlot {
    Missing,
    Locked,
    Ready,
}

fn inspect<T: Artifact>(target: &Path) -> Result<TargetSlot, JobError> {
    match store::peek_kind(target) {
        Ok(None) => Ok(TargetSlot::Missing),
        Ok(Some(kind)) if kind == Lock::KIND => Ok(TargetSlot::Locked),
        Ok(Some(kind)) if kind == T::KIND => Ok(TargetSlot::Ready),
        Ok(Some(found)) => Err(StoreError::WrongKind {
            path: target.to_path_buf(),
            expected: T::KIND,
            found,
        }
        .into()),
        // A torn write from a dead job; recompute over it.
        Err(StoreError::Parse { .. }) => {
            warn!(path = %target.display(), "unreadable target will be overwritten");
            Ok(TargetSlot::Missing)
        }
        Err(e) => Err(e.into()),
    }
}

/// Run `compute` for `item` under the lock protocol.
pub fn run_job<T, F>(
    item: &StudyItem,
    target: &Path,
    purpose: &str,
    flags: JobFlags,
    ledger: &LockLedger,
    compute: F,
) -> Result<JobOutcome, JobError>
where
    T: Artifact,
    F: FnOnce() -> Result<T, JobError>,
{
    let mut slot = inspect::<T>(target)?;

    if let TargetSlot::Locked = slot {
        if !(flags.remove_lock || flags.ignore_lock) {
            info!(record = %item.name, path = %target.display(), "target is locked");
            return Ok(JobOutcome::Skipped(SkipReason::Locked));
        }
        Lock::unlock(target)?;
        info!(record = %item.name, path = %target.display(), "removed lock");
        if flags.remove_lock {
            return Ok(JobOutcome::Skipped(SkipReason::LockRemoved));
        }
        slot = TargetSlot::Missing;
    }

    if let TargetSlot::Ready = slot {
        if !flags.force {
            return Ok(JobOutcome::Skipped(SkipReason::Exists));
        }
    }

    if flags.skip {
        return Ok(JobOutcome::Skipped(SkipReason::DryRun));
    }

    Lock::new(item.name.clone(), purpose, target).acquire()?;
    ledger.hold(item.index, target);

    let saved = compute().and_then(|artifact| Ok(store::save(target, &artifact)?));
    match saved {
        Ok(()) => {
            ledger.release(item.index);
            Ok(JobOutcome::Completed)
        }
        Err(e) => {
            warn!(record = %item.name, path = %target.display(), error = %e, "job failed");
            conditional_unlock(ledger, item.index, target);
            Err(e)
        }
    }
}

/// Remove the lock at `target` if this run holds it.
///
/// Nothing happens when the ledger does not list `target` for `index`, and a
/// file that no longer holds a lock is left alone.
pub fn conditional_unlock(ledger: &LockLedger, index: usize, target: &Path) {
    if !ledger.holds(index, target) {
        return;
    }
    if let Err(e) = Lock::unlock(target) {
        warn!(path = %target.display(), error = %e, "could not remove lock");
        return;
    }
    ledger.release(index);
}
