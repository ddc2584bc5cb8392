//! Advisory file locks.
//!
//! A `Lock` is an artifact of its own: a job writes one to its target path
//! before computing and overwrites it with the result when done. A reader that
//! finds a `Lock` where it expected a result knows that a job is running on
//! that path, or died while holding it.
//!
//! Acquisition is read-then-write, not compare-and-swap. Two jobs racing for
//! the same path may both compute; the atomic store guarantees that one
//! complete result survives.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::Identifier;
use crate::io::store::{self, Artifact, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    /// Record the job computes.
    pub owner: Identifier,
    /// Pipeline step holding the lock (e.g. `fmrifit`).
    pub purpose: String,
    pub target: PathBuf,
    pub created: DateTime<Utc>,
    pub pid: u32,
}

impl Artifact for Lock {
    const KIND: &'static str = "lock";
}

impl Lock {
    pub fn new(owner: Identifier, purpose: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            owner,
            purpose: purpose.into(),
            target: target.into(),
            created: Utc::now(),
            pid: std::process::id(),
        }
    }

    /// Write the lock to its target path.
    pub fn acquire(&self) -> Result<(), StoreError> {
        store::save(&self.target, self)
    }

    /// Remove the lock at `path`.
    ///
    /// Only a file that really holds a lock is removed; returns whether one was.
    pub fn unlock(path: &Path) -> Result<bool, StoreError> {
        match store::peek_kind(path) {
            Ok(Some(kind)) if kind == Lock::KIND => {}
            Ok(_) => return Ok(false),
            // A torn file is not a lock we can vouch for.
            Err(StoreError::Parse { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "lock removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::store::{Slot, load, save};
    use chrono::NaiveDate;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Output(u32);

    impl Artifact for Output {
        const KIND: &'static str = "output";
    }

    fn owner() -> Identifier {
        let dt = NaiveDate::from_ymd_opt(2018, 1, 2)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        Identifier::new("pat", 3, dt, "word")
    }

    #[test]
    fn lock_round_trip_then_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit/pat-0003.fit");

        let lock = Lock::new(owner(), "fmrifit", &path);
        lock.acquire().unwrap();

        match load::<Output>(&path).unwrap() {
            Slot::Locked(found) => {
                assert_eq!(found.owner, owner());
                assert_eq!(found.purpose, "fmrifit");
            }
            other => panic!("expected lock, got {other:?}"),
        }

        save(&path, &Output(7)).unwrap();
        assert_eq!(load::<Output>(&path).unwrap(), Slot::Ready(Output(7)));
    }

    #[test]
    fn unlock_never_removes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");

        assert!(!Lock::unlock(&path).unwrap());

        save(&path, &Output(1)).unwrap();
        assert!(!Lock::unlock(&path).unwrap());
        assert!(path.exists());

        Lock::new(owner(), "test", &path).acquire().unwrap();
        assert!(Lock::unlock(&path).unwrap());
        assert!(!path.exists());
    }
}
