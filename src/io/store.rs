//! Typed artifact persistence.
//!
//! Every artifact is a JSON document wrapped in an envelope naming its kind:
//!
//! ```text
//! { "kind": "session", "body": { ... } }
//! ```
//!
//! A reader asks for a specific kind and gets back a `Slot`:
//! - `Missing` when nothing is at the path
//! - `Locked` when a job currently claims the path (or died holding it)
//! - `Ready` when the file holds the requested kind
//!
//! Anything else (unreadable JSON, a different kind) is a `StoreError`, so a
//! torn or foreign file is never trusted as a result.
//!
//! Writes go to a temporary sibling and are renamed into place, so concurrent
//! writers of the same path leave exactly one complete document behind.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::io::lock::Lock;

/// Serializable domain object with a fixed kind tag.
pub trait Artifact: Serialize + DeserializeOwned {
    const KIND: &'static str;
}

/// Outcome of reading a path that should hold a `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot<T> {
    Missing,
    Locked(Lock),
    Ready(T),
}

impl<T> Slot<T> {
    pub fn is_locked(&self) -> bool {
        matches!(self, Slot::Locked(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Slot::Ready(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unreadable artifact '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("'{path}' holds a {found}, expected a {expected}")]
    WrongKind {
        path: PathBuf,
        expected: &'static str,
        found: String,
    },
}

impl StoreError {
    pub fn path(&self) -> &Path {
        match self {
            StoreError::Io { path, .. } => path,
            StoreError::Parse { path, .. } => path,
            StoreError::WrongKind { path, .. } => path,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    kind: &'static str,
    body: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    kind: String,
    body: serde_json::Value,
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Atomically write `artifact` to `path`, creating parent directories.
pub fn save<T: Artifact>(path: &Path, artifact: &T) -> Result<(), StoreError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
    }

    let tmp = temporary_sibling(path);
    let result = write_envelope(&tmp, artifact).and_then(|()| {
        fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_envelope<T: Artifact>(tmp: &Path, artifact: &T) -> Result<(), StoreError> {
    let file = File::create(tmp).map_err(|e| StoreError::io(tmp, e))?;
    let mut writer = BufWriter::new(file);
    let envelope = EnvelopeRef {
        kind: T::KIND,
        body: artifact,
    };
    serde_json::to_writer(&mut writer, &envelope).map_err(|e| StoreError::Parse {
        path: tmp.to_path_buf(),
        message: e.to_string(),
    })?;
    writer.flush().map_err(|e| StoreError::io(tmp, e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| StoreError::io(tmp, e))?;
    Ok(())
}

fn temporary_sibling(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(".{file_name}.{}.{n}.tmp", std::process::id()))
}

/// Read the envelope at `path`; `None` if there is no file.
fn read_envelope(path: &Path) -> Result<Option<Envelope>, StoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let envelope: Envelope =
        serde_json::from_reader(BufReader::new(file)).map_err(|e| StoreError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    Ok(Some(envelope))
}

fn decode<T: DeserializeOwned>(path: &Path, body: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(body).map_err(|e| StoreError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Load a `T` from `path`, recognising locks.
pub fn load<T: Artifact>(path: &Path) -> Result<Slot<T>, StoreError> {
    let Some(envelope) = read_envelope(path)? else {
        return Ok(Slot::Missing);
    };
    if envelope.kind == Lock::KIND {
        return Ok(Slot::Locked(decode(path, envelope.body)?));
    }
    if envelope.kind != T::KIND {
        return Err(StoreError::WrongKind {
            path: path.to_path_buf(),
            expected: T::KIND,
            found: envelope.kind,
        });
    }
    Ok(Slot::Ready(decode(path, envelope.body)?))
}

/// Kind tag of the document at `path`, if any.
pub fn peek_kind(path: &Path) -> Result<Option<String>, StoreError> {
    Ok(read_envelope(path)?.map(|e| e.kind))
}
