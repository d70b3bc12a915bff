/// Atomic JSON documents: heartbeats, the session document and service metadata.
///
/// Every write goes to a temp file in the destination directory and is then
/// renamed over the destination, so readers only ever see a complete document.
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current wall-clock time as UNIX epoch seconds.
pub fn now_ts() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// A JSON document at a fixed path, rewritten whole on every update.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Atomically replace the document with `data`.
    pub fn write<T: Serialize>(&self, data: &T) -> Result<(), StateFileError> {
        let json =
            serde_json::to_vec(data).map_err(|e| StateFileError::Serialize { source: e })?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let write_err = |e| StateFileError::Write {
            path: dir.to_path_buf(),
            source: e,
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".nexus-state.")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(write_err)?;
        tmp.write_all(&json).map_err(write_err)?;
        tmp.flush().map_err(write_err)?;

        tmp.persist(&self.path).map_err(|e| StateFileError::Persist {
            to: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Write `data` only when no document exists yet.
    /// Returns Ok(true) if a document was written.
    pub fn write_if_missing<T: Serialize>(&self, data: &T) -> Result<bool, StateFileError> {
        if self.path.exists() {
            return Ok(false);
        }
        self.write(data)?;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read and parse a JSON document. Absence or a parse failure is `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "ignoring unparseable document");
            None
        }
    }
}

/// Errors from writing a state document.
#[derive(Debug)]
pub enum StateFileError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Persist {
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StateFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateFileError::Serialize { source } => {
                write!(f, "failed to serialize document: {source}")
            }
            StateFileError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp document in {}: {source}",
                    path.display()
                )
            }
            StateFileError::Persist { to, source } => {
                write!(f, "failed to rename temp document -> {}: {source}", to.display())
            }
        }
    }
}

impl std::error::Error for StateFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StateFileError::Serialize { source } => Some(source),
            StateFileError::Write { source, .. } => Some(source),
            StateFileError::Persist { source, .. } => Some(source),
        }
    }
}
