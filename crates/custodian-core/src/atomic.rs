//! Write-to-temp-then-rename file primitives.
//!
//! Every writer owned by the Registry Store or the State Manager goes
//! through here. No caller writes a destination path directly.

use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AtomicWriteError {
    #[error("failed to serialize {path}: {source}")]
    Serialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write temp file {path}: {source}")]
    WriteTemp {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to rename {from} to {to}: {source}")]
    Rename {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Best-effort fsync of a path's parent directory.
///
/// Not all platforms support directory fsync (notably Windows); failures are
/// swallowed, matching the rename itself being the actual durability
/// boundary on those platforms.
pub fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

/// Serialize `value` as pretty JSON and write it to `path` via
/// write-to-temp-in-same-directory then rename.
pub fn atomic_write_json<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), AtomicWriteError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| AtomicWriteError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }

    let data = serde_json::to_vec_pretty(value).map_err(|source| AtomicWriteError::Serialize {
        path: path.display().to_string(),
        source,
    })?;

    atomic_write_bytes(path, &data)
}

/// Write raw bytes to `path` via the same temp-then-rename discipline, for
/// callers that already have a serialized payload (e.g. the audit sink
/// appending a pre-formatted JSON line, though the sink itself appends
/// rather than renames; see `audit.rs`).
pub fn atomic_write_bytes(path: &Path, data: &[u8]) -> Result<(), AtomicWriteError> {
    let tmp = path.with_extension(format!(
        "{}.tmp-{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json"),
        std::process::id()
    ));

    {
        let mut f = fs::File::create(&tmp).map_err(|source| AtomicWriteError::WriteTemp {
            path: tmp.display().to_string(),
            source,
        })?;
        f.write_all(data)
            .map_err(|source| AtomicWriteError::WriteTemp {
                path: tmp.display().to_string(),
                source,
            })?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).map_err(|source| AtomicWriteError::Rename {
        from: tmp.display().to_string(),
        to: path.display().to_string(),
        source,
    })?;

    fsync_parent_dir(path);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        v: u32,
    }

    #[test]
    fn atomic_write_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        atomic_write_json(&path, &Sample { v: 1 }).unwrap();
        let read: Sample = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read, Sample { v: 1 });
    }

    #[test]
    fn atomic_write_json_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        atomic_write_json(&path, &Sample { v: 1 }).unwrap();
        atomic_write_json(&path, &Sample { v: 2 }).unwrap();
        let read: Sample = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read, Sample { v: 2 });
    }

    #[test]
    fn atomic_write_json_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deep/sample.json");
        atomic_write_json(&path, &Sample { v: 7 }).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn no_temp_file_survives_a_successful_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        atomic_write_json(&path, &Sample { v: 1 }).unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
