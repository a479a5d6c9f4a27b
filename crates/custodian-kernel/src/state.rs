//! State Manager.
//!
//! Cross-run repository state: chain-run history, repository fingerprinting,
//! and accumulated findings keyed by a stable repository id. Owns
//! `RepositoryState` and `ChainRun` records on disk under `<var>/state`.

use chrono::Utc;
use custodian_core::{checksum_bytes, AtomicWriteError, ChainRun, ChainRunStatus, Finding, Id, RepositoryState};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("chain run {0} not found")]
    RunNotFound(Id),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Write(#[from] AtomicWriteError),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

/// Fixed ignore-list entries every fingerprint skips regardless of
/// configuration.
const DEFAULT_IGNORE: &[&str] = &[
    ".git",
    "var",
    "target",
    "node_modules",
    ".venv",
    "venv",
    "__pycache__",
    "dist",
    "build",
];

/// Lightweight entry persisted in the global run index.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct RunIndexEntry {
    run_id: Id,
    chain_name: String,
    repository_root: String,
    status: ChainRunStatus,
    started_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct RunIndex {
    entries: Vec<RunIndexEntry>,
}

/// Per-repository-id mutex map serializing writers targeting the same
/// repository root across concurrent chain invocations within one process.
#[derive(Debug, Default)]
pub struct Coordinator {
    map: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Coordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lock_for(&self, repository_id: &str) -> Arc<AsyncMutex<()>> {
        self.map
            .lock()
            .expect("coordinator map lock poisoned")
            .entry(repository_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// State Manager, rooted at `<var>/state`.
pub struct StateManager {
    root: PathBuf,
    index_lock: Mutex<()>,
    fingerprint_ignore: Vec<String>,
    pub coordinator: Coordinator,
}

impl StateManager {
    #[must_use]
    pub fn new(root: PathBuf, fingerprint_ignore: Vec<String>) -> Self {
        Self {
            root,
            index_lock: Mutex::new(()),
            fingerprint_ignore,
            coordinator: Coordinator::new(),
        }
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn repositories_dir(&self) -> PathBuf {
        self.root.join("repositories")
    }

    fn global_index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn run_path(&self, run_id: &Id) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    fn repository_path(&self, repository_id: &str) -> PathBuf {
        self.repositories_dir().join(format!("{repository_id}.json"))
    }

    /// Short, stable id derived from the normalized absolute repository
    /// path via a collision-resistant digest. Used only for file
    /// layout, never for cross-repository joins.
    #[must_use]
    pub fn repository_id(repository_root: &str) -> String {
        let normalized = normalize_path_str(repository_root);
        checksum_bytes(normalized.as_bytes())[..16].to_string()
    }

    fn read_global_index(&self) -> Result<RunIndex, StateError> {
        let path = self.global_index_path();
        if !path.exists() {
            return Ok(RunIndex::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| StateError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_global_index(&self, index: &RunIndex) -> Result<(), StateError> {
        custodian_core::atomic_write_json(&self.global_index_path(), index)?;
        Ok(())
    }

    /// Persist a `ChainRun`, update the global run index, and roll its
    /// outcome into the owning repository's state.
    pub fn record_chain_run(&self, run: &ChainRun) -> Result<(), StateError> {
        custodian_core::atomic_write_json(&self.run_path(&run.run_id), run)?;

        {
            let _guard = self.index_lock.lock().expect("state index lock poisoned");
            let mut index = self.read_global_index()?;
            index.entries.push(RunIndexEntry {
                run_id: run.run_id.clone(),
                chain_name: run.chain_name.clone(),
                repository_root: run.repository_root.clone(),
                status: run.status,
                started_at: run.started_at,
            });
            // Newest-first by start time, ties broken by the run id's own
            // sortable (UUIDv7) ordering.
            index
                .entries
                .sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.run_id.cmp(&a.run_id)));
            self.write_global_index(&index)?;
        }

        let mut state = self.get_repository_state(&run.repository_root)?;
        state.total_runs += 1;
        if run.status == ChainRunStatus::Completed {
            state
                .last_successful_runs
                .insert(run.chain_name.clone(), run.run_id.clone());
        }
        state.updated_at = Utc::now();
        self.save_repository_state(&state)?;

        Ok(())
    }

    pub fn get_chain_run(&self, run_id: &Id) -> Result<ChainRun, StateError> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Err(StateError::RunNotFound(run_id.clone()));
        }
        let content = std::fs::read_to_string(&path).map_err(|source| StateError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// List runs, newest-first, optionally filtered by repository root.
    pub fn list_runs(
        &self,
        repository_root: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChainRun>, StateError> {
        let index = self.read_global_index()?;
        index
            .entries
            .iter()
            .filter(|e| match repository_root {
                Some(root) => e.repository_root == root,
                None => true,
            })
            .take(limit)
            .map(|e| self.get_chain_run(&e.run_id))
            .collect()
    }

    /// Return the repository's current state, creating an unpersisted
    /// fresh one on first observation.
    pub fn get_repository_state(&self, repository_root: &str) -> Result<RepositoryState, StateError> {
        let repository_id = Self::repository_id(repository_root);
        let path = self.repository_path(&repository_id);
        if !path.exists() {
            return Ok(RepositoryState::new(
                repository_id,
                repository_root.to_string(),
                Utc::now(),
            ));
        }
        let content = std::fs::read_to_string(&path).map_err(|source| StateError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_repository_state(&self, state: &RepositoryState) -> Result<(), StateError> {
        custodian_core::atomic_write_json(&self.repository_path(&state.repository_id), state)?;
        Ok(())
    }

    /// Compute the repository's current fingerprint and compare it to the
    /// one stored in `RepositoryState`. A repository never before observed
    /// is reported as changed.
    pub fn has_repository_changed(&self, repository_root: &Path) -> Result<bool, StateError> {
        let current = self.compute_fingerprint(repository_root)?;
        let stored = self.get_repository_state(&repository_root.display().to_string())?;
        Ok(stored.fingerprint.is_empty() || stored.fingerprint != current)
    }

    /// Deterministic, sorted walk of `root` skipping the fixed ignore list
    /// plus any configured extras, folding `(relative_path, size,
    /// content_hash)` per file into a single streaming digest.
    pub fn compute_fingerprint(&self, root: &Path) -> Result<String, StateError> {
        let mut hasher = Sha256::new();
        let mut entries: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .into_iter()
            .filter_entry(|entry| !self.is_ignored(root, entry.path()))
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.path().to_path_buf())
            .collect();
        entries.sort();

        for path in entries {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            let bytes = std::fs::read(&path).map_err(|source| StateError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let content_hash = checksum_bytes(&bytes);
            hasher.update(relative.to_string_lossy().replace('\\', "/").as_bytes());
            hasher.update([0u8]);
            hasher.update(bytes.len().to_le_bytes());
            hasher.update(content_hash.as_bytes());
            hasher.update([0u8]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    }

    fn is_ignored(&self, root: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };
        let Some(first) = relative.components().next() else {
            return false;
        };
        let name = first.as_os_str().to_string_lossy();
        DEFAULT_IGNORE.contains(&name.as_ref())
            || self.fingerprint_ignore.iter().any(|ignored| ignored == name.as_ref())
    }

    /// Merge `findings` into the repository's accumulated list, deduplicated
    /// by `Finding::dedup_key`; the most recent observation wins on
    /// collision.
    pub fn accumulate_findings(
        &self,
        repository_root: &str,
        findings: Vec<Finding>,
    ) -> Result<(), StateError> {
        let mut state = self.get_repository_state(repository_root)?;
        let mut by_key: HashMap<String, Finding> = state
            .findings
            .into_iter()
            .map(|f| (f.dedup_key(), f))
            .collect();
        for finding in findings {
            by_key.insert(finding.dedup_key(), finding);
        }
        let mut merged: Vec<Finding> = by_key.into_values().collect();
        merged.sort_by(|a, b| a.dedup_key().cmp(&b.dedup_key()));
        state.findings = merged;
        state.updated_at = Utc::now();
        self.save_repository_state(&state)
    }
}

fn normalize_path_str(path: &str) -> String {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out.display().to_string()
}
