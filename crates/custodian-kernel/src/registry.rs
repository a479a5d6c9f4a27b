//! Agent Registry.
//!
//! Loads every contract file in a directory into a name-keyed, in-memory
//! catalog. Reads are lock-free once loaded; `refresh` replaces the whole
//! catalog atomically under a write lock.

use crate::contract::{self, ContractError};
use custodian_core::{AgentDefinition, PermissionClass};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read contracts directory {dir}: {source}")]
    ReadDir {
        dir: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("duplicate agent name '{name}' in {first} and {second}")]
    DuplicateName {
        name: String,
        first: String,
        second: String,
    },
}

/// Thread-safe catalog of parsed agent contracts.
pub struct Registry {
    dir: PathBuf,
    agents: RwLock<HashMap<String, AgentDefinition>>,
}

impl Registry {
    /// Load all contract files under `dir`. A non-contract file (anything
    /// without a `.contract` extension) is skipped.
    pub fn load(dir: &Path) -> Result<Self, RegistryError> {
        let agents = load_agents(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            agents: RwLock::new(agents),
        })
    }

    /// Re-read the contracts directory, replacing the catalog atomically.
    /// Existing `get`/`list` calls in flight see either the old or the new
    /// catalog, never a partial one.
    pub fn refresh(&self) -> Result<(), RegistryError> {
        let fresh = load_agents(&self.dir)?;
        *self.agents.write().expect("registry lock poisoned") = fresh;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<AgentDefinition> {
        self.agents
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<AgentDefinition> {
        self.agents
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn list_by_class(&self, class: PermissionClass) -> Vec<AgentDefinition> {
        self.list()
            .into_iter()
            .filter(|a| a.permission_class == class)
            .collect()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.agents
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// True iff the normalized absolute `path` lies under at least one
    /// allowed root for `name` and under none of its disallowed roots.
    #[must_use]
    pub fn allows_write_to(&self, name: &str, path: &Path) -> bool {
        let Some(agent) = self.get(name) else {
            return false;
        };
        let normalized = normalize(path);
        let allowed = agent
            .allowed_write_paths
            .iter()
            .any(|pattern| glob_match(pattern, &normalized));
        if !allowed {
            return false;
        }
        !agent
            .disallowed_write_paths
            .iter()
            .any(|pattern| glob_match(pattern, &normalized))
    }
}

fn load_agents(dir: &Path) -> Result<HashMap<String, AgentDefinition>, RegistryError> {
    let mut agents: HashMap<String, AgentDefinition> = HashMap::new();
    let mut sources: HashMap<String, String> = HashMap::new();

    let entries = std::fs::read_dir(dir).map_err(|source| RegistryError::ReadDir {
        dir: dir.display().to_string(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "contract"))
        .collect();
    paths.sort();

    for path in paths {
        let def = contract::parse_file(&path)?;
        let label = path.display().to_string();
        if let Some(first) = sources.get(&def.name) {
            return Err(RegistryError::DuplicateName {
                name: def.name.clone(),
                first: first.clone(),
                second: label,
            });
        }
        sources.insert(def.name.clone(), label);
        agents.insert(def.name.clone(), def);
    }

    Ok(agents)
}

/// Lexical normalization only (no filesystem access), matching the
/// allow/deny check's use on paths that may not exist yet.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Minimal glob matcher supporting a single trailing `/**` (match any
/// descendant) or `*` within the final segment. Contract write-path
/// patterns never need more than this.
fn glob_match(pattern: &str, path: &Path) -> bool {
    let path_str = path.to_string_lossy().replace('\\', "/");
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return path_str == prefix || path_str.starts_with(&format!("{prefix}/"));
    }
    if let Some((prefix, suffix)) = pattern.split_once('*') {
        return path_str.starts_with(prefix) && path_str.ends_with(suffix);
    }
    path_str == pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_contract(dir: &Path, filename: &str, name: &str, class: &str) {
        let content = format!(
            "# name\n{name}\n\n# permission_class\n{class}\n\n# description\ntest agent\n\n# prompt\ndo the thing\n\n# output_schema\nresult: string required\n"
        );
        fs::write(dir.join(filename), content).unwrap();
    }

    #[test]
    fn loads_all_contract_files() {
        let dir = tempfile::tempdir().unwrap();
        write_contract(dir.path(), "a.contract", "agent-a", "read-only-scan");
        write_contract(dir.path(), "b.contract", "agent-b", "write-gated");
        let registry = Registry::load(dir.path()).unwrap();
        assert_eq!(registry.names().len(), 2);
        assert!(registry.get("agent-a").is_some());
    }

    #[test]
    fn ignores_non_contract_files() {
        let dir = tempfile::tempdir().unwrap();
        write_contract(dir.path(), "a.contract", "agent-a", "read-only-scan");
        fs::write(dir.path().join("README.md"), "not a contract").unwrap();
        let registry = Registry::load(dir.path()).unwrap();
        assert_eq!(registry.names().len(), 1);
    }

    #[test]
    fn duplicate_names_fail_load() {
        let dir = tempfile::tempdir().unwrap();
        write_contract(dir.path(), "a.contract", "dup", "read-only-scan");
        write_contract(dir.path(), "b.contract", "dup", "read-only-scan");
        let err = Registry::load(dir.path()).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName { .. }));
    }

    #[test]
    fn list_by_class_filters() {
        let dir = tempfile::tempdir().unwrap();
        write_contract(dir.path(), "a.contract", "agent-a", "read-only-scan");
        write_contract(dir.path(), "b.contract", "agent-b", "write-gated");
        let registry = Registry::load(dir.path()).unwrap();
        let scans = registry.list_by_class(PermissionClass::ReadOnlyScan);
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].name, "agent-a");
    }

    #[test]
    fn allows_write_to_respects_allow_and_deny_roots() {
        let dir = tempfile::tempdir().unwrap();
        write_contract(dir.path(), "a.contract", "writer", "write-gated");
        let registry = Registry::load(dir.path()).unwrap();
        assert!(registry.allows_write_to("writer", Path::new("artifacts/out.json")));
        assert!(!registry.allows_write_to("writer", Path::new("src/main.rs")));
        assert!(!registry.allows_write_to("writer", Path::new("unrelated/out.json")));
    }

    #[test]
    fn refresh_replaces_the_catalog() {
        let dir = tempfile::tempdir().unwrap();
        write_contract(dir.path(), "a.contract", "agent-a", "read-only-scan");
        let registry = Registry::load(dir.path()).unwrap();
        assert_eq!(registry.names().len(), 1);
        write_contract(dir.path(), "b.contract", "agent-b", "write-gated");
        registry.refresh().unwrap();
        assert_eq!(registry.names().len(), 2);
    }
}
