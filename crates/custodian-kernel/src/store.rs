//! Registry Store.
//!
//! Atomic, checksummed, file-backed key/value store of typed entities with
//! an authoritative index. Every write is write-to-temp-then-rename; every
//! mutation appends to the registry operation log before the index is
//! updated, so a restart can reconcile index against directory from the
//! log plus what's actually on disk.

use crate::audit::{AuditError, AuditSink, RegistryLogRecord, RegistryOp};
use chrono::Utc;
use custodian_core::{checksum_json, AtomicWriteError, EntityRecord, RegistryIndex};
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity {entity_type}/{entity_id} already exists")]
    DuplicateEntity {
        entity_type: String,
        entity_id: String,
    },
    #[error("entity {entity_type}/{entity_id} not found")]
    NotFound {
        entity_type: String,
        entity_id: String,
    },
    #[error("checksum mismatch for {entity_type}/{entity_id}: index has {indexed}, file hashes to {actual}")]
    IntegrityError {
        entity_type: String,
        entity_id: String,
        indexed: String,
        actual: String,
    },
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
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// File-backed entity store rooted at `<var>/registry`.
pub struct Store {
    root: PathBuf,
    log: AuditSink,
    index_lock: Mutex<()>,
}

impl Store {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            log: AuditSink::new(root.clone()),
            root,
            index_lock: Mutex::new(()),
        }
    }

    fn entity_path(&self, entity_type: &str, entity_id: &str) -> PathBuf {
        self.root.join(entity_type).join(format!("{entity_id}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("_INDEX.json")
    }

    fn read_index(&self) -> Result<RegistryIndex, StoreError> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(RegistryIndex::empty(Utc::now()));
        }
        let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_index(&self, index: &RegistryIndex) -> Result<(), StoreError> {
        custodian_core::atomic_write_json(&self.index_path(), index)?;
        Ok(())
    }

    fn read_entity(&self, entity_type: &str, entity_id: &str) -> Result<EntityRecord, StoreError> {
        let path = self.entity_path(entity_type, entity_id);
        if !path.exists() {
            return Err(StoreError::NotFound {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
            });
        }
        let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Register a brand-new entity. A duplicate id makes no on-disk change.
    pub fn register(
        &self,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
    ) -> Result<EntityRecord, StoreError> {
        let _guard = self.index_lock.lock().expect("store index lock poisoned");
        let mut index = self.read_index()?;
        if index.contains(entity_type, entity_id) {
            return Err(StoreError::DuplicateEntity {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
            });
        }

        let now = Utc::now();
        let checksum = checksum_json(&data);
        let record = EntityRecord {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            created_at: now,
            updated_at: now,
            checksum: checksum.clone(),
            metadata: None,
        };

        custodian_core::atomic_write_json(&self.entity_path(entity_type, entity_id), &record)?;
        self.log.record_registry_op(&RegistryLogRecord {
            op: RegistryOp::Created,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            timestamp: now,
            checksum: Some(checksum.clone()),
        })?;

        index
            .entities
            .entry(entity_type.to_string())
            .or_default()
            .insert(entity_id.to_string());
        index
            .checksums
            .entry(entity_type.to_string())
            .or_default()
            .insert(entity_id.to_string(), checksum);
        index.updated_at = now;
        self.write_index(&index)?;

        Ok(record)
    }

    /// Replace an existing entity's payload, bumping `updated_at` and the
    /// checksum while preserving `created_at`.
    pub fn update(
        &self,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
    ) -> Result<EntityRecord, StoreError> {
        let _guard = self.index_lock.lock().expect("store index lock poisoned");
        let existing = self.read_entity(entity_type, entity_id)?;
        let mut index = self.read_index()?;

        let now = Utc::now();
        let checksum = checksum_json(&data);
        let record = EntityRecord {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            created_at: existing.created_at,
            updated_at: now,
            checksum: checksum.clone(),
            metadata: existing.metadata,
        };

        custodian_core::atomic_write_json(&self.entity_path(entity_type, entity_id), &record)?;
        self.log.record_registry_op(&RegistryLogRecord {
            op: RegistryOp::Updated,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            timestamp: now,
            checksum: Some(checksum.clone()),
        })?;

        index
            .checksums
            .entry(entity_type.to_string())
            .or_default()
            .insert(entity_id.to_string(), checksum);
        index.updated_at = now;
        self.write_index(&index)?;

        Ok(record)
    }

    pub fn deregister(&self, entity_type: &str, entity_id: &str) -> Result<(), StoreError> {
        let _guard = self.index_lock.lock().expect("store index lock poisoned");
        let path = self.entity_path(entity_type, entity_id);
        if !path.exists() {
            return Err(StoreError::NotFound {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
            });
        }
        std::fs::remove_file(&path).map_err(|source| StoreError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let now = Utc::now();
        self.log.record_registry_op(&RegistryLogRecord {
            op: RegistryOp::Deleted,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            timestamp: now,
            checksum: None,
        })?;

        let mut index = self.read_index()?;
        if let Some(ids) = index.entities.get_mut(entity_type) {
            ids.remove(entity_id);
        }
        if let Some(sums) = index.checksums.get_mut(entity_type) {
            sums.remove(entity_id);
        }
        index.updated_at = now;
        self.write_index(&index)?;

        Ok(())
    }

    pub fn read(&self, entity_type: &str, entity_id: &str) -> Result<EntityRecord, StoreError> {
        self.read_entity(entity_type, entity_id)
    }

    pub fn list(&self, entity_type: &str) -> Result<Vec<EntityRecord>, StoreError> {
        let dir = self.root.join(entity_type);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = std::fs::read_dir(&dir)
            .map_err(|source| StoreError::Read {
                path: dir.display().to_string(),
                source,
            })?
            .filter_map(Result::ok)
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .collect();
        ids.sort();
        ids.into_iter()
            .map(|id| self.read_entity(entity_type, &id))
            .collect()
    }

    /// Recompute the checksum from the stored payload and compare to the
    /// index.
    pub fn verify(&self, entity_type: &str, entity_id: &str) -> Result<bool, StoreError> {
        let record = self.read_entity(entity_type, entity_id)?;
        let actual = checksum_json(&record.data);
        let index = self.read_index()?;
        match index.checksum_of(entity_type, entity_id) {
            Some(indexed) => Ok(indexed == actual && indexed == record.checksum),
            None => Ok(false),
        }
    }

    /// Reconcile index against what's actually on disk: orphan entity
    /// files get re-indexed, stale index entries whose files are missing
    /// get dropped. Both are logged as `Reconciled` registry operations.
    pub fn reconcile(&self) -> Result<(), StoreError> {
        let _guard = self.index_lock.lock().expect("store index lock poisoned");
        let mut index = self.read_index()?;
        let now = Utc::now();
        let mut changed = false;

        if self.root.exists() {
            let mut type_dirs: Vec<PathBuf> = std::fs::read_dir(&self.root)
                .map_err(|source| StoreError::Read {
                    path: self.root.display().to_string(),
                    source,
                })?
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            type_dirs.sort();

            for type_dir in type_dirs {
                let entity_type = type_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut file_ids: Vec<String> = std::fs::read_dir(&type_dir)
                    .map_err(|source| StoreError::Read {
                        path: type_dir.display().to_string(),
                        source,
                    })?
                    .filter_map(Result::ok)
                    .filter_map(|e| {
                        e.path()
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                    })
                    .collect();
                file_ids.sort();

                for id in &file_ids {
                    if !index.contains(&entity_type, id) {
                        let record = self.read_entity(&entity_type, id)?;
                        index
                            .entities
                            .entry(entity_type.clone())
                            .or_default()
                            .insert(id.clone());
                        index
                            .checksums
                            .entry(entity_type.clone())
                            .or_default()
                            .insert(id.clone(), record.checksum.clone());
                        self.log.record_registry_op(&RegistryLogRecord {
                            op: RegistryOp::Reconciled,
                            entity_type: entity_type.clone(),
                            entity_id: id.clone(),
                            timestamp: now,
                            checksum: Some(record.checksum),
                        })?;
                        changed = true;
                    }
                }

                if let Some(ids) = index.entities.get(&entity_type).cloned() {
                    for id in ids {
                        if !file_ids.contains(&id) {
                            index.entities.get_mut(&entity_type).unwrap().remove(&id);
                            if let Some(sums) = index.checksums.get_mut(&entity_type) {
                                sums.remove(&id);
                            }
                            self.log.record_registry_op(&RegistryLogRecord {
                                op: RegistryOp::Reconciled,
                                entity_type: entity_type.clone(),
                                entity_id: id,
                                timestamp: now,
                                checksum: None,
                            })?;
                            changed = true;
                        }
                    }
                }
            }
        }

        if changed {
            index.updated_at = now;
            self.write_index(&index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        store.register("component", "x", json!({"v": 1})).unwrap();
        let record = store.read("component", "x").unwrap();
        assert_eq!(record.data, json!({"v": 1}));
        assert_eq!(record.checksum, checksum_json(&json!({"v": 1})));
    }

    #[test]
    fn duplicate_register_fails_without_changing_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        store.register("component", "x", json!({"v": 1})).unwrap();
        let err = store.register("component", "x", json!({"v": 2})).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEntity { .. }));
        let record = store.read("component", "x").unwrap();
        assert_eq!(record.data, json!({"v": 1}));
    }

    #[test]
    fn update_preserves_created_at_and_bumps_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        let created = store.register("component", "x", json!({"v": 1})).unwrap();
        let updated = store.update("component", "x", json!({"v": 2})).unwrap();
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.checksum, checksum_json(&json!({"v": 2})));
        assert!(store.verify("component", "x").unwrap());
    }

    #[test]
    fn deregister_removes_file_and_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        store.register("component", "x", json!({"v": 1})).unwrap();
        store.deregister("component", "x").unwrap();
        assert!(store.read("component", "x").is_err());
        let index = store.read_index().unwrap();
        assert!(!index.contains("component", "x"));
    }

    #[test]
    fn list_returns_all_entities_sorted_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        store.register("component", "b", json!({})).unwrap();
        store.register("component", "a", json!({})).unwrap();
        let list = store.list("component").unwrap();
        assert_eq!(
            list.iter().map(|r| r.entity_id.clone()).collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn operation_log_records_created_then_updated_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        store.register("component", "x", json!({"v": 1})).unwrap();
        store.update("component", "x", json!({"v": 2})).unwrap();
        let log = store.log.read_registry_log().unwrap();
        assert_eq!(log.len(), 2);
        assert!(matches!(log[0].op, RegistryOp::Created));
        assert!(matches!(log[1].op, RegistryOp::Updated));
    }

    #[test]
    fn reconcile_reindexes_orphan_file_and_drops_stale_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        store.register("component", "x", json!({"v": 1})).unwrap();

        // Manually corrupt the index: drop the real entity, add a phantom one.
        let mut index = store.read_index().unwrap();
        index.entities.get_mut("component").unwrap().remove("x");
        index
            .entities
            .entry("component".to_string())
            .or_default()
            .insert("ghost".to_string());
        store.write_index(&index).unwrap();

        store.reconcile().unwrap();

        let index = store.read_index().unwrap();
        assert!(index.contains("component", "x"));
        assert!(!index.contains("component", "ghost"));
    }

    #[test]
    fn verify_detects_checksum_mismatch_after_manual_tamper() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        let record = store.register("component", "x", json!({"v": 1})).unwrap();

        let mut tampered = record;
        tampered.data = json!({"v": 999});
        custodian_core::atomic_write_json(
            &dir.path().join("component").join("x.json"),
            &tampered,
        )
        .unwrap();

        assert!(!store.verify("component", "x").unwrap());
    }
}
