//! Audit Sink.
//!
//! Append-only, one file per UTC day per kind. Writers open in append mode,
//! write one JSON record followed by a newline, and flush. No in-place
//! edits, ever.

use custodian_core::{ErrorKind, ExecutionMode, Id};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to create audit directory {dir}: {source}")]
    CreateDir {
        dir: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to append to {path}: {source}")]
    Append {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize audit record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One line of the daily execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub agent_name: String,
    pub agent_class: String,
    pub status: String,
    pub execution_time_ms: i64,
    pub mode: ExecutionMode,
    pub correlation_id: Id,
    pub chain_run_id: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Kind of registry mutation recorded in `registry_log.jsonl`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryOp {
    Created,
    Updated,
    Deleted,
    /// Index/directory divergence repaired on load: an orphan
    /// entity file re-indexed, or a stale index entry dropped.
    Reconciled,
}

/// One line of the registry operation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryLogRecord {
    pub op: RegistryOp,
    pub entity_type: String,
    pub entity_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Append-only JSON-line sink rooted at `audit_root`.
#[derive(Debug, Clone)]
pub struct AuditSink {
    root: PathBuf,
}

impl AuditSink {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn record_execution(&self, record: &ExecutionRecord) -> Result<(), AuditError> {
        let filename = format!("execution_{}.jsonl", record.timestamp.format("%Y%m%d"));
        self.append_line(&filename, record)
    }

    pub fn record_registry_op(&self, record: &RegistryLogRecord) -> Result<(), AuditError> {
        self.append_line("registry_log.jsonl", record)
    }

    fn append_line<T: Serialize>(&self, filename: &str, record: &T) -> Result<(), AuditError> {
        std::fs::create_dir_all(&self.root).map_err(|source| AuditError::CreateDir {
            dir: self.root.display().to_string(),
            source,
        })?;
        let path = self.root.join(filename);
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::Append {
                path: path.display().to_string(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|source| AuditError::Append {
                path: path.display().to_string(),
                source,
            })?;
        file.flush().map_err(|source| AuditError::Append {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    /// Read back every execution record for the given UTC day, for tests
    /// and repair tooling.
    pub fn read_execution_day(&self, day: chrono::NaiveDate) -> Result<Vec<ExecutionRecord>, AuditError> {
        self.read_lines(&format!("execution_{}.jsonl", day.format("%Y%m%d")))
    }

    pub fn read_registry_log(&self) -> Result<Vec<RegistryLogRecord>, AuditError> {
        self.read_lines("registry_log.jsonl")
    }

    fn read_lines<T: for<'de> Deserialize<'de>>(&self, filename: &str) -> Result<Vec<T>, AuditError> {
        let path: PathBuf = self.root.join(filename);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| AuditError::Append {
            path: path.display().to_string(),
            source,
        })?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(AuditError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_record() -> ExecutionRecord {
        ExecutionRecord {
            timestamp: Utc::now(),
            agent_name: "scan-repository".to_string(),
            agent_class: "read-only-scan".to_string(),
            status: "completed".to_string(),
            execution_time_ms: 42,
            mode: ExecutionMode::DryRun,
            correlation_id: Id::new(),
            chain_run_id: Id::new(),
            error_kind: None,
        }
    }

    #[test]
    fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::new(dir.path().to_path_buf());
        sink.record_execution(&sample_record()).unwrap();
        sink.record_execution(&sample_record()).unwrap();
        let today = Utc::now().date_naive();
        let records = sink.read_execution_day(today).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn registry_log_records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::new(dir.path().to_path_buf());
        sink.record_registry_op(&RegistryLogRecord {
            op: RegistryOp::Created,
            entity_type: "finding".to_string(),
            entity_id: "f1".to_string(),
            timestamp: Utc::now(),
            checksum: Some("abc123".to_string()),
        })
        .unwrap();
        let records = sink.read_registry_log().unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].op, RegistryOp::Created));
    }

    #[test]
    fn missing_day_returns_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::new(dir.path().to_path_buf());
        let records = sink
            .read_execution_day(chrono::NaiveDate::from_ymd_opt(2000, 1, 1).unwrap())
            .unwrap();
        assert!(records.is_empty());
    }
}
