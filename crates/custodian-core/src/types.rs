//! Core data model for the governance kernel.
//!
//! `AgentDefinition`, `AgentResult`, `ChainStep`, `ChainDefinition`,
//! `ChainState`, `ChainRun`, `EntityRecord`, `RegistryIndex`,
//! `RepositoryState`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Sortable identifier for runs and other time-ordered records.
///
/// Backed by `UUIDv7`, which embeds a millisecond timestamp in its high bits,
/// so lexicographic order on the string form tracks creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Permission class assigned to an agent. Fixed at contract-parse time and
/// never mutated afterward. Determines the default write-path allow/deny
/// roots before any file-declared overlay is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionClass {
    ReadOnlyScan,
    PlanningSynthesis,
    RegistryState,
    WriteGated,
    ControlPlane,
}

impl PermissionClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnlyScan => "read-only-scan",
            Self::PlanningSynthesis => "planning-synthesis",
            Self::RegistryState => "registry-state",
            Self::WriteGated => "write-gated",
            Self::ControlPlane => "control-plane",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "read-only-scan" | "read_only_scan" | "readonly" | "read-only" => {
                Some(Self::ReadOnlyScan)
            }
            "planning-synthesis" | "planning_synthesis" | "planning" => {
                Some(Self::PlanningSynthesis)
            }
            "registry-state" | "registry_state" | "registry" => Some(Self::RegistryState),
            "write-gated" | "write_gated" | "write-gate" => Some(Self::WriteGated),
            "control-plane" | "control_plane" | "control" => Some(Self::ControlPlane),
            _ => None,
        }
    }

    /// Default `(allowed, disallowed)` write-path roots for this class,
    /// before any file-declared paths are overlaid on top.
    #[must_use]
    pub fn default_write_paths(self) -> (Vec<String>, Vec<String>) {
        match self {
            Self::ReadOnlyScan | Self::PlanningSynthesis => (Vec::new(), Vec::new()),
            Self::RegistryState => (
                vec!["var/registry/**".to_string(), "var/audit/**".to_string()],
                Vec::new(),
            ),
            Self::WriteGated => (
                vec!["artifacts/**".to_string(), "prompts/**".to_string()],
                vec![
                    "src/**".to_string(),
                    "config/**".to_string(),
                    "tests/**".to_string(),
                ],
            ),
            Self::ControlPlane => (
                vec!["var/**".to_string(), "prompts/**".to_string()],
                Vec::new(),
            ),
        }
    }
}

/// Execution mode for a single agent run or a whole chain. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Prechecks only, no provider call.
    DryRun,
    /// Prechecks plus a schema-shaped synthetic output, no provider call.
    Simulated,
    /// Prechecks plus a real provider dispatch.
    #[default]
    Live,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Simulated => "simulated",
            Self::Live => "live",
        }
    }
}

/// Terminal status of a single agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    Failed,
    Stopped,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    #[must_use]
    pub fn is_terminal_success(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Closed set of machine-readable error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ParseError,
    NotRegistered,
    PrecheckFailed,
    ProviderTransient,
    ProviderTransientExhausted,
    ProviderPermanent,
    ProviderTimeout,
    InvalidJson,
    ValidationFailed,
    IoError,
    IntegrityError,
    DuplicateEntity,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "parse_error",
            Self::NotRegistered => "not_registered",
            Self::PrecheckFailed => "precheck_failed",
            Self::ProviderTransient => "provider_transient",
            Self::ProviderTransientExhausted => "provider_transient_exhausted",
            Self::ProviderPermanent => "provider_permanent",
            Self::ProviderTimeout => "provider_timeout",
            Self::InvalidJson => "invalid_json",
            Self::ValidationFailed => "validation_failed",
            Self::IoError => "io_error",
            Self::IntegrityError => "integrity_error",
            Self::DuplicateEntity => "duplicate_entity",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether a Harness retry loop should retry this kind.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ProviderTransient)
    }
}

/// Permitted JSON type for a declared output-schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    /// No type constraint declared; any JSON value is permitted.
    Any,
}

impl FieldType {
    #[must_use]
    pub fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }

    /// Schema-appropriate default used by simulated-mode synthesis.
    #[must_use]
    pub fn default_value(self) -> serde_json::Value {
        match self {
            Self::String => serde_json::Value::String("simulated".to_string()),
            Self::Number => serde_json::json!(0),
            Self::Boolean => serde_json::json!(false),
            Self::Array => serde_json::json!([]),
            Self::Object => serde_json::json!({}),
            Self::Any => serde_json::Value::Null,
        }
    }
}

/// One declared field in an output schema: whether it is required, and its
/// permitted type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    pub required: bool,
    pub field_type: FieldType,
}

/// Declared output shape of an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSchema {
    pub fields: Vec<OutputField>,
}

impl OutputSchema {
    pub fn required_fields(&self) -> impl Iterator<Item = &OutputField> {
        self.fields.iter().filter(|f| f.required)
    }
}

/// Immutable agent contract, loaded once and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub permission_class: PermissionClass,
    pub description: String,
    pub prompt_body: String,
    pub input_fields: Vec<String>,
    pub output_schema: OutputSchema,
    pub allowed_write_paths: Vec<String>,
    pub disallowed_write_paths: Vec<String>,
}

/// Result of a single agent execution, owned by the `ChainRun` that produced
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_name: String,
    pub status: AgentStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub execution_time_ms: i64,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub mode: ExecutionMode,
}

/// One step in a chain definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStep {
    pub agent_name: String,
    /// State-projector mapping expression. `None` means "entire state bag".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    #[serde(default)]
    pub continue_on_failure: bool,
}

/// An ordered chain of steps plus its initial state bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub name: String,
    pub description: String,
    pub steps: Vec<ChainStep>,
    #[serde(default)]
    pub initial_state: serde_json::Map<String, serde_json::Value>,
}

/// Mutable state bag threaded between steps of one chain run.
///
/// Modeled as a JSON object wrapper rather than a statically typed struct:
/// chains are runtime-composable and keys are opaque strings chosen by
/// whichever agents happen to populate them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainState(pub serde_json::Map<String, serde_json::Value>);

impl ChainState {
    #[must_use]
    pub fn seeded_from(initial: &serde_json::Map<String, serde_json::Value>) -> Self {
        Self(initial.clone())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    #[must_use]
    pub fn as_object(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.0
    }
}

/// Terminal status of a whole chain run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainRunStatus {
    Completed,
    AgentFailed,
    PrecheckFailed,
    StopCondition,
    Manual,
}

impl ChainRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::AgentFailed => "agent_failed",
            Self::PrecheckFailed => "precheck_failed",
            Self::StopCondition => "stop_condition",
            Self::Manual => "manual",
        }
    }
}

/// Persisted record of one chain execution, owned by the State Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRun {
    pub run_id: Id,
    pub chain_name: String,
    pub repository_root: String,
    pub status: ChainRunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: i64,
    pub mode: ExecutionMode,
    pub agent_results: Vec<AgentResult>,
    pub final_state: ChainState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A typed, id-keyed JSON record persisted atomically with a content
/// checksum. Owned by the Registry Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Authoritative index of everything present in the Registry Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryIndex {
    pub schema_version: u32,
    pub updated_at: DateTime<Utc>,
    /// `entity_type -> set of ids present`.
    #[serde(default)]
    pub entities: BTreeMap<String, BTreeSet<String>>,
    /// `entity_type -> (id -> checksum)`.
    #[serde(default)]
    pub checksums: BTreeMap<String, BTreeMap<String, String>>,
}

impl RegistryIndex {
    pub const CURRENT_SCHEMA_VERSION: u32 = 1;

    #[must_use]
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            schema_version: Self::CURRENT_SCHEMA_VERSION,
            updated_at: now,
            entities: BTreeMap::new(),
            checksums: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn contains(&self, entity_type: &str, entity_id: &str) -> bool {
        self.entities
            .get(entity_type)
            .is_some_and(|ids| ids.contains(entity_id))
    }

    #[must_use]
    pub fn checksum_of(&self, entity_type: &str, entity_id: &str) -> Option<&str> {
        self.checksums
            .get(entity_type)
            .and_then(|m| m.get(entity_id))
            .map(String::as_str)
    }
}

/// Severity/location/description observation emitted by an agent and
/// deduplicated across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub agent_name: String,
    pub category: String,
    pub target_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_or_hash: Option<String>,
    pub severity: String,
    pub description: String,
    pub observed_at: DateTime<Utc>,
}

impl Finding {
    /// Stable dedup key: `(agent_name, category, target_path,
    /// line_or_hash)`.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.agent_name,
            self.category,
            self.target_path,
            self.line_or_hash.as_deref().unwrap_or("")
        )
    }
}

/// Cross-run repository state: fingerprint, last-successful-run-per-chain,
/// and accumulated findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryState {
    pub repository_id: String,
    pub repository_root: String,
    pub fingerprint: String,
    /// `chain_name -> run id of the most recent successful run`.
    #[serde(default)]
    pub last_successful_runs: BTreeMap<String, Id>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    pub total_runs: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RepositoryState {
    #[must_use]
    pub fn new(repository_id: String, repository_root: String, now: DateTime<Utc>) -> Self {
        Self {
            repository_id,
            repository_root,
            fingerprint: String::new(),
            last_successful_runs: BTreeMap::new(),
            findings: Vec::new(),
            total_runs: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
