pub mod atomic;
pub mod checksum;
pub mod config;
pub mod types;

pub use atomic::{atomic_write_bytes, atomic_write_json, fsync_parent_dir, AtomicWriteError};
pub use checksum::{checksum_bytes, checksum_json};
pub use config::{ConfigError, KernelConfig};
pub use types::{
    AgentDefinition, AgentResult, AgentStatus, ChainDefinition, ChainRun, ChainRunStatus,
    ChainState, ChainStep, EntityRecord, ErrorKind, ExecutionMode, FieldType, Finding, Id,
    OutputField, OutputSchema, PermissionClass, RegistryIndex, RepositoryState,
};
