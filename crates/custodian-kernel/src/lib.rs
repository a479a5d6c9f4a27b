//! custodian-kernel - the orchestration and governance kernel.
//!
//! Implements the governance kernel's components: the Contract Parser,
//! Agent Registry, Execution Harness, Chain Orchestrator, State Projector,
//! Registry Store, State Manager, and Audit Sink. Data types are shared
//! with `custodian-core`; this crate supplies the behavior around them
//! plus the `Provider` collaborator boundary.

pub mod audit;
pub mod contract;
pub mod harness;
pub mod orchestrator;
pub mod projector;
pub mod provider;
pub mod registry;
pub mod state;
pub mod store;

pub use audit::{AuditError, AuditSink, ExecutionRecord, RegistryLogRecord, RegistryOp};
pub use contract::ContractError;
pub use harness::{ExecutionContext, Harness};
pub use orchestrator::{ChainCallbacks, Orchestrator, OrchestratorError};
pub use projector::{project, Projection};
pub use provider::{FixtureProvider, NullProvider, Provider, ProviderError, ResponseFormat};
pub use registry::{Registry, RegistryError};
pub use state::{Coordinator, StateError, StateManager};
pub use store::{Store, StoreError};

use thiserror::Error;

/// Crate-level aggregate error for call sites that can fail for more than
/// one component's reason. Per-module errors stay distinct `thiserror`
/// enums; this exists only at seams like process wiring and embedder entry
/// points that need to propagate any of them with `?`.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("config error: {0}")]
    Config(#[from] custodian_core::ConfigError),
}

/// Install a `tracing` subscriber reading `RUST_LOG`/`EnvFilter`. Not called
/// by the library itself, embedders and this crate's own integration tests
/// call it once at process start.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
