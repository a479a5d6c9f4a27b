//! Chain Orchestrator.
//!
//! Executes an ordered sequence of agent steps against a repository,
//! projecting each step's input from a shared state bag, invoking the
//! Execution Harness for each agent, and persisting the whole run through
//! the State Manager when it finishes or halts.

use crate::harness::{ExecutionContext, Harness};
use crate::projector;
use crate::state::{StateError, StateManager};
use chrono::Utc;
use custodian_core::{
    AgentResult, AgentStatus, ChainDefinition, ChainRun, ChainRunStatus, ChainState, Id,
    ExecutionMode,
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    State(#[from] StateError),
}

/// Callbacks invoked as a chain progresses.
///
/// Optional on both counts; the orchestrator behaves identically with no
/// callbacks registered.
#[derive(Default)]
pub struct ChainCallbacks {
    pub on_step: Option<Box<dyn Fn(&AgentResult) + Send + Sync>>,
    pub on_complete: Option<Box<dyn Fn(&ChainRun) + Send + Sync>>,
}

impl std::fmt::Debug for ChainCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainCallbacks")
            .field("on_step", &self.on_step.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Chain Orchestrator, the seam between a `ChainDefinition` and a
/// persisted `ChainRun`.
pub struct Orchestrator {
    harness: Arc<Harness>,
    state: Arc<StateManager>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(harness: Arc<Harness>, state: Arc<StateManager>) -> Self {
        Self { harness, state }
    }

    /// Run every step of `chain` in order against `repository_root` under
    /// `mode`, producing and persisting exactly one `ChainRun`.
    ///
    /// `cancellation`, if provided, is checked between steps only - a step
    /// already dispatched to the Harness always runs to completion or its
    /// own timeout, never interrupted mid-call.
    pub async fn execute(
        &self,
        chain: &ChainDefinition,
        repository_root: PathBuf,
        mode: ExecutionMode,
        callbacks: Option<&ChainCallbacks>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<ChainRun, OrchestratorError> {
        let run_id = Id::new();
        let started_at = Utc::now();
        let repository_root_str = repository_root.display().to_string();
        info!(
            chain = chain.name.as_str(),
            run_id = %run_id,
            repository_root = repository_root_str.as_str(),
            "chain run starting"
        );

        let repository_id = StateManager::repository_id(&repository_root_str);
        let lock = self.state.coordinator.lock_for(&repository_id);
        let _guard = lock.lock().await;

        let mut state = ChainState::seeded_from(&chain.initial_state);
        state.insert(
            "repository_root",
            serde_json::Value::String(repository_root_str.clone()),
        );

        let mut agent_results = Vec::with_capacity(chain.steps.len());
        let mut halt_status: Option<ChainRunStatus> = None;
        let mut halt_error: Option<String> = None;

        for (index, step) in chain.steps.iter().enumerate() {
            if cancellation.is_some_and(CancellationToken::is_cancelled) {
                info!(chain = chain.name.as_str(), run_id = %run_id, step = index, "chain run cancelled");
                halt_status = Some(ChainRunStatus::Manual);
                halt_error = Some("chain run was cancelled externally".to_string());
                break;
            }

            let projection = projector::project(&state, step.input.as_deref());
            for warning in &projection.warnings {
                warn!(chain = chain.name.as_str(), run_id = %run_id, step = index, warning);
            }

            let context = ExecutionContext::new(repository_root.clone(), mode, run_id.clone());
            debug!(
                chain = chain.name.as_str(),
                run_id = %run_id,
                step = index,
                agent = step.agent_name.as_str(),
                "dispatching step"
            );
            let result = self
                .harness
                .execute(&step.agent_name, projection.value, context)
                .await;

            if let Some(cb) = callbacks.and_then(|c| c.on_step.as_ref()) {
                cb(&result);
            }

            if let Some(output_key) = &step.output_key {
                let stored = match result.status {
                    AgentStatus::Completed => result.output.clone(),
                    AgentStatus::Failed | AgentStatus::Stopped => serde_json::json!({
                        "error": result.error.clone().unwrap_or_default(),
                        "error_kind": result.error_kind,
                        "status": result.status,
                    }),
                };
                state.insert(output_key.clone(), stored);
            }

            let completed = result.status == AgentStatus::Completed;
            agent_results.push(result.clone());

            if !completed {
                if step.continue_on_failure {
                    warn!(
                        chain = chain.name.as_str(),
                        run_id = %run_id,
                        step = index,
                        agent = step.agent_name.as_str(),
                        "step failed, continuing per continue_on_failure"
                    );
                    continue;
                }

                halt_status = Some(if result.status == AgentStatus::Stopped {
                    ChainRunStatus::PrecheckFailed
                } else {
                    ChainRunStatus::AgentFailed
                });
                halt_error = result.error.clone();
                break;
            }
        }

        let completed_at = Utc::now();
        let status = halt_status.unwrap_or(ChainRunStatus::Completed);
        let run = ChainRun {
            run_id,
            chain_name: chain.name.clone(),
            repository_root: repository_root_str,
            status,
            started_at,
            completed_at: Some(completed_at),
            execution_time_ms: (completed_at - started_at).num_milliseconds(),
            mode,
            agent_results,
            final_state: state,
            error: halt_error,
        };

        info!(
            chain = chain.name.as_str(),
            run_id = %run.run_id,
            status = run.status.as_str(),
            "chain run finished"
        );
        self.state.record_chain_run(&run)?;

        if let Some(cb) = callbacks.and_then(|c| c.on_complete.as_ref()) {
            cb(&run);
        }

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::provider::{FixtureProvider, NullProvider, Provider, ProviderError};
    use crate::registry::Registry;
    use custodian_core::{ChainStep, ErrorKind, KernelConfig};
    use std::path::Path;

    fn write_contract(dir: &Path, filename: &str, name: &str, output_required: bool) {
        let output_schema = if output_required {
            "result: string required\n"
        } else {
            "result: string\n"
        };
        let content = format!(
            "# name\n{name}\n\n# permission_class\nread-only-scan\n\n# description\ntest agent\n\n# prompt\ndo the thing\n\n# output_schema\n{output_schema}"
        );
        std::fs::write(dir.join(filename), content).unwrap();
    }

    fn build(
        contracts_dir: &Path,
        var_dir: &Path,
        provider: Arc<dyn Provider>,
    ) -> (Orchestrator, Arc<StateManager>) {
        let registry = Arc::new(Registry::load(contracts_dir).unwrap());
        let audit = AuditSink::new(var_dir.join("audit"));
        let harness = Arc::new(Harness::new(registry, provider, audit, KernelConfig::default()));
        let state = Arc::new(StateManager::new(var_dir.join("state"), Vec::new()));
        (Orchestrator::new(harness, state.clone()), state)
    }

    fn two_step_chain() -> ChainDefinition {
        ChainDefinition {
            name: "audit".to_string(),
            description: "discover then plan".to_string(),
            steps: vec![
                ChainStep {
                    agent_name: "discover".to_string(),
                    input: None,
                    output_key: Some("discovery".to_string()),
                    continue_on_failure: false,
                },
                ChainStep {
                    agent_name: "plan".to_string(),
                    input: Some("$.discovery".to_string()),
                    output_key: Some("plan".to_string()),
                    continue_on_failure: false,
                },
            ],
            initial_state: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn two_step_dry_run_completes_with_empty_outputs() {
        let contracts = tempfile::tempdir().unwrap();
        write_contract(contracts.path(), "a.contract", "discover", false);
        write_contract(contracts.path(), "b.contract", "plan", false);
        let repo = tempfile::tempdir().unwrap();
        let var = tempfile::tempdir().unwrap();
        let (orchestrator, _state) = build(contracts.path(), var.path(), Arc::new(NullProvider));

        let run = orchestrator
            .execute(
                &two_step_chain(),
                repo.path().to_path_buf(),
                ExecutionMode::DryRun,
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(run.status, ChainRunStatus::Completed);
        assert_eq!(run.agent_results.len(), 2);
        assert!(run.agent_results.iter().all(|r| r.status == AgentStatus::Completed));
        assert_eq!(run.final_state.get("discovery"), Some(&serde_json::json!({})));
    }

    #[tokio::test]
    async fn precheck_failure_at_step_one_halts_before_step_two() {
        let contracts = tempfile::tempdir().unwrap();
        write_contract(contracts.path(), "a.contract", "discover", false);
        write_contract(contracts.path(), "b.contract", "plan", false);
        let var = tempfile::tempdir().unwrap();
        let (orchestrator, _state) = build(contracts.path(), var.path(), Arc::new(NullProvider));

        let run = orchestrator
            .execute(
                &two_step_chain(),
                PathBuf::from("/does/not/exist"),
                ExecutionMode::DryRun,
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(run.status, ChainRunStatus::PrecheckFailed);
        assert_eq!(run.agent_results.len(), 1);
        assert_eq!(run.agent_results[0].status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn continue_on_failure_runs_the_remaining_step() {
        let contracts = tempfile::tempdir().unwrap();
        write_contract(contracts.path(), "a.contract", "discover", true);
        write_contract(contracts.path(), "b.contract", "plan", false);
        let repo = tempfile::tempdir().unwrap();
        let var = tempfile::tempdir().unwrap();
        let provider = Arc::new(FixtureProvider::new(vec![Err(ProviderError::Permanent(
            "boom".to_string(),
        ))]));
        let (orchestrator, _state) = build(contracts.path(), var.path(), provider);

        let chain = ChainDefinition {
            name: "audit".to_string(),
            description: "continue past a failure".to_string(),
            steps: vec![
                ChainStep {
                    agent_name: "discover".to_string(),
                    input: None,
                    output_key: Some("discovery".to_string()),
                    continue_on_failure: true,
                },
                ChainStep {
                    agent_name: "plan".to_string(),
                    input: None,
                    output_key: Some("plan".to_string()),
                    continue_on_failure: false,
                },
            ],
            initial_state: serde_json::Map::new(),
        };

        let run = orchestrator
            .execute(
                &chain,
                repo.path().to_path_buf(),
                ExecutionMode::Live,
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(run.status, ChainRunStatus::Completed);
        assert_eq!(run.agent_results.len(), 2);
        assert_eq!(run.agent_results[0].status, AgentStatus::Failed);
        assert_eq!(run.agent_results[1].status, AgentStatus::Completed);
        let discovery = run.final_state.get("discovery").unwrap();
        assert!(discovery.get("error").is_some());
        assert_eq!(
            discovery.get("error_kind").unwrap(),
            &serde_json::to_value(ErrorKind::ProviderPermanent).unwrap()
        );
    }

    #[tokio::test]
    async fn halt_without_continue_stops_the_chain() {
        let contracts = tempfile::tempdir().unwrap();
        write_contract(contracts.path(), "a.contract", "discover", true);
        write_contract(contracts.path(), "b.contract", "plan", false);
        let repo = tempfile::tempdir().unwrap();
        let var = tempfile::tempdir().unwrap();
        let provider = Arc::new(FixtureProvider::new(vec![Err(ProviderError::Permanent(
            "boom".to_string(),
        ))]));
        let (orchestrator, _state) = build(contracts.path(), var.path(), provider);

        let run = orchestrator
            .execute(
                &two_step_chain(),
                repo.path().to_path_buf(),
                ExecutionMode::Live,
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(run.status, ChainRunStatus::AgentFailed);
        assert_eq!(run.agent_results.len(), 1);
    }

    #[tokio::test]
    async fn chain_run_is_persisted_and_listable() {
        let contracts = tempfile::tempdir().unwrap();
        write_contract(contracts.path(), "a.contract", "discover", false);
        write_contract(contracts.path(), "b.contract", "plan", false);
        let repo = tempfile::tempdir().unwrap();
        let var = tempfile::tempdir().unwrap();
        let (orchestrator, state) = build(contracts.path(), var.path(), Arc::new(NullProvider));

        let run = orchestrator
            .execute(
                &two_step_chain(),
                repo.path().to_path_buf(),
                ExecutionMode::DryRun,
                None,
                None,
            )
            .await
            .unwrap();

        let fetched = state.get_chain_run(&run.run_id).unwrap();
        assert_eq!(fetched.run_id, run.run_id);
        let listed = state.list_runs(None, 10).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_before_a_step_halts_with_manual_status() {
        let contracts = tempfile::tempdir().unwrap();
        write_contract(contracts.path(), "a.contract", "discover", false);
        write_contract(contracts.path(), "b.contract", "plan", false);
        let repo = tempfile::tempdir().unwrap();
        let var = tempfile::tempdir().unwrap();
        let (orchestrator, _state) = build(contracts.path(), var.path(), Arc::new(NullProvider));

        let token = CancellationToken::new();
        token.cancel();
        let run = orchestrator
            .execute(
                &two_step_chain(),
                repo.path().to_path_buf(),
                ExecutionMode::DryRun,
                None,
                Some(&token),
            )
            .await
            .unwrap();

        assert_eq!(run.status, ChainRunStatus::Manual);
        assert!(run.agent_results.is_empty());
    }

    #[tokio::test]
    async fn step_callback_observes_every_result() {
        let contracts = tempfile::tempdir().unwrap();
        write_contract(contracts.path(), "a.contract", "discover", false);
        write_contract(contracts.path(), "b.contract", "plan", false);
        let repo = tempfile::tempdir().unwrap();
        let var = tempfile::tempdir().unwrap();
        let (orchestrator, _state) = build(contracts.path(), var.path(), Arc::new(NullProvider));

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let callbacks = ChainCallbacks {
            on_step: Some(Box::new(move |result: &AgentResult| {
                seen_clone.lock().unwrap().push(result.agent_name.clone());
            })),
            on_complete: None,
        };

        orchestrator
            .execute(
                &two_step_chain(),
                repo.path().to_path_buf(),
                ExecutionMode::DryRun,
                Some(&callbacks),
                None,
            )
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["discover".to_string(), "plan".to_string()]);
    }
}
