//! Execution Harness.
//!
//! Runs a single agent under one of three modes, enforcing prechecks,
//! validating the produced JSON against the declared output schema,
//! retrying transient provider failures, and emitting an audit record on
//! every terminal outcome plus one for each transient attempt along the way.

use crate::audit::{AuditSink, ExecutionRecord};
use crate::provider::{Provider, ProviderError, ResponseFormat};
use crate::registry::Registry;
use chrono::Utc;
use custodian_core::{AgentResult, AgentStatus, ErrorKind, ExecutionMode, Id, KernelConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-execution context threaded through one `Harness::execute` call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub repository_root: PathBuf,
    pub mode: ExecutionMode,
    pub correlation_id: Id,
    pub chain_run_id: Id,
    /// Paths this step's output is expected to write to, if any. Checked
    /// against the agent's allowed/disallowed write roots during prechecks.
    /// The Harness has no visibility into provider output content ahead of
    /// time, so callers (the Orchestrator, or a caller driving a single
    /// agent directly) supply whatever paths the step is known to target.
    pub intended_write_paths: Vec<PathBuf>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(repository_root: PathBuf, mode: ExecutionMode, chain_run_id: Id) -> Self {
        Self {
            repository_root,
            mode,
            correlation_id: Id::new(),
            chain_run_id,
            intended_write_paths: Vec::new(),
        }
    }
}

/// Execution Harness, the seam between the Registry/Provider and
/// a single terminal `AgentResult`.
pub struct Harness {
    registry: Arc<Registry>,
    provider: Arc<dyn Provider>,
    audit: AuditSink,
    config: KernelConfig,
}

impl Harness {
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        provider: Arc<dyn Provider>,
        audit: AuditSink,
        config: KernelConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            audit,
            config,
        }
    }

    /// Run `agent_name` against `input` under `context.mode`, always
    /// producing a terminal `AgentResult` and always emitting a terminal
    /// audit record. Live-mode calls that hit transient provider errors
    /// along the way emit one additional attempt-level audit record each.
    pub async fn execute(
        &self,
        agent_name: &str,
        input: serde_json::Value,
        context: ExecutionContext,
    ) -> AgentResult {
        let started_at = Utc::now();

        let Some(agent) = self.registry.get(agent_name) else {
            return self.finish(
                agent_name,
                "unknown",
                AgentStatus::Stopped,
                started_at,
                serde_json::Value::Null,
                Some("agent is not registered".to_string()),
                Some(ErrorKind::NotRegistered),
                context,
            );
        };
        let agent_class = agent.permission_class.as_str().to_string();

        if let Some((error, kind)) = self.run_prechecks(&agent, &input, &context) {
            return self.finish(
                agent_name,
                &agent_class,
                AgentStatus::Stopped,
                started_at,
                serde_json::Value::Null,
                Some(error),
                Some(kind),
                context,
            );
        }

        match context.mode {
            ExecutionMode::DryRun => self.finish(
                agent_name,
                &agent_class,
                AgentStatus::Completed,
                started_at,
                serde_json::json!({}),
                None,
                None,
                context,
            ),
            ExecutionMode::Simulated => {
                let output = synthesize_output(&agent.output_schema);
                self.finish(
                    agent_name,
                    &agent_class,
                    AgentStatus::Completed,
                    started_at,
                    output,
                    None,
                    None,
                    context,
                )
            }
            ExecutionMode::Live => {
                let (status, output, error, kind) = self
                    .run_live(agent_name, &agent_class, &agent, &input, &context)
                    .await;
                self.finish(
                    agent_name, &agent_class, status, started_at, output, error, kind, context,
                )
            }
        }
    }

    /// Prechecks, all required before any provider call. Returns
    /// `Some((message, kind))` on failure.
    fn run_prechecks(
        &self,
        agent: &custodian_core::AgentDefinition,
        input: &serde_json::Value,
        context: &ExecutionContext,
    ) -> Option<(String, ErrorKind)> {
        if !context.repository_root.is_dir() {
            return Some((
                format!(
                    "repository_root {} does not exist or is not a directory",
                    context.repository_root.display()
                ),
                ErrorKind::PrecheckFailed,
            ));
        }
        if std::fs::read_dir(&context.repository_root).is_err() {
            return Some((
                format!(
                    "repository_root {} is not readable",
                    context.repository_root.display()
                ),
                ErrorKind::PrecheckFailed,
            ));
        }

        for field in &agent.input_fields {
            match input.get(field) {
                None => {
                    return Some((
                        format!("required input field '{field}' is missing"),
                        ErrorKind::PrecheckFailed,
                    ))
                }
                Some(value) if self.config.precheck_require_nonempty && is_empty_value(value) => {
                    return Some((
                        format!("required input field '{field}' is empty"),
                        ErrorKind::PrecheckFailed,
                    ))
                }
                Some(_) => {}
            }
        }

        for path in &context.intended_write_paths {
            if !self.registry.allows_write_to(&agent.name, path) {
                return Some((
                    format!("agent is not permitted to write to {}", path.display()),
                    ErrorKind::PrecheckFailed,
                ));
            }
        }

        None
    }

    /// Live-mode dispatch: retry loop plus per-call timeout plus output
    /// validation. Every attempt that fails with a transient provider error
    /// gets its own audit record, in addition to the one `finish()` writes
    /// for the call's terminal outcome.
    async fn run_live(
        &self,
        agent_name: &str,
        agent_class: &str,
        agent: &custodian_core::AgentDefinition,
        input: &serde_json::Value,
        context: &ExecutionContext,
    ) -> (
        AgentStatus,
        serde_json::Value,
        Option<String>,
        Option<ErrorKind>,
    ) {
        let prompt = format!("{}\n\nInput:\n{}", agent.prompt_body, input);
        let timeout = Duration::from_secs(self.config.live_timeout_sec);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(agent = agent.name.as_str(), attempt, "dispatching live call");

            let call = self.provider.complete(
                &agent.description,
                &prompt,
                4096,
                0.2,
                ResponseFormat::Json,
            );

            let outcome = match tokio::time::timeout(timeout, call).await {
                Err(_) => {
                    return (
                        AgentStatus::Failed,
                        serde_json::Value::Null,
                        Some(format!("provider call timed out after {}s", timeout.as_secs())),
                        Some(ErrorKind::ProviderTimeout),
                    )
                }
                Ok(result) => result,
            };

            let raw = match outcome {
                Ok(bytes) => bytes,
                Err(ProviderError::Timeout(secs)) => {
                    return (
                        AgentStatus::Failed,
                        serde_json::Value::Null,
                        Some(format!("provider call timed out after {secs}s")),
                        Some(ErrorKind::ProviderTimeout),
                    )
                }
                Err(ProviderError::Permanent(message)) => {
                    return (
                        AgentStatus::Failed,
                        serde_json::Value::Null,
                        Some(message),
                        Some(ErrorKind::ProviderPermanent),
                    )
                }
                Err(ProviderError::Transient(message)) => {
                    self.record_attempt(agent_name, agent_class, context, attempt, &message);

                    if attempt >= self.config.retry_max_attempts {
                        return (
                            AgentStatus::Failed,
                            serde_json::Value::Null,
                            Some(format!(
                                "exhausted {attempt} attempts, last error: {message}"
                            )),
                            Some(ErrorKind::ProviderTransientExhausted),
                        );
                    }
                    let backoff = self.config.retry_base_backoff_ms * (1u64 << (attempt - 1));
                    warn!(
                        agent = agent.name.as_str(),
                        attempt, backoff, "transient provider error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    continue;
                }
            };

            let parsed: serde_json::Value = match serde_json::from_slice(&raw) {
                Ok(v) => v,
                Err(err) => {
                    return (
                        AgentStatus::Failed,
                        serde_json::Value::Null,
                        Some(format!("provider returned invalid JSON: {err}")),
                        Some(ErrorKind::InvalidJson),
                    )
                }
            };

            if let Some(field) = validate_output(&agent.output_schema, &parsed) {
                return (
                    AgentStatus::Failed,
                    parsed,
                    Some(format!("output field '{field}' missing or wrong type")),
                    Some(ErrorKind::ValidationFailed),
                );
            }

            return (AgentStatus::Completed, parsed, None, None);
        }
    }

    /// Audit line for one attempt that failed with a transient provider
    /// error. Written in addition to, not instead of, the terminal record
    /// `finish()` writes once the retry loop itself returns. `status` is
    /// `"retrying"`, a detail of attempt-level visibility that never
    /// surfaces as an `AgentStatus` variant.
    fn record_attempt(
        &self,
        agent_name: &str,
        agent_class: &str,
        context: &ExecutionContext,
        attempt: u32,
        message: &str,
    ) {
        debug!(agent = agent_name, attempt, "recording transient attempt failure");
        if let Err(err) = self.audit.record_execution(&ExecutionRecord {
            timestamp: Utc::now(),
            agent_name: agent_name.to_string(),
            agent_class: agent_class.to_string(),
            status: "retrying".to_string(),
            execution_time_ms: 0,
            mode: context.mode,
            correlation_id: context.correlation_id,
            chain_run_id: context.chain_run_id,
            error_kind: Some(ErrorKind::ProviderTransient),
        }) {
            tracing::error!(error = %err, attempt, attempt_error = message, "failed to write attempt audit record");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        agent_name: &str,
        agent_class: &str,
        status: AgentStatus,
        started_at: chrono::DateTime<Utc>,
        output: serde_json::Value,
        error: Option<String>,
        error_kind: Option<ErrorKind>,
        context: ExecutionContext,
    ) -> AgentResult {
        let completed_at = Utc::now();
        let execution_time_ms = (completed_at - started_at).num_milliseconds();

        if let Err(err) = self.audit.record_execution(&ExecutionRecord {
            timestamp: completed_at,
            agent_name: agent_name.to_string(),
            agent_class: agent_class.to_string(),
            status: status.as_str().to_string(),
            execution_time_ms,
            mode: context.mode,
            correlation_id: context.correlation_id,
            chain_run_id: context.chain_run_id,
            error_kind,
        }) {
            tracing::error!(error = %err, "failed to write execution audit record");
        }

        AgentResult {
            agent_name: agent_name.to_string(),
            status,
            started_at,
            completed_at,
            execution_time_ms,
            output,
            error,
            error_kind,
            mode: context.mode,
        }
    }
}

fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Synthesize a schema-shaped minimal output for simulated mode:
/// required fields get schema-appropriate defaults, with ISO timestamps
/// for fields that look like they hold one.
fn synthesize_output(schema: &custodian_core::OutputSchema) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for field in schema.required_fields() {
        let value = if field.field_type == custodian_core::FieldType::String
            && (field.name.ends_with("_at") || field.name == "timestamp")
        {
            serde_json::Value::String(Utc::now().to_rfc3339())
        } else {
            field.field_type.default_value()
        };
        map.insert(field.name.clone(), value);
    }
    serde_json::Value::Object(map)
}

/// Validate every declared-required output field is present and of the
/// permitted type; returns the name of the first offending field.
fn validate_output(schema: &custodian_core::OutputSchema, value: &serde_json::Value) -> Option<String> {
    for field in schema.required_fields() {
        match value.get(&field.name) {
            None => return Some(field.name.clone()),
            Some(v) if !field.field_type.matches(v) => return Some(field.name.clone()),
            Some(_) => {}
        }
    }
    None
}
