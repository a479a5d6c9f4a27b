//! Provider collaborator boundary.
//!
//! Abstracts over the LLM backend an agent runs against:
//! `complete(system, prompt, max_tokens, temperature, response_format) ->
//! raw_bytes`. The Execution Harness's *live* mode dispatches here; dry-run
//! and simulated modes never touch a `Provider`.

use async_trait::async_trait;
use thiserror::Error;

/// Transport-level outcome distinguishing retryable from permanent
/// failures, mirrored into `ErrorKind::ProviderTransient` /
/// `ErrorKind::ProviderPermanent` / `ErrorKind::ProviderTimeout` by the
/// harness.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("permanent provider error: {0}")]
    Permanent(String),
    #[error("provider call timed out after {0}s")]
    Timeout(u64),
}

/// Requested response shape, passed through to the provider so it can, for
/// example, request strict JSON mode from an underlying API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    Text,
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        response_format: ResponseFormat,
    ) -> Result<Vec<u8>, ProviderError>;
}

/// Test double that always fails permanently. Useful for exercising
/// precheck and dry-run/simulated-mode paths that must never reach a real
/// provider.
#[derive(Debug, Default)]
pub struct NullProvider;

#[async_trait]
impl Provider for NullProvider {
    async fn complete(
        &self,
        _system: &str,
        _prompt: &str,
        _max_tokens: u32,
        _temperature: f32,
        _response_format: ResponseFormat,
    ) -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::Permanent(
            "NullProvider never produces output".to_string(),
        ))
    }
}

/// Test double that returns a pre-scripted queue of responses, one per
/// call, in order. Used to drive retry-exhaustion and validation-failure
/// scenarios deterministically.
#[derive(Debug)]
pub struct FixtureProvider {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<Vec<u8>, ProviderError>>>,
}

impl FixtureProvider {
    #[must_use]
    pub fn new(responses: Vec<Result<Vec<u8>, ProviderError>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl Provider for FixtureProvider {
    async fn complete(
        &self,
        _system: &str,
        _prompt: &str,
        _max_tokens: u32,
        _temperature: f32,
        _response_format: ResponseFormat,
    ) -> Result<Vec<u8>, ProviderError> {
        let mut queue = self.responses.lock().expect("fixture provider lock poisoned");
        queue
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Permanent("fixture queue exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_provider_always_fails_permanently() {
        let provider = NullProvider;
        let err = provider
            .complete("sys", "prompt", 100, 0.0, ResponseFormat::Json)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
    }

    #[tokio::test]
    async fn fixture_provider_replays_in_order() {
        let provider = FixtureProvider::new(vec![
            Err(ProviderError::Transient("rate limited".to_string())),
            Ok(b"{\"ok\":true}".to_vec()),
        ]);
        assert!(provider
            .complete("s", "p", 1, 0.0, ResponseFormat::Json)
            .await
            .is_err());
        let second = provider
            .complete("s", "p", 1, 0.0, ResponseFormat::Json)
            .await
            .unwrap();
        assert_eq!(second, b"{\"ok\":true}".to_vec());
    }
}
