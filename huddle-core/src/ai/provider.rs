//! Provider abstraction for the AI request lifecycle (§4.5.1).
//!
//! Vendor HTTP glue stays out of scope; this trait only gives the state machine
//! something concrete to call. `invoke_stream` mirrors the default-forwarding
//! streaming design a real `LlmClient` would use: implementations that don't
//! support token streaming just call `complete` and emit the full text as one chunk.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::HuddleError;

/// Tokens/cost accounting for one completion call, when the provider reports it.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One completion request (§4.5 Execution worker).
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub model: String,
    pub system_prompt: String,
    pub streaming: bool,
}

/// Result of one completion call.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// A single token (or token-like chunk) emitted during streaming.
#[derive(Debug, Clone)]
pub struct TokenChunk {
    pub content: String,
}

/// Provider client: given a request, returns completion text (§4.5.1).
///
/// Implementations: [`MockProvider`] (deterministic, test-only), [`EchoProvider`]
/// (dev-loop smoke testing). Vendor-specific HTTP clients are an external concern.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Human-readable provider name, used in routing reasons and persisted `Event.provider`.
    fn name(&self) -> &str;

    /// Single-call completion (no token-level streaming).
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionOutcome, HuddleError>;

    /// Streaming variant. When `chunk_tx` is `Some`, implementations should send
    /// [`TokenChunk`]s as they arrive. Default implementation calls [`Self::complete`]
    /// and forwards the full text as a single chunk.
    async fn invoke_stream(
        &self,
        request: CompletionRequest,
        chunk_tx: Option<mpsc::Sender<TokenChunk>>,
    ) -> Result<CompletionOutcome, HuddleError> {
        let outcome = self.complete(request).await?;
        if let Some(tx) = chunk_tx {
            if !outcome.text.is_empty() {
                let _ = tx.send(TokenChunk { content: outcome.text.clone() }).await;
            }
        }
        Ok(outcome)
    }
}

/// Deterministic provider for tests: returns a fixed response, or an injected error to
/// exercise the transient-retry and cancellation paths.
pub struct MockProvider {
    pub response: String,
    pub fail_times: std::sync::atomic::AtomicU32,
    pub transient: bool,
}

impl MockProvider {
    pub fn fixed(response: impl Into<String>) -> Self {
        Self { response: response.into(), fail_times: std::sync::atomic::AtomicU32::new(0), transient: false }
    }

    /// Fails the first `fail_times` calls with a transient error, then succeeds.
    pub fn failing_then_succeeding(response: impl Into<String>, fail_times: u32) -> Self {
        Self {
            response: response.into(),
            fail_times: std::sync::atomic::AtomicU32::new(fail_times),
            transient: true,
        }
    }
}

#[async_trait]
impl AiProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionOutcome, HuddleError> {
        use std::sync::atomic::Ordering;
        if self.transient {
            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(HuddleError::ProviderTransient("mock transient failure".into()));
            }
        }
        Ok(CompletionOutcome { text: self.response.clone(), usage: None })
    }
}

/// Trivial provider for dev-loop smoke testing: echoes the prompt back.
pub struct EchoProvider;

#[async_trait]
impl AiProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionOutcome, HuddleError> {
        Ok(CompletionOutcome { text: request.prompt, usage: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_provider_returns_prompt() {
        let provider = EchoProvider;
        let out = provider
            .complete(CompletionRequest {
                prompt: "hello".into(),
                model: "any".into(),
                system_prompt: String::new(),
                streaming: false,
            })
            .await
            .unwrap();
        assert_eq!(out.text, "hello");
    }

    #[tokio::test]
    async fn mock_provider_fails_then_succeeds() {
        let provider = MockProvider::failing_then_succeeding("hi", 1);
        let req = CompletionRequest { prompt: "x".into(), model: "m".into(), system_prompt: String::new(), streaming: false };
        let first = provider.complete(req.clone()).await;
        assert!(matches!(first, Err(HuddleError::ProviderTransient(_))));
        let second = provider.complete(req).await.unwrap();
        assert_eq!(second.text, "hi");
    }

    #[tokio::test]
    async fn default_invoke_stream_forwards_full_text_as_one_chunk() {
        let provider = EchoProvider;
        let (tx, mut rx) = mpsc::channel(4);
        provider
            .invoke_stream(
                CompletionRequest { prompt: "chunked".into(), model: "m".into(), system_prompt: String::new(), streaming: true },
                Some(tx),
            )
            .await
            .unwrap();
        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.content, "chunked");
        assert!(rx.recv().await.is_none() || rx.try_recv().is_err());
    }
}
