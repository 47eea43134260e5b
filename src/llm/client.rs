//! `CodeGenerator` trait: the abstraction over the code-producing LLM.
//!
//! The gateway never trusts what comes back; a generator only has to
//! return candidate text.

use std::future::Future;

use async_trait::async_trait;
use tracing::warn;

use crate::backoff::Backoff;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("LLM API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

impl LlmError {
    /// Network errors, overload and server errors are worth another try.
    pub fn is_retriable(&self) -> bool {
        match self {
            LlmError::Transport(_) | LlmError::EmptyResponse => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Source of candidate scripts.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Asks the model for a script. The returned text is untrusted.
    async fn generate(&self, system_prompt: &str, prompt: &str) -> Result<String, LlmError>;

    /// Whether the backend answers at all.
    async fn check_health(&self) -> bool;

    /// Human-readable description, e.g. `"ollama (mistral)"`.
    fn description(&self) -> String;
}

/// Runs `op`, retrying retriable failures while `backoff` has budget left.
pub async fn with_retries<T, F, Fut>(mut backoff: Backoff, mut op: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() => e,
            Err(e) => return Err(e),
        };
        let Some(delay) = backoff.next_delay() else {
            return Err(err);
        };
        warn!(
            "LLM attempt {} failed ({err}), retrying in {}ms",
            backoff.attempt,
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_backoff(retries: u32) -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 2, retries)
    }

    #[test]
    fn test_code_generator_is_object_safe() {
        fn _assert_object_safe(_: &dyn CodeGenerator) {}
    }

    #[test]
    fn test_retriable_classification() {
        assert!(LlmError::EmptyResponse.is_retriable());
        assert!(LlmError::Api { status: 503, body: String::new() }.is_retriable());
        assert!(LlmError::Api { status: 429, body: String::new() }.is_retriable());
        assert!(!LlmError::Api { status: 404, body: "model not found".into() }.is_retriable());
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries(fast_backoff(2), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LlmError::EmptyResponse)
            } else {
                Ok("final_shape = 1")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "final_shape = 1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(fast_backoff(2), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::Api { status: 500, body: "boom".into() })
        })
        .await;
        assert!(matches!(result, Err(LlmError::Api { status: 500, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(fast_backoff(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::Api { status: 400, body: "bad request".into() })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
