//! Scripted model provider for tests.
//!
//! [`MockProvider`] answers from a queue of canned outputs and records every
//! request it receives, so tests can drive the engine without a network.
//!
//! ```
//! use runtime::mock::MockProvider;
//! use runtime::model::{GenerateRequest, ModelProvider};
//!
//! # tokio_test_block(async {
//! let mock = MockProvider::new();
//! mock.queue_json(serde_json::json!({"_type": "success", "_data": 1}));
//! let generation = mock.generate(&GenerateRequest::new("hi")).await.unwrap();
//! assert!(generation.raw_output.contains("success"));
//! assert_eq!(mock.call_count(), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f);
//! # }
//! ```

use crate::model::{GenerateRequest, Generation, ModelInfo, ModelProvider, ProviderError, Usage};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

type Responder = Arc<dyn Fn(&GenerateRequest) -> Result<String, ProviderError> + Send + Sync>;

/// Queue-based fake [`ModelProvider`].
///
/// Each call pops the front of the queue. Once the queue is empty the
/// provider falls back to its responder, if one is set, and otherwise
/// fails with [`ProviderError::Rejected`] so a runaway test ends quickly.
#[derive(Default)]
pub struct MockProvider {
    queue: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Option<Responder>,
    calls: Mutex<Vec<GenerateRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `text` whenever the queue is empty.
    pub fn repeat_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::respond_with(move |_| Ok(text.clone()))
    }

    /// Compute the answer from the request whenever the queue is empty.
    pub fn respond_with(
        f: impl Fn(&GenerateRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            fallback: Some(Arc::new(f)),
            ..Self::default()
        }
    }

    pub fn queue_text(&self, text: impl Into<String>) -> &Self {
        lock(&self.queue).push_back(Ok(text.into()));
        self
    }

    pub fn queue_json(&self, value: Value) -> &Self {
        self.queue_text(value.to_string())
    }

    pub fn queue_error(&self, error: ProviderError) -> &Self {
        lock(&self.queue).push_back(Err(error));
        self
    }

    /// Every request received so far, oldest first.
    pub fn recorded_calls(&self) -> Vec<GenerateRequest> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

// A panicking test thread must not hide the queue from the rest of the test.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation, ProviderError> {
        lock(&self.calls).push(request.clone());
        let next = lock(&self.queue).pop_front();
        let text = match (next, &self.fallback) {
            (Some(result), _) => result?,
            (None, Some(fallback)) => fallback(request)?,
            (None, None) => return Err(ProviderError::Rejected("mock response queue is empty".into())),
        };

        let output_tokens = u32::try_from(text.len()).unwrap_or(u32::MAX);
        let input_tokens = u32::try_from(request.prompt.len()).unwrap_or(u32::MAX);
        Ok(Generation {
            raw_output: text,
            usage: Some(Usage {
                input_tokens,
                output_tokens,
            }),
            model_info: Some(ModelInfo {
                provider: "mock".into(),
                model: "mock".into(),
            }),
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

impl fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockProvider")
            .field("queued", &lock(&self.queue).len())
            .field("calls", &lock(&self.calls).len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_then_empty() {
        let mock = MockProvider::new();
        mock.queue_text("a").queue_error(ProviderError::Api("503".into()));

        let request = GenerateRequest::new("p");
        assert_eq!(mock.generate(&request).await.unwrap().raw_output, "a");
        assert!(matches!(mock.generate(&request).await, Err(ProviderError::Api(_))));
        assert!(matches!(mock.generate(&request).await, Err(ProviderError::Rejected(_))));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn responder_sees_the_request() {
        let mock = MockProvider::respond_with(|request| Ok(format!("echo: {}", request.prompt)));
        let generation = mock.generate(&GenerateRequest::new("hi")).await.unwrap();
        assert_eq!(generation.raw_output, "echo: hi");
        assert_eq!(mock.recorded_calls()[0].prompt, "hi");
    }
}
