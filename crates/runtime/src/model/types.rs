use super::errors::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::AddAssign;
use std::sync::Arc;

/// Everything a provider needs to produce one completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateRequest {
    /// The fully compiled prompt.
    pub prompt: String,
    /// Optional system prompt, sent separately where the backend supports it.
    pub system: Option<String>,
    /// Caller-supplied provider options (temperature, max tokens, ...).
    pub options: Map<String, Value>,
    /// 1-based attempt number within the current step.
    #[serde(skip)]
    pub attempt: u32,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            options: Map::new(),
            attempt: 1,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_options(mut self, options: Map<String, Value>) -> Self {
        self.options = options;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

/// Which model answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider: String,
    pub model: String,
}

/// The raw text a provider produced, plus optional metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub raw_output: String,
    pub usage: Option<Usage>,
    pub model_info: Option<ModelInfo>,
}

impl Generation {
    pub fn text(raw_output: impl Into<String>) -> Self {
        Self {
            raw_output: raw_output.into(),
            usage: None,
            model_info: None,
        }
    }
}

/// Trait for text-completion backends.
///
/// Implementations own transport concerns, including the request-level
/// timeout; a timed-out call must surface as [`ProviderError::Timeout`].
/// Providers are shared by concurrent executions and must be safe to call
/// from several tasks at once.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Produce one completion for the request.
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation, ProviderError>;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "model"
    }
}

#[async_trait]
impl<P: ModelProvider + ?Sized> ModelProvider for Arc<P> {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation, ProviderError> {
        (**self).generate(request).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
