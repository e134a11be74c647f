//! Function definitions.

use crate::cache::CachePolicy;
use crate::retry::RetryPolicy;
use schema::Schema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::marker::PhantomData;

/// A typed AI function: input shape, output shape, and the instruction
/// template the model is asked to follow.
#[derive(Debug, Clone)]
pub struct FunctionDefinition {
    id: String,
    input_schema: Schema,
    output_schema: Schema,
    template: String,
    system_prompt: Option<String>,
    retry: Option<RetryPolicy>,
    cache: Option<CachePolicy>,
    model_options: Map<String, Value>,
}

impl FunctionDefinition {
    pub fn new(
        id: impl Into<String>,
        input_schema: Schema,
        output_schema: Schema,
        template: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            input_schema,
            output_schema,
            template: template.into(),
            system_prompt: None,
            retry: None,
            cache: None,
            model_options: Map::new(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Override the engine's default retry policy for this function.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Override the engine's default cache policy for this function.
    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    /// Options forwarded to the model provider on every call.
    pub fn with_model_options(mut self, options: Map<String, Value>) -> Self {
        self.model_options = options;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    pub fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn cache(&self) -> Option<&CachePolicy> {
        self.cache.as_ref()
    }

    pub fn model_options(&self) -> &Map<String, Value> {
        &self.model_options
    }
}

/// A [`FunctionDefinition`] with Rust types bound to its input and output.
pub struct TypedFunction<I, O> {
    definition: FunctionDefinition,
    _types: PhantomData<fn(I) -> O>,
}

impl<I: Serialize, O: DeserializeOwned> TypedFunction<I, O> {
    pub fn new(definition: FunctionDefinition) -> Self {
        Self {
            definition,
            _types: PhantomData,
        }
    }
}

impl<I, O> TypedFunction<I, O> {
    pub fn definition(&self) -> &FunctionDefinition {
        &self.definition
    }
}

impl<I, O> Clone for TypedFunction<I, O> {
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            _types: PhantomData,
        }
    }
}

impl<I, O> fmt::Debug for TypedFunction<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypedFunction").field(&self.definition.id).finish()
    }
}
