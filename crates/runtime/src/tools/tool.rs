//! Tool execution trait.

use crate::tools::ToolError;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

/// Something the model can ask the engine to run.
///
/// Tools may be called more than once with the same input when the model
/// revises its plan, so implementations should be idempotent or guard their
/// own side effects.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn execute(&self, input: Value) -> Result<Value, ToolError>;
}

/// A tool backed by an async closure.
pub struct FnTool<F>(pub F);

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        (self.0)(input).await
    }
}
