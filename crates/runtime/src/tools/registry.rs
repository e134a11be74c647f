use super::{FnTool, Tool, ToolError};
use crate::error::DefinitionKind;
use crate::history::History;
use crate::retry::{self, RetryPolicy};
use crate::{Error, Result};
use schema::Schema;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// A named, schema-checked tool.
#[derive(Clone)]
pub struct ToolDefinition {
    name: String,
    description: String,
    input_schema: Schema,
    output_schema: Schema,
    tool: Arc<dyn Tool>,
    retry: Option<RetryPolicy>,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Schema,
        output_schema: Schema,
        tool: impl Tool + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema,
            tool: Arc::new(tool),
            retry: None,
        }
    }

    /// Build a tool from an async closure.
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Schema,
        output_schema: Schema,
        f: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, ToolError>> + Send + 'static,
    {
        Self::new(name, description, input_schema, output_schema, FnTool(f))
    }

    /// Retry execution failures under `policy`.
    ///
    /// Tool errors are not retryable by default, so the policy normally
    /// carries its own predicate.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    pub fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    /// Catalog entry shown to the model.
    pub fn describe(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema.describe(),
            "outputSchema": self.output_schema.describe(),
        })
    }

    /// Validate `input`, run the tool, and validate what it returned.
    pub async fn call(&self, input: Value) -> Result<Value> {
        self.input_schema
            .validate(&input)
            .map_err(|errors| Error::input(&self.name, errors))?;

        let output = match &self.retry {
            Some(policy) => retry::run(policy, |_| self.execute_once(input.clone())).await?,
            None => self.execute_once(input).await?,
        };

        self.output_schema
            .validate(&output)
            .map_err(|errors| Error::ToolOutputValidation {
                tool_name: self.name.clone(),
                output: output.clone(),
                errors,
            })?;
        Ok(output)
    }

    async fn execute_once(&self, input: Value) -> Result<Value> {
        debug!(tool = %self.name, "executing tool");
        self.tool
            .execute(input.clone())
            .await
            .map_err(|source| Error::ToolExecution {
                tool_name: self.name.clone(),
                input,
                source,
            })
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Tools reachable from one execution context, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDefinition>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: ToolDefinition) {
        if let Some(previous) = self.tools.insert(tool.name.clone(), tool) {
            warn!(tool = %previous.name, "tool registered twice, replacing previous definition");
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tools in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }

    /// Catalog entries in name order.
    pub fn catalog(&self) -> Vec<Value> {
        self.iter().map(ToolDefinition::describe).collect()
    }

    /// Look up `name` and call it.
    pub async fn invoke(&self, name: &str, input: Value) -> Result<Value> {
        let tool = self.get(name).ok_or_else(|| Error::DefinitionNotFound {
            kind: DefinitionKind::Tool,
            name: name.to_string(),
        })?;
        tool.call(input).await
    }

    /// Invoke a tool and fold the outcome into `history`.
    ///
    /// Failures are recorded as error payloads before being returned, so
    /// the next model turn sees them. This is the standalone entry point for
    /// callers driving tools outside an execution; the executor runs
    /// [`invoke`](Self::invoke) through its middleware pipeline instead, where
    /// `HistoryRecorder` folds successes and the tool step folds failures.
    pub async fn dispatch(&self, name: &str, input: Value, history: &mut History) -> Result<Value> {
        match self.invoke(name, input).await {
            Ok(output) => {
                history.push_tool_output(name, output.clone());
                Ok(output)
            }
            Err(error) => {
                history.push_tool_error(name, error.to_string());
                Err(error)
            }
        }
    }
}
