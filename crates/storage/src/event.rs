//! Event types for the execution log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// A unique identifier for one top-level execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// The kind of event that occurred during an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    AiFunctionStart,
    AiFunctionEnd,
    AiFunctionError,
    LlmStart,
    LlmEnd,
    LlmError,
    ToolStart,
    ToolEnd,
    ToolError,
    RetryAttempt,
}

impl EventKind {
    /// Stable wire name, e.g. `TOOL_END`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiFunctionStart => "AI_FUNCTION_START",
            Self::AiFunctionEnd => "AI_FUNCTION_END",
            Self::AiFunctionError => "AI_FUNCTION_ERROR",
            Self::LlmStart => "LLM_START",
            Self::LlmEnd => "LLM_END",
            Self::LlmError => "LLM_ERROR",
            Self::ToolStart => "TOOL_START",
            Self::ToolEnd => "TOOL_END",
            Self::ToolError => "TOOL_ERROR",
            Self::RetryAttempt => "RETRY_ATTEMPT",
        }
    }

    /// Whether this event closes an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AiFunctionEnd | Self::AiFunctionError)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event in the execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(execution_id: ExecutionId, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            timestamp: Utc::now(),
            kind,
            function_id: None,
            data: Value::Null,
        }
    }

    pub fn with_function(mut self, function_id: impl Into<String>) -> Self {
        self.function_id = Some(function_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}
