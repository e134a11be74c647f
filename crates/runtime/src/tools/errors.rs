use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

/// Errors a tool implementation can raise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum ToolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("timeout after {0}ms")]
    Timeout(u64),
    #[error("execution failed: {0}")]
    Execution(String),
}

impl ToolError {
    /// Wrap any displayable failure as an execution error.
    pub fn execution(error: impl Display) -> Self {
        Self::Execution(error.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidInput(error.to_string())
    }
}
