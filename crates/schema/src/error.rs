//! Schema error types.

use thiserror::Error;

/// Schema errors.
///
/// These describe a broken schema *document*. A value that merely fails to
/// conform is reported through [`ValidationErrors`](crate::ValidationErrors).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The document is not a usable JSON Schema.
    #[error("invalid schema: {0}")]
    Invalid(String),

    /// The document could not be parsed as JSON.
    #[error("failed to parse schema: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
