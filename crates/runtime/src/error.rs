use crate::config::ConfigError;
use crate::middleware::StepKind;
use crate::model::ProviderError;
use crate::tools::ToolError;
use schema::{FieldError, ValidationErrors};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// What kind of definition a lookup missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    Function,
    Tool,
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function => f.write_str("function"),
            Self::Tool => f.write_str("tool"),
        }
    }
}

/// Every failure an execution can end with.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Caller or model-supplied input does not match a function/tool schema.
    #[error("invalid input for {target}: {errors}")]
    InputValidation {
        target: String,
        errors: ValidationErrors,
    },

    /// The prompt template could not be rendered.
    #[error("prompt compilation failed: {0}")]
    PromptCompilation(String),

    /// The model backend failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// No parseable JSON could be recovered from the model's text.
    #[error("unparseable model output: {message}")]
    OutputParsing { message: String, raw: String },

    /// Parsed output does not match the envelope or output schema.
    #[error("model output failed validation: {errors}")]
    OutputValidation {
        output: Value,
        errors: ValidationErrors,
    },

    /// A tool returned a value that does not match its output schema.
    ///
    /// Same taxonomy kind as [`Error::OutputValidation`], but never retried
    /// by the default predicate since the tool is deterministic here.
    #[error("tool {tool_name} returned invalid output: {errors}")]
    ToolOutputValidation {
        tool_name: String,
        output: Value,
        errors: ValidationErrors,
    },

    /// A tool's own code failed.
    #[error("tool {tool_name} failed: {source}")]
    ToolExecution {
        tool_name: String,
        input: Value,
        #[source]
        source: ToolError,
    },

    /// A function or tool name is not registered.
    #[error("{kind} not found: {name}")]
    DefinitionNotFound { kind: DefinitionKind, name: String },

    /// A retryable failure outlived the attempt budget.
    #[error("gave up after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        last_error: Box<Error>,
    },

    /// The LLM/tool loop hit its iteration ceiling.
    #[error("no final answer within {limit} iterations")]
    MaxIterations { limit: u32 },

    /// The model answered with an `error` envelope.
    #[error("model reported an error: {0}")]
    Llm(String),

    /// A middleware ended a step without an outcome.
    #[error("{0} step ended by middleware without output")]
    Aborted(StepKind),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("event sink error: {0}")]
    Sink(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] schema::Error),

    #[error(transparent)]
    Storage(#[from] storage::Error),
}

impl Error {
    /// Default retry predicate.
    ///
    /// Transient provider failures and malformed or mismatched model output
    /// are worth another attempt; everything deterministic is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::OutputParsing { .. } | Self::OutputValidation { .. } => true,
            _ => false,
        }
    }

    /// The failure underneath any retry exhaustion wrapper.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::MaxRetriesExceeded { last_error, .. } => last_error.root_cause(),
            other => other,
        }
    }

    /// Stable name of the error kind, used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InputValidation { .. } => "input_validation",
            Self::PromptCompilation(_) => "prompt_compilation",
            Self::Provider(_) => "provider",
            Self::OutputParsing { .. } => "output_parsing",
            Self::OutputValidation { .. } | Self::ToolOutputValidation { .. } => "output_validation",
            Self::ToolExecution { .. } => "tool_execution",
            Self::DefinitionNotFound { .. } => "definition_not_found",
            Self::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            Self::MaxIterations { .. } => "max_iterations",
            Self::Llm(_) => "llm",
            Self::Aborted(_) => "aborted",
            Self::Cache(_) => "cache",
            Self::Sink(_) => "sink",
            Self::Config(_) => "config",
            Self::Schema(_) => "schema",
            Self::Storage(_) => "storage",
        }
    }

    pub(crate) fn input(target: impl Into<String>, errors: ValidationErrors) -> Self {
        Self::InputValidation {
            target: target.into(),
            errors,
        }
    }

    pub(crate) fn unparseable(message: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::OutputParsing {
            message: message.into(),
            raw: raw.into(),
        }
    }

    /// Output mismatch with a single root-level reason.
    pub(crate) fn mismatch(output: Value, message: impl Into<String>) -> Self {
        Self::OutputValidation {
            output,
            errors: ValidationErrors::single(FieldError::root(message)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_predicate_follows_taxonomy() {
        assert!(Error::from(ProviderError::Timeout(Duration::from_secs(1))).is_retryable());
        assert!(Error::unparseable("no json", "hello").is_retryable());
        assert!(Error::mismatch(Value::Null, "bad").is_retryable());

        assert!(!Error::input("adder", ValidationErrors::default()).is_retryable());
        assert!(!Error::PromptCompilation("missing".into()).is_retryable());
        assert!(
            !Error::ToolExecution {
                tool_name: "rng".into(),
                input: Value::Null,
                source: ToolError::Execution("boom".into()),
            }
            .is_retryable()
        );
        assert!(
            !Error::DefinitionNotFound {
                kind: DefinitionKind::Tool,
                name: "nope".into()
            }
            .is_retryable()
        );
        assert!(!Error::MaxIterations { limit: 3 }.is_retryable());
    }

    #[test]
    fn tool_output_mismatch_names_the_tool() {
        let err = Error::ToolOutputValidation {
            tool_name: "RNG".into(),
            output: Value::Null,
            errors: ValidationErrors::single(FieldError::root("expected integer")),
        };
        assert_eq!(err.kind(), "output_validation");
        assert!(!err.is_retryable());
        assert!(err.to_string().starts_with("tool RNG returned invalid output"));
    }

    #[test]
    fn root_cause_unwraps_exhaustion() {
        let err = Error::MaxRetriesExceeded {
            attempts: 3,
            last_error: Box::new(Error::unparseable("no json", "prose")),
        };
        assert!(matches!(err.root_cause(), Error::OutputParsing { .. }));
        assert_eq!(err.kind(), "max_retries_exceeded");
        assert_eq!(err.root_cause().kind(), "output_parsing");
    }

    #[test]
    fn display_names_missing_definition() {
        let err = Error::DefinitionNotFound {
            kind: DefinitionKind::Tool,
            name: "RNG".into(),
        };
        assert_eq!(err.to_string(), "tool not found: RNG");
    }

    #[test]
    fn source_chain_reaches_last_error() {
        use std::error::Error as _;
        let err = Error::MaxRetriesExceeded {
            attempts: 2,
            last_error: Box::new(Error::Llm("refused".into())),
        };
        let source = err.source().expect("exhaustion keeps its cause");
        assert!(source.to_string().contains("refused"));
    }
}
