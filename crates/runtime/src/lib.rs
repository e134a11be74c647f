//! Typed AI function execution engine.
//!
//! A caller declares a function (input schema, output schema, instruction
//! template) and executes it against a text-completion model. The engine
//! treats the model as an unreliable, text-only backend: it compiles the
//! prompt, recovers JSON from noisy output, checks it against a tagged
//! response envelope, runs any tool the model asks for, and retries
//! transient failures, all inside a bounded loop.
//!
//! # Overview
//!
//! - **ExecutionContext**: the model provider, optional cache and event
//!   sink, tools, functions, middleware and configuration.
//! - **FunctionDefinition** / **ToolDefinition**: immutable, schema-checked
//!   declarations.
//! - **Envelope**: the `success` / `error` / `call_tool` union each model
//!   turn must produce.
//! - **Middleware**: onion-model interceptors around every LLM and tool step.
//!
//! # Example
//!
//! ```
//! use runtime::mock::MockProvider;
//! use runtime::{ExecutionContext, FunctionDefinition, Schema};
//! use serde_json::json;
//!
//! # async fn example() -> runtime::Result<()> {
//! let adder = FunctionDefinition::new(
//!     "adder",
//!     Schema::new(json!({"type": "object", "required": ["num1", "num2"]}))?,
//!     Schema::new(json!({"type": "object", "required": ["sum"]}))?,
//!     "Add {{num1}} and {{num2}}.",
//! );
//!
//! let mock = MockProvider::new();
//! mock.queue_json(json!({"_type": "success", "_data": {"sum": 42}}));
//!
//! let engine = ExecutionContext::new(mock);
//! let output = engine.execute(&adder, json!({"num1": 15, "num2": 27})).await?;
//! assert_eq!(output, json!({"sum": 42}));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
mod definition;
pub mod envelope;
mod error;
pub mod events;
mod executor;
pub mod extract;
pub mod history;
pub mod middleware;
pub mod mock;
pub mod model;
pub mod prompt;
pub mod retry;
pub mod tools;
pub mod trace;

pub use cache::{CachePolicy, CacheProvider, CachedProvider, MemoryCache};
pub use config::{ConfigError, EngineConfig, PlaceholderMode, ToolFailurePolicy};
pub use definition::{FunctionDefinition, TypedFunction};
pub use envelope::Envelope;
pub use error::{DefinitionKind, Error, Result};
pub use events::{ChannelSink, EventSink, MemorySink};
pub use executor::{Execution, ExecutionContext};
pub use history::{History, Message};
pub use middleware::{Middleware, Next, Pipeline, StepContext, StepKind};
pub use model::{GenerateRequest, Generation, ModelProvider, ProviderError, Usage};
pub use retry::{Delay, RetryPolicy};
pub use tools::{Tool, ToolDefinition, ToolError, ToolRegistry};
pub use trace::{Target, Trace};

pub use schema::{FieldError, Schema, ValidationErrors};
pub use storage::{Event, EventKind, ExecutionId};
