//! Onion-model interceptors around each execution step.
//!
//! Every step runs through an ordered list of [`Middleware`]. Each layer
//! gets the step context and a [`Next`] handle for the rest of the chain.
//! `Next` is consumed by [`Next::run`], so a layer can continue the chain at
//! most once. Returning without running it short-circuits the step.

use crate::envelope::Envelope;
use crate::history::History;
use crate::model::Usage;
use crate::{Error, Result};
use async_trait::async_trait;
use schema::Schema;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Llm,
    Tool,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Llm => f.write_str("llm"),
            Self::Tool => f.write_str("tool"),
        }
    }
}

/// Mutable state of one step as it moves through the chain.
#[derive(Debug)]
pub struct StepContext {
    pub kind: StepKind,
    pub function_id: String,
    /// 1-based index of this step within the execution.
    pub iteration: u32,
    /// 1-based retry attempt of this step.
    pub attempt: u32,
    pub tool_name: Option<String>,
    pub input: Value,
    /// Schema `input` must satisfy before the handler runs.
    pub input_schema: Option<Schema>,
    pub output: Option<Value>,
    /// Failure captured by [`ErrorCapture`].
    pub error: Option<Error>,
    pub history: History,
    /// Decoded model answer of an LLM step.
    pub envelope: Option<Envelope>,
    /// Prompt sent to the model by an LLM step.
    pub prompt: Option<String>,
    pub usage: Option<Usage>,
}

impl StepContext {
    pub fn new(kind: StepKind, function_id: impl Into<String>, input: Value) -> Self {
        Self {
            kind,
            function_id: function_id.into(),
            iteration: 1,
            attempt: 1,
            tool_name: None,
            input,
            input_schema: None,
            output: None,
            error: None,
            history: History::new(),
            envelope: None,
            prompt: None,
            usage: None,
        }
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<()>;
}

/// The innermost step body.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &mut StepContext) -> Result<()>;
}

/// Cursor over the remaining layers of a chain.
pub struct Next<'a> {
    layers: &'a [Arc<dyn Middleware>],
    index: usize,
    handler: &'a dyn Handler,
}

impl Next<'_> {
    /// Run the rest of the chain.
    pub async fn run(self, ctx: &mut StepContext) -> Result<()> {
        match self.layers.get(self.index) {
            Some(layer) => {
                let next = Next {
                    layers: self.layers,
                    index: self.index + 1,
                    handler: self.handler,
                };
                layer.handle(ctx, next).await
            }
            None => self.handler.call(ctx).await,
        }
    }
}

/// Ordered middleware chain.
#[derive(Clone, Default)]
pub struct Pipeline {
    layers: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The executor's chain: error capture, logging, `user` layers,
    /// validation, then history recording closest to the handler.
    pub fn canonical(user: &[Arc<dyn Middleware>]) -> Self {
        let mut pipeline = Self::new().with(ErrorCapture).with(Logging::default());
        for layer in user {
            pipeline.add(layer.clone());
        }
        pipeline.with(Validation::new()).with(HistoryRecorder)
    }

    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    pub fn add(&mut self, middleware: Arc<dyn Middleware>) {
        self.layers.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run `ctx` through every layer and then `handler`.
    pub async fn run(&self, ctx: &mut StepContext, handler: &dyn Handler) -> Result<()> {
        Next {
            layers: &self.layers,
            index: 0,
            handler,
        }
        .run(ctx)
        .await
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").field("layers", &self.layers.len()).finish()
    }
}

/// Stores any failure from the inner chain on [`StepContext::error`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorCapture;

#[async_trait]
impl Middleware for ErrorCapture {
    async fn handle(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<()> {
        if let Err(error) = next.run(ctx).await {
            ctx.error = Some(error);
        }
        Ok(())
    }
}

/// Logs step start and end with duration.
#[derive(Debug, Clone, Copy)]
pub struct Logging {
    level: Level,
}

impl Logging {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self::new(Level::DEBUG)
    }
}

macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            Level::ERROR => tracing::error!($($arg)+),
            Level::WARN => tracing::warn!($($arg)+),
            Level::INFO => tracing::info!($($arg)+),
            Level::DEBUG => tracing::debug!($($arg)+),
            _ => tracing::trace!($($arg)+),
        }
    };
}

#[async_trait]
impl Middleware for Logging {
    async fn handle(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<()> {
        let kind = ctx.kind;
        let function_id = ctx.function_id.clone();
        let (iteration, attempt) = (ctx.iteration, ctx.attempt);
        log_at!(self.level, step = %kind, function_id = %function_id, iteration, attempt, "step started");

        let started = Instant::now();
        let result = next.run(ctx).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(()) => log_at!(self.level, step = %kind, function_id = %function_id, duration_ms, "step finished"),
            Err(error) => {
                log_at!(self.level, step = %kind, function_id = %function_id, duration_ms, error = %error, "step failed")
            }
        }
        result
    }
}

type Guard = Arc<dyn Fn(&StepContext) -> Result<()> + Send + Sync>;

/// Checks step input before anything inner runs.
///
/// Input is validated against [`StepContext::input_schema`] and then handed
/// to the optional guard. Either failure ends the step without calling the
/// handler.
#[derive(Clone, Default)]
pub struct Validation {
    guard: Option<Guard>,
}

impl Validation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_guard(mut self, guard: impl Fn(&StepContext) -> Result<()> + Send + Sync + 'static) -> Self {
        self.guard = Some(Arc::new(guard));
        self
    }
}

impl fmt::Debug for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validation")
            .field("guard", &self.guard.is_some())
            .finish()
    }
}

#[async_trait]
impl Middleware for Validation {
    async fn handle(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<()> {
        if let Some(schema) = &ctx.input_schema {
            let target = ctx.tool_name.as_deref().unwrap_or(&ctx.function_id);
            schema
                .validate(&ctx.input)
                .map_err(|errors| Error::input(target, errors))?;
        }
        if let Some(guard) = &self.guard {
            guard(ctx)?;
        }
        next.run(ctx).await
    }
}

/// Appends the step's outcome to history once the inner chain succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryRecorder;

#[async_trait]
impl Middleware for HistoryRecorder {
    async fn handle(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<()> {
        next.run(ctx).await?;
        match ctx.kind {
            StepKind::Llm => {
                if let Some(envelope) = ctx.envelope.clone() {
                    ctx.history.push_assistant(envelope);
                }
            }
            StepKind::Tool => {
                if let (Some(name), Some(output)) = (&ctx.tool_name, &ctx.output) {
                    ctx.history.push_tool_output(name.clone(), output.clone());
                }
            }
        }
        Ok(())
    }
}
