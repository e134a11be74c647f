//! The execution engine.
//!
//! [`ExecutionContext`] owns everything an execution can reach: the model
//! provider, the optional cache and event sink, registered tools and
//! functions, middleware and configuration. Each call to
//! [`ExecutionContext::run`] drives one bounded state machine:
//!
//! ```text
//! LLM_STEP --success--> SUCCESS
//!    |  ^ --error----> FAILED
//!    |  |
//! call_tool   tool result / tool failure (recover)
//!    v  |
//! TOOL_STEP --tool failure (abort)--> FAILED
//! ```
//!
//! History and trace belong to a single run, so one context can serve many
//! concurrent executions.

use crate::cache::{CacheProvider, CachedProvider, MemoryCache};
use crate::config::{EngineConfig, ToolFailurePolicy};
use crate::definition::{FunctionDefinition, TypedFunction};
use crate::envelope::{self, Envelope};
use crate::error::DefinitionKind;
use crate::events::{Emitter, EventSink};
use crate::extract;
use crate::history::History;
use crate::middleware::{Handler, Middleware, Pipeline, StepContext, StepKind};
use crate::model::{GenerateRequest, ModelProvider, Usage};
use crate::prompt::{PromptCompiler, PromptContext};
use crate::retry::{RetryPolicy, Verdict};
use crate::tools::{ToolDefinition, ToolRegistry};
use crate::trace::{Target, Trace};
use crate::{Error, Result};
use async_trait::async_trait;
use schema::{FieldError, ValidationErrors};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use storage::{EventKind, ExecutionId};
use tracing::{debug, info, warn};

/// Everything one execution produced.
#[derive(Debug, Clone)]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub output: Value,
    pub trace: Trace,
    pub history: History,
    /// LLM and tool steps taken.
    pub iterations: u32,
    pub usage: Usage,
}

/// Providers, definitions and policies shared by executions.
pub struct ExecutionContext {
    provider: Arc<dyn ModelProvider>,
    cache: Option<Arc<dyn CacheProvider>>,
    events: Option<Arc<dyn EventSink>>,
    tools: ToolRegistry,
    functions: BTreeMap<String, FunctionDefinition>,
    middleware: Vec<Arc<dyn Middleware>>,
    pipeline: Pipeline,
    config: EngineConfig,
    compiler: PromptCompiler,
}

impl ExecutionContext {
    pub fn new(provider: impl ModelProvider + 'static) -> Self {
        let config = EngineConfig::default();
        Self {
            provider: Arc::new(provider),
            cache: None,
            events: None,
            tools: ToolRegistry::new(),
            functions: BTreeMap::new(),
            middleware: Vec::new(),
            pipeline: Pipeline::canonical(&[]),
            compiler: PromptCompiler::from_config(&config),
            config,
        }
    }

    /// Replace the configuration after checking it.
    ///
    /// With `[cache] enabled` and no cache set yet, an in-memory cache of
    /// the configured capacity is installed.
    pub fn with_config(mut self, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        if config.cache.enabled && self.cache.is_none() {
            let cache: Arc<dyn CacheProvider> = MemoryCache::from_config(&config.cache);
            self.cache = Some(cache);
        }
        self.compiler = PromptCompiler::from_config(&config);
        self.config = config;
        Ok(self)
    }

    /// Memoize model calls in `cache`.
    pub fn with_cache(mut self, cache: impl CacheProvider + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn with_events(mut self, sink: impl EventSink + 'static) -> Self {
        self.events = Some(Arc::new(sink));
        self
    }

    /// Add a middleware between the built-in logging and validation layers.
    pub fn with_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self.pipeline = Pipeline::canonical(&self.middleware);
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.register_tool(tool);
        self
    }

    pub fn register_tool(&mut self, tool: ToolDefinition) {
        self.tools.register(tool);
    }

    pub fn with_function(mut self, function: FunctionDefinition) -> Self {
        self.register_function(function);
        self
    }

    /// Register a function for [`execute_by_id`](Self::execute_by_id).
    pub fn register_function(&mut self, function: FunctionDefinition) {
        let id = function.id().to_string();
        if self.functions.insert(id.clone(), function).is_some() {
            warn!(function_id = %id, "function registered twice, replacing previous definition");
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn function(&self, id: &str) -> Option<&FunctionDefinition> {
        self.functions.get(id)
    }

    /// Run `function` and return its output.
    pub async fn execute(&self, function: &FunctionDefinition, input: Value) -> Result<Value> {
        self.run(function, input).await.map(|execution| execution.output)
    }

    /// Run a registered function by id.
    pub async fn execute_by_id(&self, id: &str, input: Value) -> Result<Value> {
        let function = self.function(id).ok_or_else(|| Error::DefinitionNotFound {
            kind: DefinitionKind::Function,
            name: id.to_string(),
        })?;
        self.execute(function, input).await
    }

    /// Run a typed function.
    pub async fn invoke<I, O>(&self, function: &TypedFunction<I, O>, input: &I) -> Result<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let definition = function.definition();
        let input = serde_json::to_value(input).map_err(|e| {
            Error::input(
                definition.id(),
                ValidationErrors::single(FieldError::root(e.to_string())),
            )
        })?;
        let output = self.execute(definition, input).await?;
        serde_json::from_value(output.clone()).map_err(|e| Error::mismatch(output, e.to_string()))
    }

    /// Run `function` and return the output with its trace and history.
    pub async fn run(&self, function: &FunctionDefinition, input: Value) -> Result<Execution> {
        let execution_id = ExecutionId::new();
        let emitter = Emitter::new(self.events.as_deref(), execution_id, function.id());
        emitter.emit(EventKind::AiFunctionStart, json!({ "input": input }));
        info!(function_id = %function.id(), %execution_id, "execution started");

        let retry = function
            .retry()
            .cloned()
            .unwrap_or_else(|| self.config.retry_policy());
        let provider: Arc<dyn ModelProvider> = match &self.cache {
            Some(cache) => {
                let policy = function
                    .cache()
                    .cloned()
                    .unwrap_or_else(|| self.config.cache_policy());
                Arc::new(CachedProvider::new(self.provider.clone(), cache.clone(), &policy))
            }
            None => self.provider.clone(),
        };

        let mut run = Run {
            ctx: self,
            function,
            provider,
            retry,
            emitter,
            history: History::new(),
            trace: Trace::new(),
            iterations: 0,
            usage: Usage::default(),
        };
        let result = run.drive(input).await;

        match result {
            Ok(output) => {
                run.emitter.emit(
                    EventKind::AiFunctionEnd,
                    json!({ "output": output, "iterations": run.iterations }),
                );
                info!(function_id = %function.id(), iterations = run.iterations, "execution finished");
                Ok(Execution {
                    execution_id,
                    output,
                    trace: run.trace,
                    history: run.history,
                    iterations: run.iterations,
                    usage: run.usage,
                })
            }
            Err(error) => {
                run.emitter.emit(
                    EventKind::AiFunctionError,
                    json!({ "error": error.to_string(), "kind": error.kind() }),
                );
                warn!(function_id = %function.id(), error = %error, "execution failed");
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("provider", &self.provider.name())
            .field("cache", &self.cache.is_some())
            .field("events", &self.events.is_some())
            .field("tools", &self.tools)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("pipeline", &self.pipeline)
            .field("config", &self.config)
            .finish()
    }
}

/// State owned by one execution.
struct Run<'a> {
    ctx: &'a ExecutionContext,
    function: &'a FunctionDefinition,
    provider: Arc<dyn ModelProvider>,
    retry: RetryPolicy,
    emitter: Emitter<'a>,
    history: History,
    trace: Trace,
    iterations: u32,
    usage: Usage,
}

impl Run<'_> {
    async fn drive(&mut self, input: Value) -> Result<Value> {
        let function = self.function;
        function
            .input_schema()
            .validate(&input)
            .map_err(|errors| Error::input(function.id(), errors))?;
        let task = self.ctx.compiler.render(function, &input)?;
        self.history.push_user(task);

        let limit = self.ctx.config.max_iterations;
        loop {
            if self.iterations >= limit {
                return Err(Error::MaxIterations { limit });
            }
            self.iterations += 1;

            let pending = self
                .trace
                .pending_tool_call()
                .map(|(name, input)| (name.to_string(), Value::Object(input.clone())));
            match pending {
                Some((tool_name, tool_input)) => self.tool_step(tool_name, tool_input).await?,
                None => match self.llm_step(&input).await? {
                    Envelope::Success { data } => return Ok(data),
                    Envelope::Error { message } => return Err(Error::Llm(message)),
                    Envelope::CallTool { tool_name, .. } => {
                        debug!(function_id = %function.id(), tool = %tool_name, "model requested a tool");
                    }
                },
            }
        }
    }

    /// One LLM step, retried as a unit under the run's policy.
    async fn llm_step(&mut self, input: &Value) -> Result<Envelope> {
        let ctx = self.ctx;
        let function = self.function;
        let retry = self.retry.clone();
        let mut attempts = retry.attempts();
        let mut feedback: Option<Error> = None;

        loop {
            let attempt = attempts.begin();
            self.emitter.emit(
                EventKind::LlmStart,
                json!({ "iteration": self.iterations, "attempt": attempt }),
            );

            let mut step = StepContext::new(StepKind::Llm, function.id(), input.clone());
            step.iteration = self.iterations;
            step.attempt = attempt;
            step.input_schema = Some(function.input_schema().clone());
            step.history = mem::take(&mut self.history);
            let mark = step.history.len();

            let handler = LlmHandler {
                compiler: &ctx.compiler,
                function,
                provider: self.provider.as_ref(),
                tools: &ctx.tools,
                feedback: feedback.as_ref(),
            };
            let outcome = run_step(&ctx.pipeline, &mut step, &handler).await;
            self.history = mem::take(&mut step.history);
            if let Some(usage) = step.usage {
                self.usage += usage;
            }

            let error = match outcome.and_then(|output| decoded(&mut step, output, function)) {
                Ok(Decoded {
                    envelope,
                    output,
                    rewritten,
                }) => {
                    if rewritten {
                        debug!(function_id = %function.id(), "middleware replaced the model answer");
                        self.history.retract_assistant(mark);
                        self.history.push_assistant(envelope.clone());
                    }
                    let prompt = step.prompt.take().map_or_else(|| input.clone(), Value::String);
                    self.trace.record(Target::Llm, prompt, output, None);
                    self.emitter.emit(
                        EventKind::LlmEnd,
                        json!({ "attempt": attempt, "type": envelope.tag() }),
                    );
                    return Ok(envelope);
                }
                Err(error) => {
                    self.history.retract_assistant(mark);
                    error
                }
            };

            self.emitter.emit(
                EventKind::LlmError,
                json!({ "attempt": attempt, "error": error.to_string(), "kind": error.kind() }),
            );
            match attempts.judge(error) {
                Verdict::Retry { delay, error } => {
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    self.emitter.emit(
                        EventKind::RetryAttempt,
                        json!({ "attempt": attempt + 1, "delay_ms": delay_ms, "error": error.to_string() }),
                    );
                    warn!(function_id = %function.id(), attempt, delay_ms, error = %error, "llm step failed, retrying");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let correctable = matches!(error, Error::OutputParsing { .. } | Error::OutputValidation { .. });
                    feedback = (retry.validation_feedback() && correctable).then_some(error);
                }
                Verdict::Fail(error) => return Err(error),
            }
        }
    }

    async fn tool_step(&mut self, tool_name: String, input: Value) -> Result<()> {
        let ctx = self.ctx;
        self.emitter.emit(
            EventKind::ToolStart,
            json!({ "tool": tool_name, "input": input, "iteration": self.iterations }),
        );

        let mut step = StepContext::new(StepKind::Tool, self.function.id(), input.clone());
        step.iteration = self.iterations;
        step.tool_name = Some(tool_name.clone());
        step.input_schema = ctx.tools.get(&tool_name).map(|tool| tool.input_schema().clone());
        step.history = mem::take(&mut self.history);

        let outcome = run_step(&ctx.pipeline, &mut step, &ToolHandler { tools: &ctx.tools }).await;
        self.history = mem::take(&mut step.history);

        match outcome {
            Ok(output) => {
                self.trace.record(Target::Tool, input, output.clone(), Some(tool_name.clone()));
                self.emitter.emit(
                    EventKind::ToolEnd,
                    json!({ "tool": tool_name, "output": output }),
                );
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                self.history.push_tool_error(&tool_name, &message);
                self.trace.record(
                    Target::Tool,
                    input,
                    json!({ "error": message }),
                    Some(tool_name.clone()),
                );
                self.emitter.emit(
                    EventKind::ToolError,
                    json!({ "tool": tool_name, "error": message, "kind": error.kind() }),
                );
                match ctx.config.tool_failure {
                    ToolFailurePolicy::Recover => {
                        warn!(tool = %tool_name, error = %error, "tool step failed, returning control to the model");
                        Ok(())
                    }
                    ToolFailurePolicy::Abort => Err(error),
                }
            }
        }
    }
}

/// Run one step through the pipeline and collect its outcome.
async fn run_step(pipeline: &Pipeline, step: &mut StepContext, handler: &dyn Handler) -> Result<Value> {
    pipeline.run(step, handler).await?;
    if let Some(error) = step.error.take() {
        return Err(error);
    }
    step.output.clone().ok_or(Error::Aborted(step.kind))
}

/// The answer an LLM step settled on.
struct Decoded {
    envelope: Envelope,
    output: Value,
    /// The answer differs from the handler's own envelope.
    rewritten: bool,
}

/// The envelope behind an LLM step's output.
///
/// A middleware may replace the output, so anything other than the
/// handler's own envelope is decoded and validated again.
fn decoded(step: &mut StepContext, output: Value, function: &FunctionDefinition) -> Result<Decoded> {
    match step.envelope.take() {
        Some(envelope) if envelope.to_value() == output => Ok(Decoded {
            envelope,
            output,
            rewritten: false,
        }),
        _ => {
            let envelope = envelope::validate(output, function.output_schema())?;
            let output = envelope.to_value();
            Ok(Decoded {
                envelope,
                output,
                rewritten: true,
            })
        }
    }
}

/// Compile, call the model, extract and validate.
struct LlmHandler<'a> {
    compiler: &'a PromptCompiler,
    function: &'a FunctionDefinition,
    provider: &'a dyn ModelProvider,
    tools: &'a ToolRegistry,
    feedback: Option<&'a Error>,
}

#[async_trait]
impl Handler for LlmHandler<'_> {
    async fn call(&self, ctx: &mut StepContext) -> Result<()> {
        let context = PromptContext {
            tools: self.tools,
            history: &ctx.history,
            feedback: self.feedback,
        };
        let prompt = self.compiler.compile(self.function, &ctx.input, context)?;

        let mut request = GenerateRequest::new(prompt.clone())
            .with_options(self.function.model_options().clone())
            .with_attempt(ctx.attempt);
        if let Some(system) = self.function.system_prompt() {
            request = request.with_system(system);
        }
        ctx.prompt = Some(prompt);

        let generation = self.provider.generate(&request).await?;
        ctx.usage = generation.usage;
        let parsed: Value = extract::parse(&generation.raw_output)?;
        let envelope = envelope::validate(parsed, self.function.output_schema())?;

        ctx.output = Some(envelope.to_value());
        ctx.envelope = Some(envelope);
        Ok(())
    }
}

struct ToolHandler<'a> {
    tools: &'a ToolRegistry,
}

#[async_trait]
impl Handler for ToolHandler<'_> {
    async fn call(&self, ctx: &mut StepContext) -> Result<()> {
        let name = ctx.tool_name.clone().unwrap_or_default();
        let output = self.tools.invoke(&name, ctx.input.clone()).await?;
        ctx.output = Some(output);
        Ok(())
    }
}
