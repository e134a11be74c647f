//! End-to-end behavior of the execution engine against a scripted model.

use async_trait::async_trait;
use runtime::middleware::Validation;
use runtime::mock::MockProvider;
use runtime::{
    CachePolicy, ConfigError, EngineConfig, Envelope, Error, EventKind, ExecutionContext, FunctionDefinition, MemorySink, Message,
    Middleware, Next, RetryPolicy, Schema, StepContext, StepKind, Target, ToolDefinition, ToolError,
    ToolFailurePolicy, TypedFunction,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use storage::EventStore;

fn adder() -> FunctionDefinition {
    FunctionDefinition::new(
        "adder",
        Schema::new(json!({
            "type": "object",
            "properties": {
                "num1": { "type": "number" },
                "num2": { "type": "number" },
            },
            "required": ["num1", "num2"],
        }))
        .unwrap(),
        Schema::new(json!({
            "type": "object",
            "properties": { "sum": { "type": "number" } },
            "required": ["sum"],
        }))
        .unwrap(),
        "Add {{num1}} and {{num2}}.",
    )
    .with_retry(RetryPolicy::new(3))
}

fn lucky_number() -> FunctionDefinition {
    FunctionDefinition::new(
        "lucky_number",
        Schema::any(),
        Schema::new(json!({
            "type": "object",
            "properties": { "number": { "type": "integer" } },
            "required": ["number"],
        }))
        .unwrap(),
        "Pick a lucky number using the RNG tool.",
    )
    .with_retry(RetryPolicy::new(2))
}

fn rng(calls: Arc<AtomicU32>) -> ToolDefinition {
    ToolDefinition::from_fn(
        "RNG",
        "Random integer between min and max",
        Schema::new(json!({
            "type": "object",
            "properties": {
                "min": { "type": "integer" },
                "max": { "type": "integer" },
            },
            "required": ["min", "max"],
        }))
        .unwrap(),
        Schema::new(json!({ "type": "integer" })).unwrap(),
        move |input: Value| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let min = input["min"].as_i64().unwrap_or(0);
                let max = input["max"].as_i64().unwrap_or(0);
                if min > max {
                    return Err(ToolError::InvalidInput("min must not exceed max".into()));
                }
                Ok(json!(min + (max - min) / 2))
            }
        },
    )
}

fn success(data: Value) -> Value {
    json!({ "_type": "success", "_data": data })
}

fn call_rng(min: i64, max: i64) -> Value {
    json!({ "_type": "call_tool", "_toolName": "RNG", "_input": { "min": min, "max": max } })
}

#[tokio::test]
async fn adder_returns_model_answer() {
    let mock = Arc::new(MockProvider::new());
    mock.queue_json(success(json!({ "sum": 42 })));
    let engine = ExecutionContext::new(mock.clone());

    let output = engine.execute(&adder(), json!({ "num1": 15, "num2": 27 })).await.unwrap();
    assert_eq!(output, json!({ "sum": 42 }));

    let calls = mock.recorded_calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].prompt.contains("Add 15 and 27."));
}

#[tokio::test]
async fn answer_wrapped_in_prose_is_recovered() {
    let mock = MockProvider::new();
    mock.queue_text("Of course!\n```json\n{\"_type\": \"success\", \"_data\": {\"sum\": 3}}\n```\nAnything else?");
    let engine = ExecutionContext::new(mock);
    let output = engine.execute(&adder(), json!({ "num1": 1, "num2": 2 })).await.unwrap();
    assert_eq!(output, json!({ "sum": 3 }));
}

#[tokio::test]
async fn tool_call_feeds_result_back_to_model() {
    let mock = Arc::new(MockProvider::new());
    mock.queue_json(call_rng(1, 10));
    mock.queue_json(success(json!({ "number": 5 })));
    let tool_calls = Arc::new(AtomicU32::new(0));
    let engine = ExecutionContext::new(mock.clone()).with_tool(rng(tool_calls.clone()));

    let execution = engine.run(&lucky_number(), json!({})).await.unwrap();
    assert_eq!(execution.output, json!({ "number": 5 }));
    assert_eq!(tool_calls.load(Ordering::SeqCst), 1);

    assert_eq!(execution.trace.count(Target::Tool), 1);
    assert_eq!(execution.trace.targets(), [Target::Llm, Target::Tool, Target::Llm]);
    assert_eq!(execution.iterations, 3);

    // The second prompt shows the tool result in the conversation.
    let second = &mock.recorded_calls()[1].prompt;
    assert!(second.contains(r#""toolResponse":"#));
    assert!(second.contains(r#""payload":5"#));

    let roles: Vec<_> = execution.history.messages().iter().map(Message::role).collect();
    assert_eq!(roles, ["user", "assistant", "user", "assistant"]);
}

#[tokio::test]
async fn prose_only_exhausts_retries() {
    let mock = Arc::new(MockProvider::repeat_text("I believe the sum is forty-two."));
    let engine = ExecutionContext::new(mock.clone());

    let err = engine
        .execute(&adder(), json!({ "num1": 15, "num2": 27 }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MaxRetriesExceeded { attempts: 3, .. }));
    assert!(matches!(err.root_cause(), Error::OutputParsing { .. }));
    assert_eq!(mock.call_count(), 3);
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let mock = Arc::new(MockProvider::new());
    mock.queue_error(runtime::ProviderError::Network("reset".into()))
        .queue_error(runtime::ProviderError::Timeout(std::time::Duration::from_secs(30)))
        .queue_json(success(json!({ "sum": 2 })));
    let engine = ExecutionContext::new(mock.clone());

    let output = engine.execute(&adder(), json!({ "num1": 1, "num2": 1 })).await.unwrap();
    assert_eq!(output, json!({ "sum": 2 }));
    assert_eq!(mock.call_count(), 3);
}

#[tokio::test]
async fn rejected_request_is_not_retried() {
    let mock = Arc::new(MockProvider::new());
    mock.queue_error(runtime::ProviderError::Rejected("invalid api key".into()));
    let engine = ExecutionContext::new(mock.clone());

    let err = engine.execute(&adder(), json!({ "num1": 1, "num2": 1 })).await.unwrap_err();
    assert!(matches!(err, Error::Provider(_)));
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn endless_tool_requests_hit_the_iteration_ceiling() {
    let mock = Arc::new(MockProvider::repeat_text(call_rng(1, 3).to_string()));
    let tool_calls = Arc::new(AtomicU32::new(0));
    let config = EngineConfig {
        max_iterations: 5,
        ..EngineConfig::default()
    };
    let engine = ExecutionContext::new(mock.clone())
        .with_config(config)
        .unwrap()
        .with_tool(rng(tool_calls.clone()));

    let err = engine.execute(&lucky_number(), json!({})).await.unwrap_err();
    assert!(matches!(err, Error::MaxIterations { limit: 5 }));
    // llm, tool, llm, tool, llm
    assert_eq!(mock.call_count(), 3);
    assert_eq!(tool_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn model_error_envelope_fails_the_execution() {
    let mock = MockProvider::new();
    mock.queue_json(json!({ "_type": "error", "_message": "cannot add letters" }));
    let engine = ExecutionContext::new(mock);
    let err = engine.execute(&adder(), json!({ "num1": 1, "num2": 2 })).await.unwrap_err();
    assert!(matches!(err, Error::Llm(ref message) if message == "cannot add letters"));
}

#[tokio::test]
async fn invalid_input_never_reaches_the_model() {
    let mock = Arc::new(MockProvider::new());
    let engine = ExecutionContext::new(mock.clone());
    let err = engine.execute(&adder(), json!({ "num1": "fifteen" })).await.unwrap_err();
    match err {
        Error::InputValidation { target, errors } => {
            assert_eq!(target, "adder");
            assert!(!errors.is_empty());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn strict_placeholders_fail_before_the_model() {
    let mock = Arc::new(MockProvider::new());
    let engine = ExecutionContext::new(mock.clone());
    let function = FunctionDefinition::new("greeter", Schema::any(), Schema::any(), "Hello {{name}}");
    let err = engine.execute(&function, json!({ "nickname": "Ada" })).await.unwrap_err();
    assert!(matches!(err, Error::PromptCompilation(_)));
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn output_schema_mismatch_is_retried() {
    let mock = Arc::new(MockProvider::new());
    mock.queue_json(success(json!({ "total": 3 })));
    mock.queue_json(success(json!({ "sum": 3 })));
    let engine = ExecutionContext::new(mock.clone());
    let output = engine.execute(&adder(), json!({ "num1": 1, "num2": 2 })).await.unwrap();
    assert_eq!(output, json!({ "sum": 3 }));
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test]
async fn validation_feedback_reaches_the_next_prompt() {
    let mock = Arc::new(MockProvider::new());
    mock.queue_json(success(json!({ "sum": "three" })));
    mock.queue_json(success(json!({ "sum": 3 })));
    let engine = ExecutionContext::new(mock.clone());
    let function = adder().with_retry(RetryPolicy::new(2).with_validation_feedback(true));

    engine.execute(&function, json!({ "num1": 1, "num2": 2 })).await.unwrap();
    let calls = mock.recorded_calls();
    assert!(!calls[0].prompt.contains("## Previous attempt"));
    assert!(calls[1].prompt.contains("## Previous attempt"));
    assert!(calls[1].prompt.contains("/sum"));
    assert_eq!(calls[1].attempt, 2);
}

#[tokio::test]
async fn unknown_tool_is_reported_back_to_the_model() {
    let mock = Arc::new(MockProvider::new());
    mock.queue_json(json!({ "_type": "call_tool", "_toolName": "Dice", "_input": {} }));
    mock.queue_json(success(json!({ "number": 7 })));
    let engine = ExecutionContext::new(mock.clone()).with_tool(rng(Arc::new(AtomicU32::new(0))));

    let execution = engine.run(&lucky_number(), json!({})).await.unwrap();
    assert_eq!(execution.output, json!({ "number": 7 }));
    assert!(mock.recorded_calls()[1].prompt.contains("tool not found: Dice"));
    assert_eq!(execution.trace.targets(), [Target::Llm, Target::Tool, Target::Llm]);
}

#[tokio::test]
async fn tool_failure_can_abort() {
    let mock = MockProvider::new();
    mock.queue_json(call_rng(10, 1));
    let config = EngineConfig {
        tool_failure: ToolFailurePolicy::Abort,
        ..EngineConfig::default()
    };
    let engine = ExecutionContext::new(mock)
        .with_config(config)
        .unwrap()
        .with_tool(rng(Arc::new(AtomicU32::new(0))));

    let err = engine.execute(&lucky_number(), json!({})).await.unwrap_err();
    assert!(matches!(err, Error::ToolExecution { ref tool_name, .. } if tool_name == "RNG"));
}

#[tokio::test]
async fn invalid_tool_arguments_are_recoverable() {
    let mock = Arc::new(MockProvider::new());
    mock.queue_json(json!({ "_type": "call_tool", "_toolName": "RNG", "_input": { "min": "low" } }));
    mock.queue_json(call_rng(2, 4));
    mock.queue_json(success(json!({ "number": 3 })));
    let tool_calls = Arc::new(AtomicU32::new(0));
    let engine = ExecutionContext::new(mock.clone()).with_tool(rng(tool_calls.clone()));

    let execution = engine.run(&lucky_number(), json!({})).await.unwrap();
    assert_eq!(execution.output, json!({ "number": 3 }));
    assert_eq!(tool_calls.load(Ordering::SeqCst), 1);
    assert_eq!(execution.trace.count(Target::Tool), 2);
}

#[tokio::test]
async fn identical_calls_are_served_from_cache() {
    let mock = Arc::new(MockProvider::new());
    mock.queue_json(success(json!({ "sum": 42 })));
    let engine = ExecutionContext::new(mock.clone()).with_cache(runtime::MemoryCache::new(16));
    let input = json!({ "num1": 15, "num2": 27 });

    let first = engine.execute(&adder(), input.clone()).await.unwrap();
    let second = engine.execute(&adder(), input).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn config_enabled_cache_uses_sqlite_when_supplied() {
    let mock = Arc::new(MockProvider::new());
    mock.queue_json(success(json!({ "sum": 2 })));
    let engine = ExecutionContext::new(mock.clone())
        .with_cache(storage::CacheStore::in_memory().unwrap())
        .with_config(EngineConfig::parse("[cache]\nenabled = true\nttl_secs = 60").unwrap())
        .unwrap();
    let function = adder().with_cache(CachePolicy::default());

    for _ in 0..3 {
        engine.execute(&function, json!({ "num1": 1, "num2": 1 })).await.unwrap();
    }
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn events_trace_the_state_machine() {
    let mock = MockProvider::new();
    mock.queue_text("no json here");
    mock.queue_json(call_rng(1, 3));
    mock.queue_json(success(json!({ "number": 2 })));
    let sink = Arc::new(MemorySink::new());
    let engine = ExecutionContext::new(mock)
        .with_events(sink.clone())
        .with_tool(rng(Arc::new(AtomicU32::new(0))));

    engine.execute(&lucky_number(), json!({})).await.unwrap();
    assert_eq!(
        sink.kinds(),
        [
            EventKind::AiFunctionStart,
            EventKind::LlmStart,
            EventKind::LlmError,
            EventKind::RetryAttempt,
            EventKind::LlmStart,
            EventKind::LlmEnd,
            EventKind::ToolStart,
            EventKind::ToolEnd,
            EventKind::LlmStart,
            EventKind::LlmEnd,
            EventKind::AiFunctionEnd,
        ]
    );
    let events = sink.events();
    assert!(events.iter().all(|e| e.function_id.as_deref() == Some("lucky_number")));
    assert!(events.windows(2).all(|w| w[0].execution_id == w[1].execution_id));
}

#[tokio::test]
async fn events_persist_to_the_event_store() {
    let store = Arc::new(EventStore::in_memory().unwrap());
    let mock = MockProvider::new();
    mock.queue_json(success(json!({ "sum": 2 })));
    let engine = ExecutionContext::new(mock).with_events(store.clone());

    let execution = engine.run(&adder(), json!({ "num1": 1, "num2": 1 })).await.unwrap();
    let events = store.load_execution(execution.execution_id).unwrap();
    assert_eq!(events.first().map(|e| e.kind), Some(EventKind::AiFunctionStart));
    assert_eq!(events.last().map(|e| e.kind), Some(EventKind::AiFunctionEnd));

    let summaries = store.list_executions().unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].function_id.as_deref(), Some("adder"));
    assert!(summaries[0].ended_at.is_some());
}

struct DenyTools;

#[async_trait]
impl Middleware for DenyTools {
    async fn handle(&self, ctx: &mut StepContext, next: Next<'_>) -> runtime::Result<()> {
        if ctx.kind == StepKind::Tool {
            return Err(Error::ToolExecution {
                tool_name: ctx.tool_name.clone().unwrap_or_default(),
                input: ctx.input.clone(),
                source: ToolError::Execution("tools are disabled".into()),
            });
        }
        next.run(ctx).await
    }
}

#[tokio::test]
async fn middleware_can_veto_tool_steps() {
    let mock = Arc::new(MockProvider::new());
    mock.queue_json(call_rng(1, 3));
    mock.queue_json(success(json!({ "number": 1 })));
    let tool_calls = Arc::new(AtomicU32::new(0));
    let engine = ExecutionContext::new(mock.clone())
        .with_middleware(DenyTools)
        .with_tool(rng(tool_calls.clone()));

    let execution = engine.run(&lucky_number(), json!({})).await.unwrap();
    assert_eq!(execution.output, json!({ "number": 1 }));
    assert_eq!(tool_calls.load(Ordering::SeqCst), 0);
    assert!(mock.recorded_calls()[1].prompt.contains("tools are disabled"));
}

#[tokio::test]
async fn short_circuit_without_output_aborts_the_step() {
    let mock = Arc::new(MockProvider::new());
    let guard = Validation::new().with_guard(|_| Ok(()));
    struct Swallow;
    #[async_trait]
    impl Middleware for Swallow {
        async fn handle(&self, _: &mut StepContext, _: Next<'_>) -> runtime::Result<()> {
            Ok(())
        }
    }
    let engine = ExecutionContext::new(mock.clone())
        .with_middleware(guard)
        .with_middleware(Swallow);

    let err = engine.execute(&adder(), json!({ "num1": 1, "num2": 2 })).await.unwrap_err();
    assert!(matches!(err, Error::Aborted(StepKind::Llm)));
    assert_eq!(mock.call_count(), 0);
}

/// Replaces the first answer of the first LLM step after the model produced it.
struct RewriteFirstAnswer(Value);

#[async_trait]
impl Middleware for RewriteFirstAnswer {
    async fn handle(&self, ctx: &mut StepContext, next: Next<'_>) -> runtime::Result<()> {
        next.run(ctx).await?;
        if ctx.kind == StepKind::Llm && ctx.iteration == 1 && ctx.attempt == 1 {
            ctx.output = Some(self.0.clone());
        }
        Ok(())
    }
}

fn assistant_answers(history: &runtime::History) -> Vec<&Envelope> {
    history
        .messages()
        .iter()
        .filter_map(|message| match message {
            Message::Assistant { content } => Some(content),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn rewritten_answer_is_what_history_records() {
    let mock = MockProvider::new();
    mock.queue_json(success(json!({ "sum": 99 })));
    let engine = ExecutionContext::new(mock).with_middleware(RewriteFirstAnswer(success(json!({ "sum": 1 }))));

    let execution = engine.run(&adder(), json!({ "num1": 0, "num2": 1 })).await.unwrap();
    assert_eq!(execution.output, json!({ "sum": 1 }));
    assert_eq!(
        assistant_answers(&execution.history),
        [&Envelope::Success { data: json!({ "sum": 1 }) }]
    );
}

#[tokio::test]
async fn rewritten_tool_call_is_the_one_dispatched_and_recorded() {
    let mock = Arc::new(MockProvider::new());
    mock.queue_json(call_rng(1, 10));
    mock.queue_json(success(json!({ "number": 2 })));
    let engine = ExecutionContext::new(mock.clone())
        .with_middleware(RewriteFirstAnswer(call_rng(2, 2)))
        .with_tool(rng(Arc::new(AtomicU32::new(0))));

    let execution = engine.run(&lucky_number(), json!({})).await.unwrap();
    let answers = assistant_answers(&execution.history);
    assert_eq!(answers.len(), 2);
    match answers[0] {
        Envelope::CallTool { tool_name, input } => {
            assert_eq!(tool_name, "RNG");
            assert_eq!(Value::Object(input.clone()), json!({ "min": 2, "max": 2 }));
        }
        other => panic!("unexpected answer: {other:?}"),
    }
    assert!(mock.recorded_calls()[1].prompt.contains(r#""payload":2"#));
}

#[tokio::test]
async fn rejected_rewrite_leaves_no_answer_behind() {
    let mock = MockProvider::new();
    mock.queue_json(success(json!({ "sum": 3 })));
    mock.queue_json(success(json!({ "sum": 3 })));
    let engine = ExecutionContext::new(mock).with_middleware(RewriteFirstAnswer(json!({ "sum": 3 })));

    let execution = engine.run(&adder(), json!({ "num1": 1, "num2": 2 })).await.unwrap();
    assert_eq!(execution.output, json!({ "sum": 3 }));
    assert_eq!(assistant_answers(&execution.history).len(), 1);
}

#[tokio::test]
async fn invalid_tool_output_names_the_tool_when_aborting() {
    let mock = MockProvider::new();
    mock.queue_json(json!({ "_type": "call_tool", "_toolName": "Broken", "_input": {} }));
    let config = EngineConfig {
        tool_failure: ToolFailurePolicy::Abort,
        ..EngineConfig::default()
    };
    let broken = ToolDefinition::from_fn(
        "Broken",
        "Always returns text",
        Schema::any(),
        Schema::new(json!({ "type": "integer" })).unwrap(),
        |_| async { Ok(json!("seven")) },
    );
    let engine = ExecutionContext::new(mock).with_config(config).unwrap().with_tool(broken);

    let err = engine.execute(&lucky_number(), json!({})).await.unwrap_err();
    assert!(matches!(err, Error::ToolOutputValidation { ref tool_name, .. } if tool_name == "Broken"));
    assert_eq!(err.kind(), "output_validation");
}

#[test]
fn invalid_config_is_rejected_by_the_context() {
    let config = EngineConfig {
        history_limit: 0,
        ..EngineConfig::default()
    };
    let err = ExecutionContext::new(MockProvider::new()).with_config(config).unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::Invalid(_))));
}

#[tokio::test]
async fn functions_resolve_by_id() {
    let mock = MockProvider::new();
    mock.queue_json(success(json!({ "sum": 5 })));
    let engine = ExecutionContext::new(mock).with_function(adder());

    let output = engine.execute_by_id("adder", json!({ "num1": 2, "num2": 3 })).await.unwrap();
    assert_eq!(output, json!({ "sum": 5 }));

    let err = engine.execute_by_id("subtract", json!({})).await.unwrap_err();
    assert_eq!(err.to_string(), "function not found: subtract");
}

#[derive(Serialize)]
struct AddInput {
    num1: f64,
    num2: f64,
}

#[derive(Debug, Deserialize, PartialEq)]
struct AddOutput {
    sum: f64,
}

#[tokio::test]
async fn typed_functions_round_trip_rust_types() {
    let mock = MockProvider::new();
    mock.queue_json(success(json!({ "sum": 42.0 })));
    let engine = ExecutionContext::new(mock);
    let typed: TypedFunction<AddInput, AddOutput> = TypedFunction::new(adder());

    let output = engine
        .invoke(&typed, &AddInput { num1: 15.0, num2: 27.0 })
        .await
        .unwrap();
    assert_eq!(output, AddOutput { sum: 42.0 });
}

#[tokio::test]
async fn system_prompt_and_options_reach_the_provider() {
    let mock = Arc::new(MockProvider::new());
    mock.queue_json(success(json!({ "sum": 2 })));
    let mut options = serde_json::Map::new();
    options.insert("temperature".into(), json!(0));
    let function = adder()
        .with_system_prompt("You are a calculator.")
        .with_model_options(options);
    let engine = ExecutionContext::new(mock.clone());

    let execution = engine.run(&function, json!({ "num1": 1, "num2": 1 })).await.unwrap();
    let request = &mock.recorded_calls()[0];
    assert_eq!(request.system.as_deref(), Some("You are a calculator."));
    assert_eq!(request.options["temperature"], json!(0));
    assert!(execution.usage.output_tokens > 0);
}

#[tokio::test]
async fn concurrent_executions_share_one_context() {
    let mock = MockProvider::respond_with(|request| {
        let sum = if request.prompt.contains("Add 1 and 1.") { 2 } else { 4 };
        Ok(json!({ "_type": "success", "_data": { "sum": sum } }).to_string())
    });
    let engine = Arc::new(ExecutionContext::new(mock));

    let a = tokio::spawn({
        let engine = engine.clone();
        async move { engine.execute(&adder(), json!({ "num1": 1, "num2": 1 })).await }
    });
    let b = tokio::spawn({
        let engine = engine.clone();
        async move { engine.execute(&adder(), json!({ "num1": 2, "num2": 2 })).await }
    });
    assert_eq!(a.await.unwrap().unwrap(), json!({ "sum": 2 }));
    assert_eq!(b.await.unwrap().unwrap(), json!({ "sum": 4 }));
}
