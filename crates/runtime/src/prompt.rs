//! Prompt compilation.
//!
//! Compilation is a pure function of the definition, the input and the
//! context, so identical calls yield identical prompts and cache keys.

use crate::config::{EngineConfig, PlaceholderMode};
use crate::definition::FunctionDefinition;
use crate::envelope::Envelope;
use crate::history::History;
use crate::tools::ToolRegistry;
use crate::{Error, Result};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write as _;

const PREAMBLE: &str = "You are a function executed by a program. Read the task, then answer \
with exactly one JSON object and nothing else.";

/// Derived context folded into the prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub tools: &'a ToolRegistry,
    pub history: &'a History,
    /// Why the previous attempt was rejected, when feedback is enabled.
    pub feedback: Option<&'a Error>,
}

#[derive(Debug, Clone, Copy)]
pub struct PromptCompiler {
    mode: PlaceholderMode,
    history_limit: usize,
}

impl PromptCompiler {
    pub fn new(mode: PlaceholderMode, history_limit: usize) -> Self {
        Self { mode, history_limit }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.placeholders, config.history_limit)
    }

    /// Substitute `{{name}}` placeholders in the function's template.
    ///
    /// Object inputs expose each top-level key; any other input is exposed
    /// as `{{input}}`. Strings are inserted raw, other values as JSON.
    pub fn render(&self, function: &FunctionDefinition, input: &Value) -> Result<String> {
        let vars = variables(input);
        let template = function.template();
        let mut out = String::with_capacity(template.len());
        let mut missing = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find("{{") {
            let Some(len) = rest[open + 2..].find("}}") else {
                break;
            };
            out.push_str(&rest[..open]);
            let whole = &rest[open..open + 2 + len + 2];
            let name = rest[open + 2..open + 2 + len].trim();
            match vars.get(name) {
                Some(value) => out.push_str(value),
                None => {
                    missing.push(name.to_string());
                    out.push_str(whole);
                }
            }
            rest = &rest[open + 2 + len + 2..];
        }
        out.push_str(rest);

        if self.mode == PlaceholderMode::Strict && !missing.is_empty() {
            return Err(Error::PromptCompilation(format!(
                "template for {} has unresolved placeholders: {}",
                function.id(),
                missing.join(", ")
            )));
        }
        Ok(out)
    }

    /// Build the full prompt for one model turn.
    pub fn compile(&self, function: &FunctionDefinition, input: &Value, context: PromptContext<'_>) -> Result<String> {
        let task = self.render(function, input)?;
        let mut prompt = String::from(PREAMBLE);

        if !context.tools.is_empty() {
            prompt.push_str(
                "\n\n## Tools\nTo use a tool, answer with a `call_tool` envelope naming it. \
                 Available tools:\n",
            );
            for entry in context.tools.catalog() {
                let _ = writeln!(prompt, "{entry}");
            }
        }

        let window = context.history.window(self.history_limit);
        if !window.is_empty() {
            prompt.push_str("\n\n## Conversation\n");
            for message in window {
                let line = serde_json::to_string(message)
                    .map_err(|e| Error::PromptCompilation(e.to_string()))?;
                prompt.push_str(&line);
                prompt.push('\n');
            }
        }

        let schema = serde_json::to_string_pretty(&Envelope::schema(function.output_schema()))
            .map_err(|e| Error::PromptCompilation(e.to_string()))?;
        let _ = write!(
            prompt,
            "\n\n## Response format\nAnswer with one JSON object matching this schema:\n{schema}"
        );

        if let Some(error) = context.feedback {
            let _ = write!(
                prompt,
                "\n\n## Previous attempt\nYour previous answer was rejected: {error}\nCorrect it."
            );
        }

        let _ = write!(prompt, "\n\n## Task\n{task}");
        Ok(prompt)
    }
}

impl Default for PromptCompiler {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

fn variables(input: &Value) -> BTreeMap<&str, Cow<'_, str>> {
    fn text(value: &Value) -> Cow<'_, str> {
        match value {
            Value::String(s) => Cow::Borrowed(s),
            other => Cow::Owned(other.to_string()),
        }
    }

    match input {
        Value::Object(fields) => fields.iter().map(|(k, v)| (k.as_str(), text(v))).collect(),
        other => BTreeMap::from([("input", text(other))]),
    }
}
