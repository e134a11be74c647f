//! Pipeline trace: the record of every step an execution took.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Llm,
    Tool,
}

/// One executed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub timestamp: DateTime<Utc>,
    pub target: Target,
    pub input: Value,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

/// Append-only list of executed steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Trace {
    records: Vec<TraceRecord>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, target: Target, input: Value, output: Value, tool_name: Option<String>) {
        self.records.push(TraceRecord {
            timestamp: Utc::now(),
            target,
            input,
            output,
            tool_name,
        });
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn targets(&self) -> Vec<Target> {
        self.records.iter().map(|r| r.target).collect()
    }

    pub fn count(&self, target: Target) -> usize {
        self.records.iter().filter(|r| r.target == target).count()
    }

    pub fn last(&self) -> Option<&TraceRecord> {
        self.records.last()
    }

    /// The tool call requested by the latest LLM step, if that is where the
    /// execution stands.
    pub fn pending_tool_call(&self) -> Option<(&str, &Map<String, Value>)> {
        let last = self.last().filter(|r| r.target == Target::Llm)?;
        if last.output.get("_type")?.as_str()? != "call_tool" {
            return None;
        }
        let name = last.output.get("_toolName")?.as_str()?;
        let input = last.output.get("_input")?.as_object()?;
        Some((name, input))
    }
}
