//! Conversation transcript for one execution.

use crate::envelope::Envelope;
use serde::Serialize;
use serde_json::Value;

/// What a tool step produced.
///
/// Failures are shown to the model as `{"error": message}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolPayload {
    Output(Value),
    Error { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub tool_name: String,
    pub payload: ToolPayload,
}

/// One entry of the transcript.
///
/// Tool responses travel under the `user` role.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: String,
    },
    Assistant {
        content: Envelope,
    },
    #[serde(rename = "user")]
    ToolResponse {
        #[serde(rename = "toolResponse")]
        response: ToolResponse,
    },
}

impl Message {
    pub fn role(&self) -> &'static str {
        match self {
            Self::Assistant { .. } => "assistant",
            Self::User { .. } | Self::ToolResponse { .. } => "user",
        }
    }
}

/// Append-only, ordered list of messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct History {
    messages: Vec<Message>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Message::User {
            content: content.into(),
        });
    }

    pub fn push_assistant(&mut self, content: Envelope) {
        self.push(Message::Assistant { content });
    }

    pub fn push_tool_output(&mut self, tool_name: impl Into<String>, output: Value) {
        self.push(Message::ToolResponse {
            response: ToolResponse {
                tool_name: tool_name.into(),
                payload: ToolPayload::Output(output),
            },
        });
    }

    pub fn push_tool_error(&mut self, tool_name: impl Into<String>, error: impl Into<String>) {
        self.push(Message::ToolResponse {
            response: ToolResponse {
                tool_name: tool_name.into(),
                payload: ToolPayload::Error { error: error.into() },
            },
        });
    }

    /// Drop assistant messages recorded at or after position `since`.
    ///
    /// Used when a step's recorded answer was replaced or rejected after
    /// it was appended.
    pub(crate) fn retract_assistant(&mut self, since: usize) {
        let since = since.min(self.messages.len());
        let tail = self.messages.split_off(since);
        self.messages.extend(
            tail.into_iter()
                .filter(|message| !matches!(message, Message::Assistant { .. })),
        );
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The bounded view shown to the model.
    ///
    /// Returns everything when it fits, otherwise the first message plus the
    /// most recent `limit - 1`. The first message usually carries the task
    /// and is never dropped while `limit >= 1`.
    pub fn window(&self, limit: usize) -> Vec<&Message> {
        if self.messages.len() <= limit {
            return self.messages.iter().collect();
        }
        let Some((first, rest)) = self.messages.split_first() else {
            return Vec::new();
        };
        if limit == 0 {
            return Vec::new();
        }
        let tail = &rest[rest.len() - (limit - 1)..];
        std::iter::once(first).chain(tail).collect()
    }
}
