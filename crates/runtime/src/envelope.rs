//! The response envelope every model turn must produce.
//!
//! ```json
//! {"_type": "success",   "_data": <output>}
//! {"_type": "error",     "_message": "..."}
//! {"_type": "call_tool", "_toolName": "...", "_input": {...}}
//! ```

use crate::{Error, Result};
use schema::{FieldError, Schema, ValidationErrors};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

const TYPE: &str = "_type";
const DATA: &str = "_data";
const MESSAGE: &str = "_message";
const TOOL_NAME: &str = "_toolName";
const INPUT: &str = "_input";

const TAGS: [&str; 3] = ["success", "error", "call_tool"];

/// One decoded model turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Envelope {
    Success {
        #[serde(rename = "_data")]
        data: Value,
    },
    Error {
        #[serde(rename = "_message")]
        message: String,
    },
    CallTool {
        #[serde(rename = "_toolName")]
        tool_name: String,
        #[serde(rename = "_input")]
        input: Map<String, Value>,
    },
}

impl Envelope {
    /// Wire tag of this variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Success { .. } => TAGS[0],
            Self::Error { .. } => TAGS[1],
            Self::CallTool { .. } => TAGS[2],
        }
    }

    pub fn is_call_tool(&self) -> bool {
        matches!(self, Self::CallTool { .. })
    }

    /// Wire form of the envelope.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Decode an envelope from parsed model output.
    ///
    /// A missing or unknown `_type` is a parsing failure. A known tag with
    /// the wrong fields is a validation failure.
    pub fn decode(parsed: Value) -> Result<Self> {
        let tag = match &parsed {
            Value::Object(fields) => fields.get(TYPE).and_then(Value::as_str),
            _ => {
                return Err(Error::unparseable(
                    "envelope must be a JSON object",
                    parsed.to_string(),
                ));
            }
        };
        match tag {
            Some(tag) if TAGS.contains(&tag) => {}
            Some(other) => {
                let message = format!("unknown envelope type `{other}`");
                return Err(Error::unparseable(message, parsed.to_string()));
            }
            None => {
                return Err(Error::unparseable(
                    "envelope has no string `_type`",
                    parsed.to_string(),
                ));
            }
        }

        let envelope = Self::deserialize(&parsed).map_err(|e| Error::OutputValidation {
            output: parsed.clone(),
            errors: ValidationErrors::single(FieldError::root(e.to_string())),
        })?;
        match envelope {
            Self::CallTool { ref tool_name, .. } if tool_name.is_empty() => Err(Error::OutputValidation {
                output: parsed,
                errors: ValidationErrors::single(FieldError::new(
                    "/_toolName",
                    "must be a non-empty string",
                )),
            }),
            envelope => Ok(envelope),
        }
    }

    /// JSON Schema of the union, with `output` in the success arm.
    pub fn schema(output: &Schema) -> Value {
        json!({
            "oneOf": [
                {
                    "type": "object",
                    "properties": {
                        TYPE: { "const": "success" },
                        DATA: output.describe(),
                    },
                    "required": [TYPE, DATA],
                    "additionalProperties": false,
                },
                {
                    "type": "object",
                    "properties": {
                        TYPE: { "const": "error" },
                        MESSAGE: { "type": "string" },
                    },
                    "required": [TYPE, MESSAGE],
                    "additionalProperties": false,
                },
                {
                    "type": "object",
                    "properties": {
                        TYPE: { "const": "call_tool" },
                        TOOL_NAME: { "type": "string" },
                        INPUT: { "type": "object" },
                    },
                    "required": [TYPE, TOOL_NAME, INPUT],
                    "additionalProperties": false,
                },
            ]
        })
    }
}

/// Decode `parsed` and check a success payload against `output`.
///
/// `error` and `call_tool` envelopes are only checked for their own shape.
pub fn validate(parsed: Value, output: &Schema) -> Result<Envelope> {
    let envelope = Envelope::decode(parsed)?;
    if let Envelope::Success { data } = &envelope {
        output
            .validate(data)
            .map_err(|errors| Error::OutputValidation {
                output: data.clone(),
                errors,
            })?;
    }
    Ok(envelope)
}
