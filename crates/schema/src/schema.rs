//! Compiled JSON Schema documents.

use crate::{Error, FieldError, Result, ValidationErrors};
use jsonschema::Validator;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A JSON Schema, compiled once and cheap to clone.
///
/// The original document is kept so it can be shown to a model verbatim
/// (tool catalogs, response formats).
#[derive(Clone)]
pub struct Schema {
    document: Arc<Value>,
    validator: Option<Arc<Validator>>,
}

impl Schema {
    /// Compile a schema document.
    pub fn new(document: Value) -> Result<Self> {
        let validator =
            jsonschema::validator_for(&document).map_err(|e| Error::Invalid(e.to_string()))?;
        Ok(Self {
            document: Arc::new(document),
            validator: Some(Arc::new(validator)),
        })
    }

    /// Parse and compile a schema from JSON text.
    pub fn parse(json: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(json)?;
        Self::new(document)
    }

    /// A schema every value conforms to.
    pub fn any() -> Self {
        Self {
            document: Arc::new(Value::Object(Default::default())),
            validator: None,
        }
    }

    /// The schema document, for describing the expected shape to a model.
    pub fn describe(&self) -> &Value {
        &self.document
    }

    /// Whether `value` conforms.
    pub fn is_valid(&self, value: &Value) -> bool {
        self.validator.as_ref().is_none_or(|v| v.is_valid(value))
    }

    /// Check `value`, collecting every field-level failure.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), ValidationErrors> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };

        let errors: Vec<FieldError> = validator
            .iter_errors(value)
            .map(|e| FieldError::new(e.instance_path.to_string(), e.to_string()))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Schema").field(&self.document).finish()
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.document == other.document
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::any()
    }
}

impl Serialize for Schema {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.document.serialize(serializer)
    }
}

impl TryFrom<Value> for Schema {
    type Error = Error;

    fn try_from(document: Value) -> Result<Self> {
        Self::new(document)
    }
}
