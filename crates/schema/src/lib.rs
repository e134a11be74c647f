//! Structural schemas for typed AI functions.
//!
//! Core principle: **a value is either conforming or it carries its reasons.**
//!
//! A [`Schema`] wraps a JSON Schema document compiled once at definition time.
//! Checking a value yields `Ok(())` or a [`ValidationErrors`] list with one
//! [`FieldError`] per failing location, addressed by JSON pointer.
//!
//! ```
//! use schema::Schema;
//! use serde_json::json;
//!
//! let schema = Schema::new(json!({
//!     "type": "object",
//!     "properties": { "sum": { "type": "number" } },
//!     "required": ["sum"]
//! }))?;
//!
//! assert!(schema.validate(&json!({"sum": 42})).is_ok());
//! let errors = schema.validate(&json!({"sum": "42"})).unwrap_err();
//! assert_eq!(errors.paths(), vec!["/sum"]);
//! # Ok::<(), schema::Error>(())
//! ```

mod error;
mod field;
mod schema;

pub use error::{Error, Result};
pub use field::{FieldError, ValidationErrors};
pub use schema::Schema;
