//! Tool definitions and dispatch.

pub mod errors;
mod registry;
mod tool;

pub use errors::ToolError;
pub use registry::{ToolDefinition, ToolRegistry};
pub use tool::{FnTool, Tool};
