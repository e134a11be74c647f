//! Model provider boundary.

pub mod errors;
pub mod types;

pub use errors::ProviderError;
pub use types::{GenerateRequest, Generation, ModelInfo, ModelProvider, Usage};
