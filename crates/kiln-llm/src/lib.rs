//! LLM provider abstraction used for chunk summarization and embedding.

pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod ollama;
pub mod provider;

pub use error::{LlmError, Result};
pub use provider::{LlmProvider, Message, Role};
