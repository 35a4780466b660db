use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::{LlmError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

pub trait LlmProvider: Send + Sync {
    /// Send messages to the LLM and return the assistant response.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider fails to communicate or the response is invalid.
    fn chat(&self, messages: &[Message]) -> impl Future<Output = Result<String>> + Send;

    /// Embed every text in one provider call, preserving input order.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the provider returns a
    /// different number of vectors than inputs.
    fn embed_batch(&self, texts: &[String]) -> impl Future<Output = Result<Vec<Vec<f32>>>> + Send;

    /// # Errors
    ///
    /// Same as [`LlmProvider::embed_batch`].
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>>> + Send {
        let texts = vec![text.to_owned()];
        async move {
            self.embed_batch(&texts)
                .await?
                .into_iter()
                .next()
                .ok_or(LlmError::EmptyResponse {
                    provider: "embed",
                })
        }
    }

    fn name(&self) -> &str;
}
