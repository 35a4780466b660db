use ollama_rs::Ollama;
use ollama_rs::generation::chat::ChatMessage;
use ollama_rs::generation::chat::request::ChatMessageRequest;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};

use crate::error::{LlmError, Result};
use crate::provider::{LlmProvider, Message, Role};

const PROVIDER: &str = "ollama";
const DEFAULT_PORT: u16 = 11434;

#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Ollama,
    model: String,
    embedding_model: String,
}

impl OllamaProvider {
    #[must_use]
    pub fn new(base_url: &str, model: String, embedding_model: String) -> Self {
        let (host, port) = split_base_url(base_url);
        Self {
            client: Ollama::new(host, port),
            model,
            embedding_model,
        }
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }
}

impl LlmProvider for OllamaProvider {
    async fn chat(&self, messages: &[Message]) -> Result<String> {
        let ollama_messages: Vec<ChatMessage> = messages.iter().map(convert_message).collect();
        let request = ChatMessageRequest::new(self.model.clone(), ollama_messages);

        let response = self
            .client
            .send_chat_messages(request)
            .await
            .map_err(|e| classify("chat", &e.to_string()))?;

        if response.message.content.is_empty() {
            return Err(LlmError::EmptyResponse { provider: PROVIDER });
        }
        Ok(response.message.content)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = GenerateEmbeddingsRequest::new(
            self.embedding_model.clone(),
            EmbeddingsInput::Multiple(texts.to_vec()),
        );

        let response = self
            .client
            .generate_embeddings(request)
            .await
            .map_err(|e| classify("embedding", &e.to_string()))?;

        if response.embeddings.len() != texts.len() {
            return Err(LlmError::EmbeddingCount {
                provider: PROVIDER,
                expected: texts.len(),
                actual: response.embeddings.len(),
            });
        }
        Ok(response.embeddings)
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        PROVIDER
    }
}

fn convert_message(msg: &Message) -> ChatMessage {
    match msg.role {
        Role::System => ChatMessage::system(msg.content.clone()),
        Role::User => ChatMessage::user(msg.content.clone()),
        Role::Assistant => ChatMessage::assistant(msg.content.clone()),
    }
}

/// Map an Ollama client failure onto the error taxonomy the limiter understands.
fn classify(op: &str, message: &str) -> LlmError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit")
    {
        tracing::debug!(op, "ollama rate limited: {message}");
        return LlmError::RateLimited { provider: PROVIDER };
    }
    if lower.contains("connect") || lower.contains("error sending request") {
        return LlmError::Unavailable {
            provider: PROVIDER,
            message: message.to_owned(),
        };
    }
    LlmError::Other(format!("Ollama {op} request failed: {message}"))
}

/// Split `http://host:port` into the pieces `Ollama::new` takes.
fn split_base_url(base_url: &str) -> (String, u16) {
    let trimmed = base_url.trim_end_matches('/');
    trimmed
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host.to_owned(), port.parse().ok()?)))
        .unwrap_or_else(|| (trimmed.to_owned(), DEFAULT_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_split_into_host_and_port() {
        assert_eq!(
            split_base_url("http://10.0.0.5:8080/"),
            ("http://10.0.0.5".to_owned(), 8080)
        );
        assert_eq!(
            split_base_url("http://ollama.internal"),
            ("http://ollama.internal".to_owned(), DEFAULT_PORT)
        );
    }

    #[test]
    fn classify_rate_limit() {
        assert!(classify("embedding", "HTTP 429 Too Many Requests").is_rate_limited());
        assert!(matches!(
            classify("chat", "error sending request for url"),
            LlmError::Unavailable { .. }
        ));
        assert!(matches!(
            classify("chat", "model not found"),
            LlmError::Other(_)
        ));
    }

    #[tokio::test]
    async fn empty_batch_skips_the_request() {
        let provider = OllamaProvider::new("http://127.0.0.1:1", "m".into(), "e".into());
        assert!(provider.embed_batch(&[]).await.unwrap().is_empty());
    }

    #[test]
    fn stores_models() {
        let provider =
            OllamaProvider::new("http://localhost:11434", "qwen3:8b".into(), "nomic".into());
        assert_eq!(provider.model(), "qwen3:8b");
        assert_eq!(provider.embedding_model(), "nomic");
        assert_eq!(provider.name(), "ollama");
    }
}
