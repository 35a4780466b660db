use std::path::PathBuf;

use super::{Config, VectorBackend};

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("KILN_INDEX_ROOT") {
            self.index.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KILN_MANIFEST_PATH") {
            self.index.manifest_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KILN_FILE_BUDGET") {
            if let Ok(budget) = v.parse::<usize>() {
                self.index.file_budget = Some(budget);
            } else {
                tracing::warn!("ignoring invalid KILN_FILE_BUDGET value: {v}");
            }
        }
        if let Ok(v) = std::env::var("KILN_SUMMARIZE") {
            if let Ok(enabled) = v.parse::<bool>() {
                self.index.summarize = enabled;
            } else {
                tracing::warn!("ignoring invalid KILN_SUMMARIZE value: {v}");
            }
        }
        if let Ok(v) = std::env::var("KILN_QDRANT_URL") {
            self.vector_store.url = v;
        }
        if let Ok(v) = std::env::var("KILN_VECTOR_BACKEND") {
            match v.parse::<VectorBackend>() {
                Ok(backend) => self.vector_store.backend = backend,
                Err(e) => tracing::warn!("ignoring invalid KILN_VECTOR_BACKEND value: {e}"),
            }
        }
        if let Ok(v) = std::env::var("KILN_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("KILN_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("KILN_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Ok(v) = std::env::var("KILN_EMBED_CONCURRENCY") {
            if let Ok(n) = v.parse::<usize>() {
                self.quota.embedding.concurrency = n;
            } else {
                tracing::warn!("ignoring invalid KILN_EMBED_CONCURRENCY value: {v}");
            }
        }
        if let Ok(v) = std::env::var("KILN_SUMMARY_CONCURRENCY") {
            if let Ok(n) = v.parse::<usize>() {
                self.quota.summarization.concurrency = n;
            } else {
                tracing::warn!("ignoring invalid KILN_SUMMARY_CONCURRENCY value: {v}");
            }
        }
        if let Ok(v) = std::env::var("KILN_SINK_BATCH_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                self.sink.batch_size = n;
            } else {
                tracing::warn!("ignoring invalid KILN_SINK_BATCH_SIZE value: {v}");
            }
        }
    }
}
