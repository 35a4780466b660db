use std::path::PathBuf;

use kiln_index::RetryPolicy;
use kiln_index::chunker::ChunkerConfig;
use kiln_quota::QuotaConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub quota: QuotasConfig,
    /// Caller-side retries around summarization and embedding.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Relative paths resolve against `root`.
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,
    /// Maximum files processed per run; absent means unbounded.
    #[serde(default)]
    pub file_budget: Option<usize>,
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// File stems treated as entry points by the scheduler.
    #[serde(default = "default_entry_point_names")]
    pub entry_point_names: Vec<String>,
    #[serde(default = "default_true")]
    pub summarize: bool,
    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from(".kiln/manifest.json")
}

fn default_exclude_dirs() -> Vec<String> {
    kiln_index::indexer::DEFAULT_EXCLUDE_DIRS
        .iter()
        .map(|d| (*d).to_owned())
        .collect()
}

fn default_entry_point_names() -> Vec<String> {
    kiln_index::priority::DEFAULT_ENTRY_POINT_STEMS
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_collection() -> String {
    "kiln_code_chunks".into()
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            manifest_path: default_manifest_path(),
            file_budget: None,
            exclude_dirs: default_exclude_dirs(),
            exclude_patterns: Vec::new(),
            entry_point_names: default_entry_point_names(),
            summarize: default_true(),
            collection: default_collection(),
        }
    }
}

impl IndexConfig {
    /// Manifest location, resolved against the index root when relative.
    #[must_use]
    pub fn resolved_manifest_path(&self) -> PathBuf {
        if self.manifest_path.is_absolute() {
            self.manifest_path.clone()
        } else {
            self.root.join(&self.manifest_path)
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotasConfig {
    #[serde(default = "default_summarization_quota")]
    pub summarization: QuotaConfig,
    #[serde(default)]
    pub embedding: QuotaConfig,
}

fn default_summarization_quota() -> QuotaConfig {
    QuotaConfig::default().with_concurrency(2)
}

impl Default for QuotasConfig {
    fn default() -> Self {
        Self {
            summarization: default_summarization_quota(),
            embedding: QuotaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_batch_size")]
    pub batch_size: usize,
    /// Total attempts per batch.
    #[serde(default = "default_sink_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_sink_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_sink_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_sink_batch_size() -> usize {
    64
}

fn default_sink_max_retries() -> u32 {
    3
}

fn default_sink_base_delay_ms() -> u64 {
    250
}

fn default_sink_max_delay_ms() -> u64 {
    5_000
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: default_sink_batch_size(),
            max_retries: default_sink_max_retries(),
            base_delay_ms: default_sink_base_delay_ms(),
            max_delay_ms: default_sink_max_delay_ms(),
        }
    }
}

impl SinkConfig {
    #[must_use]
    pub fn backoff(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.base_delay_ms, self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Qdrant,
    Memory,
}

impl std::str::FromStr for VectorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "qdrant" => Ok(Self::Qdrant),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown vector backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorStoreConfig {
    #[serde(default)]
    pub backend: VectorBackend,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    /// Expected embedding dimensionality; checked against every produced vector.
    #[serde(default)]
    pub dimension: Option<u64>,
}

fn default_qdrant_url() -> String {
    "http://localhost:6334".into()
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::default(),
            url: default_qdrant_url(),
            dimension: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

fn default_llm_base_url() -> String {
    "http://localhost:11434".into()
}

fn default_llm_model() -> String {
    "mistral:7b".into()
}

fn default_embedding_model() -> String {
    "qwen3-embedding".into()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            embedding_model: default_embedding_model(),
        }
    }
}
