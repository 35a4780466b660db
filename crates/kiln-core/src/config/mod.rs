mod env;
mod types;


pub use types::*;

use std::path::Path;

use anyhow::{Context, bail};
use kiln_quota::QuotaConfig;

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject settings the limiter or sink cannot operate with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first inconsistent value.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_quota("summarization", &self.quota.summarization)?;
        validate_quota("embedding", &self.quota.embedding)?;

        if self.sink.batch_size == 0 {
            bail!("sink.batch_size must be at least 1");
        }
        if self.sink.max_retries == 0 {
            bail!("sink.max_retries must be at least 1");
        }
        if self.chunker.target_lines == 0 || self.chunker.max_lines < self.chunker.target_lines {
            bail!(
                "chunker.target_lines ({}) must be non-zero and not exceed max_lines ({})",
                self.chunker.target_lines,
                self.chunker.max_lines
            );
        }
        for pattern in &self.index.exclude_patterns {
            glob::Pattern::new(pattern)
                .with_context(|| format!("invalid index.exclude_patterns entry: {pattern}"))?;
        }
        Ok(())
    }
}

fn validate_quota(name: &str, quota: &QuotaConfig) -> anyhow::Result<()> {
    if quota.concurrency == 0 {
        bail!("quota.{name}.concurrency must be at least 1");
    }
    if quota.min_batch_size == 0 {
        bail!("quota.{name}.min_batch_size must be at least 1");
    }
    if quota.min_batch_size > quota.default_batch_size
        || quota.default_batch_size > quota.max_batch_size
    {
        bail!(
            "quota.{name}: expected min_batch_size <= default_batch_size <= max_batch_size, got {} / {} / {}",
            quota.min_batch_size,
            quota.default_batch_size,
            quota.max_batch_size
        );
    }
    Ok(())
}
