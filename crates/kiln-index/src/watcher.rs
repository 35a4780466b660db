use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{DebounceEventResult, DebouncedEventKind, new_debouncer};
use tokio::sync::{Mutex, mpsc};

use crate::error::Result;
use crate::indexer::{IndexPipeline, WatchFilter};

/// Re-runs the pipeline after debounced filesystem changes under a root.
///
/// Events arriving while a run is in progress collapse into a single follow-up run.
pub struct IndexWatcher {
    _handle: tokio::task::JoinHandle<()>,
}

impl IndexWatcher {
    /// # Errors
    ///
    /// Returns an error if the root does not exist or the filesystem watcher
    /// cannot be initialized.
    pub fn start(
        root: &Path,
        pipeline: Arc<Mutex<IndexPipeline>>,
        filter: WatchFilter,
        debounce: Duration,
    ) -> Result<Self> {
        let root = root.canonicalize()?;
        let filter = filter.rooted_at(&root);
        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(1);

        let mut debouncer = new_debouncer(debounce, move |events: DebounceEventResult| {
            let events = match events {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!("index watcher error: {e}");
                    return;
                }
            };

            let relevant = events
                .iter()
                .filter(|e| e.kind == DebouncedEventKind::Any && filter.accepts(&e.path))
                .count();
            if relevant > 0 {
                tracing::debug!(paths = relevant, "source change detected");
                // A full channel already holds a pending run.
                let _ = notify_tx.try_send(());
            }
        })?;

        debouncer
            .watcher()
            .watch(&root, notify::RecursiveMode::Recursive)?;

        let handle = tokio::spawn(async move {
            let _debouncer = debouncer;
            while notify_rx.recv().await.is_some() {
                let mut pipeline = pipeline.lock().await;
                match pipeline.run().await {
                    Ok(stats) => tracing::info!(
                        processed = stats.files_processed,
                        failed = stats.files_failed,
                        removed = stats.files_removed,
                        "reindex after change finished"
                    ),
                    Err(e) => tracing::warn!("reindex after change failed: {e}"),
                }
            }
        });

        Ok(Self { _handle: handle })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use kiln_llm::mock::MockProvider;
    use kiln_quota::{EMBEDDING, QuotaConfig, QuotaRateLimiter, SUMMARIZATION};

    use super::*;
    use crate::chunker::LineChunker;
    use crate::collaborators::LlmEmbedder;
    use crate::discovery::WalkDiscoverer;
    use crate::fingerprint::ContentFingerprintStore;
    use crate::indexer::{Collaborators, PipelineConfig};
    use crate::memory_store::InMemoryVectorStore;
    use crate::priority::PriorityScheduler;
    use crate::retry::RetryPolicy;
    use crate::sink::RetryingUpsertSink;

    fn pipeline(root: PathBuf) -> IndexPipeline {
        let limiter = QuotaRateLimiter::new([
            (SUMMARIZATION, QuotaConfig::default()),
            (EMBEDDING, QuotaConfig::default()),
        ]);
        limiter.start();
        let sink = Arc::new(RetryingUpsertSink::new(
            Arc::new(InMemoryVectorStore::new()),
            "code",
            RetryPolicy::immediate(1),
            None,
        ));
        IndexPipeline::new(
            ContentFingerprintStore::load(root.join(".kiln/manifest.json"), &root),
            PriorityScheduler::default(),
            limiter,
            sink,
            Collaborators {
                discoverer: Box::new(WalkDiscoverer),
                parser: Box::new(LineChunker::default()),
                summarizer: None,
                embedder: Arc::new(LlmEmbedder::new(Arc::new(MockProvider::default()))),
            },
            PipelineConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn start_with_valid_directory() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path().to_path_buf());
        let filter = p.watch_filter();
        let watcher = IndexWatcher::start(
            dir.path(),
            Arc::new(Mutex::new(p)),
            filter,
            Duration::from_millis(50),
        );
        assert!(watcher.is_ok());
    }

    #[tokio::test]
    async fn start_with_nonexistent_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path().to_path_buf());
        let filter = p.watch_filter();
        let result = IndexWatcher::start(
            Path::new("/nonexistent/path/xyz"),
            Arc::new(Mutex::new(p)),
            filter,
            Duration::from_millis(50),
        );
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn change_triggers_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let p = Arc::new(Mutex::new(pipeline(dir.path().to_path_buf())));
        let filter = p.lock().await.watch_filter();
        let _watcher =
            IndexWatcher::start(dir.path(), Arc::clone(&p), filter, Duration::from_millis(50))
                .unwrap();

        std::fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();

        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if p.lock().await.fingerprints().file("main.rs").is_some() {
                return;
            }
        }
        panic!("watcher never indexed main.rs");
    }
}
