use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kiln_core::{Config, Indexer, build_indexer};
use kiln_index::SearchFilters;

#[derive(Parser, Debug)]
#[command(
    name = "kiln",
    version,
    about = "Incremental repository indexer for semantic code search"
)]
struct Cli {
    /// TOML configuration file; defaults apply when it does not exist
    #[arg(
        long,
        global = true,
        env = "KILN_CONFIG",
        default_value = "config/default.toml"
    )]
    config: PathBuf,

    /// Repository root to index, overriding `index.root`
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one incremental indexing pass and print its statistics
    Index {
        /// Maximum number of files processed this run
        #[arg(long)]
        budget: Option<usize>,
        /// Skip chunk summarization
        #[arg(long, default_value_t = false)]
        no_summary: bool,
    },
    /// Index once, then re-index whenever source files change
    Watch {
        /// Quiet period after the last change before re-indexing
        #[arg(long, default_value_t = 500)]
        debounce_ms: u64,
    },
    /// Search the indexed chunks
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Glob over the chunk's file path, e.g. `src/**/*.rs`
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        chunk_type: Option<String>,
        /// Print hits as JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Report manifest totals without contacting any backend
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_subscriber();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if let Some(root) = cli.root {
        config.index.root = root;
    }
    if let Command::Index { budget, no_summary } = &cli.command {
        if budget.is_some() {
            config.index.file_budget = *budget;
        }
        if *no_summary {
            config.index.summarize = false;
        }
    }
    config.validate()?;

    match cli.command {
        Command::Status => {
            let report = kiln_core::status(&config);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Index { .. } => {
            let indexer = build_indexer(&config)?;
            let result = index_once(&indexer).await;
            indexer.shutdown().await;
            result
        }
        Command::Watch { debounce_ms } => {
            let indexer = build_indexer(&config)?;
            let result = watch(&indexer, Duration::from_millis(debounce_ms)).await;
            indexer.shutdown().await;
            result
        }
        Command::Search {
            query,
            limit,
            path,
            language,
            chunk_type,
            json,
        } => {
            let mut filters = SearchFilters::default();
            if let Some(pattern) = path {
                filters.path_glob = Some(
                    glob::Pattern::new(&pattern)
                        .with_context(|| format!("invalid path glob: {pattern}"))?,
                );
            }
            if let Some(language) = language {
                filters.equals.insert("language".into(), language);
            }
            if let Some(chunk_type) = chunk_type {
                filters.equals.insert("chunk_type".into(), chunk_type);
            }

            let indexer = build_indexer(&config)?;
            let result = indexer.search(&query, limit, &filters).await;
            indexer.shutdown().await;
            let hits = result?;

            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("no matches");
            } else {
                for hit in &hits {
                    println!("{:.3}  {}", hit.score, hit.header());
                    if let Some(summary) = &hit.summary {
                        println!("       {summary}");
                    }
                }
            }
            Ok(())
        }
    }
}

async fn index_once(indexer: &Indexer) -> anyhow::Result<()> {
    let stats = indexer.run().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn watch(indexer: &Indexer, debounce: Duration) -> anyhow::Result<()> {
    index_once(indexer).await?;
    let _watcher = indexer.watch(debounce).await?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    Ok(())
}

fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // Logs go to stderr so stdout stays machine-readable.
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_index_flags() {
        let cli = Cli::try_parse_from([
            "kiln",
            "--config",
            "kiln.toml",
            "index",
            "--budget",
            "5",
            "--no-summary",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("kiln.toml"));
        match cli.command {
            Command::Index { budget, no_summary } => {
                assert_eq!(budget, Some(5));
                assert!(no_summary);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_search_with_filters() {
        let cli = Cli::try_parse_from([
            "kiln",
            "search",
            "retry backoff",
            "--limit",
            "3",
            "--path",
            "src/**/*.rs",
            "--language",
            "rust",
            "--root",
            "/tmp/repo",
        ])
        .unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/repo")));
        match cli.command {
            Command::Search {
                query,
                limit,
                path,
                language,
                chunk_type,
                json,
            } => {
                assert_eq!(query, "retry backoff");
                assert_eq!(limit, 3);
                assert_eq!(path.as_deref(), Some("src/**/*.rs"));
                assert_eq!(language.as_deref(), Some("rust"));
                assert!(chunk_type.is_none());
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn search_requires_query() {
        assert!(Cli::try_parse_from(["kiln", "search"]).is_err());
    }
}
