//! Configuration loading and pipeline bootstrap.

pub mod bootstrap;
pub mod config;

pub use bootstrap::{Indexer, StatusReport, build_indexer, build_with_provider, status};
pub use config::Config;
