//! File prioritization under a processing budget.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::Serialize;

/// File stems recognised as entry points when nothing else is configured.
pub const DEFAULT_ENTRY_POINT_STEMS: &[&str] = &[
    "main", "index", "app", "lib", "mod", "__init__", "__main__", "server", "cli",
];

/// Tier for changed entry points; lower is more urgent.
pub const TIER_CHANGED_ENTRY: u32 = 0;
pub const TIER_CHANGED: u32 = 1;
pub const TIER_ENTRY: u32 = 2;
pub const TIER_REST: u32 = 3;

/// Decides whether a repository-relative path is an entry point.
pub trait EntryPointRule: Send + Sync {
    fn is_entry_point(&self, path: &str) -> bool;
}

impl<F> EntryPointRule for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_entry_point(&self, path: &str) -> bool {
        self(path)
    }
}

/// Entry point detection by file stem, case-insensitive (`main.rs`, `index.ts`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConvention {
    stems: BTreeSet<String>,
}

impl NamingConvention {
    #[must_use]
    pub fn new<I, S>(stems: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            stems: stems
                .into_iter()
                .map(|s| s.as_ref().to_lowercase())
                .collect(),
        }
    }
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self::new(DEFAULT_ENTRY_POINT_STEMS)
    }
}

impl EntryPointRule for NamingConvention {
    fn is_entry_point(&self, path: &str) -> bool {
        Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|stem| self.stems.contains(&stem.to_lowercase()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriorityEntry {
    pub path: String,
    pub priority: u32,
    pub is_changed: bool,
    pub is_entry_point: bool,
    pub reason: String,
    /// Number of directory components above the file.
    pub depth: usize,
}

impl PriorityEntry {
    fn sort_key(&self) -> (u32, usize, &str) {
        let depth = if self.priority == TIER_REST {
            self.depth
        } else {
            0
        };
        (self.priority, depth, &self.path)
    }
}

/// Ranks files into a deterministic processing order.
pub struct PriorityScheduler {
    rule: Box<dyn EntryPointRule>,
}

impl fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityScheduler").finish_non_exhaustive()
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new(NamingConvention::default())
    }
}

impl PriorityScheduler {
    #[must_use]
    pub fn new(rule: impl EntryPointRule + 'static) -> Self {
        Self {
            rule: Box::new(rule),
        }
    }

    /// Order every file by tier, then depth (last tier only), then path.
    ///
    /// Duplicate paths collapse to one entry. Output depends only on the
    /// inputs, never on their order.
    pub fn prioritize<S: AsRef<str>>(
        &self,
        all_files: &[S],
        changed: &BTreeSet<String>,
    ) -> Vec<PriorityEntry> {
        let unique: BTreeSet<&str> = all_files.iter().map(AsRef::as_ref).collect();
        let mut entries: Vec<PriorityEntry> = unique
            .into_iter()
            .map(|path| self.entry(path, changed.contains(path)))
            .collect();
        entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        entries
    }

    /// The first `budget` entries of [`Self::prioritize`]; `None` keeps all.
    pub fn top_n<S: AsRef<str>>(
        &self,
        all_files: &[S],
        changed: &BTreeSet<String>,
        budget: Option<usize>,
    ) -> Vec<PriorityEntry> {
        let mut entries = self.prioritize(all_files, changed);
        if let Some(budget) = budget {
            entries.truncate(budget);
        }
        entries
    }

    fn entry(&self, path: &str, is_changed: bool) -> PriorityEntry {
        let is_entry_point = self.rule.is_entry_point(path);
        let depth = path.matches('/').count();
        let (priority, reason) = match (is_changed, is_entry_point) {
            (true, true) => (TIER_CHANGED_ENTRY, "changed entry point".to_owned()),
            (true, false) => (TIER_CHANGED, "changed".to_owned()),
            (false, true) => (TIER_ENTRY, "unchanged entry point".to_owned()),
            (false, false) => (TIER_REST, format!("unchanged, depth {depth}")),
        };
        PriorityEntry {
            path: path.to_owned(),
            priority,
            is_changed,
            is_entry_point,
            reason,
            depth,
        }
    }
}
