//! Gitignore-aware file discovery.

use std::path::Path;

use crate::collaborators::Discoverer;
use crate::error::{IndexError, Result};
use crate::languages::is_indexable;

/// Walks a tree with [`ignore::WalkBuilder`], skipping hidden and gitignored
/// entries, excluded directory names, and file names matching an exclude glob.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkDiscoverer;

/// `/`-separated form of `path` relative to `root`.
pub(crate) fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Whether a glob exclusion applies to `rel_path`, by file name or by full relative path.
pub(crate) fn is_excluded(rel_path: &str, patterns: &[glob::Pattern]) -> bool {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    patterns
        .iter()
        .any(|p| p.matches(name) || p.matches(rel_path))
}

impl Discoverer for WalkDiscoverer {
    fn discover(
        &self,
        root: &Path,
        exclude_dirs: &[String],
        exclude_patterns: &[glob::Pattern],
    ) -> Result<Vec<String>> {
        if !root.is_dir() {
            return Err(IndexError::Other(format!(
                "index root {} is not a directory",
                root.display()
            )));
        }

        let excluded: Vec<String> = exclude_dirs.to_vec();
        let walker = ignore::WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(true)
            .require_git(false)
            .filter_entry(move |entry| {
                let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
                !(is_dir
                    && entry.depth() > 0
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| excluded.iter().any(|d| d == name)))
            })
            .build();

        let mut paths = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("discovery skipped an entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) || !is_indexable(entry.path()) {
                continue;
            }
            let Some(rel) = relative_path(root, entry.path()) else {
                continue;
            };
            if is_excluded(&rel, exclude_patterns) {
                continue;
            }
            paths.push(rel);
        }
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn patterns(globs: &[&str]) -> Vec<glob::Pattern> {
        globs.iter().map(|g| glob::Pattern::new(g).unwrap()).collect()
    }

    #[test]
    fn finds_indexable_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/main.rs", "fn main() {}");
        write(dir.path(), "src/util/mod.rs", "");
        write(dir.path(), "README.md", "# hi");
        write(dir.path(), "logo.png", "not text");

        let found = WalkDiscoverer.discover(dir.path(), &[], &[]).unwrap();
        assert_eq!(found, vec!["README.md", "src/main.rs", "src/util/mod.rs"]);
    }

    #[test]
    fn excluded_dirs_and_patterns_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/lib.rs", "");
        write(dir.path(), "target/debug/build.rs", "");
        write(dir.path(), "node_modules/pkg/index.js", "");
        write(dir.path(), "src/lib_test.rs", "");
        write(dir.path(), "docs/api.md", "");

        let found = WalkDiscoverer
            .discover(
                dir.path(),
                &["target".into(), "node_modules".into()],
                &patterns(&["*_test.rs", "docs/*"]),
            )
            .unwrap();
        assert_eq!(found, vec!["src/lib.rs"]);
    }

    #[test]
    fn hidden_and_gitignored_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".gitignore", "generated/\n");
        write(dir.path(), "generated/out.rs", "");
        write(dir.path(), ".cache/state.json", "{}");
        write(dir.path(), "app.py", "");

        let found = WalkDiscoverer.discover(dir.path(), &[], &[]).unwrap();
        assert_eq!(found, vec!["app.py"]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = WalkDiscoverer
            .discover(&dir.path().join("nope"), &[], &[])
            .unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn relative_path_uses_forward_slashes() {
        let root = Path::new("/repo");
        assert_eq!(
            relative_path(root, &root.join("a").join("b.rs")).as_deref(),
            Some("a/b.rs")
        );
        assert_eq!(relative_path(root, root), None);
        assert_eq!(relative_path(root, Path::new("/elsewhere/x.rs")), None);
    }
}
