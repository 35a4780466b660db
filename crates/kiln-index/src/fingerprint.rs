//! Durable content-hash manifest for incremental change detection.
//!
//! The manifest is one JSON snapshot holding every file and chunk fingerprint.
//! It is written to a sibling temporary file and renamed over the previous
//! snapshot, so a reader never observes a partial write.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path: String,
    /// blake3 hex digest of the bytes that were processed.
    pub content_hash: String,
    pub modified: Option<DateTime<Utc>>,
    pub size: u64,
    pub last_processed: DateTime<Utc>,
    pub chunk_count: usize,
    pub status: ProcessingStatus,
    pub language: Option<String>,
    pub chunk_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFingerprint {
    pub chunk_id: String,
    pub file_path: String,
    pub content_hash: String,
    pub index: usize,
    pub summary: Option<String>,
    /// Vector-store point holding this chunk's embedding.
    pub embedding_ref: Option<String>,
    pub status: ProcessingStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestStats {
    pub total_files: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_chunks: usize,
    pub cache_hit_rate: f64,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub files: BTreeMap<String, FileFingerprint>,
    #[serde(default)]
    pub chunks: BTreeMap<String, ChunkFingerprint>,
    #[serde(default)]
    pub stats: ManifestStats,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            updated_at: Utc::now(),
            files: BTreeMap::new(),
            chunks: BTreeMap::new(),
            stats: ManifestStats::default(),
        }
    }
}

/// Fields written for one chunk by [`ContentFingerprintStore::record_chunk`].
#[derive(Debug, Clone)]
pub struct ChunkRecord<'a> {
    pub chunk_id: &'a str,
    pub file_path: &'a str,
    pub content: &'a str,
    pub index: usize,
    pub summary: Option<String>,
    pub embedding_ref: Option<String>,
    pub status: ProcessingStatus,
}

/// Fingerprints dropped by [`ContentFingerprintStore::prune_deleted`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub files: Vec<String>,
    pub chunk_ids: Vec<String>,
}

/// Hex blake3 digest used for both file and chunk fingerprints.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Stable chunk identity: owning file path plus ordinal.
#[must_use]
pub fn chunk_id(path: &str, index: usize) -> String {
    format!("{path}#{index}")
}

/// Owner of the [`Manifest`]. All fingerprint mutation goes through here.
#[derive(Debug)]
pub struct ContentFingerprintStore {
    manifest_path: PathBuf,
    root: PathBuf,
    manifest: Manifest,
}

impl ContentFingerprintStore {
    /// Load the manifest at `manifest_path`; paths are resolved against `root`.
    ///
    /// A missing, unreadable, or corrupt manifest yields an empty one.
    #[must_use]
    pub fn load(manifest_path: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        let manifest_path = manifest_path.into();
        let manifest = read_manifest(&manifest_path);
        Self {
            manifest_path,
            root: root.into(),
            manifest,
        }
    }

    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    #[must_use]
    pub fn file(&self, path: &str) -> Option<&FileFingerprint> {
        self.manifest.files.get(path)
    }

    #[must_use]
    pub fn chunk(&self, chunk_id: &str) -> Option<&ChunkFingerprint> {
        self.manifest.chunks.get(chunk_id)
    }

    pub fn tracked_files(&self) -> impl Iterator<Item = &str> {
        self.manifest.files.keys().map(String::as_str)
    }

    /// Whether `path` needs processing.
    ///
    /// True for untracked files, files whose last run did not complete, files
    /// that cannot be read, and files whose content hash moved. A new
    /// modification time over identical bytes is not a change.
    #[must_use]
    pub fn is_changed(&self, path: &str) -> bool {
        let Some(fp) = self.manifest.files.get(path) else {
            return true;
        };
        if fp.status != ProcessingStatus::Completed {
            return true;
        }
        match std::fs::read(self.root.join(path)) {
            Ok(bytes) => hash_bytes(&bytes) != fp.content_hash,
            Err(e) => {
                tracing::warn!(file = %path, "hashing failed, treating as changed: {e}");
                true
            }
        }
    }

    /// Same check as [`Self::is_changed`] against bytes the caller already read.
    #[must_use]
    pub fn is_content_changed(&self, path: &str, content: &[u8]) -> bool {
        self.manifest.files.get(path).is_none_or(|fp| {
            fp.status != ProcessingStatus::Completed || fp.content_hash != hash_bytes(content)
        })
    }

    pub fn changed_files<'a, I>(&self, paths: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        paths
            .into_iter()
            .filter(|p| self.is_changed(p))
            .map(str::to_owned)
            .collect()
    }

    /// Read and hash `path`, then replace its fingerprint.
    ///
    /// Returns chunk IDs the file owned before but no longer does.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn record_file(
        &mut self,
        path: &str,
        language: Option<&str>,
        chunk_ids: Vec<String>,
        status: ProcessingStatus,
    ) -> io::Result<Vec<String>> {
        let content = std::fs::read(self.root.join(path))?;
        Ok(self.record_file_content(path, &content, language, chunk_ids, status))
    }

    /// Replace the fingerprint of `path` using bytes the caller already read.
    ///
    /// Chunk fingerprints the file no longer references are dropped; their IDs
    /// are returned so the caller can remove the matching vector-store points.
    pub fn record_file_content(
        &mut self,
        path: &str,
        content: &[u8],
        language: Option<&str>,
        chunk_ids: Vec<String>,
        status: ProcessingStatus,
    ) -> Vec<String> {
        let modified = std::fs::metadata(self.root.join(path))
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        let orphaned: Vec<String> = self
            .manifest
            .files
            .get(path)
            .map(|old| {
                old.chunk_ids
                    .iter()
                    .filter(|id| !chunk_ids.contains(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for id in &orphaned {
            self.manifest.chunks.remove(id);
        }

        let fp = FileFingerprint {
            path: path.to_owned(),
            content_hash: hash_bytes(content),
            modified,
            size: content.len() as u64,
            last_processed: Utc::now(),
            chunk_count: chunk_ids.len(),
            status,
            language: language.map(str::to_owned),
            chunk_ids,
        };
        self.manifest.files.insert(path.to_owned(), fp);
        orphaned
    }

    /// Mark `path` failed while keeping the chunks it last completed with.
    ///
    /// The next run sees a non-completed status and retries the file.
    pub fn mark_failed(&mut self, path: &str, content: &[u8]) {
        let (language, chunk_ids) = self
            .manifest
            .files
            .get(path)
            .map(|fp| (fp.language.clone(), fp.chunk_ids.clone()))
            .unwrap_or_default();
        self.record_file_content(
            path,
            content,
            language.as_deref(),
            chunk_ids,
            ProcessingStatus::Failed,
        );
    }

    pub fn record_chunk(&mut self, record: ChunkRecord<'_>) {
        let created_at = self
            .manifest
            .chunks
            .get(record.chunk_id)
            .map_or_else(Utc::now, |c| c.created_at);
        let fp = ChunkFingerprint {
            chunk_id: record.chunk_id.to_owned(),
            file_path: record.file_path.to_owned(),
            content_hash: hash_bytes(record.content.as_bytes()),
            index: record.index,
            summary: record.summary,
            embedding_ref: record.embedding_ref,
            status: record.status,
            created_at,
        };
        self.manifest.chunks.insert(fp.chunk_id.clone(), fp);
    }

    /// Cached summary for `chunk_id`. The caller must check the content hash
    /// before trusting it.
    #[must_use]
    pub fn cached_summary(&self, chunk_id: &str) -> Option<&str> {
        self.manifest
            .chunks
            .get(chunk_id)
            .and_then(|c| c.summary.as_deref())
    }

    /// Fingerprint for `chunk_id` only if it was taken over identical content.
    #[must_use]
    pub fn cached_chunk(&self, chunk_id: &str, content_hash: &str) -> Option<&ChunkFingerprint> {
        self.manifest
            .chunks
            .get(chunk_id)
            .filter(|c| c.content_hash == content_hash)
    }

    /// Drop fingerprints for tracked files missing from `current_paths`.
    pub fn prune_deleted<'a, I>(&mut self, current_paths: I) -> PruneReport
    where
        I: IntoIterator<Item = &'a str>,
    {
        let current: BTreeSet<&str> = current_paths.into_iter().collect();
        let gone: Vec<String> = self
            .manifest
            .files
            .keys()
            .filter(|p| !current.contains(p.as_str()))
            .cloned()
            .collect();

        let mut report = PruneReport::default();
        for path in gone {
            if let Some(fp) = self.manifest.files.remove(&path) {
                for id in fp.chunk_ids {
                    self.manifest.chunks.remove(&id);
                    report.chunk_ids.push(id);
                }
            }
            // Chunks recorded for a file whose own fingerprint never landed.
            let stray: Vec<String> = self
                .manifest
                .chunks
                .values()
                .filter(|c| c.file_path == path)
                .map(|c| c.chunk_id.clone())
                .collect();
            for id in stray {
                self.manifest.chunks.remove(&id);
                report.chunk_ids.push(id);
            }
            report.files.push(path);
        }
        report
    }

    /// Refresh aggregate statistics after a run.
    pub fn record_run(&mut self, cache_hit_rate: f64) {
        let files = self.manifest.files.values();
        let (completed, failed) = files.fold((0, 0), |(ok, bad), fp| match fp.status {
            ProcessingStatus::Completed => (ok + 1, bad),
            ProcessingStatus::Failed => (ok, bad + 1),
            _ => (ok, bad),
        });
        self.manifest.stats = ManifestStats {
            total_files: self.manifest.files.len(),
            completed,
            failed,
            total_chunks: self.manifest.chunks.len(),
            cache_hit_rate,
            last_run_at: Some(Utc::now()),
        };
    }

    /// Atomically persist the manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, the temporary write, or the rename fails.
    pub fn save(&mut self) -> io::Result<()> {
        self.manifest.updated_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(&self.manifest)?;

        if let Some(parent) = self.manifest_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.manifest_path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        if let Err(e) = std::fs::rename(&tmp, &self.manifest_path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        tracing::debug!(
            path = %self.manifest_path.display(),
            files = self.manifest.files.len(),
            chunks = self.manifest.chunks.len(),
            "manifest saved"
        );
        Ok(())
    }
}

fn read_manifest(path: &Path) -> Manifest {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no manifest yet, starting fresh");
            return Manifest::default();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "manifest unreadable, starting fresh: {e}");
            return Manifest::default();
        }
    };
    match serde_json::from_slice::<Manifest>(&bytes) {
        Ok(m) if m.version == MANIFEST_VERSION => m,
        Ok(m) => {
            tracing::warn!(
                path = %path.display(),
                version = m.version,
                "unsupported manifest version, starting fresh"
            );
            Manifest::default()
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "manifest corrupt, starting fresh: {e}");
            Manifest::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, ContentFingerprintStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentFingerprintStore::load(dir.path().join("state/manifest.json"), dir.path());
        (dir, store)
    }

    fn write(dir: &tempfile::TempDir, rel: &str, body: &str) {
        let p = dir.path().join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, body).unwrap();
    }

    fn complete(store: &mut ContentFingerprintStore, path: &str, ids: &[&str]) -> Vec<String> {
        store
            .record_file(
                path,
                Some("rust"),
                ids.iter().map(|s| (*s).to_owned()).collect(),
                ProcessingStatus::Completed,
            )
            .unwrap()
    }

    #[test]
    fn missing_manifest_is_empty() {
        let (_dir, store) = setup();
        assert!(store.manifest().files.is_empty());
        assert_eq!(store.manifest().version, MANIFEST_VERSION);
    }

    #[test]
    fn corrupt_manifest_is_treated_as_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = ContentFingerprintStore::load(&path, dir.path());
        assert!(store.manifest().files.is_empty());
    }

    #[test]
    fn future_version_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut m = Manifest::default();
        m.version = MANIFEST_VERSION + 1;
        std::fs::write(&path, serde_json::to_vec(&m).unwrap()).unwrap();
        let store = ContentFingerprintStore::load(&path, dir.path());
        assert_eq!(store.manifest().version, MANIFEST_VERSION);
    }

    #[test]
    fn new_file_is_changed_until_recorded() {
        let (dir, mut store) = setup();
        write(&dir, "src/lib.rs", "fn a() {}");
        assert!(store.is_changed("src/lib.rs"));
        complete(&mut store, "src/lib.rs", &["src/lib.rs#0"]);
        assert!(!store.is_changed("src/lib.rs"));
    }

    #[test]
    fn touch_without_edit_is_not_a_change() {
        let (dir, mut store) = setup();
        write(&dir, "a.txt", "same bytes");
        complete(&mut store, "a.txt", &[]);
        std::thread::sleep(std::time::Duration::from_millis(20));
        write(&dir, "a.txt", "same bytes");
        assert!(!store.is_changed("a.txt"));
    }

    #[test]
    fn single_byte_edit_is_a_change() {
        let (dir, mut store) = setup();
        write(&dir, "a.txt", "abc");
        complete(&mut store, "a.txt", &[]);
        write(&dir, "a.txt", "abd");
        assert!(store.is_changed("a.txt"));
        assert!(store.is_content_changed("a.txt", b"abd"));
        assert!(!store.is_content_changed("a.txt", b"abc"));
    }

    #[test]
    fn failed_file_is_retried() {
        let (dir, mut store) = setup();
        write(&dir, "a.txt", "abc");
        store.mark_failed("a.txt", b"abc");
        assert_eq!(store.file("a.txt").unwrap().status, ProcessingStatus::Failed);
        assert!(store.is_changed("a.txt"));
    }

    #[test]
    fn unreadable_file_is_changed() {
        let (dir, mut store) = setup();
        write(&dir, "a.txt", "abc");
        complete(&mut store, "a.txt", &[]);
        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        assert!(store.is_changed("a.txt"));
    }

    #[test]
    fn changed_files_filters_candidates() {
        let (dir, mut store) = setup();
        write(&dir, "a.txt", "a");
        write(&dir, "b.txt", "b");
        complete(&mut store, "a.txt", &[]);
        let changed = store.changed_files(["a.txt", "b.txt"]);
        assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec!["b.txt"]);
    }

    #[test]
    fn shrinking_file_returns_orphaned_chunks() {
        let (dir, mut store) = setup();
        write(&dir, "a.rs", "x");
        for i in 0..3 {
            store.record_chunk(ChunkRecord {
                chunk_id: &chunk_id("a.rs", i),
                file_path: "a.rs",
                content: "x",
                index: i,
                summary: None,
                embedding_ref: None,
                status: ProcessingStatus::Completed,
            });
        }
        complete(&mut store, "a.rs", &["a.rs#0", "a.rs#1", "a.rs#2"]);

        let orphaned = complete(&mut store, "a.rs", &["a.rs#0"]);
        assert_eq!(orphaned, vec!["a.rs#1", "a.rs#2"]);
        assert!(store.chunk("a.rs#1").is_none());
        assert!(store.chunk("a.rs#0").is_some());
        assert_eq!(store.file("a.rs").unwrap().chunk_count, 1);
    }

    #[test]
    fn cached_chunk_requires_matching_hash() {
        let (_dir, mut store) = setup();
        store.record_chunk(ChunkRecord {
            chunk_id: "a.rs#0",
            file_path: "a.rs",
            content: "fn a() {}",
            index: 0,
            summary: Some("defines a".into()),
            embedding_ref: Some("point".into()),
            status: ProcessingStatus::Completed,
        });
        assert_eq!(store.cached_summary("a.rs#0"), Some("defines a"));
        assert!(store.cached_chunk("a.rs#0", &hash_bytes(b"fn a() {}")).is_some());
        assert!(store.cached_chunk("a.rs#0", &hash_bytes(b"fn b() {}")).is_none());
    }

    #[test]
    fn rerecording_chunk_keeps_creation_time() {
        let (_dir, mut store) = setup();
        let rec = |content| ChunkRecord {
            chunk_id: "a.rs#0",
            file_path: "a.rs",
            content,
            index: 0,
            summary: None,
            embedding_ref: None,
            status: ProcessingStatus::Completed,
        };
        store.record_chunk(rec("one"));
        let created = store.chunk("a.rs#0").unwrap().created_at;
        store.record_chunk(rec("two"));
        let c = store.chunk("a.rs#0").unwrap();
        assert_eq!(c.created_at, created);
        assert_eq!(c.content_hash, hash_bytes(b"two"));
    }

    #[test]
    fn prune_cascades_to_chunks() {
        let (dir, mut store) = setup();
        write(&dir, "keep.rs", "k");
        write(&dir, "gone.rs", "g");
        for path in ["keep.rs", "gone.rs"] {
            let id = chunk_id(path, 0);
            store.record_chunk(ChunkRecord {
                chunk_id: &id,
                file_path: path,
                content: "c",
                index: 0,
                summary: None,
                embedding_ref: None,
                status: ProcessingStatus::Completed,
            });
            complete(&mut store, path, &[id.as_str()]);
        }

        let report = store.prune_deleted(["keep.rs"]);
        assert_eq!(report.files, vec!["gone.rs"]);
        assert_eq!(report.chunk_ids, vec!["gone.rs#0"]);
        assert!(store.file("gone.rs").is_none());
        assert!(store.chunk("gone.rs#0").is_none());
        assert!(store.chunk("keep.rs#0").is_some());
    }

    #[test]
    fn save_then_load_round_trips_and_leaves_no_temp_file() {
        let (dir, mut store) = setup();
        write(&dir, "a.txt", "abc");
        complete(&mut store, "a.txt", &[]);
        store.record_run(0.5);
        store.save().unwrap();

        let state_dir = dir.path().join("state");
        let names: Vec<_> = std::fs::read_dir(&state_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["manifest.json"]);

        let reloaded = ContentFingerprintStore::load(state_dir.join("manifest.json"), dir.path());
        assert_eq!(reloaded.manifest().files, store.manifest().files);
        assert_eq!(reloaded.manifest().stats.completed, 1);
        assert!(!reloaded.is_changed("a.txt"));
    }
}
