//! On-disk knowledge cache.
//!
//! Artifacts mirror the source tree under the cache root:
//!
//! ```text
//! <cache_root>/
//!   project_kb.md            root summary
//!   src/
//!     src_kb.md              directory knowledge for src/
//!     lib.rs.analysis.md     analysis for src/lib.rs
//! ```
//!
//! Every artifact starts with a small metadata header that is stripped before text is handed
//! back to callers.

use crate::detector::source_is_newer;
use crate::error::{KnowledgeError, Result};
use crate::tree::{system_time_ms, DirectoryNode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;

pub const FILE_ARTIFACT_SUFFIX: &str = ".analysis.md";
pub const DIRECTORY_ARTIFACT_SUFFIX: &str = "_kb.md";
pub const ROOT_ARTIFACT_NAME: &str = "project_kb.md";

/// Marker embedded in temp file names used by atomic writes.
pub(crate) const TMP_MARKER: &str = ".tmp-";

const HEADER_OPEN: &str = "<!-- context-knowledge\n";
const HEADER_CLOSE: &str = "\n-->\n";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryMeta {
    pub source_mtime_ms: u64,
    pub cached_at_ms: u64,
}

/// A stored artifact with its header already parsed off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub text: String,
    pub meta: EntryMeta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheResult {
    Hit(String),
    Miss,
}

impl CacheResult {
    #[must_use]
    pub const fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    FileAnalysis,
    DirectoryKnowledge,
    RootKnowledge,
}

impl ArtifactKind {
    #[must_use]
    pub const fn for_directory(dir: &DirectoryNode) -> Self {
        if dir.is_tree_root {
            Self::RootKnowledge
        } else {
            Self::DirectoryKnowledge
        }
    }
}

#[must_use]
pub fn encode_artifact(meta: EntryMeta, text: &str) -> String {
    let header = format!(
        "{{\"source_mtime_ms\":{},\"cached_at_ms\":{}}}",
        meta.source_mtime_ms, meta.cached_at_ms
    );
    let mut out =
        String::with_capacity(HEADER_OPEN.len() + header.len() + HEADER_CLOSE.len() + text.len());
    out.push_str(HEADER_OPEN);
    out.push_str(&header);
    out.push_str(HEADER_CLOSE);
    out.push_str(text);
    out
}

/// `None` when the header is absent or unreadable; such files count as missing.
#[must_use]
pub fn decode_artifact(raw: &str) -> Option<CacheEntry> {
    let rest = raw.strip_prefix(HEADER_OPEN)?;
    let end = rest.find(HEADER_CLOSE)?;
    let meta: EntryMeta = serde_json::from_str(&rest[..end]).ok()?;
    Some(CacheEntry {
        text: rest[end + HEADER_CLOSE.len()..].to_string(),
        meta,
    })
}

/// Recorded metadata for every node that currently has an artifact, keyed by source path.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    entries: HashMap<PathBuf, EntryMeta>,
}

impl CacheSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: impl Into<PathBuf>, meta: EntryMeta) {
        self.entries.insert(source.into(), meta);
    }

    #[must_use]
    pub fn get(&self, source: &Path) -> Option<&EntryMeta> {
        self.entries.get(source)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrepareOutcome {
    pub created: usize,
    pub existing: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    source_root: PathBuf,
    cache_root: PathBuf,
    tolerance_ms: u64,
}

impl CacheStore {
    #[must_use]
    pub fn new(
        source_root: impl Into<PathBuf>,
        cache_root: impl Into<PathBuf>,
        tolerance_ms: u64,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            cache_root: cache_root.into(),
            tolerance_ms,
        }
    }

    #[must_use]
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    #[must_use]
    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Cache directory that mirrors `source_dir`.
    pub fn mirror_dir(&self, source_dir: &Path) -> Result<PathBuf> {
        let rel = source_dir.strip_prefix(&self.source_root).map_err(|_| {
            KnowledgeError::InvalidPath(format!(
                "{} is outside {}",
                source_dir.display(),
                self.source_root.display()
            ))
        })?;
        Ok(self.cache_root.join(rel))
    }

    pub fn artifact_path(&self, source: &Path, kind: ArtifactKind) -> Result<PathBuf> {
        match kind {
            ArtifactKind::FileAnalysis => {
                let parent = source.parent().ok_or_else(|| {
                    KnowledgeError::InvalidPath(format!("{} has no parent", source.display()))
                })?;
                let name = file_name(source)?;
                Ok(self
                    .mirror_dir(parent)?
                    .join(format!("{name}{FILE_ARTIFACT_SUFFIX}")))
            }
            ArtifactKind::DirectoryKnowledge => {
                let name = file_name(source)?;
                Ok(self
                    .mirror_dir(source)?
                    .join(format!("{name}{DIRECTORY_ARTIFACT_SUFFIX}")))
            }
            ArtifactKind::RootKnowledge => Ok(self.mirror_dir(source)?.join(ROOT_ARTIFACT_NAME)),
        }
    }

    /// Create every cache directory the run can write into, before any concurrent write starts.
    ///
    /// Failures are logged and counted, not returned: `put` still creates missing parents.
    pub async fn prepare_structure(&self, tree: &DirectoryNode) -> PrepareOutcome {
        let mut outcome = PrepareOutcome::default();
        let mut stack = vec![tree];
        while let Some(dir) = stack.pop() {
            stack.extend(dir.dirs.iter());
            if dir.is_empty() {
                continue;
            }
            let target = match self.mirror_dir(&dir.path) {
                Ok(target) => target,
                Err(err) => {
                    log::warn!("Cannot mirror {}: {err}", dir.path.display());
                    outcome.failed += 1;
                    continue;
                }
            };
            if tokio::fs::metadata(&target)
                .await
                .is_ok_and(|meta| meta.is_dir())
            {
                outcome.existing += 1;
                continue;
            }
            match tokio::fs::create_dir_all(&target).await {
                Ok(()) => outcome.created += 1,
                Err(err) => {
                    log::warn!("Failed to create cache dir {}: {err}", target.display());
                    outcome.failed += 1;
                }
            }
        }
        log::debug!(
            "Prepared cache structure under {}: {outcome:?}",
            self.cache_root.display()
        );
        outcome
    }

    pub async fn read_entry(
        &self,
        source: &Path,
        kind: ArtifactKind,
    ) -> Result<Option<CacheEntry>> {
        let path = self.artifact_path(source, kind)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if is_absent(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let entry = decode_artifact(&raw);
        if entry.is_none() {
            log::debug!("Ignoring artifact without metadata header: {}", path.display());
        }
        Ok(entry)
    }

    /// Stored text for `source`, or `Miss` when absent or when the source is newer than the
    /// recorded mtime. Stale entries stay on disk.
    ///
    /// Only the node's own mtime is compared; whole-subtree checks for directories live in
    /// [`crate::KnowledgeIndexer::directory_knowledge`].
    pub async fn get(&self, source: &Path, kind: ArtifactKind) -> Result<CacheResult> {
        let Some(entry) = self.read_entry(source, kind).await? else {
            return Ok(CacheResult::Miss);
        };
        let current_mtime_ms = match tokio::fs::metadata(source).await {
            Ok(meta) => meta.modified().map(system_time_ms).unwrap_or(0),
            Err(err) if is_absent(&err) => return Ok(CacheResult::Miss),
            Err(err) => return Err(err.into()),
        };
        if source_is_newer(current_mtime_ms, entry.meta.source_mtime_ms, self.tolerance_ms) {
            return Ok(CacheResult::Miss);
        }
        Ok(CacheResult::Hit(entry.text))
    }

    /// Replace the artifact for `source` atomically.
    pub async fn put(
        &self,
        source: &Path,
        kind: ArtifactKind,
        text: &str,
        source_mtime_ms: u64,
    ) -> Result<CacheEntry> {
        let path = self.artifact_path(source, kind)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let meta = EntryMeta {
            source_mtime_ms,
            cached_at_ms: unix_now_ms(),
        };
        write_atomic(&path, encode_artifact(meta, text).as_bytes()).await?;
        Ok(CacheEntry {
            text: text.to_string(),
            meta,
        })
    }

    /// Read the recorded metadata of every node in `tree`.
    pub async fn snapshot(&self, tree: &DirectoryNode) -> Result<CacheSnapshot> {
        let mut snapshot = CacheSnapshot::new();
        for dir in tree.post_order_dirs() {
            for file in &dir.files {
                self.record(&mut snapshot, &file.path, ArtifactKind::FileAnalysis)
                    .await?;
            }
            if !dir.is_empty() {
                self.record(&mut snapshot, &dir.path, ArtifactKind::for_directory(dir))
                    .await?;
            }
        }
        Ok(snapshot)
    }

    async fn record(
        &self,
        snapshot: &mut CacheSnapshot,
        source: &Path,
        kind: ArtifactKind,
    ) -> Result<()> {
        if let Some(entry) = self.read_entry(source, kind).await? {
            snapshot.insert(source, entry.meta);
        }
        Ok(())
    }
}

/// A path component that is a file rather than a directory hides the entry just like a
/// missing one does.
pub(crate) fn is_absent(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| KnowledgeError::InvalidPath(format!("{} has no file name", path.display())))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| KnowledgeError::InvalidPath(format!("{} has no parent", path.display())))?;
    let tmp = parent.join(format!(
        ".{}{TMP_MARKER}{}-{}",
        file_name(path)?,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|dur| u64::try_from(dur.as_millis()).ok())
        .unwrap_or(0)
}
