use crate::store::CacheSnapshot;
use crate::tree::{DirectoryNode, FileNode, Node};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// True when `current_ms` is newer than `recorded_ms` by more than `tolerance_ms`.
///
/// A recorded time ahead of the source (clock skew) is never treated as stale.
#[must_use]
pub const fn source_is_newer(current_ms: u64, recorded_ms: u64, tolerance_ms: u64) -> bool {
    current_ms > recorded_ms && current_ms - recorded_ms > tolerance_ms
}

/// Why a node's artifact no longer reflects its inputs. The first failing check wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StaleReason {
    ArtifactMissing,
    SourceModified {
        source_mtime_ms: u64,
        recorded_mtime_ms: u64,
    },
    /// Entries were added, removed or renamed inside the directory.
    DirectoryModified {
        source_mtime_ms: u64,
        recorded_mtime_ms: u64,
    },
    ChildFileStale {
        path: PathBuf,
    },
    ChildKnowledgeNewer {
        path: PathBuf,
    },
    ChildDirectoryStale {
        path: PathBuf,
    },
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArtifactMissing => write!(f, "no cached artifact"),
            Self::SourceModified {
                source_mtime_ms,
                recorded_mtime_ms,
            } => write!(
                f,
                "source modified ({source_mtime_ms} ms > recorded {recorded_mtime_ms} ms)"
            ),
            Self::DirectoryModified {
                source_mtime_ms,
                recorded_mtime_ms,
            } => write!(
                f,
                "directory entries changed ({source_mtime_ms} ms > recorded {recorded_mtime_ms} ms)"
            ),
            Self::ChildFileStale { path } => write!(f, "child file stale: {}", path.display()),
            Self::ChildKnowledgeNewer { path } => {
                write!(f, "child knowledge newer: {}", path.display())
            }
            Self::ChildDirectoryStale { path } => {
                write!(f, "child directory stale: {}", path.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Stale(StaleReason),
}

impl Staleness {
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    #[must_use]
    pub const fn reason(&self) -> Option<&StaleReason> {
        match self {
            Self::Fresh => None,
            Self::Stale(reason) => Some(reason),
        }
    }
}

/// Staleness checks against recorded cache metadata.
///
/// Directory results are memoized; [`ChangeDetector::assess`] fills them bottom-up so a parent
/// always sees its children's verdicts.
pub struct ChangeDetector<'a> {
    snapshot: &'a CacheSnapshot,
    tolerance_ms: u64,
    directories: HashMap<PathBuf, Staleness>,
}

impl<'a> ChangeDetector<'a> {
    #[must_use]
    pub fn new(snapshot: &'a CacheSnapshot, tolerance_ms: u64) -> Self {
        Self {
            snapshot,
            tolerance_ms,
            directories: HashMap::new(),
        }
    }

    pub fn assess(&mut self, tree: &DirectoryNode) {
        for dir in tree.post_order_dirs() {
            self.directory_staleness(dir);
        }
    }

    pub fn is_stale(&mut self, node: Node<'_>) -> Staleness {
        match node {
            Node::File(file) => self.file_staleness(file),
            Node::Directory(dir) => self.directory_staleness(dir),
        }
    }

    #[must_use]
    pub fn file_staleness(&self, file: &FileNode) -> Staleness {
        let Some(entry) = self.snapshot.get(&file.path) else {
            return Staleness::Stale(StaleReason::ArtifactMissing);
        };
        if source_is_newer(file.mtime_ms, entry.source_mtime_ms, self.tolerance_ms) {
            return Staleness::Stale(StaleReason::SourceModified {
                source_mtime_ms: file.mtime_ms,
                recorded_mtime_ms: entry.source_mtime_ms,
            });
        }
        Staleness::Fresh
    }

    pub fn directory_staleness(&mut self, dir: &DirectoryNode) -> Staleness {
        if let Some(known) = self.directories.get(&dir.path) {
            return known.clone();
        }
        let verdict = self.compute_directory(dir);
        self.directories.insert(dir.path.clone(), verdict.clone());
        verdict
    }

    fn compute_directory(&mut self, dir: &DirectoryNode) -> Staleness {
        // Nothing to summarize, so nothing can go stale.
        if dir.is_empty() {
            return Staleness::Fresh;
        }

        let Some(own) = self.snapshot.get(&dir.path).copied() else {
            return Staleness::Stale(StaleReason::ArtifactMissing);
        };
        if source_is_newer(dir.mtime_ms, own.source_mtime_ms, self.tolerance_ms) {
            return Staleness::Stale(StaleReason::DirectoryModified {
                source_mtime_ms: dir.mtime_ms,
                recorded_mtime_ms: own.source_mtime_ms,
            });
        }

        for file in &dir.files {
            if self.file_staleness(file).is_stale() {
                return Staleness::Stale(StaleReason::ChildFileStale {
                    path: file.path.clone(),
                });
            }
        }

        for child in dir.dirs.iter().filter(|child| !child.is_empty()) {
            let newer = self
                .snapshot
                .get(&child.path)
                .is_some_and(|entry| entry.cached_at_ms > own.cached_at_ms);
            if newer {
                return Staleness::Stale(StaleReason::ChildKnowledgeNewer {
                    path: child.path.clone(),
                });
            }
        }

        for child in &dir.dirs {
            if self.directory_staleness(child).is_stale() {
                return Staleness::Stale(StaleReason::ChildDirectoryStale {
                    path: child.path.clone(),
                });
            }
        }

        Staleness::Fresh
    }
}
