use crate::stats::OrphanedCleanupStats;
use crate::store::{
    is_absent, DIRECTORY_ARTIFACT_SUFFIX, FILE_ARTIFACT_SUFFIX, ROOT_ARTIFACT_NAME, TMP_MARKER,
};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

enum ArtifactFile<'a> {
    Analysis { source_name: &'a str },
    Knowledge { dir_name: Option<&'a str> },
    Temp,
    Other,
}

fn classify(name: &str) -> ArtifactFile<'_> {
    if name.starts_with('.') && name.contains(TMP_MARKER) {
        return ArtifactFile::Temp;
    }
    if name == ROOT_ARTIFACT_NAME {
        return ArtifactFile::Knowledge { dir_name: None };
    }
    if let Some(source_name) = name
        .strip_suffix(FILE_ARTIFACT_SUFFIX)
        .filter(|stem| !stem.is_empty())
    {
        return ArtifactFile::Analysis { source_name };
    }
    if let Some(dir_name) = name
        .strip_suffix(DIRECTORY_ARTIFACT_SUFFIX)
        .filter(|stem| !stem.is_empty())
    {
        return ArtifactFile::Knowledge {
            dir_name: Some(dir_name),
        };
    }
    ArtifactFile::Other
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    File,
    Directory,
}

/// Removes cached artifacts whose source is gone, deepest directories first.
///
/// Stale-but-live artifacts are left alone; only a missing source makes an artifact an orphan.
pub struct OrphanReaper {
    source_root: PathBuf,
    cache_root: PathBuf,
}

impl OrphanReaper {
    pub fn new(source_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            cache_root: cache_root.into(),
        }
    }

    /// Blocking; call from `spawn_blocking` inside async code.
    pub fn reap(&self) -> OrphanedCleanupStats {
        let mut stats = OrphanedCleanupStats::default();
        if !self.cache_root.is_dir() {
            log::debug!("No cache at {}, nothing to reap", self.cache_root.display());
            return stats;
        }

        // contents_first yields every entry before the directory that holds it.
        for entry in WalkDir::new(&self.cache_root)
            .follow_links(false)
            .contents_first(true)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("Failed to read cache entry: {err}");
                    stats.errors += 1;
                    continue;
                }
            };
            let path = entry.path();
            if entry.file_type().is_dir() {
                if entry.depth() > 0 {
                    self.reap_directory(path, &mut stats);
                }
            } else {
                self.reap_file(path, &mut stats);
            }
        }

        log::info!(
            "Orphan cleanup: {} analyses, {} knowledge files, {} directories, {} temp files removed",
            stats.analysis_files_deleted,
            stats.knowledge_files_deleted,
            stats.directories_deleted,
            stats.temp_files_deleted
        );
        stats
    }

    fn reap_file(&self, path: &Path, stats: &mut OrphanedCleanupStats) {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return;
        };
        let Some(cache_dir) = path.parent() else {
            return;
        };

        let source = match classify(name) {
            ArtifactFile::Other => return,
            ArtifactFile::Temp => {
                if remove_file(path, stats) {
                    stats.temp_files_deleted += 1;
                }
                return;
            }
            ArtifactFile::Analysis { source_name } => self
                .mirrored_source(cache_dir)
                .map(|dir| (dir.join(source_name), SourceKind::File)),
            ArtifactFile::Knowledge { dir_name } => {
                // `<name>_kb.md` only belongs to the directory called `<name>`.
                let owner = cache_dir.file_name().and_then(|n| n.to_str());
                match dir_name {
                    Some(expected) if owner != Some(expected) => None,
                    _ => self
                        .mirrored_source(cache_dir)
                        .map(|dir| (dir, SourceKind::Directory)),
                }
            }
        };

        let is_orphan = match source {
            Some((source, kind)) => match source_exists(&source, kind) {
                Ok(exists) => !exists,
                Err(err) => {
                    log::warn!("Cannot check source {}: {err}", source.display());
                    stats.errors += 1;
                    return;
                }
            },
            None => true,
        };
        if !is_orphan {
            return;
        }

        if remove_file(path, stats) {
            log::debug!("Removed orphaned artifact {}", path.display());
            if name.ends_with(FILE_ARTIFACT_SUFFIX) {
                stats.analysis_files_deleted += 1;
            } else {
                stats.knowledge_files_deleted += 1;
            }
        }
    }

    fn reap_directory(&self, path: &Path, stats: &mut OrphanedCleanupStats) {
        let is_empty = match std::fs::read_dir(path) {
            Ok(mut entries) => entries.next().is_none(),
            Err(err) => {
                log::warn!("Failed to list {}: {err}", path.display());
                stats.errors += 1;
                return;
            }
        };
        if !is_empty {
            return;
        }
        let source_alive = match self.mirrored_source(path) {
            Some(source) => match source_exists(&source, SourceKind::Directory) {
                Ok(exists) => exists,
                Err(err) => {
                    log::warn!("Cannot check source {}: {err}", source.display());
                    stats.errors += 1;
                    return;
                }
            },
            None => false,
        };
        if source_alive {
            return;
        }
        match std::fs::remove_dir(path) {
            Ok(()) => {
                log::debug!("Removed orphaned cache directory {}", path.display());
                stats.directories_deleted += 1;
            }
            Err(err) => {
                log::warn!("Failed to remove {}: {err}", path.display());
                stats.errors += 1;
            }
        }
    }

    fn mirrored_source(&self, cache_dir: &Path) -> Option<PathBuf> {
        cache_dir
            .strip_prefix(&self.cache_root)
            .ok()
            .map(|rel| self.source_root.join(rel))
    }
}

/// A source replaced by an entry of the other kind (a directory turned into a file, or the
/// reverse) counts as gone.
fn source_exists(path: &Path, kind: SourceKind) -> io::Result<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => Ok(meta.is_dir() == (kind == SourceKind::Directory)),
        Err(err) if is_absent(&err) => Ok(false),
        Err(err) => Err(err),
    }
}

fn remove_file(path: &Path, stats: &mut OrphanedCleanupStats) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => {
            log::warn!("Failed to remove {}: {err}", path.display());
            stats.errors += 1;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn classifies_artifact_names() {
        assert!(matches!(
            classify("lib.rs.analysis.md"),
            ArtifactFile::Analysis { source_name: "lib.rs" }
        ));
        assert!(matches!(
            classify("src_kb.md"),
            ArtifactFile::Knowledge { dir_name: Some("src") }
        ));
        assert!(matches!(
            classify("project_kb.md"),
            ArtifactFile::Knowledge { dir_name: None }
        ));
        assert!(matches!(classify(".a.md.tmp-12-0"), ArtifactFile::Temp));
        assert!(matches!(classify("last_run.json"), ArtifactFile::Other));
        assert!(matches!(classify(".kb.lock"), ArtifactFile::Other));
    }

    #[test]
    fn deleting_one_file_removes_only_its_artifact_and_empty_directory() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let cache = temp.path().join("cache");
        touch(&src.join("keep/a.rs"));
        touch(&src.join("keep/b.rs"));
        fs::create_dir_all(src.join("gone_parent")).unwrap();
        touch(&cache.join("project_kb.md"));
        touch(&cache.join("keep/keep_kb.md"));
        touch(&cache.join("keep/a.rs.analysis.md"));
        touch(&cache.join("keep/b.rs.analysis.md"));
        touch(&cache.join("keep/c.rs.analysis.md"));
        touch(&cache.join("gone/deep/d.rs.analysis.md"));
        touch(&cache.join("gone/deep/deep_kb.md"));
        touch(&cache.join("gone/gone_kb.md"));
        touch(&cache.join("last_run.json"));

        let stats = OrphanReaper::new(&src, &cache).reap();

        assert_eq!(stats.analysis_files_deleted, 2);
        assert_eq!(stats.knowledge_files_deleted, 2);
        assert_eq!(stats.directories_deleted, 2);
        assert_eq!(stats.errors, 0);
        assert!(!cache.join("keep/c.rs.analysis.md").exists());
        assert!(!cache.join("gone").exists());
        assert!(cache.join("keep/a.rs.analysis.md").is_file());
        assert!(cache.join("keep/b.rs.analysis.md").is_file());
        assert!(cache.join("keep/keep_kb.md").is_file());
        assert!(cache.join("project_kb.md").is_file());
        assert!(cache.join("last_run.json").is_file());
    }

    #[test]
    fn empty_cache_directory_with_live_source_is_kept() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let cache = temp.path().join("cache");
        fs::create_dir_all(src.join("live")).unwrap();
        fs::create_dir_all(cache.join("live")).unwrap();

        let stats = OrphanReaper::new(&src, &cache).reap();
        assert_eq!(stats.total_deleted(), 0);
        assert!(cache.join("live").is_dir());
        assert!(cache.is_dir());
    }

    #[test]
    fn leftover_temp_files_are_removed() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let cache = temp.path().join("cache");
        touch(&src.join("a.rs"));
        touch(&cache.join(".a.rs.analysis.md.tmp-42-7"));

        let stats = OrphanReaper::new(&src, &cache).reap();
        assert_eq!(stats.temp_files_deleted, 1);
        assert!(!cache.join(".a.rs.analysis.md.tmp-42-7").exists());
    }

    #[test]
    fn directory_replaced_by_file_orphans_its_mirror() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let cache = temp.path().join("cache");
        touch(&src.join("x"));
        touch(&cache.join("x.analysis.md"));
        touch(&cache.join("x/y.rs.analysis.md"));
        touch(&cache.join("x/x_kb.md"));

        let stats = OrphanReaper::new(&src, &cache).reap();

        assert_eq!(stats.analysis_files_deleted, 1);
        assert_eq!(stats.knowledge_files_deleted, 1);
        assert_eq!(stats.directories_deleted, 1);
        assert_eq!(stats.errors, 0);
        assert!(!cache.join("x").exists());
        assert!(cache.join("x.analysis.md").is_file());
    }

    #[test]
    fn file_replaced_by_directory_orphans_its_analysis() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let cache = temp.path().join("cache");
        touch(&src.join("y/inner.rs"));
        touch(&cache.join("y.analysis.md"));

        let stats = OrphanReaper::new(&src, &cache).reap();

        assert_eq!(stats.analysis_files_deleted, 1);
        assert!(!cache.join("y.analysis.md").exists());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_source_is_counted_and_siblings_are_still_reaped() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let cache = temp.path().join("cache");
        fs::create_dir_all(&src).unwrap();
        // Resolving anything below `looped` fails with a symlink loop, not NotFound.
        std::os::unix::fs::symlink("looped", src.join("looped")).unwrap();
        touch(&cache.join("looped/a.rs.analysis.md"));
        touch(&cache.join("gone.rs.analysis.md"));

        let stats = OrphanReaper::new(&src, &cache).reap();

        assert_eq!(stats.errors, 1);
        assert_eq!(stats.analysis_files_deleted, 1);
        assert!(!cache.join("gone.rs.analysis.md").exists());
        assert!(cache.join("looped/a.rs.analysis.md").is_file());
    }

    #[test]
    fn missing_cache_root_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let stats = OrphanReaper::new(temp.path(), temp.path().join("nope")).reap();
        assert_eq!(stats, OrphanedCleanupStats::default());
    }
}
