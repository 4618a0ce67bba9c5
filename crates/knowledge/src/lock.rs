use crate::{KnowledgeError, Result};
use fs2::FileExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const LOCK_FILE_NAME: &str = ".kb.lock";

/// Exclusive advisory lock over a cache root, released on drop.
pub(crate) struct CacheLock {
    file: std::fs::File,
    path: PathBuf,
}

impl CacheLock {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub(crate) fn lock_path(cache_root: &Path) -> PathBuf {
    cache_root.join(LOCK_FILE_NAME)
}

/// Blocks (off the async runtime) until no other process builds or reaps this cache.
pub(crate) async fn acquire_cache_lock(cache_root: &Path) -> Result<CacheLock> {
    tokio::fs::create_dir_all(cache_root).await?;
    let path = lock_path(cache_root);

    tokio::task::spawn_blocking(move || -> Result<CacheLock> {
        use std::fs::OpenOptions;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| KnowledgeError::Lock(format!("open {}: {err}", path.display())))?;

        let start = Instant::now();
        file.lock_exclusive()
            .map_err(|err| KnowledgeError::Lock(format!("acquire {}: {err}", path.display())))?;
        let waited = start.elapsed();
        if waited.as_millis() > 100 {
            log::info!("Waited {waited:?} for cache lock {}", path.display());
        }

        Ok(CacheLock { file, path })
    })
    .await?
}
