use crate::config::RunConfig;
use crate::context::{Analyzer, RunContext};
use crate::decision::{DecisionEngine, DecisionReport};
use crate::detector::ChangeDetector;
use crate::generator::KnowledgeBuilder;
use crate::lock::acquire_cache_lock;
use crate::orchestrator::BuildOrchestrator;
use crate::reaper::OrphanReaper;
use crate::run_record::{read_last_run, write_run_record, RunRecord};
use crate::stats::{OrphanedCleanupStats, RunStats};
use crate::store::{ArtifactKind, CacheResult, CacheSnapshot, CacheStore};
use crate::tree::{DirectoryNode, TreeBuilder};
use crate::{KnowledgeError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Entry point tying the components together for one source tree.
pub struct KnowledgeIndexer {
    ctx: RunContext,
    store: CacheStore,
}

impl KnowledgeIndexer {
    pub fn new(source_root: impl AsRef<Path>, config: RunConfig) -> Result<Self> {
        let root = source_root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(KnowledgeError::InvalidPath(format!(
                "Not a directory: {}",
                root.display()
            )));
        }
        Ok(Self::with_context(RunContext::new(root, config)))
    }

    /// Use a prepared context (custom policy or progress sink).
    #[must_use]
    pub fn with_context(ctx: RunContext) -> Self {
        let store = CacheStore::new(&ctx.source_root, &ctx.cache_root, ctx.config.tolerance_ms);
        Self { ctx, store }
    }

    #[must_use]
    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    #[must_use]
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Scan and decide without generating anything.
    pub async fn plan(&self) -> Result<DecisionReport> {
        let (_, report) = self.scan_and_decide().await?;
        Ok(report)
    }

    /// Regenerate every stale artifact and record the outcome in `last_run.json`.
    ///
    /// A run aborted by a node failure still returns `Ok` with status `FAILED`; `Err` is
    /// reserved for failures before generation starts (scan, lock, cache reads).
    pub async fn build(&self, analyzer: Arc<dyn Analyzer>) -> Result<RunStats> {
        let lock = acquire_cache_lock(&self.ctx.cache_root).await?;
        log::debug!("Holding cache lock {}", lock.path().display());

        let (tree, report) = self.scan_and_decide().await?;
        let prepared = self.store.prepare_structure(&tree).await;
        if prepared.failed > 0 {
            self.ctx.progress.warning(&format!(
                "{} cache directories could not be prepared; writes will retry",
                prepared.failed
            ));
        }

        let builder = KnowledgeBuilder::new(self.ctx.clone(), self.store.clone(), analyzer);
        let stats = BuildOrchestrator::new(self.ctx.clone(), builder)
            .run(&tree, &report)
            .await;

        if let Err(err) = write_run_record(&self.ctx.cache_root, &stats).await {
            log::warn!("Failed to write run record: {err}");
        }
        drop(lock);
        Ok(stats)
    }

    /// Remove artifacts whose source is gone. Never runs concurrently with a build.
    pub async fn reap(&self) -> Result<OrphanedCleanupStats> {
        let lock = acquire_cache_lock(&self.ctx.cache_root).await?;
        log::debug!("Holding cache lock {}", lock.path().display());
        let reaper = OrphanReaper::new(&self.ctx.source_root, &self.ctx.cache_root);
        let stats = tokio::task::spawn_blocking(move || reaper.reap()).await?;
        drop(lock);
        Ok(stats)
    }

    /// Cached analysis of a source file; relative paths resolve against the source root.
    pub async fn file_analysis(&self, path: impl AsRef<Path>) -> Result<CacheResult> {
        let source = self.resolve(path.as_ref());
        self.store.get(&source, ArtifactKind::FileAnalysis).await
    }

    /// Cached knowledge of a directory.
    ///
    /// Misses when the directory or anything beneath it is stale, not just when the directory's
    /// own mtime moved. The source root and handler roots use the root artifact name.
    pub async fn directory_knowledge(&self, path: impl AsRef<Path>) -> Result<CacheResult> {
        let source = self.resolve(path.as_ref());
        let (tree, snapshot) = self.scan().await?;
        let Some(dir) = tree.find_directory(&source) else {
            return Ok(CacheResult::Miss);
        };
        let mut detector = ChangeDetector::new(&snapshot, self.ctx.config.tolerance_ms);
        let staleness = detector.directory_staleness(dir);
        if let Some(reason) = staleness.reason() {
            self.ctx.progress.debug(&format!(
                "Knowledge for {} is stale: {reason}",
                self.ctx.relative(&source)
            ));
            return Ok(CacheResult::Miss);
        }
        self.store.get(&source, ArtifactKind::for_directory(dir)).await
    }

    pub async fn last_run(&self) -> Result<Option<RunRecord>> {
        read_last_run(&self.ctx.cache_root).await
    }

    async fn scan(&self) -> Result<(DirectoryNode, CacheSnapshot)> {
        let builder = TreeBuilder::new(&self.ctx);
        let tree = tokio::task::spawn_blocking(move || builder.build()).await??;
        let snapshot = self.store.snapshot(&tree).await?;
        self.ctx.progress.debug(&format!(
            "Loaded metadata for {} cached artifacts",
            snapshot.len()
        ));
        Ok((tree, snapshot))
    }

    async fn scan_and_decide(&self) -> Result<(DirectoryNode, DecisionReport)> {
        let (tree, snapshot) = self.scan().await?;
        let report = DecisionEngine::new(&snapshot, self.ctx.config.tolerance_ms).decide(&tree);
        Ok((tree, report))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.ctx.source_root.join(path)
        }
    }
}
