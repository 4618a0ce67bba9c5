//! # Context Knowledge
//!
//! Incrementally maintained knowledge cache over a source tree: one analysis per file,
//! one synthesized summary per directory, regenerated only when stale.
//!
//! ## Pipeline
//!
//! ```text
//! Source root
//!     │
//!     ├──> Tree Builder (.gitignore aware)
//!     │      └─> DirectoryNode / FileNode tree
//!     │
//!     ├──> Change Detector + Decision Engine
//!     │      └─> REBUILD / SKIP per node, cascaded to ancestors
//!     │
//!     ├──> Build Orchestrator (bottom-up, bounded)
//!     │      └─> Analyzer ──> Cache Store (atomic writes)
//!     │
//!     └──> Orphan Reaper (leaf-first)
//!            └─> artifacts without a live source removed
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use context_knowledge::{Analyzer, KnowledgeIndexer, RunConfig};
//! use std::sync::Arc;
//!
//! async fn refresh(analyzer: Arc<dyn Analyzer>) -> anyhow::Result<()> {
//!     let indexer = KnowledgeIndexer::new("/path/to/project", RunConfig::from_env())?;
//!     let stats = indexer.build(analyzer).await?;
//!
//!     println!("{}: {} files, {} directories", stats.status, stats.files_completed, stats.directories_rebuilt);
//!     Ok(())
//! }
//! ```

mod config;
mod context;
mod decision;
mod detector;
mod error;
mod generator;
mod indexer;
mod lock;
mod orchestrator;
mod reaper;
mod run_record;
mod stats;
mod store;
mod tree;

pub use config::{RunConfig, DEFAULT_CACHE_DIR_REL};
pub use context::{
    AnalysisContext, AnalysisKind, Analyzer, InclusionPolicy, LogProgress, ProgressSink,
    RunContext,
};
pub use decision::{
    DecisionEngine, DecisionReason, DecisionReport, DecisionSummary, Outcome, RebuildDecision,
};
pub use detector::{source_is_newer, ChangeDetector, StaleReason, Staleness};
pub use error::{GenerationError, KnowledgeError, Result};
pub use generator::{empty_file_analysis, DirectoryInputs, FileOutcome, KnowledgeBuilder};
pub use indexer::KnowledgeIndexer;
pub use lock::LOCK_FILE_NAME;
pub use orchestrator::BuildOrchestrator;
pub use reaper::OrphanReaper;
pub use run_record::{read_last_run, run_record_path, write_run_record, RunRecord};
pub use stats::{NodeFailure, OrphanedCleanupStats, RunStats, RunStatus};
pub use store::{
    decode_artifact, encode_artifact, ArtifactKind, CacheEntry, CacheResult, CacheSnapshot,
    CacheStore, EntryMeta, PrepareOutcome, DIRECTORY_ARTIFACT_SUFFIX, FILE_ARTIFACT_SUFFIX,
    ROOT_ARTIFACT_NAME,
};
pub use tree::{DirectoryNode, FileNode, Node, ScanPolicy, TreeBuilder};
