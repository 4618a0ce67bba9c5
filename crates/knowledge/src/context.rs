use crate::config::RunConfig;
use crate::error::GenerationError;
use crate::tree::ScanPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Decides which source entries take part in a run.
pub trait InclusionPolicy: Send + Sync {
    fn should_process_file(&self, path: &Path) -> bool;
    fn should_process_directory(&self, path: &Path) -> bool;
}

/// Receives human-readable progress messages. Nothing is returned to the engine.
pub trait ProgressSink: Send + Sync {
    fn info(&self, message: &str);
    fn debug(&self, message: &str);
    fn warning(&self, message: &str);
    fn error(&self, message: &str);
}

/// Default sink: forwards everything to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn info(&self, message: &str) {
        log::info!(target: "context_knowledge", "{message}");
    }

    fn debug(&self, message: &str) {
        log::debug!(target: "context_knowledge", "{message}");
    }

    fn warning(&self, message: &str) {
        log::warn!(target: "context_knowledge", "{message}");
    }

    fn error(&self, message: &str) {
        log::error!(target: "context_knowledge", "{message}");
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    File,
    Directory,
    ProjectRoot,
}

impl AnalysisKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::ProjectRoot => "project_root",
        }
    }
}

/// What the analyzer is told about the node whose content it receives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisContext {
    /// Path relative to the source root, `/`-separated; empty for the root itself.
    pub relative_path: String,
    pub kind: AnalysisKind,
    /// Unchanged sibling directories, informational only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sibling_context: Vec<String>,
}

/// The LLM collaborator.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        content: &str,
        context: &AnalysisContext,
    ) -> std::result::Result<String, GenerationError>;
}

/// Everything a run needs, built once per invocation and passed down explicitly.
#[derive(Clone)]
pub struct RunContext {
    pub source_root: PathBuf,
    pub cache_root: PathBuf,
    pub config: RunConfig,
    pub policy: Arc<dyn InclusionPolicy>,
    pub progress: Arc<dyn ProgressSink>,
}

impl RunContext {
    /// Context with the default scan policy and log-backed progress.
    #[must_use]
    pub fn new(source_root: impl Into<PathBuf>, config: RunConfig) -> Self {
        let source_root = source_root.into();
        let config = config.normalized();
        let cache_root = config.resolve_cache_root(&source_root);
        let policy = Arc::new(ScanPolicy::new(&source_root).excluding(&cache_root));
        Self {
            source_root,
            cache_root,
            config,
            policy,
            progress: Arc::new(LogProgress),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn InclusionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// `/`-separated path relative to the source root.
    #[must_use]
    pub fn relative(&self, path: &Path) -> String {
        normalize_relative(&self.source_root, path)
    }
}

pub(crate) fn normalize_relative(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut normalized = relative.to_string_lossy().to_string();
    if normalized.contains('\\') {
        normalized = normalized.replace('\\', "/");
    }
    normalized
}
