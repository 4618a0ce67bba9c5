use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Run-level outcome of a build.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node whose artifact could not be produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Statistics about a build run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub status: RunStatus,

    /// Files found by the tree builder
    pub files_discovered: usize,

    /// Files scheduled for regeneration
    pub files_processed: usize,

    /// Files whose artifact was written or confirmed from cache
    pub files_completed: usize,

    /// Files answered from cache without calling the analyzer
    pub cache_hits: usize,

    pub directories_rebuilt: usize,

    /// Time taken in milliseconds
    pub elapsed_ms: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<NodeFailure>,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            status: RunStatus::Completed,
            files_discovered: 0,
            files_processed: 0,
            files_completed: 0,
            cache_hits: 0,
            directories_rebuilt: 0,
            elapsed_ms: 0,
            failures: Vec::new(),
        }
    }

    pub fn add_failure(&mut self, path: impl Into<PathBuf>, message: impl Into<String>) {
        self.failures.push(NodeFailure {
            path: path.into(),
            message: message.into(),
        });
    }

    /// Status for a run that was not aborted.
    pub fn settle(&mut self) {
        if self.status != RunStatus::Failed {
            self.status = if self.failures.is_empty() {
                RunStatus::Completed
            } else {
                RunStatus::CompletedWithErrors
            };
        }
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one orphan-cleanup pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrphanedCleanupStats {
    pub analysis_files_deleted: usize,
    pub knowledge_files_deleted: usize,
    pub directories_deleted: usize,
    pub temp_files_deleted: usize,
    /// Items that could not be inspected or removed; logged and skipped.
    pub errors: usize,
}

impl OrphanedCleanupStats {
    #[must_use]
    pub const fn total_deleted(&self) -> usize {
        self.analysis_files_deleted
            + self.knowledge_files_deleted
            + self.directories_deleted
            + self.temp_files_deleted
    }
}
