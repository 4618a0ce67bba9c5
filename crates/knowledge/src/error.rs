use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KnowledgeError>;

#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Run aborted: {0}")]
    Fatal(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Failure reported by the analyzer for a single node.
///
/// Recoverable at run level when `continue_on_file_errors` is set.
#[derive(Error, Debug, Clone)]
#[error("{}: {message}", path.display())]
pub struct GenerationError {
    pub path: PathBuf,
    pub message: String,
}

impl GenerationError {
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}
