use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MAX_CONCURRENCY: usize = 32;
const MAX_BATCH_SIZE: usize = 1024;
const MAX_TOLERANCE_MS: u64 = 60_000;

const DEFAULT_BATCH_SIZE: usize = 16;
const DEFAULT_TOLERANCE_MS: u64 = 1_000;

/// Directory (relative to the source root) that holds the knowledge cache by default.
pub const DEFAULT_CACHE_DIR_REL: &str = ".context/knowledge";

/// Run-wide settings for one indexing invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Allowed drift between a source mtime and the mtime recorded in its artifact.
    pub tolerance_ms: u64,
    pub max_concurrent_operations: usize,
    pub batch_size: usize,
    pub continue_on_file_errors: bool,
    /// Cache location; `None` resolves to `<source_root>/.context/knowledge`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_root: Option<PathBuf>,
    /// Directories (relative to the source root) that get their own forced root summary.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handler_roots: Vec<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            tolerance_ms: DEFAULT_TOLERANCE_MS,
            max_concurrent_operations: default_concurrency(),
            batch_size: DEFAULT_BATCH_SIZE,
            continue_on_file_errors: true,
            cache_root: None,
            handler_roots: Vec::new(),
        }
    }
}

impl RunConfig {
    /// Defaults with `CONTEXT_KB_*` environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        let concurrency = std::env::var("CONTEXT_KB_MAX_CONCURRENCY").ok();
        self.max_concurrent_operations = parse_clamped(
            concurrency.as_deref(),
            self.max_concurrent_operations,
            1,
            MAX_CONCURRENCY,
        );

        let batch = std::env::var("CONTEXT_KB_BATCH_SIZE").ok();
        self.batch_size = parse_clamped(batch.as_deref(), self.batch_size, 1, MAX_BATCH_SIZE);

        let tolerance = std::env::var("CONTEXT_KB_TOLERANCE_MS").ok();
        self.tolerance_ms = parse_clamped(
            tolerance.as_deref(),
            self.tolerance_ms,
            0,
            MAX_TOLERANCE_MS,
        );
    }

    /// Clamp values that would stall the scheduler (zero workers, zero-sized batches).
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_concurrent_operations = self.max_concurrent_operations.clamp(1, MAX_CONCURRENCY);
        self.batch_size = self.batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    #[must_use]
    pub fn resolve_cache_root(&self, source_root: &Path) -> PathBuf {
        match &self.cache_root {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => source_root.join(path),
            None => source_root.join(DEFAULT_CACHE_DIR_REL),
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(2, 8)
}

fn parse_clamped<T>(raw: Option<&str>, default_value: T, min: T, max: T) -> T
where
    T: std::str::FromStr + Ord + Copy,
{
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default_value)
        .clamp(min, max)
}
