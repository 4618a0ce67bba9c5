use crate::stats::{RunStats, RunStatus};
use crate::store::unix_now_ms;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

const MAX_FAILURES: usize = 5;
pub const RUN_RECORD_FILE_NAME: &str = "last_run.json";

/// Snapshot persisted to `<cache_root>/last_run.json` so other processes can
/// report on the most recent build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub finished_unix_ms: u64,
    pub status: RunStatus,
    pub elapsed_ms: u64,
    pub files_discovered: usize,
    pub files_completed: usize,
    pub cache_hits: usize,
    pub directories_rebuilt: usize,
    pub failure_count: usize,
    /// The most recent failures, `path: message`, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_unix_ms: Option<u64>,
}

impl RunRecord {
    fn from_stats(stats: &RunStats, previous: Option<&Self>) -> Self {
        let now = unix_now_ms();
        let mut failure_reasons: Vec<String> = stats
            .failures
            .iter()
            .map(|failure| format!("{}: {}", failure.path.display(), failure.message))
            .collect();
        if failure_reasons.len() > MAX_FAILURES {
            let start = failure_reasons.len() - MAX_FAILURES;
            failure_reasons = failure_reasons.split_off(start);
        }
        let last_success_unix_ms = if stats.status == RunStatus::Failed {
            previous.and_then(|record| record.last_success_unix_ms)
        } else {
            Some(now)
        };
        Self {
            finished_unix_ms: now,
            status: stats.status,
            elapsed_ms: stats.elapsed_ms,
            files_discovered: stats.files_discovered,
            files_completed: stats.files_completed,
            cache_hits: stats.cache_hits,
            directories_rebuilt: stats.directories_rebuilt,
            failure_count: stats.failures.len(),
            failure_reasons,
            last_success_unix_ms,
        }
    }
}

pub fn run_record_path(cache_root: &Path) -> PathBuf {
    cache_root.join(RUN_RECORD_FILE_NAME)
}

pub async fn write_run_record(cache_root: &Path, stats: &RunStats) -> Result<RunRecord> {
    let previous = read_last_run(cache_root).await.ok().flatten();
    let record = RunRecord::from_stats(stats, previous.as_ref());

    let path = run_record_path(cache_root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(&record)?;
    fs::write(&path, data).await?;
    Ok(record)
}

pub async fn read_last_run(cache_root: &Path) -> Result<Option<RunRecord>> {
    let path = run_record_path(cache_root);
    match fs::read(&path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
