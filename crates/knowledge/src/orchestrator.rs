use crate::context::RunContext;
use crate::decision::DecisionReport;
use crate::generator::{DirectoryInputs, FileOutcome, KnowledgeBuilder};
use crate::stats::{RunStats, RunStatus};
use crate::tree::{DirectoryNode, FileNode};
use crate::{KnowledgeError, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

enum Work {
    File(FileNode),
    Directory(DirectoryInputs),
}

impl Work {
    fn path(&self) -> &Path {
        match self {
            Self::File(file) => &file.path,
            Self::Directory(dir) => &dir.path,
        }
    }
}

struct Job {
    work: Arc<Work>,
    parent: Option<usize>,
    /// Children that have not finished yet; the directory runs once this reaches zero.
    pending: usize,
}

enum Finished {
    File(FileOutcome),
    Directory,
}

/// Runs the REBUILD part of a [`DecisionReport`] bottom-up.
///
/// Every job counts its unfinished children. File jobs are released in batches
/// of `batch_size`, directory jobs as soon as their count reaches zero, and at
/// most `max_concurrent_operations` jobs run at once.
pub struct BuildOrchestrator {
    ctx: RunContext,
    builder: Arc<KnowledgeBuilder>,
}

impl BuildOrchestrator {
    pub fn new(ctx: RunContext, builder: KnowledgeBuilder) -> Self {
        Self {
            ctx,
            builder: Arc::new(builder),
        }
    }

    pub async fn run(&self, tree: &DirectoryNode, report: &DecisionReport) -> RunStats {
        let started = Instant::now();
        let mut stats = RunStats::new();
        stats.files_discovered = tree.total_files();

        let mut jobs = Vec::new();
        collect_jobs(tree, report, None, &mut jobs);

        let mut file_queue: VecDeque<usize> = VecDeque::new();
        let mut ready_dirs: VecDeque<usize> = VecDeque::new();
        let mut directory_jobs = 0usize;
        for (idx, job) in jobs.iter().enumerate() {
            match job.work.as_ref() {
                Work::File(_) => file_queue.push_back(idx),
                Work::Directory(_) => {
                    directory_jobs += 1;
                    if job.pending == 0 {
                        ready_dirs.push_back(idx);
                    }
                }
            }
        }
        stats.files_processed = file_queue.len();
        self.ctx.progress.info(&format!(
            "Building knowledge: {} files, {} directories",
            stats.files_processed, directory_jobs
        ));

        let max_concurrent = self.ctx.config.max_concurrent_operations.max(1);
        let batch_size = self.ctx.config.batch_size.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut set: JoinSet<(usize, Result<Finished>)> = JoinSet::new();
        let mut ready_files: VecDeque<usize> = VecDeque::new();
        let mut batch_outstanding = 0usize;

        loop {
            if batch_outstanding == 0 && !file_queue.is_empty() {
                let take = batch_size.min(file_queue.len());
                ready_files.extend(file_queue.drain(..take));
                batch_outstanding = take;
                self.ctx
                    .progress
                    .debug(&format!("Released batch of {take} files"));
            }

            while let Ok(permit) = semaphore.clone().try_acquire_owned() {
                let Some(idx) = ready_dirs.pop_front().or_else(|| ready_files.pop_front()) else {
                    break;
                };
                let work = jobs[idx].work.clone();
                let builder = self.builder.clone();
                set.spawn(async move {
                    let _permit = permit;
                    let finished = match work.as_ref() {
                        Work::File(file) => builder.build_file(file).await.map(Finished::File),
                        Work::Directory(dir) => builder
                            .build_directory(dir)
                            .await
                            .map(|()| Finished::Directory),
                    };
                    (idx, finished)
                });
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            let (idx, finished) = match joined {
                Ok(done) => done,
                Err(err) => {
                    // The job index is lost with a panicked task, so nothing can be unblocked.
                    self.ctx.progress.error(&format!("Build task failed: {err}"));
                    stats.add_failure(&self.ctx.source_root, format!("task failed: {err}"));
                    stats.status = RunStatus::Failed;
                    set.abort_all();
                    break;
                }
            };

            let is_file = matches!(jobs[idx].work.as_ref(), Work::File(_));
            if is_file {
                batch_outstanding = batch_outstanding.saturating_sub(1);
            }

            match finished {
                Ok(Finished::File(outcome)) => {
                    stats.files_completed += 1;
                    if outcome == FileOutcome::CacheHit {
                        stats.cache_hits += 1;
                    }
                }
                Ok(Finished::Directory) => stats.directories_rebuilt += 1,
                Err(err) => {
                    let path = jobs[idx].work.path().to_path_buf();
                    let fatal = matches!(err, KnowledgeError::Fatal(_))
                        || !self.ctx.config.continue_on_file_errors;
                    stats.add_failure(&path, failure_message(&err));
                    if fatal {
                        self.ctx.progress.error(&format!(
                            "Aborting build after failure on {}: {err}",
                            self.ctx.relative(&path)
                        ));
                        stats.status = RunStatus::Failed;
                        set.abort_all();
                        break;
                    }
                    self.ctx.progress.warning(&format!(
                        "Failed to build {}: {err}",
                        self.ctx.relative(&path)
                    ));
                }
            }

            if let Some(parent) = jobs[idx].parent {
                let job = &mut jobs[parent];
                job.pending = job.pending.saturating_sub(1);
                if job.pending == 0 {
                    ready_dirs.push_back(parent);
                }
            }
        }

        // Aborted tasks are cancelled; their partial results are discarded.
        while set.join_next().await.is_some() {}

        stats.settle();
        stats.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.ctx.progress.info(&format!(
            "Build {}: {}/{} files, {} directories, {} failures in {} ms",
            stats.status,
            stats.files_completed,
            stats.files_processed,
            stats.directories_rebuilt,
            stats.failures.len(),
            stats.elapsed_ms
        ));
        stats
    }
}

/// Post-order job list. SKIP subtrees are never entered: cascading guarantees they hold no
/// REBUILD descendants.
fn collect_jobs(
    dir: &DirectoryNode,
    report: &DecisionReport,
    parent: Option<usize>,
    jobs: &mut Vec<Job>,
) -> Option<usize> {
    if !report.needs_rebuild(&dir.path) {
        return None;
    }

    let mut children = Vec::new();
    for child in &dir.dirs {
        if let Some(idx) = collect_jobs(child, report, None, jobs) {
            children.push(idx);
        }
    }
    for file in dir.files.iter().filter(|file| report.needs_rebuild(&file.path)) {
        children.push(jobs.len());
        jobs.push(Job {
            work: Arc::new(Work::File(file.clone())),
            parent: None,
            pending: 0,
        });
    }

    let idx = jobs.len();
    let siblings: Vec<PathBuf> = report.siblings_of(&dir.path).to_vec();
    jobs.push(Job {
        work: Arc::new(Work::Directory(DirectoryInputs::from_node(dir, &siblings))),
        parent,
        pending: children.len(),
    });
    for child in children {
        jobs[child].parent = Some(idx);
    }
    Some(idx)
}

fn failure_message(err: &KnowledgeError) -> String {
    match err {
        KnowledgeError::Generation(generation) => generation.message.clone(),
        other => other.to_string(),
    }
}
