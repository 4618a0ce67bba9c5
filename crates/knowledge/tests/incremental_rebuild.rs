use async_trait::async_trait;
use context_knowledge::{
    AnalysisContext, AnalysisKind, Analyzer, CacheResult, DecisionReason, GenerationError,
    KnowledgeIndexer, Outcome, ProgressSink, RunConfig, RunContext, RunStatus,
};
use filetime::{set_file_mtime, FileTime};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const BASE_MTIME: i64 = 1_700_000_000;

/// Deterministic analyzer: records every call and fails for configured paths.
#[derive(Default)]
struct StubAnalyzer {
    calls: Mutex<Vec<(String, AnalysisKind, String)>>,
    failing: HashSet<String>,
}

impl StubAnalyzer {
    fn failing(paths: &[&str]) -> Self {
        Self {
            failing: paths.iter().map(|p| (*p).to_string()).collect(),
            ..Self::default()
        }
    }

    fn called_paths(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(path, _, _)| path.clone())
            .collect()
    }

    fn prompt_for(&self, path: &str) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _, _)| p == path)
            .map(|(_, _, content)| content.clone())
    }
}

#[async_trait]
impl Analyzer for StubAnalyzer {
    async fn analyze(
        &self,
        content: &str,
        context: &AnalysisContext,
    ) -> Result<String, GenerationError> {
        self.calls.lock().unwrap().push((
            context.relative_path.clone(),
            context.kind,
            content.to_string(),
        ));
        if self.failing.contains(&context.relative_path) {
            return Err(GenerationError::new(&context.relative_path, "stub failure"));
        }
        Ok(format!(
            "{} analysis of `{}`\n",
            context.kind.as_str(),
            context.relative_path
        ))
    }
}

struct Fixture {
    temp: TempDir,
}

impl Fixture {
    /// src/{top.rs, a/{b/{c/leaf.txt}, d/other.txt}} with a cache outside the source tree.
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let fixture = Self { temp };
        fixture.write("top.rs", "fn top() {}");
        fixture.write("a/b/c/leaf.txt", "leaf");
        fixture.write("a/d/other.txt", "other");
        fixture
    }

    fn src(&self) -> PathBuf {
        self.temp.path().join("src")
    }

    fn cache(&self) -> PathBuf {
        self.temp.path().join("cache")
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.src().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(BASE_MTIME, 0)).unwrap();
    }

    fn touch_later(&self, rel: &str, content: &str) {
        let path = self.src().join(rel);
        fs::write(&path, content).unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(BASE_MTIME + 100, 0)).unwrap();
    }

    fn config(&self) -> RunConfig {
        RunConfig {
            cache_root: Some(self.cache()),
            max_concurrent_operations: 4,
            batch_size: 2,
            ..RunConfig::default()
        }
    }

    fn indexer(&self) -> KnowledgeIndexer {
        KnowledgeIndexer::new(self.src(), self.config()).unwrap()
    }

    fn indexer_with(&self, tune: impl FnOnce(&mut RunConfig)) -> KnowledgeIndexer {
        let mut config = self.config();
        tune(&mut config);
        KnowledgeIndexer::new(self.src(), config).unwrap()
    }
}

fn sorted(mut paths: Vec<String>) -> Vec<String> {
    paths.sort();
    paths
}

#[tokio::test]
async fn first_build_generates_everything_bottom_up() {
    let fixture = Fixture::new();
    let analyzer = Arc::new(StubAnalyzer::default());

    let stats = fixture.indexer().build(analyzer.clone()).await.unwrap();

    assert_eq!(stats.status, RunStatus::Completed);
    assert_eq!(stats.files_discovered, 3);
    assert_eq!(stats.files_completed, 3);
    assert_eq!(stats.directories_rebuilt, 5);
    assert!(stats.failures.is_empty());

    let cache = fixture.cache();
    assert!(cache.join("project_kb.md").is_file());
    assert!(cache.join("top.rs.analysis.md").is_file());
    assert!(cache.join("a/a_kb.md").is_file());
    assert!(cache.join("a/b/c/c_kb.md").is_file());
    assert!(cache.join("a/b/c/leaf.txt.analysis.md").is_file());

    // A directory is analyzed only after everything beneath it.
    let order = analyzer.called_paths();
    let position = |path: &str| order.iter().position(|p| p == path).unwrap();
    assert!(position("a/b/c/leaf.txt") < position("a/b/c"));
    assert!(position("a/b/c") < position("a/b"));
    assert!(position("a/b") < position("a"));
    assert!(position("a/d") < position("a"));
    assert!(position("a") < position(""));
    assert!(position("top.rs") < position(""));
}

#[tokio::test]
async fn unchanged_tree_only_regenerates_root() {
    let fixture = Fixture::new();
    fixture
        .indexer()
        .build(Arc::new(StubAnalyzer::default()))
        .await
        .unwrap();

    let analyzer = Arc::new(StubAnalyzer::default());
    let stats = fixture.indexer().build(analyzer.clone()).await.unwrap();

    assert_eq!(stats.status, RunStatus::Completed);
    assert_eq!(stats.files_processed, 0);
    assert_eq!(stats.directories_rebuilt, 1);
    assert_eq!(analyzer.called_paths(), vec![String::new()]);
}

#[tokio::test]
async fn deep_change_cascades_to_ancestors_only() {
    let fixture = Fixture::new();
    fixture
        .indexer()
        .build(Arc::new(StubAnalyzer::default()))
        .await
        .unwrap();

    fixture.touch_later("a/b/c/leaf.txt", "leaf v2");

    let report = fixture.indexer().plan().await.unwrap();
    let src = fixture.src();
    for rel in ["a/b/c", "a/b", "a"] {
        assert_eq!(
            report.get(&src.join(rel)).unwrap().outcome,
            Outcome::Rebuild,
            "{rel}"
        );
    }
    assert_eq!(
        report.get(&src).unwrap().reason,
        DecisionReason::ProjectRootForced
    );
    assert_eq!(report.get(&src.join("a/d")).unwrap().outcome, Outcome::Skip);
    assert_eq!(report.siblings_of(&src.join("a/b")), &[src.join("a/d")]);

    let analyzer = Arc::new(StubAnalyzer::default());
    let stats = fixture.indexer().build(analyzer.clone()).await.unwrap();
    assert_eq!(stats.files_processed, 1);
    assert_eq!(stats.directories_rebuilt, 4);
    assert_eq!(
        sorted(analyzer.called_paths()),
        sorted(vec![
            String::new(),
            "a".into(),
            "a/b".into(),
            "a/b/c".into(),
            "a/b/c/leaf.txt".into(),
        ])
    );
    assert_eq!(
        analyzer.prompt_for("a/b/c/leaf.txt").as_deref(),
        Some("leaf v2")
    );
}

#[tokio::test]
async fn added_file_invalidates_its_directory() {
    let fixture = Fixture::new();
    fixture
        .indexer()
        .build(Arc::new(StubAnalyzer::default()))
        .await
        .unwrap();

    fixture.write("a/d/new.txt", "new");
    let analyzer = Arc::new(StubAnalyzer::default());
    fixture.indexer().build(analyzer.clone()).await.unwrap();

    let called = analyzer.called_paths();
    assert!(called.contains(&"a/d/new.txt".to_string()));
    assert!(called.contains(&"a/d".to_string()));
    assert!(!called.contains(&"a/d/other.txt".to_string()));
    assert!(!called.contains(&"a/b".to_string()));
}

#[tokio::test]
async fn file_failure_is_recorded_and_run_continues() {
    let fixture = Fixture::new();
    let analyzer = Arc::new(StubAnalyzer::failing(&["a/b/c/leaf.txt"]));

    let stats = fixture.indexer().build(analyzer.clone()).await.unwrap();

    assert_eq!(stats.status, RunStatus::CompletedWithErrors);
    assert_eq!(stats.failures.len(), 1);
    assert_eq!(stats.failures[0].path, fixture.src().join("a/b/c/leaf.txt"));
    assert_eq!(stats.files_completed, 2);
    assert_eq!(stats.directories_rebuilt, 5);
    let prompt = analyzer.prompt_for("a/b/c").unwrap();
    assert!(prompt.contains("(analysis unavailable)"), "{prompt}");

    let record = fixture.indexer().last_run().await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::CompletedWithErrors);
    assert_eq!(record.failure_count, 1);

    // The failed file has no artifact, so the next run retries it.
    let retry = Arc::new(StubAnalyzer::default());
    let stats = fixture.indexer().build(retry.clone()).await.unwrap();
    assert_eq!(stats.status, RunStatus::Completed);
    assert!(retry
        .called_paths()
        .contains(&"a/b/c/leaf.txt".to_string()));
}

#[tokio::test]
async fn fail_fast_aborts_and_reports_failed() {
    let fixture = Fixture::new();
    let analyzer = Arc::new(StubAnalyzer::failing(&["a/b/c/leaf.txt"]));
    let indexer = fixture.indexer_with(|config| {
        config.continue_on_file_errors = false;
        config.max_concurrent_operations = 1;
        config.batch_size = 1;
    });

    let stats = indexer.build(analyzer.clone()).await.unwrap();

    assert_eq!(stats.status, RunStatus::Failed);
    assert_eq!(stats.failures.len(), 1);
    assert!(!analyzer.called_paths().contains(&String::new()));
    assert!(!fixture.cache().join("project_kb.md").exists());
    let record = indexer.last_run().await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
}

#[tokio::test]
async fn unwritable_cache_aborts_even_when_continuing_on_errors() {
    let fixture = Fixture::new();
    fs::create_dir_all(fixture.cache()).unwrap();
    // A plain file where the mirror of `a/` belongs.
    fs::write(fixture.cache().join("a"), "blocker").unwrap();
    let indexer = fixture.indexer_with(|config| {
        config.continue_on_file_errors = true;
        config.max_concurrent_operations = 1;
        config.batch_size = 1;
    });

    let stats = indexer.build(Arc::new(StubAnalyzer::default())).await.unwrap();

    assert_eq!(stats.status, RunStatus::Failed);
    assert_eq!(stats.failures.len(), 1);
    assert!(stats.failures[0].path.starts_with(fixture.src().join("a")));
    assert!(!fixture.cache().join("project_kb.md").exists());
    let record = indexer.last_run().await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
}

#[tokio::test]
async fn empty_files_never_reach_the_analyzer() {
    let fixture = Fixture::new();
    fixture.write("a/empty.rs", "");
    let analyzer = Arc::new(StubAnalyzer::default());

    fixture.indexer().build(analyzer.clone()).await.unwrap();
    assert!(!analyzer.called_paths().contains(&"a/empty.rs".to_string()));

    let first = fixture.indexer().file_analysis("a/empty.rs").await.unwrap();
    fs::remove_dir_all(fixture.cache()).unwrap();
    fixture
        .indexer()
        .build(Arc::new(StubAnalyzer::default()))
        .await
        .unwrap();
    let second = fixture.indexer().file_analysis("a/empty.rs").await.unwrap();

    assert!(first.is_hit());
    assert_eq!(first, second);
}

#[tokio::test]
async fn empty_directories_get_no_artifacts() {
    let fixture = Fixture::new();
    fs::create_dir_all(fixture.src().join("a/empty")).unwrap();

    let report = fixture.indexer().plan().await.unwrap();
    assert_eq!(
        report.get(&fixture.src().join("a/empty")).unwrap().reason,
        DecisionReason::EmptyDirectory
    );

    fixture
        .indexer()
        .build(Arc::new(StubAnalyzer::default()))
        .await
        .unwrap();
    assert!(!fixture.cache().join("a/empty").exists());
}

#[tokio::test]
async fn plan_writes_nothing() {
    let fixture = Fixture::new();
    let report = fixture.indexer().plan().await.unwrap();
    assert_eq!(report.summary.rebuild, report.summary.total);
    assert!(!fixture.cache().exists());
}

#[tokio::test]
async fn retrieval_misses_once_the_source_changes() {
    let fixture = Fixture::new();
    let indexer = fixture.indexer();
    indexer
        .build(Arc::new(StubAnalyzer::default()))
        .await
        .unwrap();

    assert_eq!(
        indexer.file_analysis("top.rs").await.unwrap(),
        CacheResult::Hit("file analysis of `top.rs`\n".to_string())
    );
    assert_eq!(
        indexer.directory_knowledge("a/b").await.unwrap(),
        CacheResult::Hit("directory analysis of `a/b`\n".to_string())
    );
    assert!(indexer
        .directory_knowledge(fixture.src())
        .await
        .unwrap()
        .is_hit());

    fixture.touch_later("top.rs", "fn top() { changed() }");
    assert_eq!(
        indexer.file_analysis("top.rs").await.unwrap(),
        CacheResult::Miss
    );
}

#[tokio::test]
async fn directory_knowledge_misses_when_a_descendant_changes_in_place() {
    let fixture = Fixture::new();
    let indexer = fixture.indexer();
    indexer
        .build(Arc::new(StubAnalyzer::default()))
        .await
        .unwrap();
    assert!(indexer.directory_knowledge("a").await.unwrap().is_hit());

    // Rewriting an existing file leaves every directory mtime untouched.
    fixture.touch_later("a/b/c/leaf.txt", "leaf v2");

    for stale in ["a/b/c", "a/b", "a"] {
        assert_eq!(
            indexer.directory_knowledge(stale).await.unwrap(),
            CacheResult::Miss,
            "{stale}"
        );
    }
    assert_eq!(
        indexer.directory_knowledge(fixture.src()).await.unwrap(),
        CacheResult::Miss
    );
    assert_eq!(
        indexer.directory_knowledge("a/d").await.unwrap(),
        CacheResult::Hit("directory analysis of `a/d`\n".to_string())
    );
    assert_eq!(
        indexer.directory_knowledge("no/such/dir").await.unwrap(),
        CacheResult::Miss
    );
}

#[tokio::test]
async fn handler_roots_get_their_own_root_summary() {
    let fixture = Fixture::new();
    let indexer = fixture.indexer_with(|config| {
        config.handler_roots = vec![PathBuf::from("a/d")];
    });
    let analyzer = Arc::new(StubAnalyzer::default());
    indexer.build(analyzer.clone()).await.unwrap();

    assert!(fixture.cache().join("a/d/project_kb.md").is_file());
    assert!(!fixture.cache().join("a/d/d_kb.md").exists());
    assert!(indexer.directory_knowledge("a/d").await.unwrap().is_hit());

    let report = indexer.plan().await.unwrap();
    assert_eq!(
        report.get(&fixture.src().join("a/d")).unwrap().reason,
        DecisionReason::ProjectRootForced
    );
    assert!(report.needs_rebuild(&fixture.src().join("a")));
}

#[tokio::test]
async fn reap_after_delete_removes_only_orphans() {
    let fixture = Fixture::new();
    let indexer = fixture.indexer();
    indexer
        .build(Arc::new(StubAnalyzer::default()))
        .await
        .unwrap();

    fs::remove_dir_all(fixture.src().join("a/d")).unwrap();
    let stats = indexer.reap().await.unwrap();

    assert_eq!(stats.analysis_files_deleted, 1);
    assert_eq!(stats.knowledge_files_deleted, 1);
    assert_eq!(stats.directories_deleted, 1);
    assert_eq!(stats.errors, 0);

    let cache = fixture.cache();
    assert!(!cache.join("a/d").exists());
    for kept in [
        "project_kb.md",
        "top.rs.analysis.md",
        "a/a_kb.md",
        "a/b/b_kb.md",
        "a/b/c/leaf.txt.analysis.md",
        "last_run.json",
    ] {
        assert!(cache.join(kept).is_file(), "{kept} should survive");
    }

    // Nothing left to reap.
    assert_eq!(indexer.reap().await.unwrap().total_deleted(), 0);
}

#[tokio::test]
async fn cache_inside_source_tree_is_not_indexed() {
    let fixture = Fixture::new();
    let indexer = KnowledgeIndexer::new(
        fixture.src(),
        RunConfig {
            cache_root: None,
            ..fixture.config()
        },
    )
    .unwrap();
    let analyzer = Arc::new(StubAnalyzer::default());
    indexer.build(analyzer.clone()).await.unwrap();
    indexer
        .build(Arc::new(StubAnalyzer::default()))
        .await
        .unwrap();

    let inner = fixture.src().join(".context/knowledge");
    assert!(inner.join("project_kb.md").is_file());
    assert!(analyzer
        .called_paths()
        .iter()
        .all(|path| !path.starts_with(".context")));
    let report = indexer.plan().await.unwrap();
    assert!(report
        .decisions
        .keys()
        .all(|path| !path.starts_with(&inner)));
}

#[derive(Default)]
struct CollectingProgress {
    messages: Mutex<Vec<(&'static str, String)>>,
}

impl CollectingProgress {
    fn push(&self, level: &'static str, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((level, message.to_string()));
    }
}

impl ProgressSink for CollectingProgress {
    fn info(&self, message: &str) {
        self.push("info", message);
    }

    fn debug(&self, message: &str) {
        self.push("debug", message);
    }

    fn warning(&self, message: &str) {
        self.push("warning", message);
    }

    fn error(&self, message: &str) {
        self.push("error", message);
    }
}

#[tokio::test]
async fn progress_sink_receives_build_messages() {
    let fixture = Fixture::new();
    let progress = Arc::new(CollectingProgress::default());
    let ctx = RunContext::new(fixture.src(), fixture.config()).with_progress(progress.clone());
    let indexer = KnowledgeIndexer::with_context(ctx);

    indexer
        .build(Arc::new(StubAnalyzer::failing(&["top.rs"])))
        .await
        .unwrap();

    let messages = progress.messages.lock().unwrap();
    assert!(messages
        .iter()
        .any(|(level, msg)| *level == "info" && msg.starts_with("Building knowledge: 3 files")));
    assert!(messages
        .iter()
        .any(|(level, msg)| *level == "warning" && msg.contains("top.rs")));
}

#[test]
fn missing_source_root_is_rejected() {
    let temp = TempDir::new().unwrap();
    assert!(KnowledgeIndexer::new(temp.path().join("absent"), RunConfig::default()).is_err());
}
