use anyhow::{bail, Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand};
use context_knowledge::{CacheResult, KnowledgeIndexer, RunConfig, RunStatus};
use std::path::PathBuf;
use std::sync::Arc;

mod analyzer;

use analyzer::CommandAnalyzer;

#[derive(Parser)]
#[command(name = "context-kb")]
#[command(about = "Incremental knowledge cache over a source tree", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors (stdout is reserved for JSON)
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Regenerate stale file analyses and directory summaries
    Build(BuildArgs),

    /// Show which nodes a build would regenerate, without generating anything
    Plan(PlanArgs),

    /// Remove artifacts whose source file or directory no longer exists
    Reap(ReapArgs),

    /// Print the cached artifact for a file or directory
    Show(ShowArgs),
}

#[derive(Args)]
struct ProjectArgs {
    /// Source directory (defaults to current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Cache directory (default: <path>/.context/knowledge)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Allowed mtime drift before a source counts as modified
    #[arg(long)]
    tolerance_ms: Option<u64>,

    /// Directory (relative to <path>) that gets its own root summary; repeatable
    #[arg(long = "handler-root")]
    handler_roots: Vec<PathBuf>,
}

impl ProjectArgs {
    fn indexer(&self, tune: impl FnOnce(&mut RunConfig)) -> Result<KnowledgeIndexer> {
        let path = self.path.canonicalize().context("Invalid project path")?;
        let mut config = RunConfig::from_env();
        config.cache_root = self.cache_dir.clone();
        if let Some(tolerance_ms) = self.tolerance_ms {
            config.tolerance_ms = tolerance_ms;
        }
        config.handler_roots = self.handler_roots.clone();
        tune(&mut config);
        Ok(KnowledgeIndexer::new(path, config)?)
    }
}

#[derive(Args)]
struct BuildArgs {
    #[command(flatten)]
    project: ProjectArgs,

    /// Analyzer program; receives node content on stdin and prints the artifact text
    #[arg(long)]
    analyzer: String,

    /// Extra argument for the analyzer program; repeatable
    #[arg(long = "analyzer-arg", allow_hyphen_values = true)]
    analyzer_args: Vec<String>,

    /// Maximum concurrent generation tasks
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Files released to the worker pool per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Abort the run on the first failed node
    #[arg(long)]
    fail_fast: bool,

    /// Output JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct PlanArgs {
    #[command(flatten)]
    project: ProjectArgs,

    /// Output JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ReapArgs {
    #[command(flatten)]
    project: ProjectArgs,

    /// Output JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ShowArgs {
    #[command(flatten)]
    project: ProjectArgs,

    /// File or directory, relative to the source directory
    #[arg(long)]
    target: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    match cli.command {
        Commands::Build(args) => run_build(args).await?,
        Commands::Plan(args) => run_plan(args).await?,
        Commands::Reap(args) => run_reap(args).await?,
        Commands::Show(args) => run_show(args).await?,
    }

    Ok(())
}

async fn run_build(args: BuildArgs) -> Result<()> {
    let indexer = args.project.indexer(|config| {
        if let Some(max) = args.max_concurrency {
            config.max_concurrent_operations = max;
        }
        if let Some(batch) = args.batch_size {
            config.batch_size = batch;
        }
        if args.fail_fast {
            config.continue_on_file_errors = false;
        }
    })?;
    let analyzer = CommandAnalyzer::new(&args.analyzer, args.analyzer_args.clone());

    let stats = indexer
        .build(Arc::new(analyzer))
        .await
        .context("Build failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        eprintln!(
            "{}: {} of {} files, {} directories, {} cache hits in {}ms",
            stats.status,
            stats.files_completed,
            stats.files_processed,
            stats.directories_rebuilt,
            stats.cache_hits,
            stats.elapsed_ms
        );
        for failure in &stats.failures {
            eprintln!("  {}: {}", failure.path.display(), failure.message);
        }
    }
    if stats.status == RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_plan(args: PlanArgs) -> Result<()> {
    let indexer = args.project.indexer(|_| {})?;
    let report = indexer.plan().await.context("Planning failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for path in report.rebuild_paths() {
        let decision = report.get(path).map(|d| d.reason);
        let relative = indexer.context().relative(path);
        println!(
            "REBUILD {:<28} {}",
            decision.map_or_else(String::new, |reason| format!("{reason:?}")),
            if relative.is_empty() { "." } else { &relative }
        );
    }
    eprintln!(
        "{} of {} nodes need rebuilding",
        report.summary.rebuild, report.summary.total
    );
    Ok(())
}

async fn run_reap(args: ReapArgs) -> Result<()> {
    let indexer = args.project.indexer(|_| {})?;
    let stats = indexer.reap().await.context("Cleanup failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        eprintln!(
            "Removed {} analyses, {} knowledge files, {} directories ({} errors)",
            stats.analysis_files_deleted,
            stats.knowledge_files_deleted,
            stats.directories_deleted,
            stats.errors
        );
    }
    Ok(())
}

async fn run_show(args: ShowArgs) -> Result<()> {
    let indexer = args.project.indexer(|_| {})?;
    let source = indexer.context().source_root.join(&args.target);

    let result = if source.is_dir() {
        indexer.directory_knowledge(&source).await?
    } else {
        indexer.file_analysis(&source).await?
    };
    match result {
        CacheResult::Hit(text) => {
            print!("{text}");
            Ok(())
        }
        CacheResult::Miss => bail!(
            "No current artifact for {} (run `context-kb build` first)",
            args.target.display()
        ),
    }
}
