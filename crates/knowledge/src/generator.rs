use crate::context::{AnalysisContext, AnalysisKind, Analyzer, RunContext};
use crate::store::{ArtifactKind, CacheResult, CacheStore};
use crate::tree::{DirectoryNode, FileNode};
use crate::{KnowledgeError, Result};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const UNAVAILABLE: &str = "(analysis unavailable)";

/// Analysis written for zero-byte files instead of calling the analyzer.
///
/// Contains no timestamps so regenerating it yields identical bytes.
#[must_use]
pub fn empty_file_analysis(relative_path: &str) -> String {
    format!(
        "# {relative_path}\n\
         \n\
         ## Summary\n\
         Empty file (0 bytes). There is no content to analyze.\n\
         \n\
         ## Key Elements\n\
         None.\n\
         \n\
         ## Dependencies\n\
         None.\n\
         \n\
         <!-- end of analysis -->\n"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Analyzed,
    CacheHit,
    Templated,
}

/// Owned description of a directory to synthesize; the in-memory tree stays with the caller.
#[derive(Debug, Clone)]
pub struct DirectoryInputs {
    pub path: PathBuf,
    pub mtime_ms: u64,
    pub is_tree_root: bool,
    pub files: Vec<PathBuf>,
    pub subdirs: Vec<(PathBuf, ArtifactKind)>,
    pub siblings: Vec<PathBuf>,
}

impl DirectoryInputs {
    #[must_use]
    pub fn from_node(dir: &DirectoryNode, siblings: &[PathBuf]) -> Self {
        Self {
            path: dir.path.clone(),
            mtime_ms: dir.mtime_ms,
            is_tree_root: dir.is_tree_root,
            files: dir.files.iter().map(|file| file.path.clone()).collect(),
            subdirs: dir
                .dirs
                .iter()
                .filter(|child| !child.is_empty())
                .map(|child| (child.path.clone(), ArtifactKind::for_directory(child)))
                .collect(),
            siblings: siblings.to_vec(),
        }
    }

    fn artifact_kind(&self) -> ArtifactKind {
        if self.is_tree_root {
            ArtifactKind::RootKnowledge
        } else {
            ArtifactKind::DirectoryKnowledge
        }
    }
}

/// Produces file analyses and directory summaries, cache-first.
pub struct KnowledgeBuilder {
    ctx: RunContext,
    store: CacheStore,
    analyzer: Arc<dyn Analyzer>,
}

impl KnowledgeBuilder {
    pub fn new(ctx: RunContext, store: CacheStore, analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            ctx,
            store,
            analyzer,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub async fn build_file(&self, file: &FileNode) -> Result<FileOutcome> {
        let relative_path = self.ctx.relative(&file.path);

        if file.size == 0 {
            let text = empty_file_analysis(&relative_path);
            self.persist(&file.path, ArtifactKind::FileAnalysis, &text, file.mtime_ms)
                .await?;
            return Ok(FileOutcome::Templated);
        }

        if let CacheResult::Hit(_) = self.store.get(&file.path, ArtifactKind::FileAnalysis).await? {
            self.ctx
                .progress
                .debug(&format!("Cache hit for {relative_path}"));
            return Ok(FileOutcome::CacheHit);
        }

        let bytes = tokio::fs::read(&file.path).await?;
        let content = String::from_utf8_lossy(&bytes);
        let context = AnalysisContext {
            relative_path,
            kind: AnalysisKind::File,
            sibling_context: Vec::new(),
        };
        let text = self.analyzer.analyze(&content, &context).await?;
        self.persist(&file.path, ArtifactKind::FileAnalysis, &text, file.mtime_ms)
            .await?;
        self.ctx
            .progress
            .debug(&format!("Analyzed {}", context.relative_path));
        Ok(FileOutcome::Analyzed)
    }

    /// Synthesize a directory summary from whatever child artifacts exist right now.
    pub async fn build_directory(&self, dir: &DirectoryInputs) -> Result<()> {
        let kind = if dir.is_tree_root {
            AnalysisKind::ProjectRoot
        } else {
            AnalysisKind::Directory
        };
        let context = AnalysisContext {
            relative_path: self.ctx.relative(&dir.path),
            kind,
            sibling_context: dir
                .siblings
                .iter()
                .map(|path| self.ctx.relative(path))
                .collect(),
        };

        let prompt = self.synthesis_input(dir, &context).await?;
        let text = self.analyzer.analyze(&prompt, &context).await?;
        self.persist(&dir.path, dir.artifact_kind(), &text, dir.mtime_ms)
            .await?;
        self.ctx.progress.debug(&format!(
            "Synthesized {} knowledge for {}",
            kind.as_str(),
            display_relative(&context.relative_path)
        ));
        Ok(())
    }

    /// Write failures are fatal and abort the run even under `continue_on_file_errors`.
    async fn persist(
        &self,
        source: &Path,
        kind: ArtifactKind,
        text: &str,
        source_mtime_ms: u64,
    ) -> Result<()> {
        match self.store.put(source, kind, text, source_mtime_ms).await {
            Ok(_) => Ok(()),
            Err(err) => Err(KnowledgeError::Fatal(format!(
                "cannot write knowledge for {}: {err}",
                display_relative(&self.ctx.relative(source))
            ))),
        }
    }

    async fn synthesis_input(
        &self,
        dir: &DirectoryInputs,
        context: &AnalysisContext,
    ) -> Result<String> {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "# Directory: {}\n",
            display_relative(&context.relative_path)
        );

        if !dir.files.is_empty() {
            out.push_str("## Files\n\n");
            for file in &dir.files {
                let text = self
                    .store
                    .read_entry(file, ArtifactKind::FileAnalysis)
                    .await?
                    .map(|entry| entry.text);
                push_section(&mut out, &self.ctx.relative(file), text.as_deref());
            }
        }

        if !dir.subdirs.is_empty() {
            out.push_str("## Subdirectories\n\n");
            for (path, kind) in &dir.subdirs {
                let text = self
                    .store
                    .read_entry(path, *kind)
                    .await?
                    .map(|entry| entry.text);
                push_section(&mut out, &self.ctx.relative(path), text.as_deref());
            }
        }

        if !context.sibling_context.is_empty() {
            out.push_str("## Unchanged sibling directories (context only)\n\n");
            for sibling in &context.sibling_context {
                let _ = writeln!(out, "- {sibling}");
            }
            out.push('\n');
        }

        Ok(out)
    }
}

fn push_section(out: &mut String, title: &str, text: Option<&str>) {
    let _ = writeln!(out, "### {title}\n");
    out.push_str(text.map_or(UNAVAILABLE, str::trim_end));
    out.push_str("\n\n");
}

fn display_relative(relative: &str) -> &str {
    if relative.is_empty() {
        "."
    } else {
        relative
    }
}
