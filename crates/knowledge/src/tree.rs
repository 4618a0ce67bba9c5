use crate::context::{InclusionPolicy, RunContext};
use crate::error::{KnowledgeError, Result};
use ignore::WalkBuilder;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Snapshot of one source file, taken once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileNode {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_ms: u64,
}

/// A directory and everything the inclusion policy let through beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryNode {
    pub path: PathBuf,
    pub mtime_ms: u64,
    pub files: Vec<FileNode>,
    pub dirs: Vec<DirectoryNode>,
    /// Set for the run root and for designated handler roots.
    pub is_tree_root: bool,
}

/// Borrowed view over either node type.
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    File(&'a FileNode),
    Directory(&'a DirectoryNode),
}

impl Node<'_> {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Node::File(file) => &file.path,
            Node::Directory(dir) => &dir.path,
        }
    }
}

impl DirectoryNode {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, mtime_ms: u64) -> Self {
        Self {
            path: path.into(),
            mtime_ms,
            files: Vec::new(),
            dirs: Vec::new(),
            is_tree_root: false,
        }
    }

    /// No files and no subdirectories survived the inclusion policy.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }

    /// Every directory in the subtree, children before parents.
    #[must_use]
    pub fn post_order_dirs(&self) -> Vec<&DirectoryNode> {
        let mut out = Vec::new();
        collect_post_order_dirs(self, &mut out);
        out
    }

    /// Every node in the subtree; a directory's files and subdirectories precede it.
    #[must_use]
    pub fn post_order(&self) -> Vec<Node<'_>> {
        let mut out = Vec::new();
        collect_post_order(self, &mut out);
        out
    }

    #[must_use]
    pub fn total_files(&self) -> usize {
        self.files.len() + self.dirs.iter().map(DirectoryNode::total_files).sum::<usize>()
    }

    #[must_use]
    pub fn find_directory(&self, path: &Path) -> Option<&DirectoryNode> {
        if self.path == path {
            return Some(self);
        }
        if !path.starts_with(&self.path) {
            return None;
        }
        self.dirs.iter().find_map(|dir| dir.find_directory(path))
    }

    fn sort_children(&mut self) {
        self.files.sort_by(|a, b| a.path.cmp(&b.path));
        self.dirs.sort_by(|a, b| a.path.cmp(&b.path));
    }
}

fn collect_post_order_dirs<'a>(dir: &'a DirectoryNode, out: &mut Vec<&'a DirectoryNode>) {
    for child in &dir.dirs {
        collect_post_order_dirs(child, out);
    }
    out.push(dir);
}

fn collect_post_order<'a>(dir: &'a DirectoryNode, out: &mut Vec<Node<'a>>) {
    for child in &dir.dirs {
        collect_post_order(child, out);
    }
    out.extend(dir.files.iter().map(Node::File));
    out.push(Node::Directory(dir));
}

/// Walks the source tree once and produces the in-memory node tree.
pub struct TreeBuilder {
    root: PathBuf,
    cache_root: PathBuf,
    policy: Arc<dyn InclusionPolicy>,
    handler_roots: Vec<PathBuf>,
}

impl TreeBuilder {
    #[must_use]
    pub fn new(ctx: &RunContext) -> Self {
        Self {
            root: ctx.source_root.clone(),
            cache_root: ctx.cache_root.clone(),
            policy: ctx.policy.clone(),
            handler_roots: ctx
                .config
                .handler_roots
                .iter()
                .map(|rel| ctx.source_root.join(rel))
                .collect(),
        }
    }

    pub fn build(&self) -> Result<DirectoryNode> {
        let root_meta = std::fs::metadata(&self.root).map_err(|err| {
            KnowledgeError::InvalidPath(format!("{}: {err}", self.root.display()))
        })?;
        if !root_meta.is_dir() {
            return Err(KnowledgeError::InvalidPath(format!(
                "Not a directory: {}",
                self.root.display()
            )));
        }

        let mut dirs: HashMap<PathBuf, DirectoryNode> = HashMap::new();
        dirs.insert(
            self.root.clone(),
            DirectoryNode::new(&self.root, modified_ms(&root_meta)),
        );

        let root = self.root.clone();
        let cache_root = self.cache_root.clone();
        let policy = self.policy.clone();
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(true)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .require_git(false)
            .follow_links(false);
        builder.filter_entry(move |entry| {
            let path = entry.path();
            if path == root {
                return true;
            }
            if path.starts_with(&cache_root) {
                return false;
            }
            match entry.file_type() {
                Some(ft) if ft.is_dir() => policy.should_process_directory(path),
                Some(ft) if ft.is_file() => policy.should_process_file(path),
                _ => false,
            }
        });

        let mut files = 0usize;
        for result in builder.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("Failed to read entry: {err}");
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            let Some(file_type) = entry.file_type() else {
                continue;
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    log::warn!("Failed to stat {}: {err}", entry.path().display());
                    continue;
                }
            };
            let path = entry.path().to_path_buf();
            if file_type.is_dir() {
                dirs.entry(path.clone())
                    .or_insert_with(|| DirectoryNode::new(path, modified_ms(&meta)));
            } else if file_type.is_file() {
                let Some(parent) = path.parent().map(Path::to_path_buf) else {
                    continue;
                };
                let node = FileNode {
                    path,
                    size: meta.len(),
                    mtime_ms: modified_ms(&meta),
                };
                // Directories are yielded before their contents.
                if let Some(dir) = dirs.get_mut(&parent) {
                    dir.files.push(node);
                    files += 1;
                }
            }
        }

        let mut tree = self.assemble(dirs)?;
        log::info!(
            "Scanned {} files under {}",
            files,
            self.root.display()
        );
        self.mark_handler_roots(&mut tree);
        Ok(tree)
    }

    fn assemble(&self, mut dirs: HashMap<PathBuf, DirectoryNode>) -> Result<DirectoryNode> {
        let mut paths: Vec<PathBuf> = dirs.keys().cloned().collect();
        // Deepest first, so a directory is complete before it moves into its parent.
        paths.sort_by(|a, b| {
            b.components()
                .count()
                .cmp(&a.components().count())
                .then_with(|| a.cmp(b))
        });

        for path in paths {
            if path == self.root {
                continue;
            }
            let Some(mut node) = dirs.remove(&path) else {
                continue;
            };
            node.sort_children();
            let Some(parent) = path.parent() else {
                continue;
            };
            match dirs.get_mut(parent) {
                Some(parent_node) => parent_node.dirs.push(node),
                None => log::debug!("Dropping orphan directory {}", path.display()),
            }
        }

        let mut tree = dirs.remove(&self.root).ok_or_else(|| {
            KnowledgeError::InvalidPath(format!("root lost during scan: {}", self.root.display()))
        })?;
        tree.sort_children();
        tree.is_tree_root = true;
        Ok(tree)
    }

    fn mark_handler_roots(&self, tree: &mut DirectoryNode) {
        for handler in &self.handler_roots {
            if !mark_directory(tree, handler) {
                log::warn!(
                    "Handler root {} is not part of the scanned tree",
                    handler.display()
                );
            }
        }
    }
}

fn mark_directory(dir: &mut DirectoryNode, target: &Path) -> bool {
    if dir.path == target {
        dir.is_tree_root = true;
        return true;
    }
    if !target.starts_with(&dir.path) {
        return false;
    }
    dir.dirs.iter_mut().any(|child| mark_directory(child, target))
}

pub(crate) fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn modified_ms(meta: &std::fs::Metadata) -> u64 {
    meta.modified().map(system_time_ms).unwrap_or(0)
}

/// Default inclusion policy: skips tooling, build output, vendored code, noise files and
/// anything too large to be worth summarizing.
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    root: PathBuf,
    excluded: Vec<PathBuf>,
    max_file_size: u64,
}

impl ScanPolicy {
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            excluded: Vec::new(),
            max_file_size: MAX_FILE_SIZE_BYTES,
        }
    }

    /// Never descend into `path` (used for a cache that lives inside the source tree).
    #[must_use]
    pub fn excluding(mut self, path: impl AsRef<Path>) -> Self {
        self.excluded.push(path.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.excluded.iter().any(|ex| path.starts_with(ex))
    }

    fn is_ignored_scope(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        relative.components().any(|component| match component {
            Component::Normal(name) => {
                let lowered = name.to_string_lossy().to_lowercase();
                IGNORED_SCOPES.iter().any(|ignored| *ignored == lowered)
            }
            _ => false,
        })
    }

    fn is_noise_file(path: &Path) -> bool {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if NOISE_FILE_NAMES
                .iter()
                .any(|candidate| name.eq_ignore_ascii_case(candidate))
            {
                return true;
            }
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_lowercase();
                BINARY_EXTENSIONS.iter().any(|candidate| *candidate == ext)
            })
    }
}

impl InclusionPolicy for ScanPolicy {
    fn should_process_file(&self, path: &Path) -> bool {
        if self.is_excluded(path) || self.is_ignored_scope(path) || Self::is_noise_file(path) {
            return false;
        }
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > self.max_file_size => {
                log::debug!(
                    "Skipping large file {} ({} bytes > {})",
                    path.display(),
                    meta.len(),
                    self.max_file_size
                );
                false
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }

    fn should_process_directory(&self, path: &Path) -> bool {
        !self.is_excluded(path) && !self.is_ignored_scope(path)
    }
}

const IGNORED_SCOPES: &[&str] = &[
    // VCS / tooling
    ".git",
    ".hg",
    ".svn",
    ".idea",
    ".vscode",
    ".context",
    // caches / builds
    ".cache",
    "node_modules",
    ".next",
    ".turbo",
    "build",
    "dist",
    "coverage",
    "target",
    ".venv",
    "__pycache__",
    // vendor
    "vendor",
    "third_party",
];

const NOISE_FILE_NAMES: &[&str] = &[
    "package-lock.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    "Cargo.lock",
    "poetry.lock",
    ".DS_Store",
];

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "webp", "pdf", "zip", "gz", "tar", "tgz", "xz", "7z",
    "so", "dylib", "dll", "exe", "o", "a", "class", "jar", "wasm", "bin", "woff", "woff2", "ttf",
];

const MAX_FILE_SIZE_BYTES: u64 = 1_048_576; // 1 MB
