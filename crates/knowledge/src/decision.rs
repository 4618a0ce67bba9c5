use crate::detector::ChangeDetector;
use crate::store::CacheSnapshot;
use crate::tree::{DirectoryNode, Node};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Rebuild,
    Skip,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    EmptyDirectory,
    ProjectRootForced,
    ComprehensiveStaleness,
    ChildDirectoryRebuilt,
    NoChange,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RebuildDecision {
    pub path: PathBuf,
    pub outcome: Outcome,
    pub reason: DecisionReason,
    pub detail: String,
}

impl RebuildDecision {
    fn new(path: &Path, outcome: Outcome, reason: DecisionReason, detail: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            outcome,
            reason,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn is_rebuild(&self) -> bool {
        self.outcome == Outcome::Rebuild
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DecisionSummary {
    pub total: usize,
    pub rebuild: usize,
    pub skip: usize,
    pub by_reason: BTreeMap<DecisionReason, usize>,
}

/// Outcome of one planning pass. Read-only once the engine returns it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecisionReport {
    pub decisions: BTreeMap<PathBuf, RebuildDecision>,
    /// REBUILD directory -> unchanged sibling directories, for synthesis context only.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub sibling_context: BTreeMap<PathBuf, Vec<PathBuf>>,
    pub summary: DecisionSummary,
}

impl DecisionReport {
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&RebuildDecision> {
        self.decisions.get(path)
    }

    #[must_use]
    pub fn needs_rebuild(&self, path: &Path) -> bool {
        self.get(path).is_some_and(RebuildDecision::is_rebuild)
    }

    #[must_use]
    pub fn siblings_of(&self, path: &Path) -> &[PathBuf] {
        self.sibling_context
            .get(path)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn rebuild_paths(&self) -> impl Iterator<Item = &Path> {
        self.decisions
            .values()
            .filter(|decision| decision.is_rebuild())
            .map(|decision| decision.path.as_path())
    }
}

/// Turns staleness into per-node REBUILD/SKIP decisions.
pub struct DecisionEngine<'a> {
    snapshot: &'a CacheSnapshot,
    tolerance_ms: u64,
}

impl<'a> DecisionEngine<'a> {
    #[must_use]
    pub fn new(snapshot: &'a CacheSnapshot, tolerance_ms: u64) -> Self {
        Self {
            snapshot,
            tolerance_ms,
        }
    }

    #[must_use]
    pub fn decide(&self, tree: &DirectoryNode) -> DecisionReport {
        let mut detector = ChangeDetector::new(self.snapshot, self.tolerance_ms);
        detector.assess(tree);

        let mut decisions = BTreeMap::new();
        for node in tree.post_order() {
            let decision = initial_decision(&mut detector, node);
            decisions.insert(decision.path.clone(), decision);
        }

        cascade(&tree.path, &mut decisions);
        let sibling_context = collect_sibling_context(tree, &decisions);
        let summary = summarize(&decisions);
        log::info!(
            "Planned {} nodes: {} rebuild, {} skip",
            summary.total,
            summary.rebuild,
            summary.skip
        );

        DecisionReport {
            decisions,
            sibling_context,
            summary,
        }
    }
}

fn initial_decision(detector: &mut ChangeDetector<'_>, node: Node<'_>) -> RebuildDecision {
    match node {
        Node::Directory(dir) if dir.is_empty() => RebuildDecision::new(
            &dir.path,
            Outcome::Skip,
            DecisionReason::EmptyDirectory,
            "no files or subdirectories",
        ),
        Node::Directory(dir) if dir.is_tree_root => RebuildDecision::new(
            &dir.path,
            Outcome::Rebuild,
            DecisionReason::ProjectRootForced,
            "root summary is always regenerated",
        ),
        Node::Directory(_) | Node::File(_) => match detector.is_stale(node).reason() {
            Some(reason) => RebuildDecision::new(
                node.path(),
                Outcome::Rebuild,
                DecisionReason::ComprehensiveStaleness,
                reason.to_string(),
            ),
            None => RebuildDecision::new(
                node.path(),
                Outcome::Skip,
                DecisionReason::NoChange,
                "artifact is current",
            ),
        },
    }
}

/// Mark every ancestor of a REBUILD node as REBUILD. Existing REBUILD reasons are kept.
fn cascade(root: &Path, decisions: &mut BTreeMap<PathBuf, RebuildDecision>) {
    let rebuilt: Vec<PathBuf> = decisions
        .values()
        .filter(|decision| decision.is_rebuild())
        .map(|decision| decision.path.clone())
        .collect();

    for path in rebuilt {
        let mut current = path.parent();
        while let Some(ancestor) = current {
            if !ancestor.starts_with(root) {
                break;
            }
            match decisions.get(ancestor) {
                // Its own walk (or an earlier one) already covers the rest of the chain.
                Some(existing) if existing.is_rebuild() => break,
                _ => {
                    decisions.insert(
                        ancestor.to_path_buf(),
                        RebuildDecision::new(
                            ancestor,
                            Outcome::Rebuild,
                            DecisionReason::ChildDirectoryRebuilt,
                            format!("descendant rebuilt: {}", path.display()),
                        ),
                    );
                }
            }
            current = ancestor.parent();
        }
    }
}

fn collect_sibling_context(
    tree: &DirectoryNode,
    decisions: &BTreeMap<PathBuf, RebuildDecision>,
) -> BTreeMap<PathBuf, Vec<PathBuf>> {
    let rebuilding = |path: &Path| decisions.get(path).is_some_and(RebuildDecision::is_rebuild);
    let mut context = BTreeMap::new();
    for parent in tree.post_order_dirs() {
        let unchanged: Vec<PathBuf> = parent
            .dirs
            .iter()
            .filter(|child| !child.is_empty() && !rebuilding(&child.path))
            .map(|child| child.path.clone())
            .collect();
        if unchanged.is_empty() {
            continue;
        }
        for child in parent.dirs.iter().filter(|child| rebuilding(&child.path)) {
            context.insert(child.path.clone(), unchanged.clone());
        }
    }
    context
}

fn summarize(decisions: &BTreeMap<PathBuf, RebuildDecision>) -> DecisionSummary {
    let mut summary = DecisionSummary {
        total: decisions.len(),
        ..DecisionSummary::default()
    };
    for decision in decisions.values() {
        match decision.outcome {
            Outcome::Rebuild => summary.rebuild += 1,
            Outcome::Skip => summary.skip += 1,
        }
        *summary.by_reason.entry(decision.reason).or_insert(0) += 1;
    }
    summary
}
