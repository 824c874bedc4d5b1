//! Revision forest
//!
//! A document's history is a set of branches that share prefixes. The forest
//! is stored as an arena: a flat map from revision id to a node record that
//! names its parent and children, plus the list of roots. No node owns
//! another, so the whole structure serializes as plain JSON inside the
//! document metadata record.
//!
//! Winner selection only looks at the set of leaves, so two replicas that
//! merged the same paths in different orders pick the same winner.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::DbError;
use crate::revision::{RevisionId, MAX_GENERATION};

/// Default number of generations kept behind every leaf
pub const DEFAULT_MAX_HISTORY_DEPTH: usize = 1000;

/// Availability of a revision body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionStatus {
    /// Body stored in the sequence log
    Available,
    /// Known ancestor whose body is not available here
    Missing,
    /// Tombstone
    Deleted,
}

impl RevisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevisionStatus::Available => "available",
            RevisionStatus::Missing => "missing",
            RevisionStatus::Deleted => "deleted",
        }
    }
}

/// Arena record for one revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionNode {
    pub status: RevisionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RevisionId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RevisionId>,
}

impl RevisionNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// How an incoming path related to the existing forest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Extended the tip of an existing branch
    NewLeaf,
    /// Attached below an inner node, or started an unrelated root
    NewBranch,
    /// Every revision on the path was already known
    Existing,
}

/// Result of merging one path into a forest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeResult {
    pub outcome: MergeOutcome,
    /// The path's tip gained a body (inserted, or promoted from `Missing`)
    pub leaf_written: bool,
}

/// A leaf with its tombstone flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Leaf {
    pub rev: RevisionId,
    pub deleted: bool,
}

/// Entry of `_revs_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevisionInfo {
    pub rev: RevisionId,
    pub status: RevisionStatus,
}

/// Ancestry of one revision in `_revisions` form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionHistory {
    /// Generation of the newest revision
    pub start: u64,
    /// Hashes, newest first
    pub ids: Vec<String>,
}

/// A root-to-tip chain of consecutive revisions, as carried by an edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionPath {
    revisions: Vec<RevisionId>,
    tip_status: RevisionStatus,
}

impl RevisionPath {
    /// Path for a locally made edit: optional parent, then the new revision
    pub fn for_edit(parent: Option<&RevisionId>, rev: RevisionId, deleted: bool) -> Self {
        let mut revisions = Vec::with_capacity(2);
        if let Some(parent) = parent {
            revisions.push(parent.clone());
        }
        revisions.push(rev);
        Self {
            revisions,
            tip_status: tip_status(deleted),
        }
    }

    /// Path described by a `_revisions` history, ancestors first
    pub fn from_history(history: &RevisionHistory, deleted: bool) -> Result<Self, DbError> {
        if history.ids.is_empty() {
            return Err(DbError::BadRequest("_revisions.ids must not be empty".into()));
        }
        let len = history.ids.len() as u64;
        if history.start < len {
            return Err(DbError::BadRequest(format!(
                "_revisions.start {} is shorter than its {} ids",
                history.start, len
            )));
        }
        if history.start > MAX_GENERATION {
            return Err(DbError::BadRequest(format!("_revisions.start {} is too large", history.start)));
        }
        let oldest = history.start - (len - 1);
        let revisions = history
            .ids
            .iter()
            .rev()
            .enumerate()
            .map(|(i, hash)| RevisionId::new(oldest + i as u64, hash.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            revisions,
            tip_status: tip_status(deleted),
        })
    }

    pub fn tip(&self) -> &RevisionId {
        // Both constructors guarantee at least one revision.
        &self.revisions[self.revisions.len() - 1]
    }

    pub fn revisions(&self) -> &[RevisionId] {
        &self.revisions
    }

    pub fn is_deleted(&self) -> bool {
        self.tip_status == RevisionStatus::Deleted
    }
}

fn tip_status(deleted: bool) -> RevisionStatus {
    if deleted {
        RevisionStatus::Deleted
    } else {
        RevisionStatus::Available
    }
}

/// All branches of one document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionForest {
    nodes: BTreeMap<RevisionId, RevisionNode>,
    roots: Vec<RevisionId>,
}

impl RevisionForest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, rev: &RevisionId) -> bool {
        self.nodes.contains_key(rev)
    }

    pub fn status(&self, rev: &RevisionId) -> Option<RevisionStatus> {
        self.nodes.get(rev).map(|n| n.status)
    }

    pub fn roots(&self) -> &[RevisionId] {
        &self.roots
    }

    /// Merge `path` and stem history older than `max_depth` generations
    pub fn merge_path(&mut self, path: &RevisionPath, max_depth: usize) -> MergeResult {
        let tip_index = path.revisions.len() - 1;
        let mut prev: Option<RevisionId> = None;
        let mut outcome = MergeOutcome::Existing;
        let mut leaf_written = false;

        for (i, rev) in path.revisions.iter().enumerate() {
            let status = if i == tip_index {
                path.tip_status
            } else {
                RevisionStatus::Missing
            };

            if let Some(node) = self.nodes.get_mut(rev) {
                if i == tip_index && node.status == RevisionStatus::Missing && status != RevisionStatus::Missing {
                    node.status = status;
                    leaf_written = true;
                }
                if node.parent.is_none() {
                    if let Some(parent) = &prev {
                        self.graft(rev, parent);
                    }
                }
                prev = Some(rev.clone());
                continue;
            }

            if outcome == MergeOutcome::Existing {
                outcome = match &prev {
                    Some(parent) if self.nodes.get(parent).is_some_and(|n| n.is_leaf()) => {
                        MergeOutcome::NewLeaf
                    }
                    _ => MergeOutcome::NewBranch,
                };
            }
            self.insert(rev.clone(), status, prev.clone());
            if i == tip_index {
                leaf_written = true;
            }
            prev = Some(rev.clone());
        }

        self.stem(max_depth);
        MergeResult { outcome, leaf_written }
    }

    fn insert(&mut self, rev: RevisionId, status: RevisionStatus, parent: Option<RevisionId>) {
        match &parent {
            Some(p) => {
                if let Some(parent_node) = self.nodes.get_mut(p) {
                    insert_sorted(&mut parent_node.children, rev.clone());
                }
            }
            None => insert_sorted(&mut self.roots, rev.clone()),
        }
        self.nodes.insert(
            rev,
            RevisionNode {
                status,
                parent,
                children: Vec::new(),
            },
        );
    }

    /// Hang a former root below `parent`, which was learned later
    fn graft(&mut self, rev: &RevisionId, parent: &RevisionId) {
        if parent.generation().checked_add(1) != Some(rev.generation()) {
            return;
        }
        self.roots.retain(|r| r != rev);
        if let Some(node) = self.nodes.get_mut(rev) {
            node.parent = Some(parent.clone());
        }
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            insert_sorted(&mut parent_node.children, rev.clone());
        }
    }

    /// Turn revisions more than `max_depth` generations behind every leaf
    /// into `Missing` stubs
    fn stem(&mut self, max_depth: usize) {
        if max_depth == 0 {
            return;
        }
        let mut keep: HashSet<RevisionId> = HashSet::new();
        for leaf in self.leaf_ids() {
            let mut current = Some(leaf);
            let mut depth = 0;
            while let Some(rev) = current {
                if depth >= max_depth {
                    break;
                }
                current = self.nodes.get(&rev).and_then(|n| n.parent.clone());
                keep.insert(rev);
                depth += 1;
            }
        }
        for (rev, node) in self.nodes.iter_mut() {
            if !keep.contains(rev) && !node.is_leaf() {
                node.status = RevisionStatus::Missing;
            }
        }
    }

    fn leaf_ids(&self) -> Vec<RevisionId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.is_leaf())
            .map(|(rev, _)| rev.clone())
            .collect()
    }

    /// Leaves ordered winner-first: live before deleted, then by revision
    /// descending
    pub fn leaves(&self) -> Vec<Leaf> {
        let mut leaves: Vec<Leaf> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.is_leaf())
            .map(|(rev, n)| Leaf {
                rev: rev.clone(),
                deleted: n.status == RevisionStatus::Deleted,
            })
            .collect();
        leaves.sort_by(|a, b| a.deleted.cmp(&b.deleted).then_with(|| b.rev.cmp(&a.rev)));
        leaves
    }

    /// The deterministic current revision
    ///
    /// Highest generation among live leaves, ties broken by the greater hash.
    /// Tombstones only win when no live leaf is left.
    pub fn winning_revision(&self) -> Option<RevisionId> {
        self.leaves().into_iter().next().map(|leaf| leaf.rev)
    }

    /// Whether the winning leaf is a tombstone
    pub fn is_deleted(&self) -> bool {
        self.leaves().first().is_some_and(|leaf| leaf.deleted)
    }

    /// Live leaves other than the winner
    pub fn conflicts(&self) -> Vec<RevisionId> {
        self.leaves()
            .into_iter()
            .skip(1)
            .filter(|leaf| !leaf.deleted)
            .map(|leaf| leaf.rev)
            .collect()
    }

    /// Every known revision with its status, newest first
    pub fn revisions_info(&self) -> Vec<RevisionInfo> {
        self.nodes
            .iter()
            .rev()
            .map(|(rev, node)| RevisionInfo {
                rev: rev.clone(),
                status: node.status,
            })
            .collect()
    }

    /// Root-to-`target` chain of ancestors
    pub fn path_to(&self, target: &RevisionId) -> Option<Vec<RevisionId>> {
        let mut chain = Vec::new();
        let mut current = Some(target.clone());
        while let Some(rev) = current {
            let node = self.nodes.get(&rev)?;
            current = node.parent.clone();
            chain.push(rev);
        }
        chain.reverse();
        Some(chain)
    }

    /// `_revisions` form of the ancestry of `target`
    pub fn history(&self, target: &RevisionId) -> Option<RevisionHistory> {
        let path = self.path_to(target)?;
        Some(RevisionHistory {
            start: target.generation(),
            ids: path.iter().rev().map(|r| r.hash().to_string()).collect(),
        })
    }
}

fn insert_sorted(list: &mut Vec<RevisionId>, rev: RevisionId) {
    if let Err(pos) = list.binary_search(&rev) {
        list.insert(pos, rev);
    }
}
