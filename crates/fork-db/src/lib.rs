//! The fork database: an in-memory DAG of candidate block states rooted at
//! the last irreversible block.
//!
//! Every block observed but not yet irreversible lives here. The database
//! tracks which nodes have been fully applied (`mark_valid`), selects the
//! best chain tip deterministically, computes the branches involved in a
//! fork switch, and garbage-collects everything left behind when the root
//! advances.
//!
//! # Invariants
//!
//! - The root is the most recently committed irreversible block.
//! - Every non-root node's parent is present (or is the root).
//! - `head()` is deterministic: repeated calls without mutation return the
//!   same node, and all replicas order candidates identically.

use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;
use veldt_types::{BlockId, BlockNum, BlockTimestamp};

/// Errors from fork-database operations. These indicate integrity
/// violations and are fatal to the operation that triggered them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForkDbError {
    #[error("block {0} already exists in the fork database")]
    DuplicateBlock(BlockId),

    #[error("unlinkable block {id}: parent {previous} not found")]
    UnlinkableBlock { id: BlockId, previous: BlockId },

    #[error("block {0} not found in the fork database")]
    UnknownBlock(BlockId),

    #[error("the root block cannot be removed")]
    CannotRemoveRoot,

    #[error("advance target {0} is not a descendant of the current root")]
    NotOnRootBranch(BlockId),
}

/// Minimal view of a block state the fork database needs.
pub trait ForkNode: Clone {
    fn id(&self) -> BlockId;
    fn previous(&self) -> BlockId;
    fn timestamp(&self) -> BlockTimestamp;

    fn block_num(&self) -> BlockNum {
        self.id().block_num()
    }
}

struct Entry<T> {
    node: T,
    valid: bool,
}

/// The fork database.
pub struct ForkDatabase<T: ForkNode> {
    root: T,
    /// Non-root nodes by id.
    index: HashMap<BlockId, Entry<T>>,
    /// Parent id -> child ids, for subtree pruning.
    children: HashMap<BlockId, Vec<BlockId>>,
}

/// Deterministic tip ordering: higher block wins; at equal height the
/// earlier-produced block wins; ids break the remaining ties.
fn better_tip(
    a: (BlockNum, BlockTimestamp, BlockId),
    b: (BlockNum, BlockTimestamp, BlockId),
) -> Ordering {
    a.0.cmp(&b.0)
        .then_with(|| b.1.cmp(&a.1))
        .then_with(|| b.2.cmp(&a.2))
}

impl<T: ForkNode> ForkDatabase<T> {
    /// Create a database with `root` as both root and head.
    pub fn new(root: T) -> Self {
        ForkDatabase { root, index: HashMap::new(), children: HashMap::new() }
    }

    /// Reinitialize with a single node as both root and head.
    pub fn reset(&mut self, root: T) {
        self.root = root;
        self.index.clear();
        self.children.clear();
    }

    /// The root (last irreversible) block state.
    pub fn root(&self) -> &T {
        &self.root
    }

    /// Number of non-root nodes.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Insert a block state. Its parent must already be present.
    pub fn add(&mut self, node: T, mark_valid: bool) -> Result<(), ForkDbError> {
        let id = node.id();
        if id == self.root.id() || self.index.contains_key(&id) {
            return Err(ForkDbError::DuplicateBlock(id));
        }
        let previous = node.previous();
        if previous != self.root.id() && !self.index.contains_key(&previous) {
            return Err(ForkDbError::UnlinkableBlock { id, previous });
        }
        self.children.entry(previous).or_default().push(id);
        self.index.insert(id, Entry { node, valid: mark_valid });
        Ok(())
    }

    /// Look up a block state (the root included).
    pub fn get(&self, id: &BlockId) -> Option<&T> {
        if *id == self.root.id() {
            return Some(&self.root);
        }
        self.index.get(id).map(|entry| &entry.node)
    }

    /// True if the node exists and has been marked valid (the root always
    /// is).
    pub fn is_valid(&self, id: &BlockId) -> bool {
        *id == self.root.id() || self.index.get(id).is_some_and(|entry| entry.valid)
    }

    /// Flag a node as fully applied, making it eligible for head selection.
    pub fn mark_valid(&mut self, id: &BlockId) -> Result<(), ForkDbError> {
        let entry = self.index.get_mut(id).ok_or(ForkDbError::UnknownBlock(*id))?;
        entry.valid = true;
        Ok(())
    }

    fn best<'a>(&'a self, require_valid: bool) -> &'a T {
        let mut best: &'a T = &self.root;
        let mut best_key = (best.block_num(), best.timestamp(), best.id());
        for entry in self.index.values() {
            if require_valid && !entry.valid {
                continue;
            }
            let key = (entry.node.block_num(), entry.node.timestamp(), entry.node.id());
            if better_tip(key, best_key) == Ordering::Greater {
                best = &entry.node;
                best_key = key;
            }
        }
        best
    }

    /// The best fully-validated chain tip.
    pub fn head(&self) -> &T {
        self.best(true)
    }

    /// The best chain tip, validated or not.
    pub fn pending_head(&self) -> &T {
        self.best(false)
    }

    /// The portion of the branch ending at `tip` whose block numbers are at
    /// most `up_to`, newest first. `BlockNum::MAX` fetches the whole branch
    /// down to (but excluding) the root.
    pub fn fetch_branch(&self, tip: BlockId, up_to: BlockNum) -> Vec<T> {
        let mut branch = Vec::new();
        let mut cursor = tip;
        while cursor != self.root.id() {
            let Some(entry) = self.index.get(&cursor) else { break };
            if entry.node.block_num() <= up_to {
                branch.push(entry.node.clone());
            }
            cursor = entry.node.previous();
        }
        branch
    }

    /// The two branches that diverge at the common ancestor of `a` and `b`:
    /// `(ancestors of a, ancestors of b)`, each newest first, excluding the
    /// ancestor itself. Used for fork switching: apply the first list
    /// oldest-first after popping the second list.
    pub fn fetch_branch_from(
        &self,
        a: BlockId,
        b: BlockId,
    ) -> Result<(Vec<T>, Vec<T>), ForkDbError> {
        let mut first = Vec::new();
        let mut second = Vec::new();
        let mut cursor_a = self.get(&a).ok_or(ForkDbError::UnknownBlock(a))?.clone();
        let mut cursor_b = self.get(&b).ok_or(ForkDbError::UnknownBlock(b))?.clone();

        while cursor_a.block_num() > cursor_b.block_num() {
            let prev = cursor_a.previous();
            first.push(cursor_a);
            cursor_a = self.get(&prev).ok_or(ForkDbError::UnknownBlock(prev))?.clone();
        }
        while cursor_b.block_num() > cursor_a.block_num() {
            let prev = cursor_b.previous();
            second.push(cursor_b);
            cursor_b = self.get(&prev).ok_or(ForkDbError::UnknownBlock(prev))?.clone();
        }
        while cursor_a.id() != cursor_b.id() {
            let prev_a = cursor_a.previous();
            let prev_b = cursor_b.previous();
            first.push(cursor_a);
            second.push(cursor_b);
            cursor_a = self.get(&prev_a).ok_or(ForkDbError::UnknownBlock(prev_a))?.clone();
            cursor_b = self.get(&prev_b).ok_or(ForkDbError::UnknownBlock(prev_b))?.clone();
        }
        Ok((first, second))
    }

    /// The ancestor of `tip` at exactly `block_num`, if the branch reaches
    /// that far.
    pub fn search_on_branch(&self, tip: BlockId, block_num: BlockNum) -> Option<&T> {
        let mut cursor = tip;
        loop {
            if cursor == self.root.id() {
                return (self.root.block_num() == block_num).then_some(&self.root);
            }
            let entry = self.index.get(&cursor)?;
            match entry.node.block_num().cmp(&block_num) {
                Ordering::Equal => return Some(&entry.node),
                Ordering::Less => return None,
                Ordering::Greater => cursor = entry.node.previous(),
            }
        }
    }

    /// Advance the root to `new_root_id` (which must be a validated
    /// descendant of the current root), pruning every node that is neither
    /// the new root nor one of its descendants.
    ///
    /// The pruned states are returned so the caller can drop them off the
    /// critical path. The operation is atomic with respect to `head()`:
    /// it either completes or leaves the database untouched.
    pub fn advance_root(&mut self, new_root_id: BlockId) -> Result<Vec<T>, ForkDbError> {
        if new_root_id == self.root.id() {
            return Ok(Vec::new());
        }
        // Walk back from the new root to confirm ancestry.
        let mut cursor = new_root_id;
        while cursor != self.root.id() {
            let entry = self
                .index
                .get(&cursor)
                .ok_or(ForkDbError::NotOnRootBranch(new_root_id))?;
            cursor = entry.node.previous();
        }

        // Collect the ids that survive: the new root's subtree.
        let mut keep: HashMap<BlockId, ()> = HashMap::new();
        let mut stack = vec![new_root_id];
        while let Some(id) = stack.pop() {
            keep.insert(id, ());
            if let Some(kids) = self.children.get(&id) {
                stack.extend(kids.iter().copied());
            }
        }

        let new_root = self
            .index
            .remove(&new_root_id)
            .expect("ancestry walk found the new root")
            .node;
        let mut pruned = vec![std::mem::replace(&mut self.root, new_root)];
        let removed_ids: Vec<BlockId> =
            self.index.keys().filter(|id| !keep.contains_key(*id)).copied().collect();
        for id in &removed_ids {
            if let Some(entry) = self.index.remove(id) {
                pruned.push(entry.node);
            }
        }
        self.children.retain(|parent, _| keep.contains_key(parent));
        for kids in self.children.values_mut() {
            kids.retain(|kid| keep.contains_key(kid));
        }
        debug!(
            new_root = %new_root_id,
            pruned = pruned.len(),
            remaining = self.index.len(),
            "fork database root advanced"
        );
        Ok(pruned)
    }

    /// Replace a node's payload in place. The replacement must keep the
    /// same id and parent; used when applying a block refines its
    /// provisionally constructed state.
    pub fn update(&mut self, id: &BlockId, node: T) -> Result<(), ForkDbError> {
        let entry = self.index.get_mut(id).ok_or(ForkDbError::UnknownBlock(*id))?;
        assert_eq!(entry.node.id(), node.id(), "update must preserve the node id");
        assert_eq!(entry.node.previous(), node.previous(), "update must preserve the parent");
        entry.node = node;
        Ok(())
    }

    /// Remove the subtree rooted at `id`.
    pub fn remove(&mut self, id: &BlockId) -> Result<Vec<T>, ForkDbError> {
        if *id == self.root.id() {
            return Err(ForkDbError::CannotRemoveRoot);
        }
        if !self.index.contains_key(id) {
            return Err(ForkDbError::UnknownBlock(*id));
        }
        let mut removed = Vec::new();
        let mut stack = vec![*id];
        while let Some(cursor) = stack.pop() {
            if let Some(kids) = self.children.remove(&cursor) {
                stack.extend(kids);
            }
            if let Some(entry) = self.index.remove(&cursor) {
                let parent = entry.node.previous();
                if let Some(siblings) = self.children.get_mut(&parent) {
                    siblings.retain(|sibling| sibling != &cursor);
                }
                removed.push(entry.node);
            }
        }
        Ok(removed)
    }
}
