//! Traversal state machines for the parent/child hierarchy.
//!
//! The walkers never look stores up themselves. A backend drives them by
//! answering "which stores have this parent" or "which store has this id",
//! so the in-memory directory and the SQLite repository share one algorithm
//! while fetching rows in their own way (synchronously or over an async
//! connection).

use std::collections::HashSet;

use crate::types::{Store, StoreId};

/// Depth-first, pre-order enumeration of every descendant of a root store.
///
/// ```text
/// let mut walk = DescendantWalk::new(root);
/// while let Some(parent) = walk.next_parent() {
///     walk.expand(children_of(&parent));
/// }
/// let descendants = walk.finish();
/// ```
#[derive(Debug)]
pub struct DescendantWalk {
    root: Option<StoreId>,
    pending: Vec<Store>,
    visited: HashSet<StoreId>,
    descendants: Vec<Store>,
    revisited: Vec<StoreId>,
}

impl DescendantWalk {
    pub fn new(root: &StoreId) -> Self {
        let mut visited = HashSet::new();
        visited.insert(root.clone());
        Self {
            root: Some(root.clone()),
            pending: Vec::new(),
            visited,
            descendants: Vec::new(),
            revisited: Vec::new(),
        }
    }

    /// Returns the id whose children must be supplied next through [`Self::expand`].
    pub fn next_parent(&mut self) -> Option<StoreId> {
        if let Some(root) = self.root.take() {
            return Some(root);
        }

        let store = self.pending.pop()?;
        let id = store.id().clone();
        self.descendants.push(store);
        Some(id)
    }

    /// Queues the direct children of the last parent, in sibling order.
    pub fn expand(&mut self, children: Vec<Store>) {
        let mut fresh = Vec::with_capacity(children.len());
        for child in children {
            if self.visited.insert(child.id().clone()) {
                fresh.push(child);
            } else {
                self.revisited.push(child.id().clone());
            }
        }
        // Reverse so the first sibling is popped first.
        self.pending.extend(fresh.into_iter().rev());
    }

    /// Ids reached twice during the walk. Non-empty only for a cyclic hierarchy.
    pub fn revisited(&self) -> &[StoreId] {
        &self.revisited
    }

    pub fn finish(self) -> Vec<Store> {
        self.descendants
    }
}

/// Next action requested by an [`AncestorWalk`].
#[derive(Debug, PartialEq, Eq)]
pub enum AncestorStep {
    /// Look up this id and feed the result back through [`AncestorWalk::visit`].
    Fetch(StoreId),
    /// The target was reached; the path runs from the start store to the target.
    Reached(Vec<Store>),
    /// The chain ended (root or dangling reference) without meeting the target.
    Missed,
    /// The chain looped back onto this id before meeting the target.
    Cycle(StoreId),
}

/// Climbs the parent chain from a store until a given ancestor is met.
#[derive(Debug)]
pub struct AncestorWalk {
    target: StoreId,
    visited: HashSet<StoreId>,
    path: Vec<Store>,
}

impl AncestorWalk {
    pub fn new(target: &StoreId) -> Self {
        Self {
            target: target.clone(),
            visited: HashSet::new(),
            path: Vec::new(),
        }
    }

    /// Feeds the store found for the last requested id (or `None` when missing).
    pub fn visit(&mut self, store: Option<Store>) -> AncestorStep {
        let Some(store) = store else {
            return AncestorStep::Missed;
        };

        if !self.visited.insert(store.id().clone()) {
            return AncestorStep::Cycle(store.id().clone());
        }

        let reached = *store.id() == self.target;
        let parent = store.parent_id().cloned();
        self.path.push(store);

        if reached {
            return AncestorStep::Reached(std::mem::take(&mut self.path));
        }

        match parent {
            Some(parent) => AncestorStep::Fetch(parent),
            None => AncestorStep::Missed,
        }
    }
}
