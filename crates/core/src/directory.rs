use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::tree::{AncestorStep, AncestorWalk, DescendantWalk};
use crate::types::{normalize_slug, NewStore, Store, StoreId, StoreUpdate};

/// Errors raised by directory operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("no stores are registered")]
    NoStoresAvailable,
    #[error("store {0} not found")]
    StoreNotFound(StoreId),
    #[error("parent store {0} not found")]
    ParentNotFound(StoreId),
    #[error("assigning parent {parent} to store {store} would create a cycle")]
    CyclicParent { store: StoreId, parent: StoreId },
    #[error("slug {0:?} is already taken")]
    DuplicateSlug(String),
    #[error("slug must not be blank")]
    InvalidSlug,
    #[error("store {0} appears more than once")]
    DuplicateStore(StoreId),
}

/// In-memory store directory.
///
/// Stores live in one flat arena in creation order; the hierarchy is an index
/// from parent id to child ids. Reads share a lock, every mutation (including
/// the default election triggered by [`StoreDirectory::get_default`]) holds the
/// write lock for its whole duration, which keeps at most one store flagged as
/// default.
pub struct StoreDirectory {
    arena: RwLock<Arena>,
}

impl Default for StoreDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreDirectory {
    pub fn new() -> Self {
        Self {
            arena: RwLock::new(Arena::default()),
        }
    }

    /// Loads previously exported records as-is.
    ///
    /// The records are not repaired here: several default flags or a cyclic
    /// parent chain survive the import and are handled by the read paths.
    pub fn from_stores(stores: Vec<Store>) -> Result<Self, DirectoryError> {
        let mut arena = Arena::default();
        for store in stores {
            if arena.positions.contains_key(store.id()) {
                return Err(DirectoryError::DuplicateStore(store.id().clone()));
            }
            if arena.slug_taken(store.slug(), None) {
                return Err(DirectoryError::DuplicateSlug(store.slug().to_string()));
            }
            arena.insert(store);
        }

        Ok(Self {
            arena: RwLock::new(arena),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Arena> {
        self.arena.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arena> {
        self.arena.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new store.
    ///
    /// A store created with `default` set takes the flag from every other
    /// store. A store created while no store is flagged becomes the default.
    pub fn create(&self, new: NewStore) -> Result<Store, DirectoryError> {
        let slug = normalize_slug(&new.slug).ok_or(DirectoryError::InvalidSlug)?;
        let now = Utc::now();
        let mut arena = self.write();

        if arena.slug_taken(slug, None) {
            return Err(DirectoryError::DuplicateSlug(slug.to_string()));
        }
        if let Some(parent) = &new.parent_id {
            if !arena.positions.contains_key(parent) {
                return Err(DirectoryError::ParentNotFound(parent.clone()));
            }
        }

        let promote = new.default || !arena.stores.iter().any(Store::is_default);
        let mut store = new.into_store(now);
        if promote {
            for other in &mut arena.stores {
                other.set_default_flag(false, now);
            }
            store.set_default_flag(true, now);
        }

        debug!(stage = "directory", store_id = %store.id(), slug = store.slug(), default = store.is_default(), "store created");
        arena.insert(store.clone());
        Ok(store)
    }

    /// Applies a partial update. The default flag is not part of it.
    pub fn update(&self, id: &StoreId, mut update: StoreUpdate) -> Result<Store, DirectoryError> {
        let now = Utc::now();
        let mut arena = self.write();
        let position = arena
            .position(id)
            .ok_or_else(|| DirectoryError::StoreNotFound(id.clone()))?;

        if let Some(slug) = update.slug.take() {
            let slug = normalize_slug(&slug).ok_or(DirectoryError::InvalidSlug)?;
            if arena.slug_taken(slug, Some(id)) {
                return Err(DirectoryError::DuplicateSlug(slug.to_string()));
            }
            update.slug = Some(slug.to_string());
        }

        if let Some(Some(parent)) = &update.parent_id {
            if !arena.positions.contains_key(parent) {
                return Err(DirectoryError::ParentNotFound(parent.clone()));
            }
            if arena.climbs_to(parent, id) {
                return Err(DirectoryError::CyclicParent {
                    store: id.clone(),
                    parent: parent.clone(),
                });
            }
        }

        let previous_parent = arena.stores[position].parent_id().cloned();
        arena.stores[position].apply(update, now);
        let parent = arena.stores[position].parent_id().cloned();
        if parent != previous_parent {
            arena.unlink(id, previous_parent.as_ref());
            arena.link(id, parent.as_ref());
        }

        Ok(arena.stores[position].clone())
    }

    /// Removes a store. Children keep their (now dangling) parent reference.
    pub fn delete(&self, id: &StoreId) -> Result<Store, DirectoryError> {
        let mut arena = self.write();
        let removed = arena
            .remove(id)
            .ok_or_else(|| DirectoryError::StoreNotFound(id.clone()))?;

        if removed.is_default() {
            info!(stage = "directory", store_id = %id, "default store deleted; next lookup elects a replacement");
        }
        Ok(removed)
    }

    pub fn get(&self, id: &StoreId) -> Option<Store> {
        self.read().get(id).cloned()
    }

    pub fn get_by_slug(&self, slug: &str) -> Option<Store> {
        self.read()
            .stores
            .iter()
            .find(|store| store.slug() == slug)
            .cloned()
    }

    /// All stores in creation order.
    pub fn list(&self) -> Vec<Store> {
        self.read().stores.clone()
    }

    /// Clones the records out for export; same as [`Self::list`].
    pub fn snapshot(&self) -> Vec<Store> {
        self.list()
    }

    pub fn len(&self) -> usize {
        self.read().stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().stores.is_empty()
    }

    /// Stores listing `hostname` among their domains, in creation order.
    pub fn find_by_domain(&self, hostname: &str) -> Vec<Store> {
        self.read()
            .stores
            .iter()
            .filter(|store| store.domains().contains(hostname))
            .cloned()
            .collect()
    }

    /// Returns the default store, electing one first when the flags are off.
    ///
    /// With exactly one store flagged this is a plain read. Otherwise it falls
    /// through to [`Self::elect_default`], which writes.
    pub fn get_default(&self) -> Result<Store, DirectoryError> {
        {
            let arena = self.read();
            let mut flagged = arena.stores.iter().filter(|store| store.is_default());
            if let (Some(store), None) = (flagged.next(), flagged.next()) {
                return Ok(store.clone());
            }
            if arena.stores.is_empty() {
                return Err(DirectoryError::NoStoresAvailable);
            }
        }

        self.elect_default()
    }

    /// Default election fallback.
    ///
    /// Keeps the earliest-created flagged store, or promotes the
    /// earliest-created store when none is flagged, and clears every other
    /// flag. The new flags are stored before returning.
    pub fn elect_default(&self) -> Result<Store, DirectoryError> {
        let now = Utc::now();
        let mut arena = self.write();
        let elected = arena
            .stores
            .iter()
            .position(Store::is_default)
            .or_else(|| (!arena.stores.is_empty()).then_some(0))
            .ok_or(DirectoryError::NoStoresAvailable)?;

        let promoted = !arena.stores[elected].is_default();
        let mut cleared = 0usize;
        for (position, store) in arena.stores.iter_mut().enumerate() {
            if store.set_default_flag(position == elected, now) && position != elected {
                cleared += 1;
            }
        }

        let store = arena.stores[elected].clone();
        if promoted {
            info!(stage = "directory", store_id = %store.id(), slug = store.slug(), "no default store flagged; promoted earliest store");
        }
        if cleared > 0 {
            warn!(stage = "directory", store_id = %store.id(), cleared, "several default stores flagged; kept earliest");
        }
        Ok(store)
    }

    /// Flags `id` as the default and clears the flag everywhere else.
    pub fn set_default(&self, id: &StoreId) -> Result<Store, DirectoryError> {
        let now = Utc::now();
        let mut arena = self.write();
        let target = arena
            .position(id)
            .ok_or_else(|| DirectoryError::StoreNotFound(id.clone()))?;

        for (position, store) in arena.stores.iter_mut().enumerate() {
            store.set_default_flag(position == target, now);
        }

        info!(stage = "directory", store_id = %id, "default store changed");
        Ok(arena.stores[target].clone())
    }

    /// Direct children in creation order.
    pub fn children(&self, id: &StoreId) -> Vec<Store> {
        self.read().children_of(id)
    }

    /// Every descendant of `id`, depth-first with parents before their children.
    pub fn all_children(&self, id: &StoreId) -> Vec<Store> {
        let arena = self.read();
        let mut walk = DescendantWalk::new(id);
        while let Some(parent) = walk.next_parent() {
            walk.expand(arena.children_of(&parent));
        }

        if !walk.revisited().is_empty() {
            warn!(stage = "directory", store_id = %id, revisited = ?walk.revisited(), "cycle in store hierarchy; traversal cut short");
        }
        walk.finish()
    }

    /// Path from `id` up to and including `ancestor`, nearest first.
    ///
    /// Empty when `ancestor` is not on the parent chain of `id`.
    pub fn up_to(&self, id: &StoreId, ancestor: &StoreId) -> Vec<Store> {
        let arena = self.read();
        match arena.walk_up(id, ancestor) {
            AncestorStep::Reached(path) => path,
            AncestorStep::Cycle(at) => {
                warn!(stage = "directory", store_id = %id, cycle_at = %at, "cycle in store hierarchy; no path returned");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Arena {
    stores: Vec<Store>,
    positions: HashMap<StoreId, usize>,
    children: HashMap<StoreId, Vec<StoreId>>,
}

impl Arena {
    fn position(&self, id: &StoreId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    fn get(&self, id: &StoreId) -> Option<&Store> {
        self.position(id).map(|position| &self.stores[position])
    }

    fn slug_taken(&self, slug: &str, except: Option<&StoreId>) -> bool {
        self.stores
            .iter()
            .any(|store| store.slug() == slug && Some(store.id()) != except)
    }

    fn insert(&mut self, store: Store) {
        let id = store.id().clone();
        let parent = store.parent_id().cloned();
        self.positions.insert(id.clone(), self.stores.len());
        self.stores.push(store);
        self.link(&id, parent.as_ref());
    }

    fn remove(&mut self, id: &StoreId) -> Option<Store> {
        let position = self.position(id)?;
        let removed = self.stores.remove(position);
        self.unlink(id, removed.parent_id());
        self.positions = self
            .stores
            .iter()
            .enumerate()
            .map(|(position, store)| (store.id().clone(), position))
            .collect();
        Some(removed)
    }

    fn link(&mut self, id: &StoreId, parent: Option<&StoreId>) {
        if let Some(parent) = parent {
            self.children
                .entry(parent.clone())
                .or_default()
                .push(id.clone());
        }
    }

    fn unlink(&mut self, id: &StoreId, parent: Option<&StoreId>) {
        let Some(parent) = parent else {
            return;
        };
        if let Some(siblings) = self.children.get_mut(parent) {
            siblings.retain(|child| child != id);
            if siblings.is_empty() {
                self.children.remove(parent);
            }
        }
    }

    fn children_of(&self, id: &StoreId) -> Vec<Store> {
        let Some(ids) = self.children.get(id) else {
            return Vec::new();
        };
        let mut positions: Vec<usize> = ids.iter().filter_map(|child| self.position(child)).collect();
        positions.sort_unstable();
        positions
            .into_iter()
            .map(|position| self.stores[position].clone())
            .collect()
    }

    fn walk_up(&self, id: &StoreId, ancestor: &StoreId) -> AncestorStep {
        let mut walk = AncestorWalk::new(ancestor);
        let mut step = walk.visit(self.get(id).cloned());
        while let AncestorStep::Fetch(next) = step {
            step = walk.visit(self.get(&next).cloned());
        }
        step
    }

    /// Returns `true` when `target` is `from` itself or one of its ancestors.
    fn climbs_to(&self, from: &StoreId, target: &StoreId) -> bool {
        matches!(self.walk_up(from, target), AncestorStep::Reached(_))
    }
}
