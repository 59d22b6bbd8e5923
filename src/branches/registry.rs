//! Branch registry implementation.

use crate::blocks::{Block, BlockStore};
use crate::error::{Result, StoreError};
use crate::types::{
    Branch, BranchId, BranchStatus, OpLogEntry, Snapshot, Timestamp, Version, MAIN_BRANCH,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Options for branch garbage collection.
#[derive(Clone, Debug, Default)]
pub struct BranchGcOptions {
    /// Delete branches that never received a write.
    pub delete_empty: bool,
    /// Delete branches frozen by a merge.
    pub delete_merged: bool,
    /// Delete branches created before this time.
    pub delete_stale_older_than: Option<Timestamp>,
    /// Only delete branches whose name contains one of these patterns.
    pub name_patterns: Option<Vec<String>>,
}

/// Result of branch garbage collection.
#[derive(Clone, Debug, Default)]
pub struct BranchGcResult {
    /// Branches that were deleted, with the blocks each one freed.
    pub deleted: Vec<(BranchId, usize)>,
    /// Blocks freed by the deletions.
    pub blocks_freed: usize,
}

/// Mutable part of a branch.
#[derive(Debug)]
pub(crate) struct BranchState {
    pub meta: Branch,
    pub snapshot: Snapshot,
    pub log: Vec<OpLogEntry>,
}

/// Point-in-time copy of the registry and the block table.
pub(crate) struct RegistryExport {
    pub branches: Vec<(Branch, Snapshot, Vec<OpLogEntry>)>,
    pub created: u64,
    pub blocks: Vec<Block>,
    pub last_block_id: u64,
    pub last_version: Version,
}

/// A live branch.
///
/// Handed out as `Arc` so callers can work on a branch without holding the
/// registry lock.
pub struct BranchCell {
    id: BranchId,
    ordinal: u64,
    state: Mutex<BranchState>,
    table_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BranchCell {
    fn new(ordinal: u64, meta: Branch, snapshot: Snapshot, log: Vec<OpLogEntry>) -> Self {
        Self {
            id: meta.id.clone(),
            ordinal,
            state: Mutex::new(BranchState { meta, snapshot, log }),
            table_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &BranchId {
        &self.id
    }

    /// Branch metadata.
    pub fn info(&self) -> Branch {
        self.state.lock().meta.clone()
    }

    pub fn status(&self) -> BranchStatus {
        self.state.lock().meta.status
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().snapshot.clone()
    }

    /// Copy of the operation log.
    pub fn log(&self) -> Vec<OpLogEntry> {
        self.state.lock().log.clone()
    }

    pub fn op_count(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Lock serializing writes to one table of this branch.
    ///
    /// Only locks some writer still holds are kept; idle ones are dropped
    /// whenever a new table's lock is created.
    pub fn table_lock(&self, table: &str) -> Arc<Mutex<()>> {
        let mut locks = self.table_locks.lock();
        if let Some(lock) = locks.get(table) {
            return Arc::clone(lock);
        }
        // An idle lock is referenced by the map alone.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(table.to_string(), Arc::clone(&lock));
        lock
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, BranchState> {
        self.state.lock()
    }
}

#[derive(Default)]
struct RegistryIndex {
    branches: HashMap<BranchId, Arc<BranchCell>>,
    name_to_id: HashMap<String, BranchId>,
    /// Number of branches ever created, `main` excluded.
    created: u64,
}

/// Maps branch ids to branches and owns their lifecycle.
pub struct BranchRegistry {
    index: RwLock<RegistryIndex>,
    blocks: Arc<BlockStore>,
}

impl BranchRegistry {
    /// Create a registry holding an empty `main` branch.
    pub fn new(blocks: Arc<BlockStore>) -> Self {
        let main = Branch {
            id: BranchId::main(),
            name: MAIN_BRANCH.to_string(),
            parent: None,
            created: Timestamp::now(),
            status: BranchStatus::Active,
        };

        let mut index = RegistryIndex::default();
        index.name_to_id.insert(MAIN_BRANCH.to_string(), main.id.clone());
        index.branches.insert(
            main.id.clone(),
            Arc::new(BranchCell::new(0, main, Snapshot::new(), Vec::new())),
        );

        Self {
            index: RwLock::new(index),
            blocks,
        }
    }

    /// Rebuild a registry from persisted branches, listed in creation order.
    ///
    /// Block reference counts are not touched; they were persisted with the
    /// blocks.
    pub(crate) fn from_parts(
        blocks: Arc<BlockStore>,
        branches: Vec<(Branch, Snapshot, Vec<OpLogEntry>)>,
        created: u64,
    ) -> Result<Self> {
        let mut index = RegistryIndex {
            created,
            ..Default::default()
        };

        for (ordinal, (meta, snapshot, log)) in branches.into_iter().enumerate() {
            if index.name_to_id.contains_key(&meta.name) {
                return Err(StoreError::Corruption(format!(
                    "duplicate branch name: {}",
                    meta.name
                )));
            }
            index.name_to_id.insert(meta.name.clone(), meta.id.clone());
            index.branches.insert(
                meta.id.clone(),
                Arc::new(BranchCell::new(ordinal as u64, meta, snapshot, log)),
            );
        }

        if !index.branches.contains_key(&BranchId::main()) {
            return Err(StoreError::Corruption("main branch missing".into()));
        }

        Ok(Self {
            index: RwLock::new(index),
            blocks,
        })
    }

    /// Number of branches ever created (used to number new ones).
    pub(crate) fn created_count(&self) -> u64 {
        self.index.read().created
    }

    /// Create a branch that shares `parent_id`'s current snapshot.
    ///
    /// No table data is copied: each block the parent references gains one
    /// reference. `name` defaults to `branch-<n>`.
    pub fn create_branch(&self, parent_id: &BranchId, name: Option<&str>) -> Result<Branch> {
        let mut index = self.index.write();

        let parent = index
            .branches
            .get(parent_id)
            .cloned()
            .ok_or_else(|| StoreError::ParentNotFound(parent_id.clone()))?;

        let number = index.created + 1;
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("branch-{}", number));
        if index.name_to_id.contains_key(&name) {
            return Err(StoreError::BranchExists(name));
        }

        let id = BranchId::numbered(number);
        if index.branches.contains_key(&id) {
            return Err(StoreError::Corruption(format!("branch id reused: {}", id)));
        }

        let snapshot = {
            let parent_state = parent.state();
            if !parent_state.meta.status.is_active() {
                return Err(StoreError::BranchNotActive(parent_id.clone()));
            }
            self.blocks.retain(parent_state.snapshot.values())?;
            parent_state.snapshot.clone()
        };

        let meta = Branch {
            id: id.clone(),
            name: name.clone(),
            parent: Some(parent_id.clone()),
            created: Timestamp::now(),
            status: BranchStatus::Active,
        };

        let tables = snapshot.len();
        index.created = number;
        index.name_to_id.insert(name, id.clone());
        index.branches.insert(
            id.clone(),
            Arc::new(BranchCell::new(number, meta.clone(), snapshot, Vec::new())),
        );

        info!(branch = %id, parent = %parent_id, name = %meta.name, tables, "created branch");
        Ok(meta)
    }

    /// Get a branch by id.
    pub fn get(&self, id: &BranchId) -> Result<Arc<BranchCell>> {
        self.index
            .read()
            .branches
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::BranchNotFound(id.clone()))
    }

    /// Get branch metadata by id.
    pub fn get_branch(&self, id: &BranchId) -> Result<Branch> {
        Ok(self.get(id)?.info())
    }

    /// Find a branch by its name.
    pub fn find_by_name(&self, name: &str) -> Option<Branch> {
        let index = self.index.read();
        let id = index.name_to_id.get(name)?;
        index.branches.get(id).map(|cell| cell.info())
    }

    pub fn contains(&self, id: &BranchId) -> bool {
        self.index.read().branches.contains_key(id)
    }

    /// All live branches, oldest first.
    pub fn cells(&self) -> Vec<Arc<BranchCell>> {
        let mut cells: Vec<_> = self.index.read().branches.values().cloned().collect();
        cells.sort_by_key(|cell| cell.ordinal);
        cells
    }

    /// Metadata of all live branches, oldest first.
    pub fn list_branches(&self) -> Vec<Branch> {
        self.cells().iter().map(|cell| cell.info()).collect()
    }

    pub fn branch_count(&self) -> usize {
        self.index.read().branches.len()
    }

    /// Branches whose parent is `id`.
    pub fn children(&self, id: &BranchId) -> Vec<Branch> {
        self.list_branches()
            .into_iter()
            .filter(|b| b.parent.as_ref() == Some(id))
            .collect()
    }

    /// Branch lineage from `id` up to `main`.
    pub fn ancestry(&self, id: &BranchId) -> Result<Vec<Branch>> {
        let index = self.index.read();
        let mut ancestry = Vec::new();

        let mut current = Some(
            index
                .branches
                .get(id)
                .ok_or_else(|| StoreError::BranchNotFound(id.clone()))?
                .info(),
        );

        while let Some(branch) = current {
            if ancestry.len() > index.branches.len() {
                return Err(StoreError::Corruption(format!(
                    "cycle in parent chain of {}",
                    id
                )));
            }
            current = branch
                .parent
                .as_ref()
                .and_then(|pid| index.branches.get(pid))
                .map(|cell| cell.info());
            ancestry.push(branch);
        }

        Ok(ancestry)
    }

    /// Delete a branch, releasing its blocks. `main` is protected.
    ///
    /// A branch frozen by a merge keeps its `Merged` status; anything else
    /// ends `RolledBack`. Returns the number of blocks freed.
    pub fn delete_branch(&self, id: &BranchId) -> Result<usize> {
        self.remove(id, BranchStatus::RolledBack, false)
    }

    /// Remove a branch for good. An active branch is left in `terminal`
    /// status for anyone still holding its cell; a terminal status is never
    /// rewritten. With `require_active`, a branch that already left `Active`
    /// is rejected with `BranchNotActive` and stays untouched.
    ///
    /// Children are re-parented to the removed branch's parent so every
    /// parent chain still ends at `main`.
    pub(crate) fn remove(
        &self,
        id: &BranchId,
        terminal: BranchStatus,
        require_active: bool,
    ) -> Result<usize> {
        if id.is_main() {
            return Err(StoreError::ProtectedBranch(id.clone()));
        }

        let mut index = self.index.write();
        let cell = index
            .branches
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::BranchNotFound(id.clone()))?;

        let (name, parent, status, snapshot) = {
            let mut state = cell.state();
            if state.meta.status.is_active() {
                state.meta.status = terminal;
            } else if require_active {
                return Err(StoreError::BranchNotActive(id.clone()));
            }
            (
                state.meta.name.clone(),
                state.meta.parent.clone(),
                state.meta.status,
                std::mem::take(&mut state.snapshot),
            )
        };
        index.branches.remove(id);
        index.name_to_id.remove(&name);

        let mut reparented = 0;
        for child in index.branches.values() {
            let mut state = child.state();
            if state.meta.parent.as_ref() == Some(id) {
                state.meta.parent = parent.clone();
                reparented += 1;
            }
        }
        drop(index);

        let freed = self.blocks.release_all(snapshot.values())?;
        info!(branch = %id, ?status, freed, reparented, "removed branch");
        Ok(freed)
    }

    /// Freeze a branch after a merge: it stays readable but accepts no writes.
    pub(crate) fn freeze(&self, id: &BranchId) -> Result<()> {
        if id.is_main() {
            return Err(StoreError::ProtectedBranch(id.clone()));
        }
        let cell = self.get(id)?;
        cell.state().meta.status = BranchStatus::Merged;
        debug!(branch = %id, "froze merged branch");
        Ok(())
    }

    /// Copy out every branch, oldest first, together with the block table.
    ///
    /// Holds the registry lock and every branch's state lock while copying,
    /// so no write, create or delete lands half way through the image.
    pub(crate) fn export(&self) -> RegistryExport {
        let index = self.index.write();
        let mut cells: Vec<_> = index.branches.values().cloned().collect();
        cells.sort_by_key(|cell| cell.ordinal);

        let guards: Vec<_> = cells.iter().map(|cell| cell.state()).collect();
        let branches = guards
            .iter()
            .map(|state| (state.meta.clone(), state.snapshot.clone(), state.log.clone()))
            .collect();
        let (blocks, last_block_id, last_version) = self.blocks.to_parts();

        RegistryExport {
            branches,
            created: index.created,
            blocks,
            last_block_id,
            last_version,
        }
    }

    /// Garbage collect branches based on criteria. `main` is never collected.
    pub fn gc(&self, options: &BranchGcOptions) -> Result<BranchGcResult> {
        let mut result = BranchGcResult::default();

        let candidates: Vec<Branch> = self
            .cells()
            .iter()
            .filter(|cell| !cell.id().is_main())
            .filter(|cell| {
                let state = cell.state();
                let empty = options.delete_empty && state.log.is_empty();
                let merged = options.delete_merged && state.meta.status == BranchStatus::Merged;
                let stale = options
                    .delete_stale_older_than
                    .is_some_and(|cutoff| state.meta.created < cutoff);
                empty || merged || stale
            })
            .map(|cell| cell.info())
            .filter(|branch| match &options.name_patterns {
                Some(patterns) => patterns.iter().any(|p| branch.name.contains(p.as_str())),
                None => true,
            })
            .collect();

        for branch in candidates {
            // A concurrent delete may have beaten us to it.
            match self.delete_branch(&branch.id) {
                Ok(freed) => {
                    result.blocks_freed += freed;
                    result.deleted.push((branch.id, freed));
                }
                Err(StoreError::BranchNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> (Arc<BlockStore>, BranchRegistry) {
        let blocks = Arc::new(BlockStore::new());
        let registry = BranchRegistry::new(Arc::clone(&blocks));
        (blocks, registry)
    }

    /// Put a one-row table on a branch directly.
    fn seed_table(blocks: &BlockStore, registry: &BranchRegistry, branch: &BranchId, table: &str) {
        let write = blocks.allocate_for_write(|rows| rows.push(json!({"id": 1})));
        let cell = registry.get(branch).unwrap();
        cell.state().snapshot.insert(table.to_string(), write.block);
    }

    #[test]
    fn test_idle_table_locks_are_pruned() {
        let (_, registry) = registry();
        let cell = registry.get(&BranchId::main()).unwrap();

        let held = cell.table_lock("orders");
        let _guard = held.lock();
        for n in 0..100 {
            drop(cell.table_lock(&format!("t{}", n)));
        }

        assert!(cell.table_locks.lock().len() <= 2);
        assert!(Arc::ptr_eq(&held, &cell.table_lock("orders")));
    }

    #[test]
    fn test_new_has_main_branch() {
        let (_, registry) = registry();
        let main = registry.get_branch(&BranchId::main()).unwrap();
        assert_eq!(main.name, MAIN_BRANCH);
        assert!(main.parent.is_none());
        assert_eq!(main.status, BranchStatus::Active);
    }

    #[test]
    fn test_create_branch_shares_blocks() {
        let (blocks, registry) = registry();
        seed_table(&blocks, &registry, &BranchId::main(), "products");
        seed_table(&blocks, &registry, &BranchId::main(), "orders");

        let branch = registry.create_branch(&BranchId::main(), Some("disc10")).unwrap();
        assert_eq!(branch.id, BranchId::numbered(1));
        assert_eq!(branch.parent, Some(BranchId::main()));

        let main_snapshot = registry.get(&BranchId::main()).unwrap().snapshot();
        let child_snapshot = registry.get(&branch.id).unwrap().snapshot();
        assert_eq!(main_snapshot, child_snapshot);

        for id in child_snapshot.values() {
            assert_eq!(blocks.ref_count(*id), Some(2));
        }
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks.metrics().allocations, 2);
    }

    #[test]
    fn test_create_branch_unknown_parent() {
        let (_, registry) = registry();
        let result = registry.create_branch(&BranchId::from("nope"), None);
        assert!(matches!(result, Err(StoreError::ParentNotFound(_))));
        assert_eq!(registry.created_count(), 0);
    }

    #[test]
    fn test_default_names_and_duplicates() {
        let (_, registry) = registry();
        let first = registry.create_branch(&BranchId::main(), None).unwrap();
        assert_eq!(first.name, "branch-1");

        let result = registry.create_branch(&BranchId::main(), Some("branch-1"));
        assert!(matches!(result, Err(StoreError::BranchExists(_))));

        let second = registry.create_branch(&BranchId::main(), None).unwrap();
        assert_eq!(second.id, BranchId::numbered(2));
        assert!(registry.find_by_name("branch-2").is_some());
    }

    #[test]
    fn test_cannot_delete_main() {
        let (_, registry) = registry();
        let result = registry.delete_branch(&BranchId::main());
        assert!(matches!(result, Err(StoreError::ProtectedBranch(_))));
    }

    #[test]
    fn test_delete_releases_blocks() {
        let (blocks, registry) = registry();
        seed_table(&blocks, &registry, &BranchId::main(), "products");
        let branch = registry.create_branch(&BranchId::main(), None).unwrap();

        // Give the branch a private table too.
        seed_table(&blocks, &registry, &branch.id, "scratch");
        assert_eq!(blocks.len(), 2);

        let freed = registry.delete_branch(&branch.id).unwrap();
        assert_eq!(freed, 1);
        assert_eq!(blocks.len(), 1);

        let shared = registry.get(&BranchId::main()).unwrap().snapshot()["products"];
        assert_eq!(blocks.ref_count(shared), Some(1));
        assert!(matches!(
            registry.get(&branch.id),
            Err(StoreError::BranchNotFound(_))
        ));
    }

    #[test]
    fn test_delete_reparents_children() {
        let (_, registry) = registry();
        let feature = registry.create_branch(&BranchId::main(), Some("feature")).unwrap();
        let sub = registry.create_branch(&feature.id, Some("sub")).unwrap();

        registry.delete_branch(&feature.id).unwrap();

        let sub = registry.get_branch(&sub.id).unwrap();
        assert_eq!(sub.parent, Some(BranchId::main()));
    }

    #[test]
    fn test_get_ancestry() {
        let (_, registry) = registry();
        let feature = registry.create_branch(&BranchId::main(), Some("feature")).unwrap();
        let sub = registry.create_branch(&feature.id, Some("sub-feature")).unwrap();

        let ancestry = registry.ancestry(&sub.id).unwrap();
        let names: Vec<_> = ancestry.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["sub-feature", "feature", MAIN_BRANCH]);
    }

    #[test]
    fn test_list_branches_in_creation_order() {
        let (_, registry) = registry();
        for name in ["a", "b", "c"] {
            registry.create_branch(&BranchId::main(), Some(name)).unwrap();
        }
        let names: Vec<_> = registry.list_branches().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec![MAIN_BRANCH, "a", "b", "c"]);
        assert_eq!(registry.children(&BranchId::main()).len(), 3);
    }

    #[test]
    fn test_frozen_parent_cannot_fork() {
        let (_, registry) = registry();
        let branch = registry.create_branch(&BranchId::main(), None).unwrap();
        registry.freeze(&branch.id).unwrap();

        let result = registry.create_branch(&branch.id, None);
        assert!(matches!(result, Err(StoreError::BranchNotActive(_))));
    }

    #[test]
    fn test_gc_with_patterns() {
        let (_, registry) = registry();
        registry.create_branch(&BranchId::main(), Some("whatif-1")).unwrap();
        registry.create_branch(&BranchId::main(), Some("whatif-2")).unwrap();
        let keep = registry.create_branch(&BranchId::main(), Some("hotfix")).unwrap();

        let result = registry
            .gc(&BranchGcOptions {
                delete_empty: true,
                name_patterns: Some(vec!["whatif".to_string()]),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(result.deleted.len(), 2);
        assert!(registry.contains(&keep.id));
        assert!(registry.contains(&BranchId::main()));
    }
}
