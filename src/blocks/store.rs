//! Block store implementation.

use crate::error::{Result, StoreError};
use crate::types::{BlockId, Hash, Version};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// An immutable-by-default unit of table data.
///
/// Blocks with a single owner are mutated in place; shared blocks are never
/// mutated, a writer gets a private copy instead.
#[derive(Clone, Debug)]
pub struct Block {
    pub id: BlockId,
    pub rows: Arc<Vec<Value>>,
    pub version: Version,
    pub ref_count: usize,
}

impl Block {
    /// SHA-256 over the JSON encoding of the rows.
    pub fn content_hash(&self) -> Hash {
        Hash::of_rows(&self.rows)
    }
}

/// Result of a copy-on-write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockWrite {
    /// Block now holding the written rows.
    pub block: BlockId,

    /// Version before the write (`ABSENT` for a fresh table).
    pub base_version: Version,

    /// Version after the write.
    pub version: Version,

    /// Shared block the rows were copied from, if the write had to clone.
    ///
    /// The caller still holds its reference to this block and must
    /// [`release`](BlockStore::release) it once its snapshot points at
    /// `block`.
    pub cloned_from: Option<BlockId>,
}

/// Block store counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockMetrics {
    pub allocations: u64,
    pub in_place_writes: u64,
    pub clones: u64,
    pub freed: u64,
}

#[derive(Default)]
struct BlockTable {
    blocks: HashMap<BlockId, Block>,
    last_id: u64,
    last_version: Version,
    metrics: BlockMetrics,
}

impl BlockTable {
    fn allocate(&mut self, rows: Vec<Value>, version: Version) -> BlockId {
        self.last_id += 1;
        let id = BlockId(self.last_id);
        self.blocks.insert(
            id,
            Block {
                id,
                rows: Arc::new(rows),
                version,
                ref_count: 1,
            },
        );
        self.metrics.allocations += 1;
        id
    }

    fn next_version(&mut self) -> Version {
        self.last_version = self.last_version.next();
        self.last_version
    }
}

/// Owner of every block in a store.
///
/// All reference-count changes happen under one mutex, so attaching a block
/// to a new branch can never race with the release that would free it.
pub struct BlockStore {
    table: Mutex<BlockTable>,
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(BlockTable::default()),
        }
    }

    /// Rebuild a store from persisted blocks.
    pub(crate) fn from_parts(blocks: Vec<Block>, last_id: u64, last_version: Version) -> Self {
        let blocks = blocks.into_iter().map(|b| (b.id, b)).collect();
        Self {
            table: Mutex::new(BlockTable {
                blocks,
                last_id,
                last_version,
                metrics: BlockMetrics::default(),
            }),
        }
    }

    /// Copy out every block plus the id and version counters.
    pub(crate) fn to_parts(&self) -> (Vec<Block>, u64, Version) {
        let table = self.table.lock();
        let mut blocks: Vec<Block> = table.blocks.values().cloned().collect();
        blocks.sort_by_key(|b| b.id);
        (blocks, table.last_id, table.last_version)
    }

    /// Get a block by id.
    pub fn get(&self, id: BlockId) -> Result<Block> {
        self.table
            .lock()
            .blocks
            .get(&id)
            .cloned()
            .ok_or(StoreError::BlockNotFound(id))
    }

    /// Current version and rows of a block.
    ///
    /// The rows are shared; later writes to the block never show through
    /// the returned `Arc`.
    pub fn read(&self, id: BlockId) -> Result<(Version, Arc<Vec<Value>>)> {
        let table = self.table.lock();
        let block = table.blocks.get(&id).ok_or(StoreError::BlockNotFound(id))?;
        Ok((block.version, Arc::clone(&block.rows)))
    }

    pub fn version(&self, id: BlockId) -> Result<Version> {
        self.table
            .lock()
            .blocks
            .get(&id)
            .map(|b| b.version)
            .ok_or(StoreError::BlockNotFound(id))
    }

    pub fn ref_count(&self, id: BlockId) -> Option<usize> {
        self.table.lock().blocks.get(&id).map(|b| b.ref_count)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.table.lock().blocks.contains_key(&id)
    }

    /// Allocate a block for a table that does not exist yet and write to it.
    pub fn allocate_for_write(&self, mutate: impl FnOnce(&mut Vec<Value>)) -> BlockWrite {
        let mut rows = Vec::new();
        mutate(&mut rows);

        let mut table = self.table.lock();
        let version = table.next_version();
        let block = table.allocate(rows, version);
        trace!(%block, %version, "allocated block");

        BlockWrite {
            block,
            base_version: Version::ABSENT,
            version,
            cloned_from: None,
        }
    }

    /// Make `id` writable for its caller and apply `mutate` to it.
    ///
    /// A block referenced only by the caller is mutated in place and keeps
    /// its id. A shared block is left untouched: its rows are copied into a
    /// new block which receives the write. Either way the written block gets
    /// a fresh version.
    pub fn clone_for_write(
        &self,
        id: BlockId,
        mutate: impl FnOnce(&mut Vec<Value>),
    ) -> Result<BlockWrite> {
        let mut table = self.table.lock();
        let version = table.next_version();

        let block = table
            .blocks
            .get_mut(&id)
            .ok_or(StoreError::BlockNotFound(id))?;
        let base_version = block.version;

        if block.ref_count == 1 {
            // Readers holding the old `Arc` keep their copy.
            mutate(Arc::make_mut(&mut block.rows));
            block.version = version;
            table.metrics.in_place_writes += 1;
            trace!(block = %id, %version, "wrote block in place");

            return Ok(BlockWrite {
                block: id,
                base_version,
                version,
                cloned_from: None,
            });
        }

        let mut rows = Vec::clone(&block.rows);
        mutate(&mut rows);
        let new_id = table.allocate(rows, version);
        table.metrics.clones += 1;
        trace!(from = %id, to = %new_id, %version, "cloned shared block");

        Ok(BlockWrite {
            block: new_id,
            base_version,
            version,
            cloned_from: Some(id),
        })
    }

    /// Add one reference to each block. Fails without changing anything if
    /// any id is unknown.
    pub fn retain<'a>(&self, ids: impl IntoIterator<Item = &'a BlockId> + Clone) -> Result<()> {
        let mut table = self.table.lock();

        if let Some(missing) = ids.clone().into_iter().find(|id| !table.blocks.contains_key(*id)) {
            return Err(StoreError::BlockNotFound(*missing));
        }

        for id in ids {
            if let Some(block) = table.blocks.get_mut(id) {
                block.ref_count += 1;
            }
        }
        Ok(())
    }

    /// Drop one reference, freeing the block when none remain.
    ///
    /// Returns whether the block was freed.
    pub fn release(&self, id: BlockId) -> Result<bool> {
        let mut table = self.table.lock();
        Self::release_locked(&mut table, id)
    }

    /// Release a reference to each block. Returns the number freed.
    pub fn release_all<'a>(&self, ids: impl IntoIterator<Item = &'a BlockId>) -> Result<usize> {
        let mut table = self.table.lock();
        let mut freed = 0;
        for id in ids {
            if Self::release_locked(&mut table, *id)? {
                freed += 1;
            }
        }
        Ok(freed)
    }

    fn release_locked(table: &mut BlockTable, id: BlockId) -> Result<bool> {
        let block = table
            .blocks
            .get_mut(&id)
            .ok_or(StoreError::BlockNotFound(id))?;

        block.ref_count -= 1;
        if block.ref_count > 0 {
            return Ok(false);
        }

        table.blocks.remove(&id);
        table.metrics.freed += 1;
        trace!(block = %id, "freed block");
        Ok(true)
    }

    /// Number of live blocks.
    pub fn len(&self) -> usize {
        self.table.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live blocks referenced by more than one owner.
    pub fn shared_count(&self) -> usize {
        self.table
            .lock()
            .blocks
            .values()
            .filter(|b| b.ref_count > 1)
            .count()
    }

    pub fn metrics(&self) -> BlockMetrics {
        self.table.lock().metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded(store: &BlockStore) -> BlockId {
        store
            .allocate_for_write(|rows| rows.push(json!({"id": 1, "price": 10})))
            .block
    }

    #[test]
    fn test_exclusive_block_written_in_place() {
        let store = BlockStore::new();
        let id = seeded(&store);
        let before = store.version(id).unwrap();

        let write = store
            .clone_for_write(id, |rows| rows.push(json!({"id": 2})))
            .unwrap();

        assert_eq!(write.block, id);
        assert_eq!(write.cloned_from, None);
        assert_eq!(write.base_version, before);
        assert!(write.version > before);
        assert_eq!(store.len(), 1);
        assert_eq!(store.metrics().allocations, 1);
        assert_eq!(store.metrics().in_place_writes, 1);
    }

    #[test]
    fn test_shared_block_is_cloned() {
        let store = BlockStore::new();
        let id = seeded(&store);
        store.retain([id].iter()).unwrap();
        assert_eq!(store.ref_count(id), Some(2));

        let write = store
            .clone_for_write(id, |rows| rows[0]["price"] = json!(8))
            .unwrap();

        assert_ne!(write.block, id);
        assert_eq!(write.cloned_from, Some(id));

        // The original is untouched until the writer detaches from it.
        let (_, original) = store.read(id).unwrap();
        assert_eq!(original[0]["price"], 10);
        assert_eq!(store.ref_count(id), Some(2));

        assert!(!store.release(id).unwrap());
        assert_eq!(store.ref_count(id), Some(1));

        let (_, copy) = store.read(write.block).unwrap();
        assert_eq!(copy[0]["price"], 8);
    }

    #[test]
    fn test_reader_keeps_snapshot_across_in_place_write() {
        let store = BlockStore::new();
        let id = seeded(&store);
        let (_, held) = store.read(id).unwrap();

        store
            .clone_for_write(id, |rows| rows.clear())
            .unwrap();

        assert_eq!(held.len(), 1);
        assert!(store.read(id).unwrap().1.is_empty());
    }

    #[test]
    fn test_release_frees_at_zero() {
        let store = BlockStore::new();
        let id = seeded(&store);

        assert!(store.release(id).unwrap());
        assert!(!store.contains(id));
        assert_eq!(store.metrics().freed, 1);
        assert!(matches!(store.release(id), Err(StoreError::BlockNotFound(_))));
    }

    #[test]
    fn test_retain_is_all_or_nothing() {
        let store = BlockStore::new();
        let id = seeded(&store);

        let result = store.retain([id, BlockId(999)].iter());
        assert!(matches!(result, Err(StoreError::BlockNotFound(BlockId(999)))));
        assert_eq!(store.ref_count(id), Some(1));
    }

    #[test]
    fn test_versions_are_unique_across_blocks() {
        let store = BlockStore::new();
        let a = store.allocate_for_write(|_| {});
        let b = store.allocate_for_write(|_| {});
        let a2 = store.clone_for_write(a.block, |_| {}).unwrap();

        assert_ne!(a.version, b.version);
        assert_ne!(a2.version, b.version);
        assert!(a2.version > b.version);
    }
}
