//! Copy-on-write engine implementation.

use crate::blocks::BlockStore;
use crate::branches::BranchCell;
use crate::error::{Result, StoreError};
use crate::tables::{apply_write, validate_write};
use crate::types::{OpLogEntry, TableWrite, Timestamp, Version};
use std::sync::Arc;
use tracing::debug;

/// Outcome of a conditional write.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOutcome {
    /// The write was committed.
    Applied(OpLogEntry),

    /// The table was not at the expected version; nothing was written.
    Conflict { found: Version },
}

/// Applies table writes to branches.
pub struct CowEngine {
    blocks: Arc<BlockStore>,
    key_field: String,
}

impl CowEngine {
    pub fn new(blocks: Arc<BlockStore>, key_field: impl Into<String>) -> Self {
        Self {
            blocks,
            key_field: key_field.into(),
        }
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Current version of `table` on a branch (`ABSENT` if the table does
    /// not exist there).
    pub fn current_version(&self, cell: &BranchCell, table: &str) -> Result<Version> {
        let block = cell.state().snapshot.get(table).copied();
        match block {
            None => Ok(Version::ABSENT),
            Some(id) => self.blocks.version(id).map_err(|e| match e {
                // The branch was removed and its blocks released under us.
                StoreError::BlockNotFound(_) if !cell.status().is_active() => {
                    StoreError::BranchNotActive(cell.id().clone())
                }
                other => other,
            }),
        }
    }

    /// Apply `write` to `table` on a branch.
    ///
    /// Writes to the same table of a branch are applied one at a time in
    /// arrival order. A write that fails validation changes nothing.
    pub fn update(&self, cell: &BranchCell, table: &str, write: TableWrite) -> Result<OpLogEntry> {
        validate_write(table, &write, &self.key_field)?;

        let lock = cell.table_lock(table);
        let _guard = lock.lock();
        self.commit(cell, table, write)
    }

    /// Apply `write` only if `table` is still at `expected` on the branch.
    pub fn write_if_version(
        &self,
        cell: &BranchCell,
        table: &str,
        write: TableWrite,
        expected: Version,
    ) -> Result<WriteOutcome> {
        validate_write(table, &write, &self.key_field)?;

        let lock = cell.table_lock(table);
        let _guard = lock.lock();

        // Only writers holding the table lock move the version.
        let found = self.current_version(cell, table)?;
        if found != expected {
            return Ok(WriteOutcome::Conflict { found });
        }

        self.commit(cell, table, write).map(WriteOutcome::Applied)
    }

    /// Write and swap the snapshot pointer in one critical section.
    ///
    /// The caller holds the table lock and has validated the write.
    fn commit(&self, cell: &BranchCell, table: &str, write: TableWrite) -> Result<OpLogEntry> {
        let mut state = cell.state();
        if !state.meta.status.is_active() {
            return Err(StoreError::BranchNotActive(cell.id().clone()));
        }

        let key_field = self.key_field.as_str();
        let result = match state.snapshot.get(table).copied() {
            Some(id) => self
                .blocks
                .clone_for_write(id, |rows| apply_write(rows, &write, key_field))?,
            None => self
                .blocks
                .allocate_for_write(|rows| apply_write(rows, &write, key_field)),
        };

        state.snapshot.insert(table.to_string(), result.block);
        if let Some(shared) = result.cloned_from {
            // Hand back this branch's reference to the block it used to share.
            self.blocks.release(shared)?;
        }

        let entry = OpLogEntry {
            seq: state.log.len() as u64 + 1,
            table: table.to_string(),
            write,
            timestamp: Timestamp::now(),
            base_version: result.base_version,
            result_version: result.version,
        };
        state.log.push(entry.clone());

        debug!(
            branch = %cell.id(),
            table,
            op = entry.write.kind(),
            base = %entry.base_version,
            version = %entry.result_version,
            cloned = result.cloned_from.is_some(),
            "committed write"
        );

        Ok(entry)
    }
}
