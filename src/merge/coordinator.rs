//! Merge/rollback coordinator implementation.

use crate::branches::BranchRegistry;
use crate::cow::{CowEngine, WriteOutcome};
use crate::error::{Result, StoreError};
use crate::types::{
    BranchId, BranchStatus, MergeConflict, MergeOptions, MergeResult, SourceDisposition, Version,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Drives merges and rollbacks across the registry and the write engine.
pub struct MergeCoordinator {
    registry: Arc<BranchRegistry>,
    engine: Arc<CowEngine>,
}

impl MergeCoordinator {
    pub fn new(registry: Arc<BranchRegistry>, engine: Arc<CowEngine>) -> Self {
        Self { registry, engine }
    }

    /// Replay `source`'s operation log onto `target`.
    ///
    /// The source log is read, never modified. Applied entries are appended
    /// to the target's own log as new writes. Entries already applied stay
    /// applied if the merge fails part way.
    pub fn merge(
        &self,
        source: &BranchId,
        target: &BranchId,
        options: &MergeOptions,
    ) -> Result<MergeResult> {
        let source_cell = self.registry.get(source)?;
        let target_cell = self.registry.get(target)?;

        if source == target {
            return Err(StoreError::SelfMergeRejected(source.clone()));
        }
        if !target_cell.status().is_active() {
            return Err(StoreError::BranchNotActive(target.clone()));
        }
        if source.is_main() && options.source != SourceDisposition::Keep {
            return Err(StoreError::ProtectedBranch(source.clone()));
        }

        let mut result = MergeResult::default();

        // table -> (source version, target version) after the last entry
        // this merge applied to that table.
        let mut rebased: HashMap<String, (Version, Version)> = HashMap::new();

        for entry in source_cell.log() {
            let expected = match rebased.get(&entry.table) {
                Some((after_source, after_target)) if *after_source == entry.base_version => {
                    *after_target
                }
                _ => entry.base_version,
            };

            let outcome = self.engine.write_if_version(
                &target_cell,
                &entry.table,
                entry.write.clone(),
                expected,
            )?;

            match outcome {
                WriteOutcome::Applied(applied) => {
                    rebased.insert(
                        entry.table.clone(),
                        (entry.result_version, applied.result_version),
                    );
                    result.applied.push(entry);
                    result.written.push(applied);
                }
                WriteOutcome::Conflict { found } => {
                    warn!(
                        source = %source,
                        target = %target,
                        table = %entry.table,
                        seq = entry.seq,
                        %expected,
                        %found,
                        "merge conflict"
                    );
                    result.conflicts.push(MergeConflict {
                        entry,
                        expected,
                        found,
                    });
                }
            }
        }

        match options.source {
            SourceDisposition::Keep => {}
            SourceDisposition::Freeze => self.registry.freeze(source)?,
            SourceDisposition::Delete => {
                let freed = self.registry.remove(source, BranchStatus::Merged, false)?;
                result.source_blocks_freed = Some(freed);
            }
        }

        info!(
            source = %source,
            target = %target,
            applied = result.applied.len(),
            conflicts = result.conflicts.len(),
            disposition = ?options.source,
            "merged branch"
        );

        Ok(result)
    }

    /// Discard an active branch and release its blocks. Irreversible.
    ///
    /// A branch already frozen by a merge is rejected with `BranchNotActive`.
    /// Returns the number of blocks freed.
    pub fn rollback(&self, id: &BranchId) -> Result<usize> {
        let freed = self.registry.remove(id, BranchStatus::RolledBack, true)?;
        info!(branch = %id, freed, "rolled back branch");
        Ok(freed)
    }
}
