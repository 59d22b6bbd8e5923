//! Main Store struct tying all components together.

use crate::blocks::BlockStore;
use crate::branches::{BranchGcOptions, BranchGcResult, BranchRegistry};
use crate::cache::{QueryCache, QueryCacheConfig, SimilarResultFinder};
use crate::cow::CowEngine;
use crate::error::{Result, StoreError};
use crate::events::{EventBus, StoreEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId};
use crate::merge::MergeCoordinator;
use crate::persist::{self, StoreImage, MANIFEST_FILE};
use crate::tables::DEFAULT_KEY_FIELD;
use crate::types::{
    Branch, BranchId, MergeOptions, MergeResult, OpLogEntry, StoreStats, TableView, TableWrite,
    Version,
};
use serde_json::Value;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory for the on-disk image. `None` keeps the store in memory.
    pub path: Option<PathBuf>,

    /// Row field that identifies a row for upserts and deletes.
    pub key_field: String,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Settings for the default query cache.
    pub cache: QueryCacheConfig,

    /// Buffer size for subscriptions made with [`Store::subscribe_all`].
    pub event_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            key_field: DEFAULT_KEY_FIELD.to_string(),
            create_if_missing: true,
            cache: QueryCacheConfig::default(),
            event_buffer_size: 1000,
        }
    }
}

impl StoreConfig {
    /// Config for an on-disk store at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }
}

/// Where a cached answer came from.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheHit {
    /// The earlier query the answer was recorded for.
    pub query: String,
    pub similarity: f64,
}

/// Result of [`Store::cached_query`].
#[derive(Clone, Debug, PartialEq)]
pub struct CachedQuery {
    pub view: TableView,
    /// Set when the view was served from the cache.
    pub hit: Option<CacheHit>,
}

/// The branch store.
///
/// Provides a unified interface for:
/// - Creating, merging, rolling back and deleting branches
/// - Writing to and reading tables on a branch
/// - Cached reads keyed by query text
/// - Subscribing to store events
///
/// `Store` is `Send + Sync`; share it across threads behind an `Arc`.
pub struct Store {
    config: StoreConfig,

    /// Lock file for exclusive access to `config.path`.
    _lock_file: Option<File>,

    blocks: Arc<BlockStore>,
    registry: Arc<BranchRegistry>,
    engine: Arc<CowEngine>,
    coordinator: MergeCoordinator,
    finder: Arc<dyn SimilarResultFinder>,
    events: EventBus,
}

impl Store {
    /// Create an in-memory store holding an empty `main` branch.
    ///
    /// `config.path` is ignored; use [`Store::create`] for an on-disk store.
    pub fn new(mut config: StoreConfig) -> Self {
        config.path = None;
        let blocks = Arc::new(BlockStore::new());
        let registry = Arc::new(BranchRegistry::new(Arc::clone(&blocks)));
        Self::assemble(config, None, blocks, registry)
    }

    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        let Some(path) = config.path.as_deref() else {
            return Ok(Self::new(config));
        };

        if path.join(MANIFEST_FILE).exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store. With no path this is the same as [`Store::new`].
    ///
    /// Fails with [`StoreError::AlreadyInitialized`] if `config.path`
    /// already holds a store; use [`Store::open`] for that.
    pub fn create(config: StoreConfig) -> Result<Self> {
        let Some(path) = config.path.clone() else {
            return Ok(Self::new(config));
        };

        fs::create_dir_all(&path)?;
        let lock_file = persist::acquire_lock(&path)?;
        if path.join(MANIFEST_FILE).exists() {
            return Err(StoreError::AlreadyInitialized(path));
        }
        persist::write_manifest(&path)?;

        let blocks = Arc::new(BlockStore::new());
        let registry = Arc::new(BranchRegistry::new(Arc::clone(&blocks)));

        info!(path = %path.display(), "created store");
        Ok(Self::assemble(config, Some(lock_file), blocks, registry))
    }

    /// Open an existing store, verifying its image.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let path = config.path.clone().ok_or(StoreError::NotInitialized)?;

        persist::verify_manifest(&path)?;
        let lock_file = persist::acquire_lock(&path)?;

        let (blocks, registry) = match persist::load_image(&path)? {
            Some(image) => {
                let parts = image.into_parts()?;
                let blocks = Arc::new(BlockStore::from_parts(
                    parts.blocks,
                    parts.last_block_id,
                    parts.last_version,
                ));
                let registry = BranchRegistry::from_parts(
                    Arc::clone(&blocks),
                    parts.branches,
                    parts.created,
                )?;
                (blocks, Arc::new(registry))
            }
            None => {
                let blocks = Arc::new(BlockStore::new());
                let registry = Arc::new(BranchRegistry::new(Arc::clone(&blocks)));
                (blocks, registry)
            }
        };

        info!(
            path = %path.display(),
            branches = registry.branch_count(),
            blocks = blocks.len(),
            "opened store"
        );
        Ok(Self::assemble(config, Some(lock_file), blocks, registry))
    }

    fn assemble(
        config: StoreConfig,
        lock_file: Option<File>,
        blocks: Arc<BlockStore>,
        registry: Arc<BranchRegistry>,
    ) -> Self {
        let engine = Arc::new(CowEngine::new(
            Arc::clone(&blocks),
            config.key_field.clone(),
        ));
        let coordinator = MergeCoordinator::new(Arc::clone(&registry), Arc::clone(&engine));
        let finder: Arc<dyn SimilarResultFinder> = Arc::new(QueryCache::new(config.cache.clone()));
        let events = EventBus::with_buffer_size(config.event_buffer_size);

        Self {
            config,
            _lock_file: lock_file,
            blocks,
            registry,
            engine,
            coordinator,
            finder,
            events,
        }
    }

    /// Replace the default query cache with another result finder.
    pub fn with_result_finder(mut self, finder: Arc<dyn SimilarResultFinder>) -> Self {
        self.finder = finder;
        self
    }

    // --- Branch Operations ---

    /// Fork `parent`. The new branch shares every table with its parent
    /// until one side writes. `name` defaults to `branch-<n>`.
    pub fn create_branch(&self, parent: &BranchId, name: Option<&str>) -> Result<Branch> {
        let branch = self.registry.create_branch(parent, name)?;
        self.events.publish(StoreEvent::BranchCreated {
            branch: branch.clone(),
        });
        Ok(branch)
    }

    pub fn get_branch(&self, id: &BranchId) -> Result<Branch> {
        self.registry.get_branch(id)
    }

    pub fn find_branch(&self, name: &str) -> Option<Branch> {
        self.registry.find_by_name(name)
    }

    /// All live branches, oldest first.
    pub fn list_branches(&self) -> Vec<Branch> {
        self.registry.list_branches()
    }

    pub fn children(&self, id: &BranchId) -> Vec<Branch> {
        self.registry.children(id)
    }

    /// Branch lineage from `id` up to `main`.
    pub fn ancestry(&self, id: &BranchId) -> Result<Vec<Branch>> {
        self.registry.ancestry(id)
    }

    /// Copy of a branch's operation log.
    pub fn operation_log(&self, id: &BranchId) -> Result<Vec<OpLogEntry>> {
        Ok(self.registry.get(id)?.log())
    }

    /// Delete a branch and release its blocks. `main` is protected.
    pub fn delete_branch(&self, id: &BranchId) -> Result<usize> {
        let freed = self.registry.delete_branch(id)?;
        self.events.publish(StoreEvent::BranchDeleted {
            branch: id.clone(),
            blocks_freed: freed,
        });
        Ok(freed)
    }

    /// Discard a branch and everything written to it. Irreversible.
    pub fn rollback(&self, id: &BranchId) -> Result<usize> {
        let freed = self.coordinator.rollback(id)?;
        self.events.publish(StoreEvent::RolledBack {
            branch: id.clone(),
            blocks_freed: freed,
        });
        Ok(freed)
    }

    /// Garbage collect branches. `main` is never collected.
    pub fn gc(&self, options: &BranchGcOptions) -> Result<BranchGcResult> {
        let result = self.registry.gc(options)?;
        for (branch, freed) in &result.deleted {
            self.events.publish(StoreEvent::BranchDeleted {
                branch: branch.clone(),
                blocks_freed: *freed,
            });
        }
        Ok(result)
    }

    // --- Table Operations ---

    /// Upsert `payload` into `table` on a branch.
    pub fn update(&self, branch: &BranchId, table: &str, payload: Value) -> Result<OpLogEntry> {
        self.apply(branch, table, TableWrite::Upsert(payload))
    }

    /// Apply any table write to a branch.
    pub fn apply(&self, branch: &BranchId, table: &str, write: TableWrite) -> Result<OpLogEntry> {
        let cell = self.registry.get(branch)?;
        let entry = self.engine.update(&cell, table, write)?;
        self.events.publish(StoreEvent::TableWritten {
            branch: branch.clone(),
            entry: entry.clone(),
        });
        Ok(entry)
    }

    /// Read a table on a branch. A table the branch never wrote or
    /// inherited reads as empty at `Version::ABSENT`.
    pub fn query(&self, branch: &BranchId, table: &str) -> Result<TableView> {
        let cell = self.registry.get(branch)?;

        // Hold the branch state so the block can't be released mid-read.
        let state = cell.state();
        let (version, rows) = match state.snapshot.get(table) {
            Some(id) => self.blocks.read(*id)?,
            None => (Version::ABSENT, Arc::new(Vec::new())),
        };

        Ok(TableView {
            branch: branch.clone(),
            table: table.to_string(),
            version,
            rows,
        })
    }

    /// Read a table, reusing the answer to an earlier, similar query when
    /// the table has not changed since.
    ///
    /// The finder is asked first and its answer checked against the table's
    /// current version only; rows are read just on a miss or a stale hit.
    pub fn cached_query(&self, branch: &BranchId, table: &str, query: &str) -> Result<CachedQuery> {
        let scope = format!("{}/{}", branch, table);
        let cell = self.registry.get(branch)?;

        if let Some(hit) = self.finder.find_similar(&scope, query) {
            let current = self.engine.current_version(&cell, table)?;
            if hit.result.version == current {
                debug!(%scope, query, matched = %hit.query, similarity = hit.similarity, "cache hit");
                return Ok(CachedQuery {
                    view: hit.result,
                    hit: Some(CacheHit {
                        query: hit.query,
                        similarity: hit.similarity,
                    }),
                });
            }
            debug!(
                %scope,
                query,
                cached = %hit.result.version,
                %current,
                "stale cached result"
            );
        }

        let view = self.query(branch, table)?;
        self.finder.record(&scope, query, view.clone());
        Ok(CachedQuery { view, hit: None })
    }

    // --- Merge ---

    /// Merge `source` into `target`, keeping `source` active.
    pub fn merge(&self, source: &BranchId, target: &BranchId) -> Result<MergeResult> {
        self.merge_with(source, target, &MergeOptions::default())
    }

    pub fn merge_with(
        &self,
        source: &BranchId,
        target: &BranchId,
        options: &MergeOptions,
    ) -> Result<MergeResult> {
        let result = self.coordinator.merge(source, target, options)?;
        for entry in &result.written {
            self.events.publish(StoreEvent::TableWritten {
                branch: target.clone(),
                entry: entry.clone(),
            });
        }
        self.events.publish(StoreEvent::Merged {
            source: source.clone(),
            target: target.clone(),
            applied: result.applied.len(),
            conflicts: result.conflicts.len(),
        });
        if let Some(freed) = result.source_blocks_freed {
            self.events.publish(StoreEvent::BranchDeleted {
                branch: source.clone(),
                blocks_freed: freed,
            });
        }
        Ok(result)
    }

    // --- Events ---

    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.events.subscribe(config)
    }

    /// Subscribe to every event using `StoreConfig::event_buffer_size`.
    pub fn subscribe_all(&self) -> SubscriptionHandle {
        self.events.subscribe_default()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.events.unsubscribe(id)
    }

    // --- Store Operations ---

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let branches = self.registry.list_branches();
        let total_operations = self
            .registry
            .cells()
            .iter()
            .map(|cell| cell.op_count() as u64)
            .sum();
        let metrics = self.blocks.metrics();

        StoreStats {
            total_branches: branches.len() as u64,
            active_branches: branches.iter().filter(|b| b.status.is_active()).count() as u64,
            total_blocks: self.blocks.len() as u64,
            shared_blocks: self.blocks.shared_count() as u64,
            total_operations,
            block_allocations: metrics.allocations,
            in_place_writes: metrics.in_place_writes,
            block_clones: metrics.clones,
            blocks_freed: metrics.freed,
        }
    }

    /// Write the store image to disk. A no-op for in-memory stores.
    pub fn sync(&self) -> Result<()> {
        let Some(path) = self.config.path.as_deref() else {
            return Ok(());
        };
        let image = StoreImage::from_export(self.registry.export());
        persist::save_image(path, &image)
    }

    /// Get the store path.
    pub fn path(&self) -> Option<&Path> {
        self.config.path.as_deref()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Best-effort sync on drop
        if let Err(e) = self.sync() {
            warn!(error = %e, "failed to sync store on drop");
        }
    }
}
