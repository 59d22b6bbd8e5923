//! # Branch Store
//!
//! A copy-on-write branching table store for what-if exploration: fork a
//! branch, change it freely, then merge it back or throw it away.
//!
//! ## Core Concepts
//!
//! - **Blocks**: Reference-counted row sets; one block holds one table
//! - **Branches**: Named snapshots mapping table names to blocks
//! - **Copy-on-write**: Forking shares blocks; the first write to a shared
//!   block clones it, later writes go in place
//! - **Merge**: Replays a branch's operation log onto another branch and
//!   reports conflicting entries instead of resolving them
//!
//! ## Example
//!
//! ```ignore
//! use branchstore::{BranchId, Store, StoreConfig};
//! use serde_json::json;
//!
//! let store = Store::new(StoreConfig::default());
//! let main = BranchId::main();
//! store.update(&main, "products", json!({"id": 123, "price": 99.99}))?;
//!
//! // Try a discount on a branch
//! let b1 = store.create_branch(&main, Some("disc10"))?;
//! store.update(&b1.id, "products", json!({"id": 123, "price": 89.99}))?;
//!
//! // main is untouched until the merge
//! let result = store.merge(&b1.id, &main)?;
//! assert!(result.is_clean());
//! ```

pub mod blocks;
pub mod branches;
pub mod cache;
pub mod cow;
pub mod error;
pub mod events;
pub mod merge;
pub mod persist;
pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use blocks::{Block, BlockMetrics, BlockStore};
pub use branches::{BranchCell, BranchGcOptions, BranchGcResult, BranchRegistry};
pub use cache::{QueryCache, QueryCacheConfig, SimilarHit, SimilarResultFinder};
pub use cow::{CowEngine, WriteOutcome};
pub use error::{Result, StoreError};
pub use events::{
    DropReason, EventBus, EventFilter, StoreEvent, SubscriptionConfig, SubscriptionHandle,
    SubscriptionId,
};
pub use merge::MergeCoordinator;
pub use store::{CacheHit, CachedQuery, Store, StoreConfig};
pub use types::{
    BlockId, Branch, BranchId, BranchStatus, Hash, MergeConflict, MergeOptions, MergeResult,
    OpLogEntry, Snapshot, SourceDisposition, StoreStats, TableView, TableWrite, Timestamp,
    Version, MAIN_BRANCH,
};
