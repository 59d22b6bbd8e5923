//! Branch registry with copy-on-write snapshots.
//!
//! Creating a branch shares the parent's blocks by reference: the cost is
//! one reference-count bump per table, independent of how much data the
//! tables hold. The branches form a forest rooted at `main`.

mod registry;

pub use registry::{BranchCell, BranchGcOptions, BranchGcResult, BranchRegistry};
pub(crate) use registry::RegistryExport;
