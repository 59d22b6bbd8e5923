//! Reference-counted block storage.
//!
//! Every table a branch can see lives in a block. Branches share blocks by
//! id and only materialize a private copy on the first write to a block
//! someone else still references (copy-on-write).

mod store;

pub use store::{Block, BlockMetrics, BlockStore, BlockWrite};
