//! Merge and rollback of branches.
//!
//! Merging replays the source's operation log against the target, entry by
//! entry. An entry applies only if the target's table is still at the
//! version the entry was written on top of; otherwise it is reported as a
//! conflict and skipped. Merges are best-effort, not transactional.

mod coordinator;

pub use coordinator::MergeCoordinator;
