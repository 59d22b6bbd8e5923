//! Copy-on-write table writes.
//!
//! Applies one table-level write to one branch: the branch's block for the
//! table is made exclusive (cloned if shared), mutated, and the branch's
//! snapshot and operation log are updated in the same critical section.

mod engine;

pub use engine::{CowEngine, WriteOutcome};
