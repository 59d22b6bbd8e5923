//! Table write semantics.
//!
//! A table is an ordered set of JSON rows. Rows are keyed by a configurable
//! key field (`"id"` by default); writes are validated against the current
//! rows before anything is mutated, so a rejected write leaves the table
//! untouched.

mod operations;

pub use operations::{apply_write, validate_write, DEFAULT_KEY_FIELD};
