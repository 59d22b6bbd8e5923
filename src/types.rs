//! Core types for the branch store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name and id of the root branch.
pub const MAIN_BRANCH: &str = "main";

/// Identifier of a block in the snapshot store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of a table's contents.
///
/// Versions are drawn from one store-wide counter, so a version names exactly
/// one table state. `Version::ABSENT` stands for a table that does not exist.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Version(pub u64);

impl Version {
    pub const ABSENT: Version = Version(0);

    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }

    pub fn is_absent(self) -> bool {
        self == Self::ABSENT
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Unique identifier for a branch.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(String);

impl BranchId {
    pub fn new(id: impl Into<String>) -> Self {
        BranchId(id.into())
    }

    /// The reserved id of the root branch.
    pub fn main() -> Self {
        BranchId(MAIN_BRANCH.to_string())
    }

    /// Id assigned to the `n`th branch created by a store.
    pub fn numbered(n: u64) -> Self {
        BranchId(format!("branch_{}", n))
    }

    pub fn is_main(&self) -> bool {
        self.0 == MAIN_BRANCH
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchId({})", self.0)
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BranchId {
    fn from(s: &str) -> Self {
        BranchId(s.to_string())
    }
}

impl From<String> for BranchId {
    fn from(s: String) -> Self {
        BranchId(s)
    }
}

impl From<&BranchId> for BranchId {
    fn from(id: &BranchId) -> Self {
        id.clone()
    }
}

/// Content hash for blocks (SHA-256).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Hash of a row set's JSON encoding.
    pub fn of_rows(rows: &[Value]) -> Self {
        // Serializing a slice of `Value` cannot fail.
        let encoded = serde_json::to_vec(rows).unwrap_or_default();
        Self::from_bytes(&encoded)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Hash(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A branch's view of its tables: table name to block.
pub type Snapshot = BTreeMap<String, BlockId>;

/// A single table-level write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum TableWrite {
    /// Merge the payload's fields into the row with the same key, or append
    /// it when no such row exists (or the payload carries no key).
    Upsert(Value),

    /// Append one row.
    Append(Value),

    /// Remove every row whose key equals the given value.
    Delete(Value),

    /// Replace the whole row set.
    Replace(Vec<Value>),
}

impl TableWrite {
    pub fn kind(&self) -> &'static str {
        match self {
            TableWrite::Upsert(_) => "upsert",
            TableWrite::Append(_) => "append",
            TableWrite::Delete(_) => "delete",
            TableWrite::Replace(_) => "replace",
        }
    }
}

/// One committed write in a branch's operation log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpLogEntry {
    /// Position in the branch's log (1-based).
    pub seq: u64,

    /// Table the write touched.
    pub table: String,

    /// The write itself.
    pub write: TableWrite,

    /// When the write was committed.
    pub timestamp: Timestamp,

    /// Table version the write was applied on top of.
    pub base_version: Version,

    /// Table version the write produced.
    pub result_version: Version,
}

/// Lifecycle of a branch. `Merged` and `RolledBack` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchStatus {
    Active,
    Merged,
    RolledBack,
}

impl BranchStatus {
    pub fn is_active(self) -> bool {
        self == BranchStatus::Active
    }
}

/// Branch metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub parent: Option<BranchId>,
    pub created: Timestamp,
    pub status: BranchStatus,
}

/// Read-only view of one table on one branch.
#[derive(Clone, Debug, PartialEq)]
pub struct TableView {
    pub branch: BranchId,
    pub table: String,
    pub version: Version,
    pub rows: Arc<Vec<Value>>,
}

impl TableView {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Find the row whose `key_field` equals `key`.
    pub fn find(&self, key_field: &str, key: &Value) -> Option<&Value> {
        self.rows.iter().find(|row| row.get(key_field) == Some(key))
    }
}

/// What happens to the source branch after a merge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SourceDisposition {
    /// Source stays active and may keep diverging.
    #[default]
    Keep,
    /// Source becomes `Merged`: read-only but still queryable.
    Freeze,
    /// Source becomes `Merged` and is removed, releasing its blocks.
    Delete,
}

/// Options for a merge.
#[derive(Clone, Debug, Default)]
pub struct MergeOptions {
    pub source: SourceDisposition,
}

/// A source entry that could not be applied to the target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeConflict {
    /// The source log entry.
    pub entry: OpLogEntry,

    /// Base version the entry expected on the target.
    pub expected: Version,

    /// Version the target actually held.
    pub found: Version,
}

/// Outcome of a merge. Conflicts are reported, never auto-resolved.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeResult {
    /// Source entries that were applied, in log order.
    pub applied: Vec<OpLogEntry>,

    /// Source entries that were skipped.
    pub conflicts: Vec<MergeConflict>,

    /// Target log entries the applied writes produced, parallel to `applied`.
    pub written: Vec<OpLogEntry>,

    /// Blocks freed by removing the source, set for `SourceDisposition::Delete`.
    pub source_blocks_freed: Option<usize>,
}

impl MergeResult {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreStats {
    pub total_branches: u64,
    pub active_branches: u64,
    pub total_blocks: u64,
    pub shared_blocks: u64,
    pub total_operations: u64,
    pub block_allocations: u64,
    pub in_place_writes: u64,
    pub block_clones: u64,
    pub blocks_freed: u64,
}
