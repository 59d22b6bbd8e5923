//! Event and subscription types.

use crate::types::{Branch, BranchId, OpLogEntry};
use serde::{Deserialize, Serialize};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before the subscriber is dropped.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: EventFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: EventFilter::all(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// Only events about these branches (None = all branches).
    pub branches: Option<Vec<BranchId>>,

    /// Only writes to these tables (None = all tables).
    pub tables: Option<Vec<String>>,

    /// Include committed table writes.
    pub include_writes: bool,

    /// Include branch creation, deletion and rollback.
    pub include_lifecycle: bool,

    /// Include merge outcomes.
    pub include_merges: bool,
}

impl EventFilter {
    /// Subscribe to everything.
    pub fn all() -> Self {
        Self {
            include_writes: true,
            include_lifecycle: true,
            include_merges: true,
            ..Default::default()
        }
    }

    /// Everything that happens to one branch.
    pub fn branch(id: BranchId) -> Self {
        Self {
            branches: Some(vec![id]),
            ..Self::all()
        }
    }

    /// Writes to specific tables, on any branch.
    pub fn writes_to(tables: Vec<String>) -> Self {
        Self {
            tables: Some(tables),
            include_writes: true,
            ..Default::default()
        }
    }

    /// Branch lifecycle events only.
    pub fn lifecycle() -> Self {
        Self {
            include_lifecycle: true,
            ..Default::default()
        }
    }

    pub(crate) fn matches(&self, event: &StoreEvent) -> bool {
        let wanted = match event {
            StoreEvent::TableWritten { entry, .. } => {
                self.include_writes
                    && self
                        .tables
                        .as_ref()
                        .map_or(true, |tables| tables.contains(&entry.table))
            }
            StoreEvent::BranchCreated { .. }
            | StoreEvent::BranchDeleted { .. }
            | StoreEvent::RolledBack { .. } => self.include_lifecycle,
            StoreEvent::Merged { .. } => self.include_merges,
            StoreEvent::Dropped { .. } => true,
        };

        wanted
            && match &self.branches {
                None => true,
                Some(ids) => event.branches().into_iter().any(|id| ids.contains(id)),
            }
    }
}

/// Events emitted by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A branch was created.
    BranchCreated { branch: Branch },

    /// A write was committed to a branch.
    TableWritten { branch: BranchId, entry: OpLogEntry },

    /// A merge finished.
    Merged {
        source: BranchId,
        target: BranchId,
        applied: usize,
        conflicts: usize,
    },

    /// A branch was rolled back.
    RolledBack {
        branch: BranchId,
        blocks_freed: usize,
    },

    /// A branch was deleted.
    BranchDeleted {
        branch: BranchId,
        blocks_freed: usize,
    },

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

impl StoreEvent {
    /// Branches the event is about.
    pub fn branches(&self) -> Vec<&BranchId> {
        match self {
            StoreEvent::BranchCreated { branch } => {
                let mut ids = vec![&branch.id];
                ids.extend(branch.parent.as_ref());
                ids
            }
            StoreEvent::TableWritten { branch, .. }
            | StoreEvent::RolledBack { branch, .. }
            | StoreEvent::BranchDeleted { branch, .. } => vec![branch],
            StoreEvent::Merged { source, target, .. } => vec![source, target],
            StoreEvent::Dropped { .. } => Vec::new(),
        }
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to manage a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<StoreEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<StoreEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<StoreEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<StoreEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently buffered, without blocking.
    pub fn drain(&self) -> Vec<StoreEvent> {
        self.receiver.try_iter().collect()
    }
}
