//! Event bus for broadcasting store events.

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use super::types::{DropReason, StoreEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId};

struct Subscriber {
    config: SubscriptionConfig,
    sender: Sender<StoreEvent>,
}

impl Subscriber {
    /// False if the buffer is full or the receiver is gone.
    fn try_send(&self, event: StoreEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Fans store events out to subscribers.
pub struct EventBus {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    default_buffer_size: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_buffer_size(SubscriptionConfig::default().buffer_size)
    }

    /// Bus whose [`EventBus::subscribe_default`] uses `buffer_size`.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            default_buffer_size: buffer_size.max(1),
        }
    }

    /// Register a subscriber. Events published from now on that pass the
    /// filter are delivered to the returned handle.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        self.subscribers
            .write()
            .insert(id, Subscriber { config, sender });
        debug!(subscription = id.0, "subscribed");

        SubscriptionHandle { id, receiver }
    }

    /// Subscribe to every event with the bus's default buffer size.
    pub fn subscribe_default(&self) -> SubscriptionHandle {
        self.subscribe(SubscriptionConfig {
            buffer_size: self.default_buffer_size,
            ..Default::default()
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(sub) = self.subscribers.write().remove(&id) {
            // Best effort; the buffer may be full.
            let _ = sub.sender.try_send(StoreEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver `event` to every matching subscriber. Subscribers whose
    /// buffer is full are dropped.
    pub fn publish(&self, event: StoreEvent) {
        let mut overflowed = Vec::new();

        {
            let subs = self.subscribers.read();
            if subs.is_empty() {
                return;
            }
            for (id, sub) in subs.iter() {
                if sub.config.filter.matches(&event) && !sub.try_send(event.clone()) {
                    overflowed.push(*id);
                }
            }
        }

        if overflowed.is_empty() {
            return;
        }

        let mut subs = self.subscribers.write();
        for id in overflowed {
            if let Some(sub) = subs.remove(&id) {
                warn!(subscription = id.0, "dropping slow subscriber");
                let _ = sub.sender.try_send(StoreEvent::Dropped {
                    reason: DropReason::BufferOverflow,
                });
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::types::{BranchId, OpLogEntry, TableWrite, Timestamp, Version};
    use serde_json::json;
    use std::time::Duration;

    fn written(branch: &str, table: &str) -> StoreEvent {
        StoreEvent::TableWritten {
            branch: BranchId::from(branch),
            entry: OpLogEntry {
                seq: 1,
                table: table.to_string(),
                write: TableWrite::Append(json!({"id": 1})),
                timestamp: Timestamp::now(),
                base_version: Version::ABSENT,
                result_version: Version(1),
            },
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let bus = EventBus::new();

        let handle = bus.subscribe(SubscriptionConfig::default());
        assert_eq!(bus.subscription_count(), 1);

        bus.unsubscribe(handle.id);
        assert_eq!(bus.subscription_count(), 0);
        assert_eq!(
            handle.try_recv().unwrap(),
            StoreEvent::Dropped {
                reason: DropReason::Unsubscribed
            }
        );
    }

    #[test]
    fn test_publish_to_matching() {
        let bus = EventBus::new();
        let handle = bus.subscribe(SubscriptionConfig {
            filter: EventFilter::writes_to(vec!["products".to_string()]),
            ..Default::default()
        });

        bus.publish(written("main", "products"));

        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            StoreEvent::TableWritten { branch, entry } => {
                assert!(branch.is_main());
                assert_eq!(entry.table, "products");
            }
            other => panic!("Expected TableWritten, got {:?}", other),
        }
    }

    #[test]
    fn test_publish_filters_non_matching() {
        let bus = EventBus::new();
        let tables = bus.subscribe(SubscriptionConfig {
            filter: EventFilter::writes_to(vec!["products".to_string()]),
            ..Default::default()
        });
        let branch = bus.subscribe(SubscriptionConfig {
            filter: EventFilter::branch(BranchId::from("branch_1")),
            ..Default::default()
        });

        bus.publish(written("main", "orders"));
        bus.publish(StoreEvent::RolledBack {
            branch: BranchId::from("branch_2"),
            blocks_freed: 0,
        });

        assert!(tables.try_recv().is_err());
        assert!(branch.try_recv().is_err());

        bus.publish(StoreEvent::Merged {
            source: BranchId::from("branch_1"),
            target: BranchId::main(),
            applied: 1,
            conflicts: 0,
        });
        assert!(matches!(branch.try_recv(), Ok(StoreEvent::Merged { .. })));
        assert!(tables.try_recv().is_err());
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let bus = EventBus::new();
        let handle = bus.subscribe(SubscriptionConfig {
            buffer_size: 2,
            ..Default::default()
        });

        for _ in 0..10 {
            bus.publish(written("main", "t"));
        }

        assert_eq!(bus.subscription_count(), 0);
        // The buffered events survive the drop.
        assert_eq!(handle.drain().len(), 2);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = StoreEvent::BranchDeleted {
            branch: BranchId::from("branch_3"),
            blocks_freed: 2,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "branch_deleted");
        assert_eq!(value["branch"], "branch_3");
    }
}
