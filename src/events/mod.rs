//! In-process subscriptions to store events.
//!
//! Subscribers receive branch lifecycle events, committed table writes and
//! merge outcomes over bounded channels. A subscriber that falls behind and
//! fills its buffer is dropped rather than slowing down writers.
//!
//! # Example
//!
//! ```ignore
//! let handle = store.subscribe(SubscriptionConfig {
//!     filter: EventFilter::writes_to(vec!["products".to_string()]),
//!     ..Default::default()
//! });
//!
//! while let Ok(event) = handle.recv() {
//!     match event {
//!         StoreEvent::TableWritten { branch, entry } => println!("{}: {:?}", branch, entry),
//!         StoreEvent::Dropped { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{
    DropReason, EventFilter, StoreEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
};
