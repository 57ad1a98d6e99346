//! CIRRUS Events - Cache-Changed Notifications
//!
//! Every cache instance publishes `CacheEvent`s through its own `EventHub`.
//! Events are delivered only after the batch that produced them has drained,
//! and the `PendingNotifications` counter tells readers when an event is still
//! in flight.
//!
//! ```text
//! lane job ──► post_when_idle ──► (barrier: lane idle) ──► delivery task ──► subscribers
//!                  pending += 1                                 pending -= 1
//! ```

mod event;
mod hub;

pub use event::{CacheEvent, CacheKind, ChangeReason, ChangeSet};
pub use hub::{EventHub, IdleBarrier, PendingNotifications};
