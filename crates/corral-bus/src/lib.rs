//! In-process typed publish/subscribe.
//!
//! The bus is the only signaling channel between runtime components:
//! lifecycle changes, heartbeats, task dispatch and completion, pool
//! scaling, and process exits all travel through it as [`Event`]s.

pub mod bus;
pub mod event;

pub use bus::{EventBus, Subscription, TopicStats};
pub use event::{Event, HeartbeatMetrics, Topic};
