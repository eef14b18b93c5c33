//! Real-time packet ingest and distribution core.
//!
//! Accepts packets from many producers (live capture, file playback,
//! simulators) and fans them out to many concurrent consumers
//! (visualization widgets, loggers, evaluators) with bounded memory and
//! explicit back-pressure. Three layers:
//!
//! 1. The lock-free ring buffers in the [`packetring`] crate carry raw
//!    items between threads.
//! 2. The [`message`] layer wraps payloads in routed, timed, prioritised
//!    envelopes with three ownership flavors (owned, move-only zero-copy,
//!    reference-counted shared).
//! 3. [`channel`]s add lifecycle, blocking policy, TTL enforcement, and
//!    statistics on top of a ring; the [`bus`] routes published messages
//!    to subscription channels through a hierarchical, wildcard-capable
//!    topic namespace.
//!
//! # Example
//!
//! ```
//! use packetbus::{
//!     create_channel, ChannelConfig, ChannelKind, Message, MessageBus,
//!     MessageChannel, Priority, RoutingConfig, SharedMessage,
//! };
//! use std::sync::Arc;
//!
//! let bus = MessageBus::new("ingest", RoutingConfig::default());
//! let channel = create_channel(
//!     ChannelKind::Spsc,
//!     "viewer",
//!     ChannelConfig::default(),
//! )
//! .unwrap();
//!
//! bus.subscribe("sensor/temperature", Arc::clone(&channel), 1, Priority::NORMAL)
//!     .unwrap();
//!
//! let message = SharedMessage::with_payload("frame", Arc::new(vec![1u8, 2, 3]));
//! let delivered = bus.publish("sensor/temperature", message.boxed()).unwrap();
//! assert_eq!(delivered, 1);
//!
//! let received = channel.try_receive().unwrap();
//! assert_eq!(received.message_type(), "frame");
//! ```

pub mod bus;
pub mod channel;
mod clock;
pub mod error;
pub mod event;
pub mod message;
pub mod registry;
pub mod topic;
pub mod wire;

pub use bus::{BusStatistics, MessageBus, MessageFilter, RoutingConfig, Subscription};
pub use channel::{
    create_channel, optimal_channel, BufferedChannel, ChannelConfig, ChannelKind,
    ChannelStatistics, ErrorHandler, MessageChannel, MessageHandler, MpscChannel, SpscChannel,
};
pub use clock::monotonic_ns;
pub use error::BusError;
pub use event::{BusObserver, ChannelObserver};
pub use message::{
    next_message_id, reset_message_counter, total_message_count, AttrValue, Envelope, Message,
    MessageId, MessagePtr, Metadata, OwnedMessage, Payload, Priority, Route, SharedMessage,
    SubscriberId, SubscriptionId, Timing, UniqueMessage, VoidMessage,
};
pub use registry::{default_bus, BusRegistry, DEFAULT_BUS_NAME};
pub use topic::{validate_topic, TopicPattern};
