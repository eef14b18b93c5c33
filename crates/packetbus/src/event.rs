//! Observer interfaces for bus and channel events.
//!
//! Narrow callback traits handed in at (or after) construction; every hook
//! has an empty default body so observers implement only what they need.
//! No bus or topic lock is held across any of these calls, and channel
//! locks are released before the channel hooks run — observer code must
//! still return promptly, since it executes on the publishing or receiving
//! thread.

use crate::message::{Envelope, Message, SubscriptionId};

/// Receives bus lifecycle and delivery events.
#[allow(unused_variables)]
pub trait BusObserver: Send + Sync {
    /// A message passed validation and entered delivery.
    fn message_published(&self, topic: &str, message: &dyn Message) {}

    /// One subscription's channel accepted the message.
    fn message_delivered(&self, topic: &str, subscription: SubscriptionId) {}

    /// One subscription's channel refused the message.
    fn delivery_failed(&self, topic: &str, subscription: SubscriptionId, error: &str) {}

    fn subscription_created(&self, subscription: SubscriptionId, topic: &str) {}

    fn subscription_removed(&self, subscription: SubscriptionId, topic: &str) {}

    fn topic_created(&self, topic: &str) {}

    fn topic_deleted(&self, topic: &str) {}
}

/// Receives per-channel traffic events.
#[allow(unused_variables)]
pub trait ChannelObserver: Send + Sync {
    /// A message was accepted into the channel's queue. Only the envelope
    /// is available: the message itself is already in flight.
    fn message_sent(&self, envelope: &Envelope) {}

    /// A message was handed to a receiver.
    fn message_received(&self, message: &dyn Message) {}

    /// A message was discarded by drop-on-full policy.
    fn message_dropped(&self, message: &dyn Message) {}

    /// A send found the queue full.
    fn queue_full(&self) {}

    /// A structural channel error occurred.
    fn error_occurred(&self, description: &str) {}
}
