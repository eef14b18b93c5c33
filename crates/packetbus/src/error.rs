//! Error types surfaced by channels and buses.

use crate::message::SubscriptionId;
use thiserror::Error;

/// Errors returned by channel and bus operations.
///
/// Transient back-pressure (`Full`, `Timeout`, `Expired`) is recovered
/// locally: callers may retry, the statistics record it, and the bus never
/// propagates it past the affected delivery. Structural failures
/// (`CapacityExceeded`, `InvalidArgument`, `Serialization`,
/// `PolicyViolation`, `NotFound`) are surfaced to the caller. No variant is
/// fatal to the core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// A topic-count or per-topic subscription policy limit was hit.
    #[error("{what} limit exceeded (max: {limit})")]
    CapacityExceeded {
        what: &'static str,
        limit: usize,
    },

    /// Non-blocking send rejected: the channel is full and dropping on
    /// full is disabled.
    #[error("channel is full")]
    Full,

    /// A blocking send or receive ran past its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The channel was closed before or during the operation.
    #[error("channel is closed")]
    Closed,

    /// The message's time-to-live elapsed before delivery.
    #[error("message expired before delivery")]
    Expired,

    /// Malformed input: empty or ill-formed topic, bad pattern, null-like
    /// message state.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed bytes handed to the wire decoder.
    #[error("malformed wire data: {0}")]
    Serialization(String),

    /// The subscription id is unknown to this bus.
    #[error("unknown subscription {0}")]
    NotFound(SubscriptionId),

    /// A move-only or owned message was published to more than one
    /// subscription.
    #[error("ownership policy violation: {0}")]
    PolicyViolation(String),
}
