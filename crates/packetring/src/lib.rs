//! Lock-free bounded ring buffers for real-time packet transport.
//!
//! Two variants cover the producer/consumer topologies the packet pipeline
//! needs:
//!
//! - [`SpscRing`] — exactly one producer thread and one consumer thread.
//!   Index-per-side with lazily cached views of the opposite index, so the
//!   fast path touches a single cache line.
//! - [`CasRing`] — many producers and many consumers. Each slot carries a
//!   sequence ticket; producers and consumers claim indices with
//!   compare-and-swap and the slot sequence is the only synchronization
//!   between a writer and the reader of its payload.
//!
//! Both are allocated once at construction, never resize, and never block:
//! every operation either completes or reports failure immediately
//! ([`CasRing::timed_push`] spin-yields with a bounded budget on top of the
//! same non-blocking core).
//!
//! # Example
//!
//! ```
//! use packetring::SpscRing;
//!
//! let ring = SpscRing::with_capacity(8).unwrap();
//! assert!(ring.try_push(42u64).is_ok());
//! assert_eq!(ring.try_pop(), Some(42));
//! ```

mod cas;
mod spsc;
mod stats;

pub use cas::CasRing;
pub use spsc::SpscRing;
pub use stats::{RingStats, RingStatsSnapshot};

use thiserror::Error;

/// Errors surfaced at ring construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// Requested capacity was zero or too large to address.
    #[error("invalid ring capacity: {0}")]
    InvalidCapacity(usize),
}

/// Largest capacity a ring will accept after rounding.
///
/// Indices are unbounded `u64` sequence counters and slots are addressed
/// with `index & mask`, so the buffer itself must stay well below the
/// addressable range.
const MAX_CAPACITY: usize = usize::MAX / 2;

/// Rounds a requested capacity to the effective slot count.
///
/// Capacities round up to the next power of two with a floor of 2 slots.
/// Zero and anything that would round past half the address space are
/// rejected.
pub(crate) fn effective_capacity(requested: usize) -> Result<usize, RingError> {
    if requested == 0 || requested > MAX_CAPACITY {
        return Err(RingError::InvalidCapacity(requested));
    }
    let rounded = requested.next_power_of_two().max(2);
    if rounded > MAX_CAPACITY {
        return Err(RingError::InvalidCapacity(requested));
    }
    Ok(rounded)
}
