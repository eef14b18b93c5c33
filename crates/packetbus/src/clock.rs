//! Process-local monotonic clock.
//!
//! All message timestamps (`created`, `sent`, `received`) and TTL
//! comparisons use the same monotonic source; nanosecond counts are
//! measured from a lazily-initialised process anchor, so they are
//! meaningful only within one process lifetime. Zero is reserved for
//! "unset", which the anchor offset guarantees real readings never hit.

use std::sync::OnceLock;
use std::time::Instant;

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the process clock anchor. Strictly positive.
pub fn monotonic_ns() -> u64 {
    let anchor = *ANCHOR.get_or_init(Instant::now);
    // +1 keeps 0 free as the "unset" sentinel.
    anchor.elapsed().as_nanos() as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_are_positive_and_monotonic() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(a > 0);
        assert!(b >= a);
    }
}
