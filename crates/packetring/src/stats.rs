use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Operation counters maintained by both ring variants.
///
/// All counters are relaxed atomics: they tolerate approximation and must
/// never add synchronization to the push/pop paths.
#[derive(Debug, Default)]
pub struct RingStats {
    pub(crate) pushes: AtomicU64,
    pub(crate) pops: AtomicU64,
    pub(crate) push_failures: AtomicU64,
    pub(crate) pop_failures: AtomicU64,
    pub(crate) cas_failures: AtomicU64,
    pub(crate) backpressure_events: AtomicU64,
}

impl RingStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters out together with the ring's current occupancy.
    pub(crate) fn snapshot(&self, current_len: usize, capacity: usize) -> RingStatsSnapshot {
        RingStatsSnapshot {
            pushes: self.pushes.load(Ordering::Relaxed),
            pops: self.pops.load(Ordering::Relaxed),
            push_failures: self.push_failures.load(Ordering::Relaxed),
            pop_failures: self.pop_failures.load(Ordering::Relaxed),
            cas_failures: self.cas_failures.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            current_len,
            utilization_percent: (current_len as f64 / capacity as f64) * 100.0,
        }
    }

    pub(crate) fn reset(&self) {
        self.pushes.store(0, Ordering::Relaxed);
        self.pops.store(0, Ordering::Relaxed);
        self.push_failures.store(0, Ordering::Relaxed);
        self.pop_failures.store(0, Ordering::Relaxed);
        self.cas_failures.store(0, Ordering::Relaxed);
        self.backpressure_events.store(0, Ordering::Relaxed);
    }
}

/// Back-pressure arming shared by both ring variants.
///
/// Disabled by default; once armed, `is_tripped` compares the ring's
/// occupancy against a precomputed slot threshold.
#[derive(Debug)]
pub(crate) struct BackPressure {
    enabled: AtomicBool,
    threshold_slots: AtomicUsize,
}

impl BackPressure {
    pub(crate) fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            threshold_slots: AtomicUsize::new(0),
        }
    }

    pub(crate) fn configure(&self, enabled: bool, threshold: f64, capacity: usize) {
        self.enabled.store(enabled, Ordering::Relaxed);
        self.threshold_slots
            .store((threshold * capacity as f64) as usize, Ordering::Relaxed);
    }

    pub(crate) fn is_tripped(&self, len: usize) -> bool {
        self.enabled.load(Ordering::Relaxed) && len > self.threshold_slots.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of a ring's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RingStatsSnapshot {
    pub pushes: u64,
    pub pops: u64,
    pub push_failures: u64,
    pub pop_failures: u64,
    /// Lost compare-and-swap races (always 0 for the SPSC variant).
    pub cas_failures: u64,
    pub backpressure_events: u64,
    pub current_len: usize,
    pub utilization_percent: f64,
}
