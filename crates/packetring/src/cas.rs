use crate::stats::BackPressure;
use crate::{effective_capacity, RingError, RingStats, RingStatsSnapshot};
use crossbeam_utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// =============================================================================
// SLOT TICKET PROTOCOL
// =============================================================================
//
// Every slot carries a sequence counter that doubles as slot state and
// generation number. Slot i starts at sequence i and then walks the series
//
//     i, i+1, i+capacity, i+capacity+1, i+2*capacity, ...
//
// - A producer that claimed index h may write the slot when sequence == h,
//   and publishes with sequence = h + 1 (Release).
// - A consumer that claimed index t may read the slot when
//   sequence == t + 1, and re-arms it for the next lap with
//   sequence = t + capacity (Release).
//
// Index claiming is a CAS on `head` (producers) or `tail` (consumers) with
// Relaxed ordering: the slot sequence, not the shared index, is the
// synchronization point between the writer of a payload and its reader.
// The Acquire load of the sequence before the claim pairs with the
// publishing Release store, so the payload write happens-before the read.
//
// A consumer that wins the claiming CAS is the unique owner of that
// generation of the slot: the sequence was already observed equal to t + 1
// before the CAS, so the payload read cannot fail and needs no fallback.
// =============================================================================

struct Slot<T> {
    sequence: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded lock-free queue admitting many producers and many consumers.
///
/// Capacity is rounded up to the next power of two with a floor of 2.
/// `len`/`is_empty`/`is_full` are approximate under concurrency.
pub struct CasRing<T> {
    /// Producer claim index.
    head: CachePadded<AtomicU64>,
    /// Consumer claim index.
    tail: CachePadded<AtomicU64>,

    backpressure: BackPressure,
    stats: RingStats,
    mask: usize,
    capacity: usize,

    /// Slot array; each slot is padded so neighbouring sequences never
    /// share a cache line under producer/consumer contention.
    slots: Box<[CachePadded<Slot<T>>]>,
}

// Safety: slot ownership is serialized by the ticket protocol; the shared
// indices and sequences are atomics.
unsafe impl<T: Send> Send for CasRing<T> {}
unsafe impl<T: Send> Sync for CasRing<T> {}

impl<T> CasRing<T> {
    /// Creates a ring with at least `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Result<Self, RingError> {
        let capacity = effective_capacity(capacity)?;
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(CachePadded::new(Slot {
                sequence: AtomicU64::new(i as u64),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            }));
        }

        Ok(Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            backpressure: BackPressure::new(),
            stats: RingStats::new(),
            mask: capacity - 1,
            capacity,
            slots: slots.into_boxed_slice(),
        })
    }

    /// Returns the effective slot count.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the approximate number of queued items.
    ///
    /// Always within [0, capacity]: the producer index is read first, so
    /// the later consumer read can only shrink the difference (clamped at
    /// zero when it overtakes the stale producer value).
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let diff = head.wrapping_sub(tail) as i64;
        if diff < 0 {
            0
        } else {
            diff as usize
        }
    }

    /// Returns true if the ring appears empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the ring appears full.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Non-blocking enqueue. Hands the value back iff the ring is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[(head as usize) & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(head) as i64;

            if diff == 0 {
                // Slot is writable for index `head`; try to claim it.
                match self.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS makes this producer the
                        // unique owner of slot generation `head`; no other
                        // thread touches the payload until the Release
                        // store of head + 1 below.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(head.wrapping_add(1), Ordering::Release);
                        RingStats::bump(&self.stats.pushes);
                        debug_assert!(
                            head.wrapping_add(1)
                                .wrapping_sub(self.tail.load(Ordering::Relaxed))
                                as usize
                                <= self.capacity,
                            "claimed slot {head} would overfill a {}-slot ring",
                            self.capacity
                        );
                        return Ok(());
                    }
                    Err(current) => {
                        RingStats::bump(&self.stats.cas_failures);
                        head = current;
                    }
                }
            } else if diff < 0 {
                // Sequence lags the claim index by a full lap: full.
                RingStats::bump(&self.stats.push_failures);
                return Err(value);
            } else {
                // Another producer is mid-write on this slot; re-read.
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Enqueue with a bounded spin-yield retry budget.
    ///
    /// A zero timeout degrades to a single `try_push`. Failed attempts hand
    /// the value back internally, so retrying the move is safe.
    pub fn timed_push(&self, value: T, timeout: Duration) -> Result<(), T> {
        let mut value = match self.try_push(value) {
            Ok(()) => return Ok(()),
            Err(v) => v,
        };
        if timeout.is_zero() {
            return Err(value);
        }

        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            // Spins first, then yields to the scheduler once spinning
            // stops paying off; the deadline bounds the whole wait.
            backoff.snooze();
            if Instant::now() >= deadline {
                return Err(value);
            }
            value = match self.try_push(value) {
                Ok(()) => return Ok(()),
                Err(v) => v,
            };
        }
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Non-blocking dequeue. Returns `None` iff the ring is empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut tail = self.tail.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[(tail as usize) & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(tail.wrapping_add(1)) as i64;

            if diff == 0 {
                // Slot is readable for index `tail`; try to claim it.
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the sequence was observed == tail + 1
                        // before the claim, and winning the CAS makes this
                        // consumer the unique owner of the generation, so
                        // the payload is initialized and nobody else reads
                        // or overwrites it before the re-arm store below.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        let rearmed = tail.wrapping_add(self.capacity as u64);
                        debug_assert!(
                            rearmed > seq,
                            "slot sequence moved backwards: {seq} -> {rearmed}"
                        );
                        slot.sequence.store(rearmed, Ordering::Release);
                        RingStats::bump(&self.stats.pops);
                        return Some(value);
                    }
                    Err(current) => {
                        RingStats::bump(&self.stats.cas_failures);
                        tail = current;
                    }
                }
            } else if diff < 0 {
                // Sequence still belongs to the previous lap: empty.
                RingStats::bump(&self.stats.pop_failures);
                return None;
            } else {
                // Another consumer is mid-read on this slot; re-read.
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Pops up to `max` items into `out`, returning how many were moved.
    pub fn try_pop_batch(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut popped = 0;
        while popped < max {
            match self.try_pop() {
                Some(value) => {
                    out.push(value);
                    popped += 1;
                }
                None => break,
            }
        }
        popped
    }

    // ---------------------------------------------------------------------
    // BACK-PRESSURE & STATISTICS
    // ---------------------------------------------------------------------

    /// Arms or disarms back-pressure signalling.
    ///
    /// `threshold` is a fraction of capacity (0.0–1.0).
    pub fn set_backpressure(&self, enabled: bool, threshold: f64) {
        self.backpressure.configure(enabled, threshold, self.capacity);
    }

    /// Returns true if producers should slow down; counts each trip.
    pub fn should_apply_backpressure(&self) -> bool {
        if self.backpressure.is_tripped(self.len()) {
            RingStats::bump(&self.stats.backpressure_events);
            return true;
        }
        false
    }

    /// Copies the operation counters out.
    pub fn stats(&self) -> RingStatsSnapshot {
        self.stats.snapshot(self.len(), self.capacity)
    }

    /// Zeroes the operation counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    // ---------------------------------------------------------------------
    // LIFECYCLE
    // ---------------------------------------------------------------------

    /// Drops all queued items and re-arms every slot.
    ///
    /// Exclusive access (`&mut`) enforces the single-threaded contract.
    pub fn clear(&mut self) {
        while self.try_pop().is_some() {}

        for (i, slot) in self.slots.iter().enumerate() {
            slot.sequence.store(i as u64, Ordering::Relaxed);
        }
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }
}

impl<T> Drop for CasRing<T> {
    fn drop(&mut self) {
        // Drain whatever is still queued so Drop types are released.
        while self.try_pop().is_some() {}
    }
}

impl<T> std::fmt::Debug for CasRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CasRing")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
