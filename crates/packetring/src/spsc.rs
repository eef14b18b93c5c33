use crate::stats::BackPressure;
use crate::{effective_capacity, RingError, RingStats, RingStatsSnapshot};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// Unbounded u64 indices, masked only when addressing slots, so generations
// never alias (no ABA). `head` is the producer index, `tail` the consumer
// index; a slot at position p is initialized iff tail <= p < head.
//
// Producer path:
//   1. Load `head` Relaxed (producer is the only writer of head)
//   2. Check the cached consumer index (UnsafeCell, producer-only)
//   3. On apparent full: refresh the cache with an Acquire load of `tail`
//   4. Write the payload slot (protected by the index protocol, no atomics)
//   5. Store `head + 1` Release — publishes the payload to the consumer
//
// Consumer path is the mirror image: Relaxed `tail`, cached producer index
// refreshed with Acquire on apparent empty, payload read, Release store of
// `tail + 1` to hand the slot back.
//
// The cached views have exactly one writer each, so the UnsafeCell reads
// and writes are unsynchronized but race-free by construction. This holds
// only under the SPSC contract: one thread pushing, one thread popping.
// =============================================================================

/// Bounded lock-free queue for exactly one producer and one consumer.
///
/// More than one concurrent thread on either side is undefined; the type is
/// `Sync` because the producer and consumer are *different* threads sharing
/// one reference, and the index protocol keeps their slot accesses disjoint.
///
/// Capacity is rounded up to the next power of two with a floor of 2.
/// `len`/`is_empty`/`is_full` are approximate when read from a third
/// thread; they are exact on the owning side.
#[repr(C)]
pub struct SpscRing<T> {
    // === PRODUCER HOT ===
    /// Producer index (written by producer, read by consumer).
    head: CachePadded<AtomicU64>,
    /// Producer's cached view of `tail` (avoids cross-core reads).
    cached_tail: CachePadded<UnsafeCell<u64>>,

    // === CONSUMER HOT ===
    /// Consumer index (written by consumer, read by producer).
    tail: CachePadded<AtomicU64>,
    /// Consumer's cached view of `head`.
    cached_head: CachePadded<UnsafeCell<u64>>,

    // === COLD STATE ===
    backpressure: BackPressure,
    stats: RingStats,
    mask: usize,
    capacity: usize,

    /// Fixed-size storage; slots are initialized iff their position is in
    /// the [tail, head) window.
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Safety: the index protocol above partitions slot access between the one
// producer and the one consumer; atomics order the handoff.
unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// Creates a ring with at least `capacity` slots.
    ///
    /// The effective capacity is the next power of two, minimum 2. Fails
    /// for a zero capacity or one too large to address.
    pub fn with_capacity(capacity: usize) -> Result<Self, RingError> {
        let capacity = effective_capacity(capacity)?;
        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));

        Ok(Self {
            head: CachePadded::new(AtomicU64::new(0)),
            cached_tail: CachePadded::new(UnsafeCell::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            cached_head: CachePadded::new(UnsafeCell::new(0)),
            backpressure: BackPressure::new(),
            stats: RingStats::new(),
            mask: capacity - 1,
            capacity,
            buffer: buffer.into_boxed_slice(),
        })
    }

    /// Returns the effective slot count.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the approximate number of queued items.
    ///
    /// Always within [0, capacity], even when observed from a third
    /// thread: the producer index is read first, so the later consumer
    /// read can only shrink the difference (clamped at zero when it
    /// overtakes the stale producer value).
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
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
        self.head.load(Ordering::Relaxed) == self.tail.load(Ordering::Relaxed)
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
        let head = self.head.load(Ordering::Relaxed);

        // Fast path: check the cached consumer index.
        // SAFETY: cached_tail has exactly one writer (the producer, here).
        let mut tail = unsafe { *self.cached_tail.get() };
        if head.wrapping_sub(tail) as usize >= self.capacity {
            // Slow path: refresh the cache. Acquire pairs with the
            // consumer's Release store of `tail`.
            tail = self.tail.load(Ordering::Acquire);
            // SAFETY: single-writer as above.
            unsafe { *self.cached_tail.get() = tail };
            if head.wrapping_sub(tail) as usize >= self.capacity {
                RingStats::bump(&self.stats.push_failures);
                return Err(value);
            }
        }

        let idx = (head as usize) & self.mask;
        // SAFETY: position `head` is outside the initialized [tail, head)
        // window, the consumer will not touch it until the Release store
        // below, and only this producer writes slots.
        unsafe { (*self.buffer[idx].get()).write(value) };

        let new_head = head.wrapping_add(1);
        debug_assert!(
            new_head.wrapping_sub(tail) as usize <= self.capacity,
            "push would leave {} items in a {}-slot ring",
            new_head.wrapping_sub(tail),
            self.capacity
        );
        self.head.store(new_head, Ordering::Release);

        RingStats::bump(&self.stats.pushes);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Non-blocking dequeue. Returns `None` iff the ring is empty.
    pub fn try_pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);

        // Fast path: check the cached producer index.
        // SAFETY: cached_head has exactly one writer (the consumer, here).
        let mut head = unsafe { *self.cached_head.get() };
        if head == tail {
            // Slow path: refresh. Acquire pairs with the producer's
            // Release store of `head` and makes the payload visible.
            head = self.head.load(Ordering::Acquire);
            // SAFETY: single-writer as above.
            unsafe { *self.cached_head.get() = head };
            if head == tail {
                RingStats::bump(&self.stats.pop_failures);
                return None;
            }
        }
        debug_assert!(
            tail <= head,
            "consumer index {tail} ahead of producer index {head}"
        );

        let idx = (tail as usize) & self.mask;
        // SAFETY: tail < head, so the slot was fully written and published
        // by the producer; ownership moves out and the slot is handed back
        // by the Release store below.
        let value = unsafe { (*self.buffer[idx].get()).assume_init_read() };

        let new_tail = tail.wrapping_add(1);
        debug_assert!(
            new_tail <= head,
            "pop advanced tail to {new_tail}, past the producer index {head}"
        );
        self.tail.store(new_tail, Ordering::Release);

        RingStats::bump(&self.stats.pops);
        Some(value)
    }

    /// Runs `f` against the front element without consuming it.
    ///
    /// Consumer-side only, like `try_pop`.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let tail = self.tail.load(Ordering::Relaxed);
        let mut head = unsafe { *self.cached_head.get() };
        if head == tail {
            head = self.head.load(Ordering::Acquire);
            unsafe { *self.cached_head.get() = head };
            if head == tail {
                return None;
            }
        }

        let idx = (tail as usize) & self.mask;
        // SAFETY: slot is initialized (tail < head) and the producer cannot
        // reuse it until `tail` advances, which this method never does.
        let value = unsafe { (*self.buffer[idx].get()).assume_init_ref() };
        Some(f(value))
    }

    /// Non-mutating read of the front element.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.peek_with(Clone::clone)
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

    /// Drops all queued items and rewinds the indices.
    ///
    /// Exclusive access (`&mut`) enforces the single-threaded contract.
    pub fn clear(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let count = head.wrapping_sub(tail) as usize;

        for i in 0..count {
            let idx = ((tail as usize).wrapping_add(i)) & self.mask;
            // SAFETY: [tail, head) slots are initialized; exclusive access.
            unsafe { ptr::drop_in_place((*self.buffer[idx].get()).as_mut_ptr()) };
        }

        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        // SAFETY: exclusive access, no concurrent readers of the caches.
        unsafe {
            *self.cached_head.get() = 0;
            *self.cached_tail.get() = 0;
        }
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let count = head.wrapping_sub(tail) as usize;

        for i in 0..count {
            let idx = ((tail as usize).wrapping_add(i)) & self.mask;
            // SAFETY: [tail, head) slots are initialized; we have &mut.
            unsafe { ptr::drop_in_place((*self.buffer[idx].get()).as_mut_ptr()) };
        }
    }
}

impl<T> std::fmt::Debug for SpscRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpscRing")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
