//! Point-to-point message carriers.
//!
//! Three variants share one interface and differ only in their inner queue
//! and the producer/consumer topology they support:
//!
//! | Variant | Inner queue | Producers | Consumers |
//! |---|---|---|---|
//! | [`SpscChannel`] | lock-free SPSC ring | one | one |
//! | [`MpscChannel`] | lock-free CAS ring | many | one |
//! | [`BufferedChannel`] | mutex-guarded FIFO | many | many |
//!
//! On top of the queue every channel adds open/close lifecycle, blocking
//! and timed sends, per-message and per-channel TTL enforcement, traffic
//! statistics, and observer hooks. Consumers block on a condition
//! variable; senders take the same mutex only to signal, so the queue
//! itself stays lock-free for the ring variants.

use crate::error::BusError;
use crate::event::ChannelObserver;
use crate::message::{Envelope, Message, MessagePtr};
use packetring::{CasRing, RingError, SpscRing};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Callback invoked on the consumer thread for every received message.
pub type MessageHandler = Arc<dyn Fn(&dyn Message) + Send + Sync>;

/// Callback invoked when a channel reports a structural error.
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Pause between retries of a blocking send against a full ring.
const SEND_RETRY_PAUSE: Duration = Duration::from_micros(100);

/// Minimum interval between throughput recomputations.
const THROUGHPUT_UPDATE_INTERVAL: Duration = Duration::from_millis(1000);

/// Channel configuration, immutable after construction.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Queue depth. Ring variants round this up to a power of two.
    pub buffer_size: usize,
    /// Report success (and count a drop) instead of failing when full.
    pub drop_on_full: bool,
    /// Make `send` retry until success, closure, or `send_timeout`.
    pub blocking_send: bool,
    /// Deadline for blocking sends; zero waits indefinitely.
    pub send_timeout: Duration,
    /// Channel-wide TTL applied on top of per-message TTLs; zero disables.
    pub message_ttl: Duration,
    /// Maintain sent/received/latency/throughput statistics.
    pub enable_statistics: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            drop_on_full: false,
            blocking_send: false,
            send_timeout: Duration::from_millis(100),
            message_ttl: Duration::ZERO,
            enable_statistics: true,
        }
    }
}

impl ChannelConfig {
    /// Large buffer, drop on full, never block: favours the producer.
    pub fn high_throughput() -> Self {
        Self {
            buffer_size: 4096,
            drop_on_full: true,
            blocking_send: false,
            ..Self::default()
        }
    }

    /// Moderate buffer, blocking sends with a one-second deadline.
    pub fn reliable() -> Self {
        Self {
            buffer_size: 1024,
            drop_on_full: false,
            blocking_send: true,
            send_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

/// Point-in-time copy of a channel's traffic counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStatistics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub messages_expired: u64,
    pub current_queue_size: usize,
    /// Exponential moving average (alpha = 0.1) of send-to-receive
    /// latency.
    pub avg_latency_us: f64,
    pub peak_latency_us: u64,
    pub throughput_msg_per_sec: f64,
    pub last_reset_ns: u64,
}

#[derive(Debug)]
struct StatsInner {
    sent: u64,
    received: u64,
    dropped: u64,
    expired: u64,
    avg_latency_us: f64,
    peak_latency_us: u64,
    throughput: f64,
    messages_in_period: u64,
    last_throughput_update: Instant,
    last_reset_ns: u64,
}

impl StatsInner {
    fn new() -> Self {
        Self {
            sent: 0,
            received: 0,
            dropped: 0,
            expired: 0,
            avg_latency_us: 0.0,
            peak_latency_us: 0,
            throughput: 0.0,
            messages_in_period: 0,
            last_throughput_update: Instant::now(),
            last_reset_ns: crate::clock::monotonic_ns(),
        }
    }

    fn tick_throughput(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_throughput_update);
        if elapsed >= THROUGHPUT_UPDATE_INTERVAL {
            self.throughput =
                (self.messages_in_period as f64 * 1000.0) / elapsed.as_millis() as f64;
            self.messages_in_period = 0;
            self.last_throughput_update = now;
        } else {
            self.messages_in_period += 1;
        }
    }
}

/// State and behavior shared by all channel variants.
struct ChannelCore {
    name: String,
    config: ChannelConfig,
    open: AtomicBool,
    stats: Mutex<StatsInner>,
    message_handler: Mutex<Option<MessageHandler>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    observer: Mutex<Option<Arc<dyn ChannelObserver>>>,
}

impl ChannelCore {
    fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            name: name.into(),
            config,
            open: AtomicBool::new(true),
            stats: Mutex::new(StatsInner::new()),
            message_handler: Mutex::new(None),
            error_handler: Mutex::new(None),
            observer: Mutex::new(None),
        }
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn observer(&self) -> Option<Arc<dyn ChannelObserver>> {
        self.observer.lock().unwrap().clone()
    }

    /// Per-message TTL first, then the channel-wide TTL.
    fn is_expired(&self, message: &dyn Message) -> bool {
        if message.is_expired() {
            return true;
        }
        !self.config.message_ttl.is_zero()
            && message.envelope().timing.age() > self.config.message_ttl
    }

    /// Rejects sends on closed channels and expired messages.
    fn precheck_send(&self, message: &dyn Message) -> Result<(), BusError> {
        if !self.is_open() {
            self.emit_error("send on closed channel");
            return Err(BusError::Closed);
        }
        if self.is_expired(message) {
            self.count_expired();
            return Err(BusError::Expired);
        }
        Ok(())
    }

    fn count_expired(&self) {
        self.stats.lock().unwrap().expired += 1;
    }

    /// Snapshot taken before a push so the sent event can fire after the
    /// message itself is already in flight. Only paid when observed.
    fn envelope_snapshot(&self, message: &dyn Message) -> Option<Envelope> {
        self.observer
            .lock()
            .unwrap()
            .as_ref()
            .map(|_| message.envelope().clone())
    }

    fn on_accepted(&self, snapshot: Option<Envelope>) {
        if self.config.enable_statistics {
            let mut stats = self.stats.lock().unwrap();
            stats.sent += 1;
            stats.tick_throughput();
        }
        if let (Some(observer), Some(envelope)) = (self.observer(), snapshot) {
            observer.message_sent(&envelope);
        }
    }

    /// Full-queue outcome: drop-accept or surface `Full`.
    fn on_full(&self, message: MessagePtr) -> Result<(), BusError> {
        if self.config.drop_on_full {
            self.stats.lock().unwrap().dropped += 1;
            if let Some(observer) = self.observer() {
                observer.message_dropped(&*message);
            }
            Ok(())
        } else {
            if let Some(observer) = self.observer() {
                observer.queue_full();
            }
            Err(BusError::Full)
        }
    }

    /// Stamps, records, and announces a dequeued message. No channel lock
    /// is held while the observer and handler run.
    fn finish_receive(&self, mut message: MessagePtr) -> MessagePtr {
        message.envelope_mut().timing.mark_received();

        if self.config.enable_statistics {
            let mut stats = self.stats.lock().unwrap();
            stats.received += 1;
            if let Some(latency) = message.envelope().timing.latency() {
                let latency_us = latency.as_micros() as u64;
                if stats.received == 1 {
                    stats.avg_latency_us = latency_us as f64;
                } else {
                    stats.avg_latency_us =
                        stats.avg_latency_us * 0.9 + latency_us as f64 * 0.1;
                }
                stats.peak_latency_us = stats.peak_latency_us.max(latency_us);
            }
            stats.tick_throughput();
        }

        if let Some(observer) = self.observer() {
            observer.message_received(&*message);
        }
        let handler = self.message_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(&*message);
        }
        message
    }

    fn emit_error(&self, description: &str) {
        log::warn!("channel {}: {description}", self.name);
        let handler = self.error_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(description);
        }
        if let Some(observer) = self.observer() {
            observer.error_occurred(description);
        }
    }

    fn statistics(&self, current_queue_size: usize) -> ChannelStatistics {
        let stats = self.stats.lock().unwrap();
        ChannelStatistics {
            messages_sent: stats.sent,
            messages_received: stats.received,
            messages_dropped: stats.dropped,
            messages_expired: stats.expired,
            current_queue_size,
            avg_latency_us: stats.avg_latency_us,
            peak_latency_us: stats.peak_latency_us,
            throughput_msg_per_sec: stats.throughput,
            last_reset_ns: stats.last_reset_ns,
        }
    }

    fn reset_statistics(&self) {
        *self.stats.lock().unwrap() = StatsInner::new();
    }
}

/// The interface shared by all channel variants.
///
/// `receive` timeout semantics: `None` waits indefinitely, `Some(ZERO)` is
/// non-blocking, any other duration is a deadline. After `close`, sends
/// fail but queued messages may still be drained until empty.
pub trait MessageChannel: Send + Sync {
    fn name(&self) -> &str;
    fn config(&self) -> &ChannelConfig;

    /// Sends per the configured policy (`blocking_send`, `drop_on_full`).
    fn send(&self, message: MessagePtr) -> Result<(), BusError>;

    /// Single non-blocking attempt (plus drop-accept when configured).
    fn try_send(&self, message: MessagePtr) -> Result<(), BusError>;

    /// Retries until the deadline; a zero timeout equals `try_send`.
    fn timed_send(&self, message: MessagePtr, timeout: Duration) -> Result<(), BusError>;

    fn receive(&self, timeout: Option<Duration>) -> Option<MessagePtr>;
    fn try_receive(&self) -> Option<MessagePtr>;

    /// Reopens a closed channel.
    fn open(&self);

    /// Closes the channel and wakes every waiter. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Drains and discards everything queued.
    fn flush(&self);

    /// Alias of `flush` for the lock-free variants; the buffered variant
    /// also wakes blocked senders.
    fn clear(&self);

    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn is_full(&self) -> bool;
    fn capacity(&self) -> usize;

    fn stats(&self) -> ChannelStatistics;
    fn reset_stats(&self);

    fn set_message_handler(&self, handler: MessageHandler);
    fn set_error_handler(&self, handler: ErrorHandler);
    fn set_observer(&self, observer: Arc<dyn ChannelObserver>);
}

// ---------------------------------------------------------------------
// SPSC variant
// ---------------------------------------------------------------------

/// One sender thread, one receiver thread; the fastest point-to-point
/// carrier.
pub struct SpscChannel {
    core: ChannelCore,
    ring: SpscRing<MessagePtr>,
    recv_lock: Mutex<()>,
    recv_cv: Condvar,
}

impl SpscChannel {
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Result<Self, BusError> {
        let ring = SpscRing::with_capacity(config.buffer_size).map_err(ring_error)?;
        Ok(Self {
            core: ChannelCore::new(name, config),
            ring,
            recv_lock: Mutex::new(()),
            recv_cv: Condvar::new(),
        })
    }

    /// Takes the receive mutex so a concurrent receiver between its empty
    /// check and its wait cannot miss the signal.
    fn notify_receiver(&self) {
        let _guard = self.recv_lock.lock().unwrap();
        self.recv_cv.notify_one();
    }

    /// Pops past expired messages; counts each one dropped this way.
    fn pop_unexpired(&self) -> Option<MessagePtr> {
        loop {
            let message = self.ring.try_pop()?;
            if self.core.is_expired(&*message) {
                self.core.count_expired();
                continue;
            }
            return Some(message);
        }
    }

    fn send_with_deadline(
        &self,
        mut message: MessagePtr,
        timeout: Option<Duration>,
    ) -> Result<(), BusError> {
        self.core.precheck_send(&*message)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let snapshot = self.core.envelope_snapshot(&*message);

        loop {
            message.envelope_mut().timing.mark_sent();
            match self.ring.try_push(message) {
                Ok(()) => {
                    self.core.on_accepted(snapshot);
                    self.notify_receiver();
                    return Ok(());
                }
                Err(back) => message = back,
            }
            if !self.core.is_open() {
                return Err(BusError::Closed);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(BusError::Timeout);
                }
            }
            thread::sleep(SEND_RETRY_PAUSE);
        }
    }
}

impl MessageChannel for SpscChannel {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn config(&self) -> &ChannelConfig {
        &self.core.config
    }

    fn send(&self, message: MessagePtr) -> Result<(), BusError> {
        if self.core.config.blocking_send {
            let timeout = (!self.core.config.send_timeout.is_zero())
                .then_some(self.core.config.send_timeout);
            self.send_with_deadline(message, timeout)
        } else {
            self.try_send(message)
        }
    }

    fn try_send(&self, mut message: MessagePtr) -> Result<(), BusError> {
        self.core.precheck_send(&*message)?;
        message.envelope_mut().timing.mark_sent();
        let snapshot = self.core.envelope_snapshot(&*message);
        match self.ring.try_push(message) {
            Ok(()) => {
                self.core.on_accepted(snapshot);
                self.notify_receiver();
                Ok(())
            }
            Err(back) => self.core.on_full(back),
        }
    }

    fn timed_send(&self, message: MessagePtr, timeout: Duration) -> Result<(), BusError> {
        if timeout.is_zero() {
            self.try_send(message)
        } else {
            self.send_with_deadline(message, Some(timeout))
        }
    }

    fn receive(&self, timeout: Option<Duration>) -> Option<MessagePtr> {
        receive_with_condvar(
            &self.core,
            &self.recv_lock,
            &self.recv_cv,
            timeout,
            || self.pop_unexpired(),
        )
    }

    fn try_receive(&self) -> Option<MessagePtr> {
        self.pop_unexpired().map(|m| self.core.finish_receive(m))
    }

    fn open(&self) {
        self.core.open.store(true, Ordering::Release);
    }

    fn close(&self) {
        self.core.open.store(false, Ordering::Release);
        let _guard = self.recv_lock.lock().unwrap();
        self.recv_cv.notify_all();
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn flush(&self) {
        while self.ring.try_pop().is_some() {}
    }

    fn clear(&self) {
        self.flush();
    }

    fn len(&self) -> usize {
        self.ring.len()
    }

    fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    fn stats(&self) -> ChannelStatistics {
        self.core.statistics(self.ring.len())
    }

    fn reset_stats(&self) {
        self.core.reset_statistics();
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.core.message_handler.lock().unwrap() = Some(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        *self.core.error_handler.lock().unwrap() = Some(handler);
    }

    fn set_observer(&self, observer: Arc<dyn ChannelObserver>) {
        *self.core.observer.lock().unwrap() = Some(observer);
    }
}

// ---------------------------------------------------------------------
// MPSC variant
// ---------------------------------------------------------------------

/// Many sender threads, one receiver thread. Ideal for collecting packets
/// from multiple sources into one sink.
pub struct MpscChannel {
    core: ChannelCore,
    ring: CasRing<MessagePtr>,
    recv_lock: Mutex<()>,
    recv_cv: Condvar,
}

impl MpscChannel {
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Result<Self, BusError> {
        let ring = CasRing::with_capacity(config.buffer_size).map_err(ring_error)?;
        Ok(Self {
            core: ChannelCore::new(name, config),
            ring,
            recv_lock: Mutex::new(()),
            recv_cv: Condvar::new(),
        })
    }

    fn notify_receiver(&self) {
        let _guard = self.recv_lock.lock().unwrap();
        self.recv_cv.notify_one();
    }

    fn pop_unexpired(&self) -> Option<MessagePtr> {
        loop {
            let message = self.ring.try_pop()?;
            if self.core.is_expired(&*message) {
                self.core.count_expired();
                continue;
            }
            return Some(message);
        }
    }

    fn send_with_deadline(
        &self,
        mut message: MessagePtr,
        timeout: Option<Duration>,
    ) -> Result<(), BusError> {
        self.core.precheck_send(&*message)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let snapshot = self.core.envelope_snapshot(&*message);

        loop {
            message.envelope_mut().timing.mark_sent();
            // Spin-yield inside the ring in short slices so the open flag
            // and the deadline are observed between retries.
            match self.ring.timed_push(message, Duration::from_millis(1)) {
                Ok(()) => {
                    self.core.on_accepted(snapshot);
                    self.notify_receiver();
                    return Ok(());
                }
                Err(back) => message = back,
            }
            if !self.core.is_open() {
                return Err(BusError::Closed);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(BusError::Timeout);
                }
            }
        }
    }

    /// Receives up to `max` messages, waiting up to `timeout` for the
    /// first batch if the queue is empty.
    pub fn receive_batch(&self, max: usize, timeout: Option<Duration>) -> Vec<MessagePtr> {
        let mut batch = Vec::new();
        if max == 0 {
            return batch;
        }

        while batch.len() < max {
            match self.pop_unexpired() {
                Some(message) => batch.push(self.core.finish_receive(message)),
                None => break,
            }
        }

        if batch.is_empty() {
            if let Some(message) = self.receive(timeout) {
                batch.push(message);
                while batch.len() < max {
                    match self.pop_unexpired() {
                        Some(message) => batch.push(self.core.finish_receive(message)),
                        None => break,
                    }
                }
            }
        }

        batch
    }
}

impl MessageChannel for MpscChannel {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn config(&self) -> &ChannelConfig {
        &self.core.config
    }

    fn send(&self, message: MessagePtr) -> Result<(), BusError> {
        if self.core.config.blocking_send {
            let timeout = (!self.core.config.send_timeout.is_zero())
                .then_some(self.core.config.send_timeout);
            self.send_with_deadline(message, timeout)
        } else {
            self.try_send(message)
        }
    }

    fn try_send(&self, mut message: MessagePtr) -> Result<(), BusError> {
        self.core.precheck_send(&*message)?;
        message.envelope_mut().timing.mark_sent();
        let snapshot = self.core.envelope_snapshot(&*message);
        match self.ring.try_push(message) {
            Ok(()) => {
                self.core.on_accepted(snapshot);
                self.notify_receiver();
                Ok(())
            }
            Err(back) => self.core.on_full(back),
        }
    }

    fn timed_send(&self, message: MessagePtr, timeout: Duration) -> Result<(), BusError> {
        if timeout.is_zero() {
            self.try_send(message)
        } else {
            self.send_with_deadline(message, Some(timeout))
        }
    }

    fn receive(&self, timeout: Option<Duration>) -> Option<MessagePtr> {
        receive_with_condvar(
            &self.core,
            &self.recv_lock,
            &self.recv_cv,
            timeout,
            || self.pop_unexpired(),
        )
    }

    fn try_receive(&self) -> Option<MessagePtr> {
        self.pop_unexpired().map(|m| self.core.finish_receive(m))
    }

    fn open(&self) {
        self.core.open.store(true, Ordering::Release);
    }

    fn close(&self) {
        self.core.open.store(false, Ordering::Release);
        let _guard = self.recv_lock.lock().unwrap();
        self.recv_cv.notify_all();
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn flush(&self) {
        while self.ring.try_pop().is_some() {}
    }

    fn clear(&self) {
        self.flush();
    }

    fn len(&self) -> usize {
        self.ring.len()
    }

    fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    fn stats(&self) -> ChannelStatistics {
        self.core.statistics(self.ring.len())
    }

    fn reset_stats(&self) {
        self.core.reset_statistics();
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.core.message_handler.lock().unwrap() = Some(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        *self.core.error_handler.lock().unwrap() = Some(handler);
    }

    fn set_observer(&self, observer: Arc<dyn ChannelObserver>) {
        *self.core.observer.lock().unwrap() = Some(observer);
    }
}

// ---------------------------------------------------------------------
// Buffered variant
// ---------------------------------------------------------------------

/// Many senders, many receivers; a mutex-guarded FIFO with two condition
/// variables. The most flexible variant, and the slowest.
pub struct BufferedChannel {
    core: ChannelCore,
    queue: Mutex<VecDeque<MessagePtr>>,
    send_cv: Condvar,
    recv_cv: Condvar,
}

impl BufferedChannel {
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Result<Self, BusError> {
        if config.buffer_size == 0 {
            return Err(BusError::InvalidArgument(
                "buffer_size must be greater than 0".into(),
            ));
        }
        Ok(Self {
            core: ChannelCore::new(name, config),
            queue: Mutex::new(VecDeque::new()),
            send_cv: Condvar::new(),
            recv_cv: Condvar::new(),
        })
    }

    /// Enqueues with an optional deadline for a full queue; `block` false
    /// means a single attempt.
    fn enqueue(
        &self,
        mut message: MessagePtr,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<(), BusError> {
        self.core.precheck_send(&*message)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let snapshot = self.core.envelope_snapshot(&*message);

        let mut queue = self.queue.lock().unwrap();
        while queue.len() >= self.core.config.buffer_size {
            if self.core.config.drop_on_full {
                drop(queue);
                return self.core.on_full(message);
            }
            if !block {
                drop(queue);
                return self.core.on_full(message);
            }
            if !self.core.is_open() {
                return Err(BusError::Closed);
            }
            match deadline {
                None => queue = self.send_cv.wait(queue).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BusError::Timeout);
                    }
                    let (guard, result) =
                        self.send_cv.wait_timeout(queue, deadline - now).unwrap();
                    queue = guard;
                    if result.timed_out() && queue.len() >= self.core.config.buffer_size {
                        return Err(BusError::Timeout);
                    }
                }
            }
        }

        message.envelope_mut().timing.mark_sent();
        queue.push_back(message);
        self.recv_cv.notify_one();
        drop(queue);

        self.core.on_accepted(snapshot);
        Ok(())
    }

    /// Pops past expired messages under the queue lock; the caller runs
    /// statistics and callbacks after the lock is gone.
    fn pop_unexpired(&self, queue: &mut VecDeque<MessagePtr>) -> Option<MessagePtr> {
        while let Some(message) = queue.pop_front() {
            self.send_cv.notify_one();
            if self.core.is_expired(&*message) {
                self.core.count_expired();
                continue;
            }
            return Some(message);
        }
        None
    }
}

impl MessageChannel for BufferedChannel {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn config(&self) -> &ChannelConfig {
        &self.core.config
    }

    fn send(&self, message: MessagePtr) -> Result<(), BusError> {
        let block = self.core.config.blocking_send;
        let timeout = (!self.core.config.send_timeout.is_zero())
            .then_some(self.core.config.send_timeout);
        self.enqueue(message, block, if block { timeout } else { None })
    }

    fn try_send(&self, message: MessagePtr) -> Result<(), BusError> {
        self.enqueue(message, false, None)
    }

    fn timed_send(&self, message: MessagePtr, timeout: Duration) -> Result<(), BusError> {
        if timeout.is_zero() {
            self.try_send(message)
        } else {
            self.enqueue(message, true, Some(timeout))
        }
    }

    fn receive(&self, timeout: Option<Duration>) -> Option<MessagePtr> {
        // Fast path.
        {
            let mut queue = self.queue.lock().unwrap();
            if let Some(message) = self.pop_unexpired(&mut queue) {
                drop(queue);
                return Some(self.core.finish_receive(message));
            }
        }
        if matches!(timeout, Some(t) if t.is_zero()) {
            return None;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(message) = self.pop_unexpired(&mut queue) {
                drop(queue);
                return Some(self.core.finish_receive(message));
            }
            if !self.core.is_open() {
                return None;
            }
            match deadline {
                None => queue = self.recv_cv.wait(queue).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, result) =
                        self.recv_cv.wait_timeout(queue, deadline - now).unwrap();
                    queue = guard;
                    if result.timed_out() {
                        let message = self.pop_unexpired(&mut queue);
                        drop(queue);
                        return message.map(|m| self.core.finish_receive(m));
                    }
                }
            }
        }
    }

    fn try_receive(&self) -> Option<MessagePtr> {
        let mut queue = self.queue.lock().unwrap();
        let message = self.pop_unexpired(&mut queue);
        drop(queue);
        message.map(|m| self.core.finish_receive(m))
    }

    fn open(&self) {
        self.core.open.store(true, Ordering::Release);
    }

    fn close(&self) {
        self.core.open.store(false, Ordering::Release);
        let _queue = self.queue.lock().unwrap();
        self.send_cv.notify_all();
        self.recv_cv.notify_all();
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn flush(&self) {
        let mut queue = self.queue.lock().unwrap();
        queue.clear();
        self.send_cv.notify_all();
    }

    fn clear(&self) {
        self.flush();
    }

    fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    fn is_full(&self) -> bool {
        self.len() >= self.core.config.buffer_size
    }

    fn capacity(&self) -> usize {
        self.core.config.buffer_size
    }

    fn stats(&self) -> ChannelStatistics {
        self.core.statistics(self.len())
    }

    fn reset_stats(&self) {
        self.core.reset_statistics();
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.core.message_handler.lock().unwrap() = Some(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        *self.core.error_handler.lock().unwrap() = Some(handler);
    }

    fn set_observer(&self, observer: Arc<dyn ChannelObserver>) {
        *self.core.observer.lock().unwrap() = Some(observer);
    }
}

// ---------------------------------------------------------------------
// Shared receive loop for the condvar-signalled ring variants
// ---------------------------------------------------------------------

/// Blocks on `cv` until `pop` yields, the channel closes, or the deadline
/// passes. Senders signal while holding `lock`, so a pop miss followed by
/// a wait cannot lose a wakeup.
fn receive_with_condvar(
    core: &ChannelCore,
    lock: &Mutex<()>,
    cv: &Condvar,
    timeout: Option<Duration>,
    pop: impl Fn() -> Option<MessagePtr>,
) -> Option<MessagePtr> {
    // Fast path outside the lock.
    if let Some(message) = pop() {
        return Some(core.finish_receive(message));
    }
    if matches!(timeout, Some(t) if t.is_zero()) {
        return None;
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut guard = lock.lock().unwrap();
    loop {
        if let Some(message) = pop() {
            drop(guard);
            return Some(core.finish_receive(message));
        }
        if !core.is_open() {
            return None;
        }
        match deadline {
            None => guard = cv.wait(guard).unwrap(),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                let (g, result) = cv.wait_timeout(guard, deadline - now).unwrap();
                guard = g;
                if result.timed_out() {
                    // Last chance: a push may have raced the timeout.
                    let message = pop();
                    drop(guard);
                    return message.map(|m| core.finish_receive(m));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------

/// The available channel topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Single producer, single consumer (fastest).
    Spsc,
    /// Multi producer, single consumer.
    Mpsc,
    /// Multi producer, multi consumer (most flexible).
    Buffered,
}

/// Creates a channel of an explicit kind.
pub fn create_channel(
    kind: ChannelKind,
    name: impl Into<String>,
    config: ChannelConfig,
) -> Result<Arc<dyn MessageChannel>, BusError> {
    Ok(match kind {
        ChannelKind::Spsc => Arc::new(SpscChannel::new(name, config)?),
        ChannelKind::Mpsc => Arc::new(MpscChannel::new(name, config)?),
        ChannelKind::Buffered => Arc::new(BufferedChannel::new(name, config)?),
    })
}

/// Picks the cheapest sufficient variant for the expected topology:
/// 1P/1C → SPSC, NP/1C → MPSC, anything else → buffered.
pub fn optimal_channel(
    name: impl Into<String>,
    expected_producers: usize,
    expected_consumers: usize,
    config: ChannelConfig,
) -> Result<Arc<dyn MessageChannel>, BusError> {
    let kind = match (expected_producers, expected_consumers) {
        (1, 1) => ChannelKind::Spsc,
        (_, 1) => ChannelKind::Mpsc,
        _ => ChannelKind::Buffered,
    };
    create_channel(kind, name, config)
}

fn ring_error(err: RingError) -> BusError {
    BusError::InvalidArgument(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::VoidMessage;

    fn msg(message_type: &str) -> MessagePtr {
        VoidMessage::new(message_type).boxed()
    }

    #[test]
    fn spsc_send_receive() {
        let ch = SpscChannel::new("test", ChannelConfig::default()).unwrap();
        ch.try_send(msg("a")).unwrap();
        ch.try_send(msg("b")).unwrap();

        let first = ch.try_receive().unwrap();
        assert_eq!(first.message_type(), "a");
        assert!(first.envelope().timing.sent_ns().is_some());
        assert!(first.envelope().timing.received_ns().is_some());

        assert_eq!(ch.try_receive().unwrap().message_type(), "b");
        assert!(ch.try_receive().is_none());
    }

    #[test]
    fn ring_capacity_is_rounded() {
        let config = ChannelConfig {
            buffer_size: 15,
            ..ChannelConfig::default()
        };
        let ch = SpscChannel::new("round", config).unwrap();
        assert_eq!(ch.capacity(), 16);
    }

    #[test]
    fn zero_capacity_fails() {
        let config = ChannelConfig {
            buffer_size: 0,
            ..ChannelConfig::default()
        };
        assert!(SpscChannel::new("bad", config.clone()).is_err());
        assert!(MpscChannel::new("bad", config.clone()).is_err());
        assert!(BufferedChannel::new("bad", config).is_err());
    }

    #[test]
    fn closed_channel_rejects_sends_but_drains() {
        let ch = MpscChannel::new("closing", ChannelConfig::default()).unwrap();
        ch.try_send(msg("queued")).unwrap();
        ch.close();
        assert!(!ch.is_open());

        assert_eq!(ch.try_send(msg("late")), Err(BusError::Closed));
        // Queued traffic can still be drained after close.
        assert_eq!(ch.try_receive().unwrap().message_type(), "queued");
        assert!(ch.try_receive().is_none());

        // Double close is a no-op; reopen makes it usable again.
        ch.close();
        ch.open();
        ch.try_send(msg("again")).unwrap();
    }

    #[test]
    fn drop_on_full_reports_success_and_counts() {
        let config = ChannelConfig {
            buffer_size: 4,
            drop_on_full: true,
            ..ChannelConfig::default()
        };
        let ch = SpscChannel::new("droppy", config).unwrap();

        for i in 0..10 {
            assert!(ch.try_send(msg(&format!("m{i}"))).is_ok(), "send {i}");
        }

        let stats = ch.stats();
        assert_eq!(stats.messages_sent, 4);
        assert_eq!(stats.messages_dropped, 6);
        assert!(ch.len() <= 4);
    }

    #[test]
    fn full_without_drop_fails() {
        let config = ChannelConfig {
            buffer_size: 2,
            ..ChannelConfig::default()
        };
        let ch = MpscChannel::new("strict", config).unwrap();
        ch.try_send(msg("a")).unwrap();
        ch.try_send(msg("b")).unwrap();
        assert_eq!(ch.try_send(msg("c")), Err(BusError::Full));
    }

    #[test]
    fn expired_message_is_rejected_on_send() {
        let ch = BufferedChannel::new("ttl", ChannelConfig::default()).unwrap();
        let mut message = VoidMessage::new("stale");
        message
            .envelope_mut()
            .set_ttl(Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(1));

        assert_eq!(ch.try_send(message.boxed()), Err(BusError::Expired));
        assert_eq!(ch.stats().messages_expired, 1);
    }

    #[test]
    fn channel_ttl_expires_on_dequeue() {
        let config = ChannelConfig {
            message_ttl: Duration::from_millis(10),
            ..ChannelConfig::default()
        };
        let ch = SpscChannel::new("ttl", config).unwrap();
        ch.try_send(msg("fast")).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert!(ch.receive(Some(Duration::ZERO)).is_none());
        assert_eq!(ch.stats().messages_expired, 1);
    }

    #[test]
    fn timed_send_zero_equals_try_send() {
        let config = ChannelConfig {
            buffer_size: 2,
            ..ChannelConfig::default()
        };
        let ch = MpscChannel::new("z", config).unwrap();
        ch.try_send(msg("a")).unwrap();
        ch.try_send(msg("b")).unwrap();

        let start = Instant::now();
        assert_eq!(ch.timed_send(msg("c"), Duration::ZERO), Err(BusError::Full));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn timed_send_times_out_on_full_channel() {
        let config = ChannelConfig {
            buffer_size: 2,
            ..ChannelConfig::default()
        };
        let ch = BufferedChannel::new("t", config).unwrap();
        ch.try_send(msg("a")).unwrap();
        ch.try_send(msg("b")).unwrap();

        let start = Instant::now();
        assert_eq!(
            ch.timed_send(msg("c"), Duration::from_millis(30)),
            Err(BusError::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn receive_timeout_expires_empty() {
        let ch = SpscChannel::new("empty", ChannelConfig::default()).unwrap();
        let start = Instant::now();
        assert!(ch.receive(Some(Duration::from_millis(20))).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn message_handler_runs_on_receive() {
        use std::sync::atomic::AtomicUsize;

        let ch = BufferedChannel::new("handled", ChannelConfig::default()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = Arc::clone(&seen);
        ch.set_message_handler(Arc::new(move |_m| {
            seen_in_handler.fetch_add(1, Ordering::SeqCst);
        }));

        ch.try_send(msg("x")).unwrap();
        ch.try_send(msg("y")).unwrap();
        ch.try_receive().unwrap();
        ch.try_receive().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn flush_discards_everything() {
        let ch = MpscChannel::new("flush", ChannelConfig::default()).unwrap();
        for i in 0..5 {
            ch.try_send(msg(&format!("m{i}"))).unwrap();
        }
        ch.flush();
        assert!(ch.is_empty());
        // Discarded messages were never "received".
        assert_eq!(ch.stats().messages_received, 0);
    }

    #[test]
    fn reset_stats_clears_counters() {
        let ch = SpscChannel::new("stats", ChannelConfig::default()).unwrap();
        ch.try_send(msg("a")).unwrap();
        ch.try_receive().unwrap();
        assert_eq!(ch.stats().messages_sent, 1);

        ch.reset_stats();
        let stats = ch.stats();
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.messages_received, 0);
    }

    #[test]
    fn factory_picks_topology() {
        let spsc = optimal_channel("a", 1, 1, ChannelConfig::default()).unwrap();
        let mpsc = optimal_channel("b", 4, 1, ChannelConfig::default()).unwrap();
        let buffered = optimal_channel("c", 4, 4, ChannelConfig::default()).unwrap();

        // Ring variants round capacity; the buffered one keeps it as-is.
        assert_eq!(spsc.capacity(), 1024);
        assert_eq!(mpsc.capacity(), 1024);
        assert_eq!(buffered.capacity(), 1024);
        assert_eq!(spsc.name(), "a");
        assert_eq!(mpsc.name(), "b");
        assert_eq!(buffered.name(), "c");
    }

    #[test]
    fn presets() {
        let ht = ChannelConfig::high_throughput();
        assert_eq!(ht.buffer_size, 4096);
        assert!(ht.drop_on_full);
        assert!(!ht.blocking_send);

        let reliable = ChannelConfig::reliable();
        assert_eq!(reliable.buffer_size, 1024);
        assert!(reliable.blocking_send);
        assert_eq!(reliable.send_timeout, Duration::from_secs(1));
    }
}
