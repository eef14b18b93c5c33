//! Topic-addressed publish/subscribe bus.
//!
//! A bus routes published messages to subscription channels through the
//! topic tree (exact subscriptions) and a pattern list (wildcard
//! subscriptions), applying the optional global filter and each
//! subscription's own filter, then delivering in descending subscription
//! priority. Publishing is synchronous — it returns once every target
//! channel has accepted or refused the message — and never blocks the
//! publisher on a slow consumer unless the target channel itself was
//! configured to block.
//!
//! Transient delivery failures (full channels, timeouts) are absorbed
//! into the statistics; only structural errors (invalid topics, policy
//! violations, capacity limits) surface to the caller.

use crate::channel::MessageChannel;
use crate::error::BusError;
use crate::event::BusObserver;
use crate::message::{Message, MessagePtr, Priority, SubscriberId, SubscriptionId};
use crate::topic::{validate_topic, TopicNode, TopicPattern};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Predicate applied to messages before delivery.
pub type MessageFilter = Arc<dyn Fn(&dyn Message) -> bool + Send + Sync>;

/// Routing policy, immutable for the lifetime of a bus.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Treat topics as slash-separated hierarchies; when disabled every
    /// topic string is a single flat name.
    pub enable_topic_hierarchy: bool,
    /// Honour wildcard pattern subscriptions.
    pub enable_pattern_matching: bool,
    /// Honour the global filter and per-subscription filters.
    pub enable_message_filtering: bool,
    /// Deliver in descending subscription priority.
    pub enable_priority_routing: bool,
    pub max_subscriptions_per_topic: usize,
    pub max_topics: usize,
    /// Budget for one channel delivery when `drop_on_timeout` is set.
    pub delivery_timeout: Duration,
    /// Bound each delivery by `delivery_timeout` and drop on overrun;
    /// when disabled the target channel's own send policy applies.
    pub drop_on_timeout: bool,
    pub enable_statistics: bool,
    /// Cadence of the closed-subscription sweep.
    pub maintenance_interval: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enable_topic_hierarchy: true,
            enable_pattern_matching: true,
            enable_message_filtering: true,
            enable_priority_routing: true,
            max_subscriptions_per_topic: 1000,
            max_topics: 10_000,
            delivery_timeout: Duration::from_micros(100),
            drop_on_timeout: false,
            enable_statistics: true,
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// Upper bound on cached topic-string → node mappings.
const TOPIC_CACHE_SIZE: usize = 1000;

/// A registered interest: subscriber, topic or pattern, channel, filter,
/// priority.
///
/// Owned by the bus registry and referenced from the topic tree (exact
/// subscriptions) or the pattern list. Holds no reference back to the
/// bus, so no cycles form; the channel is shared with the consumer.
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    subscriber: SubscriberId,
    topic: Option<String>,
    pattern: Option<TopicPattern>,
    filter: Option<MessageFilter>,
    channel: Arc<dyn MessageChannel>,
    priority: AtomicI32,
    active: AtomicBool,
    created_at_ns: u64,
    messages_received: AtomicU64,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }

    /// The exact topic, for non-pattern subscriptions.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// The wildcard pattern, for pattern subscriptions.
    pub fn pattern(&self) -> Option<&TopicPattern> {
        self.pattern.as_ref()
    }

    /// Topic or pattern text, whichever this subscription was made with.
    fn interest(&self) -> &str {
        self.topic
            .as_deref()
            .or_else(|| self.pattern.as_ref().map(TopicPattern::as_str))
            .unwrap_or_default()
    }

    pub fn channel(&self) -> &Arc<dyn MessageChannel> {
        &self.channel
    }

    pub fn priority(&self) -> Priority {
        Priority(self.priority.load(Ordering::Relaxed))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn created_at_ns(&self) -> u64 {
        self.created_at_ns
    }

    /// Messages successfully handed to this subscription's channel.
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Passes when the subscription should see this message right now.
    fn accepts(&self, message: &dyn Message, filtering: bool) -> bool {
        if !self.is_active() || !self.channel.is_open() {
            return false;
        }
        if filtering {
            if let Some(filter) = &self.filter {
                return filter(message);
            }
        }
        true
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subscriber", &self.subscriber)
            .field("interest", &self.interest())
            .field("priority", &self.priority())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Aggregate bus statistics.
#[derive(Debug, Clone, Default)]
pub struct BusStatistics {
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub failed_deliveries: u64,
    /// Subscriptions created over the bus lifetime.
    pub total_subscriptions: u64,
    /// Currently registered subscriptions.
    pub active_subscriptions: u64,
    pub messages_per_topic: HashMap<String, u64>,
    /// Current subscription count per topic or pattern.
    pub subscribers_per_topic: HashMap<String, u64>,
    pub avg_delivery_us: f64,
    pub peak_delivery_us: u64,
}

#[derive(Debug, Default)]
struct BusStatsInner {
    published: u64,
    delivered: u64,
    failed: u64,
    total_subscriptions: u64,
    messages_per_topic: HashMap<String, u64>,
    delivery_us_sum: u64,
    delivery_samples: u64,
    peak_delivery_us: u64,
}

struct ShutdownSignal {
    stop: Mutex<bool>,
    cv: Condvar,
}

struct BusInner {
    name: String,
    config: RoutingConfig,
    root: Arc<TopicNode>,
    topic_count: AtomicUsize,
    topic_cache: Mutex<HashMap<String, Arc<TopicNode>>>,
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
    pattern_subscriptions: RwLock<Vec<Arc<Subscription>>>,
    global_filter: Mutex<Option<MessageFilter>>,
    observer: Mutex<Option<Arc<dyn BusObserver>>>,
    stats: Mutex<BusStatsInner>,
    next_subscription_id: AtomicU64,
}

/// A named publish/subscribe bus.
///
/// Construction spawns a maintenance thread that periodically removes
/// subscriptions whose channels have closed; dropping the bus stops and
/// joins it.
pub struct MessageBus {
    inner: Arc<BusInner>,
    shutdown: Arc<ShutdownSignal>,
    maintenance: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MessageBus {
    pub fn new(name: impl Into<String>, config: RoutingConfig) -> Self {
        let maintenance_interval = config.maintenance_interval;
        let inner = Arc::new(BusInner {
            name: name.into(),
            config,
            root: TopicNode::new(String::new()),
            topic_count: AtomicUsize::new(0),
            topic_cache: Mutex::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            pattern_subscriptions: RwLock::new(Vec::new()),
            global_filter: Mutex::new(None),
            observer: Mutex::new(None),
            stats: Mutex::new(BusStatsInner::default()),
            next_subscription_id: AtomicU64::new(1),
        });

        let shutdown = Arc::new(ShutdownSignal {
            stop: Mutex::new(false),
            cv: Condvar::new(),
        });

        let maintenance = {
            let weak = Arc::downgrade(&inner);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("bus-maintenance".into())
                .spawn(move || maintenance_loop(&weak, &shutdown, maintenance_interval))
                .ok()
        };

        Self {
            inner,
            shutdown,
            maintenance: Mutex::new(maintenance),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.inner.config
    }

    // ---------------------------------------------------------------------
    // Topic management
    // ---------------------------------------------------------------------

    /// Creates the topic node eagerly. Publishing and subscribing create
    /// topics lazily; this is only needed to pre-announce them.
    pub fn create_topic(&self, topic: &str) -> Result<(), BusError> {
        validate_topic(topic)?;
        let (_, created) = self.inner.node_for_create(topic)?;
        if created > 0 {
            if let Some(observer) = self.inner.observer() {
                observer.topic_created(topic);
            }
        }
        Ok(())
    }

    /// Removes a topic subtree and every subscription under it.
    pub fn delete_topic(&self, topic: &str) -> Result<(), BusError> {
        validate_topic(topic)?;
        if topic.is_empty() {
            return Err(BusError::InvalidArgument(
                "cannot delete the root topic".into(),
            ));
        }

        let segments = self.inner.segments(topic);
        let (parent_path, leaf) = segments.split_at(segments.len() - 1);
        let parent = self
            .inner
            .root
            .find(parent_path.iter().copied())
            .ok_or_else(|| BusError::InvalidArgument(format!("unknown topic {topic:?}")))?;

        let removed = parent
            .children
            .write()
            .unwrap()
            .remove(leaf[0])
            .ok_or_else(|| BusError::InvalidArgument(format!("unknown topic {topic:?}")))?;

        // Invalidate cached lookups into the detached subtree.
        self.inner.topic_cache.lock().unwrap().retain(|cached, _| {
            cached != topic && !cached.starts_with(&format!("{topic}/"))
        });

        // Drop every subscription that lived under the subtree.
        let mut doomed = Vec::new();
        collect_subscription_ids(&removed, &mut doomed);
        for id in doomed {
            let _ = self.unsubscribe(id);
        }

        let mut nodes = 0;
        count_nodes(&removed, &mut nodes);
        self.inner.topic_count.fetch_sub(nodes, Ordering::Relaxed);

        if let Some(observer) = self.inner.observer() {
            observer.topic_deleted(topic);
        }
        Ok(())
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        validate_topic(topic).is_ok() && self.inner.node_for(topic).is_some()
    }

    /// Every topic path currently in the tree.
    pub fn topics(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.inner.root.collect_topics("", &mut out);
        out
    }

    // ---------------------------------------------------------------------
    // Publishing
    // ---------------------------------------------------------------------

    /// Publishes to `topic`, returning the number of deliveries that
    /// channels accepted.
    pub fn publish(&self, topic: &str, message: MessagePtr) -> Result<usize, BusError> {
        validate_topic(topic)?;
        let targets = self.inner.ready_targets(topic);
        self.inner.deliver(topic, message, &targets)
    }

    /// Publishes using the topic recorded in the message's own route.
    pub fn publish_routed(&self, message: MessagePtr) -> Result<usize, BusError> {
        let topic = message.envelope().route.topic.clone();
        self.publish(&topic, message)
    }

    /// Publishes a batch to one topic, enumerating subscriptions once.
    pub fn publish_batch(
        &self,
        topic: &str,
        messages: Vec<MessagePtr>,
    ) -> Result<usize, BusError> {
        validate_topic(topic)?;
        let targets = self.inner.ready_targets(topic);
        let mut delivered = 0;
        for message in messages {
            delivered += self.inner.deliver(topic, message, &targets)?;
        }
        Ok(delivered)
    }

    // ---------------------------------------------------------------------
    // Subscribing
    // ---------------------------------------------------------------------

    /// Subscribes a channel to an exact topic.
    pub fn subscribe(
        &self,
        topic: &str,
        channel: Arc<dyn MessageChannel>,
        subscriber: SubscriberId,
        priority: Priority,
    ) -> Result<SubscriptionId, BusError> {
        self.subscribe_inner(topic, channel, None, subscriber, priority)
    }

    /// Subscribes a channel to an exact topic with a message filter.
    pub fn subscribe_with_filter(
        &self,
        topic: &str,
        channel: Arc<dyn MessageChannel>,
        filter: MessageFilter,
        subscriber: SubscriberId,
        priority: Priority,
    ) -> Result<SubscriptionId, BusError> {
        self.subscribe_inner(topic, channel, Some(filter), subscriber, priority)
    }

    /// Subscribes a channel to a wildcard pattern.
    pub fn subscribe_pattern(
        &self,
        pattern: &str,
        channel: Arc<dyn MessageChannel>,
        subscriber: SubscriberId,
        priority: Priority,
    ) -> Result<SubscriptionId, BusError> {
        if !self.inner.config.enable_pattern_matching {
            return Err(BusError::InvalidArgument(
                "pattern matching is disabled on this bus".into(),
            ));
        }
        let pattern = TopicPattern::parse(pattern)?;

        let subscription = Arc::new(Subscription {
            id: self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed),
            subscriber,
            topic: None,
            pattern: Some(pattern),
            filter: None,
            channel,
            priority: AtomicI32::new(priority.0),
            active: AtomicBool::new(true),
            created_at_ns: crate::clock::monotonic_ns(),
            messages_received: AtomicU64::new(0),
        });

        self.inner
            .pattern_subscriptions
            .write()
            .unwrap()
            .push(Arc::clone(&subscription));
        self.inner.register(&subscription);
        Ok(subscription.id)
    }

    fn subscribe_inner(
        &self,
        topic: &str,
        channel: Arc<dyn MessageChannel>,
        filter: Option<MessageFilter>,
        subscriber: SubscriberId,
        priority: Priority,
    ) -> Result<SubscriptionId, BusError> {
        validate_topic(topic)?;
        let (node, created) = self.inner.node_for_create(topic)?;
        if created > 0 {
            if let Some(observer) = self.inner.observer() {
                observer.topic_created(topic);
            }
        }

        let subscription = Arc::new(Subscription {
            id: self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed),
            subscriber,
            topic: Some(topic.to_owned()),
            pattern: None,
            filter,
            channel,
            priority: AtomicI32::new(priority.0),
            active: AtomicBool::new(true),
            created_at_ns: crate::clock::monotonic_ns(),
            messages_received: AtomicU64::new(0),
        });

        {
            let mut subscriptions = node.subscriptions.lock().unwrap();
            if subscriptions.len() >= self.inner.config.max_subscriptions_per_topic {
                return Err(BusError::CapacityExceeded {
                    what: "subscriptions per topic",
                    limit: self.inner.config.max_subscriptions_per_topic,
                });
            }
            subscriptions.push(Arc::clone(&subscription));
        }

        self.inner.register(&subscription);
        Ok(subscription.id)
    }

    // ---------------------------------------------------------------------
    // Unsubscribing and subscription control
    // ---------------------------------------------------------------------

    /// Removes one subscription. The second call for the same id fails
    /// with `NotFound` and has no side effects.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        let subscription = self
            .inner
            .subscriptions
            .write()
            .unwrap()
            .remove(&id)
            .ok_or(BusError::NotFound(id))?;

        if let Some(topic) = subscription.topic() {
            // Only the affected topic node is locked, never the tree.
            if let Some(node) = self.inner.node_for(topic) {
                node.subscriptions.lock().unwrap().retain(|s| s.id != id);
            }
        } else {
            self.inner
                .pattern_subscriptions
                .write()
                .unwrap()
                .retain(|s| s.id != id);
        }

        if let Some(observer) = self.inner.observer() {
            observer.subscription_removed(id, subscription.interest());
        }
        Ok(())
    }

    /// Removes every subscription belonging to `subscriber`; returns how
    /// many were removed.
    pub fn unsubscribe_all(&self, subscriber: SubscriberId) -> usize {
        let ids: Vec<SubscriptionId> = {
            let subscriptions = self.inner.subscriptions.read().unwrap();
            subscriptions
                .values()
                .filter(|s| s.subscriber == subscriber)
                .map(|s| s.id)
                .collect()
        };
        ids.into_iter()
            .filter(|&id| self.unsubscribe(id).is_ok())
            .count()
    }

    /// Removes `subscriber`'s subscriptions on one exact topic.
    pub fn unsubscribe_from_topic(&self, topic: &str, subscriber: SubscriberId) -> usize {
        let ids: Vec<SubscriptionId> = {
            let subscriptions = self.inner.subscriptions.read().unwrap();
            subscriptions
                .values()
                .filter(|s| s.subscriber == subscriber && s.topic() == Some(topic))
                .map(|s| s.id)
                .collect()
        };
        ids.into_iter()
            .filter(|&id| self.unsubscribe(id).is_ok())
            .count()
    }

    /// Pauses delivery to a subscription; messages skip it entirely.
    pub fn pause_subscription(&self, id: SubscriptionId) -> Result<(), BusError> {
        self.with_subscription(id, |s| s.active.store(false, Ordering::Relaxed))
    }

    /// Resumes a paused subscription from the next publish on.
    pub fn resume_subscription(&self, id: SubscriptionId) -> Result<(), BusError> {
        self.with_subscription(id, |s| s.active.store(true, Ordering::Relaxed))
    }

    /// Changes a subscription's delivery priority.
    pub fn set_subscription_priority(
        &self,
        id: SubscriptionId,
        priority: Priority,
    ) -> Result<(), BusError> {
        self.with_subscription(id, |s| s.priority.store(priority.0, Ordering::Relaxed))
    }

    fn with_subscription(
        &self,
        id: SubscriptionId,
        f: impl FnOnce(&Subscription),
    ) -> Result<(), BusError> {
        let subscriptions = self.inner.subscriptions.read().unwrap();
        let subscription = subscriptions.get(&id).ok_or(BusError::NotFound(id))?;
        f(subscription);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Exact subscriptions on one topic, in insertion order.
    pub fn subscriptions_on(&self, topic: &str) -> Vec<Arc<Subscription>> {
        self.inner
            .node_for(topic)
            .map(|node| node.subscriptions.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Everything `subscriber` is subscribed to (exact and pattern).
    pub fn subscriptions_of(&self, subscriber: SubscriberId) -> Vec<Arc<Subscription>> {
        self.inner
            .subscriptions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.subscriber == subscriber)
            .cloned()
            .collect()
    }

    pub fn subscription_count(&self, topic: &str) -> usize {
        self.inner
            .node_for(topic)
            .map_or(0, |node| node.subscriptions.lock().unwrap().len())
    }

    pub fn total_subscription_count(&self) -> usize {
        self.inner.subscriptions.read().unwrap().len()
    }

    // ---------------------------------------------------------------------
    // Filters, observers, statistics
    // ---------------------------------------------------------------------

    /// Installs a filter applied to every publish before enumeration.
    pub fn set_global_filter(&self, filter: MessageFilter) {
        *self.inner.global_filter.lock().unwrap() = Some(filter);
    }

    pub fn clear_global_filter(&self) {
        *self.inner.global_filter.lock().unwrap() = None;
    }

    pub fn set_observer(&self, observer: Arc<dyn BusObserver>) {
        *self.inner.observer.lock().unwrap() = Some(observer);
    }

    pub fn statistics(&self) -> BusStatistics {
        let stats = self.inner.stats.lock().unwrap();
        let subscriptions = self.inner.subscriptions.read().unwrap();

        let mut subscribers_per_topic: HashMap<String, u64> = HashMap::new();
        for subscription in subscriptions.values() {
            *subscribers_per_topic
                .entry(subscription.interest().to_owned())
                .or_default() += 1;
        }

        BusStatistics {
            messages_published: stats.published,
            messages_delivered: stats.delivered,
            failed_deliveries: stats.failed,
            total_subscriptions: stats.total_subscriptions,
            active_subscriptions: subscriptions.len() as u64,
            messages_per_topic: stats.messages_per_topic.clone(),
            subscribers_per_topic,
            avg_delivery_us: if stats.delivery_samples > 0 {
                stats.delivery_us_sum as f64 / stats.delivery_samples as f64
            } else {
                0.0
            },
            peak_delivery_us: stats.peak_delivery_us,
        }
    }

    pub fn reset_statistics(&self) {
        *self.inner.stats.lock().unwrap() = BusStatsInner::default();
    }

    /// Runs one closed-subscription sweep immediately.
    pub fn run_maintenance(&self) -> usize {
        let removed = self.inner.closed_subscription_ids();
        let count = removed.len();
        for id in removed {
            let _ = self.unsubscribe(id);
        }
        if count > 0 {
            log::debug!(
                "bus {}: removed {count} subscriptions with closed channels",
                self.inner.name
            );
        }
        count
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        *self.shutdown.stop.lock().unwrap() = true;
        self.shutdown.cv.notify_all();
        if let Some(handle) = self.maintenance.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("name", &self.inner.name)
            .field("subscriptions", &self.total_subscription_count())
            .field("topics", &self.inner.topic_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BusInner {
    fn observer(&self) -> Option<Arc<dyn BusObserver>> {
        self.observer.lock().unwrap().clone()
    }

    /// Splits a topic according to the hierarchy setting.
    fn segments<'a>(&self, topic: &'a str) -> Vec<&'a str> {
        if self.config.enable_topic_hierarchy {
            crate::topic::split_topic(topic).collect()
        } else if topic.is_empty() {
            Vec::new()
        } else {
            vec![topic]
        }
    }

    /// Cache-assisted lookup without creation.
    fn node_for(&self, topic: &str) -> Option<Arc<TopicNode>> {
        if let Some(node) = self.topic_cache.lock().unwrap().get(topic) {
            return Some(Arc::clone(node));
        }
        let node = self.root.find(self.segments(topic))?;
        self.cache_node(topic, &node);
        Some(node)
    }

    /// Cache-assisted lookup, creating missing nodes under the topic cap.
    fn node_for_create(&self, topic: &str) -> Result<(Arc<TopicNode>, usize), BusError> {
        if let Some(node) = self.topic_cache.lock().unwrap().get(topic) {
            return Ok((Arc::clone(node), 0));
        }

        let segments = self.segments(topic);
        if self.root.find(segments.iter().copied()).is_none()
            && self.topic_count.load(Ordering::Relaxed) >= self.config.max_topics
        {
            return Err(BusError::CapacityExceeded {
                what: "topics",
                limit: self.config.max_topics,
            });
        }

        let (node, created) = self.root.find_or_create(segments.into_iter());
        if created > 0 {
            self.topic_count.fetch_add(created, Ordering::Relaxed);
        }
        self.cache_node(topic, &node);
        Ok((node, created))
    }

    fn cache_node(&self, topic: &str, node: &Arc<TopicNode>) {
        let mut cache = self.topic_cache.lock().unwrap();
        if cache.len() < TOPIC_CACHE_SIZE {
            cache.insert(topic.to_owned(), Arc::clone(node));
        }
    }

    /// Collects the subscriptions a publish on `topic` should consider:
    /// exact-node entries plus matching patterns, sorted by descending
    /// priority (stable, so equal priorities keep insertion order).
    ///
    /// Per-message checks (filters, active, open) happen at delivery time;
    /// no tree or node lock is held beyond the copy-out.
    fn ready_targets(&self, topic: &str) -> Vec<Arc<Subscription>> {
        let mut targets: Vec<Arc<Subscription>> = Vec::new();

        if let Some(node) = self.node_for(topic) {
            targets.extend(node.subscriptions.lock().unwrap().iter().cloned());
        }

        if self.config.enable_pattern_matching {
            let patterns = self.pattern_subscriptions.read().unwrap();
            targets.extend(
                patterns
                    .iter()
                    .filter(|s| s.pattern().is_some_and(|p| p.matches(topic)))
                    .cloned(),
            );
        }

        if self.config.enable_priority_routing {
            targets.sort_by(|a, b| b.priority().cmp(&a.priority()));
        }
        targets
    }

    /// Runs one message through filtering, fan-out policy, and delivery.
    fn deliver(
        &self,
        topic: &str,
        message: MessagePtr,
        targets: &[Arc<Subscription>],
    ) -> Result<usize, BusError> {
        if self.config.enable_message_filtering {
            let filter = self.global_filter.lock().unwrap().clone();
            if let Some(filter) = filter {
                if !filter(&*message) {
                    return Ok(0);
                }
            }
        }
        if message.is_expired() {
            // Channels would refuse it anyway; skip the fan-out entirely.
            return Ok(0);
        }

        let ready: Vec<&Arc<Subscription>> = targets
            .iter()
            .filter(|s| s.accepts(&*message, self.config.enable_message_filtering))
            .collect();

        self.record_published(topic);
        if let Some(observer) = self.observer() {
            observer.message_published(topic, &*message);
        }

        if ready.is_empty() {
            return Ok(0);
        }

        // Fan-out needs a duplicable carrier: owned and move-only payloads
        // reach at most one subscription.
        let mut spare: Option<MessagePtr> = None;
        if ready.len() > 1 {
            match message.clone_for_fanout() {
                Some(clone) => spare = Some(clone),
                None => {
                    return Err(BusError::PolicyViolation(format!(
                        "message {} cannot be duplicated to {} subscriptions",
                        message.id(),
                        ready.len()
                    )));
                }
            }
        }

        let observer = self.observer();
        let mut delivered = 0;
        let mut original = Some(message);
        let last = ready.len() - 1;

        for (i, subscription) in ready.iter().enumerate() {
            let outgoing = if i == last {
                match original.take() {
                    Some(message) => message,
                    None => break,
                }
            } else if let Some(clone) = spare.take() {
                clone
            } else {
                match original.as_ref().and_then(|m| m.clone_for_fanout()) {
                    Some(clone) => clone,
                    None => break,
                }
            };

            let started = Instant::now();
            let result = if self.config.drop_on_timeout {
                subscription
                    .channel
                    .timed_send(outgoing, self.config.delivery_timeout)
            } else {
                subscription.channel.send(outgoing)
            };
            let elapsed_us = started.elapsed().as_micros() as u64;

            match result {
                Ok(()) => {
                    delivered += 1;
                    subscription.messages_received.fetch_add(1, Ordering::Relaxed);
                    self.record_delivery(true, elapsed_us);
                    if let Some(observer) = &observer {
                        observer.message_delivered(topic, subscription.id);
                    }
                }
                Err(err) => {
                    self.record_delivery(false, elapsed_us);
                    log::debug!(
                        "bus {}: delivery to subscription {} on {topic:?} failed: {err}",
                        self.name,
                        subscription.id
                    );
                    if let Some(observer) = &observer {
                        observer.delivery_failed(topic, subscription.id, &err.to_string());
                    }
                }
            }
        }

        Ok(delivered)
    }

    fn record_published(&self, topic: &str) {
        if !self.config.enable_statistics {
            return;
        }
        let mut stats = self.stats.lock().unwrap();
        stats.published += 1;
        *stats.messages_per_topic.entry(topic.to_owned()).or_default() += 1;
    }

    fn record_delivery(&self, success: bool, elapsed_us: u64) {
        if !self.config.enable_statistics {
            return;
        }
        let mut stats = self.stats.lock().unwrap();
        if success {
            stats.delivered += 1;
        } else {
            stats.failed += 1;
        }
        stats.delivery_us_sum += elapsed_us;
        stats.delivery_samples += 1;
        stats.peak_delivery_us = stats.peak_delivery_us.max(elapsed_us);
    }

    fn register(&self, subscription: &Arc<Subscription>) {
        self.subscriptions
            .write()
            .unwrap()
            .insert(subscription.id, Arc::clone(subscription));
        if self.config.enable_statistics {
            self.stats.lock().unwrap().total_subscriptions += 1;
        }
        if let Some(observer) = self.observer() {
            observer.subscription_created(subscription.id, subscription.interest());
        }
    }

    fn closed_subscription_ids(&self) -> Vec<SubscriptionId> {
        self.subscriptions
            .read()
            .unwrap()
            .values()
            .filter(|s| !s.channel.is_open())
            .map(|s| s.id)
            .collect()
    }
}

fn collect_subscription_ids(node: &Arc<TopicNode>, out: &mut Vec<SubscriptionId>) {
    out.extend(node.subscriptions.lock().unwrap().iter().map(|s| s.id));
    for child in node.children.read().unwrap().values() {
        collect_subscription_ids(child, out);
    }
}

fn count_nodes(node: &Arc<TopicNode>, out: &mut usize) {
    *out += 1;
    for child in node.children.read().unwrap().values() {
        count_nodes(child, out);
    }
}

/// Periodic sweep removing subscriptions whose channels have closed.
///
/// Holds only a weak reference so an abandoned bus can still be dropped;
/// the owning `MessageBus` signals and joins on drop.
fn maintenance_loop(
    bus: &Weak<BusInner>,
    shutdown: &Arc<ShutdownSignal>,
    interval: Duration,
) {
    loop {
        {
            let guard = shutdown.stop.lock().unwrap();
            let (guard, _) = shutdown.cv.wait_timeout(guard, interval).unwrap();
            if *guard {
                return;
            }
        }

        let Some(inner) = bus.upgrade() else { return };
        let removed = inner.closed_subscription_ids();
        if removed.is_empty() {
            continue;
        }
        log::debug!(
            "bus {}: maintenance removing {} closed subscriptions",
            inner.name,
            removed.len()
        );
        for id in removed {
            // Mirrors MessageBus::unsubscribe without the outer handle.
            let subscription = inner.subscriptions.write().unwrap().remove(&id);
            let Some(subscription) = subscription else { continue };
            if let Some(topic) = subscription.topic() {
                if let Some(node) = inner.node_for(topic) {
                    node.subscriptions.lock().unwrap().retain(|s| s.id != id);
                }
            } else {
                inner
                    .pattern_subscriptions
                    .write()
                    .unwrap()
                    .retain(|s| s.id != id);
            }
            if let Some(observer) = inner.observer() {
                observer.subscription_removed(id, subscription.interest());
            }
        }
    }
}
