// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Topic registry and publish fan-out.
//!
//! The [`InProcessBroadcaster`] keeps every live subscription in memory,
//! indexed both by subscription id and by topic key. Structural changes
//! (subscribe, unsubscribe, close) take the registry write lock; publishing
//! takes a snapshot of the subscribers under the read lock and writes outside
//! of it.
//!
//! # Topic lifecycle
//!
//! Each topic entry carries a reference count. The first subscriber triggers
//! [`TopicLifecycle::topic_start`], the last one leaving triggers
//! [`TopicLifecycle::topic_stop`]. A failing start rolls back the whole
//! subscribe call.
//!
//! ```text
//!   n: 0 ──subscribe──► 1        topic_start (rollback on error)
//!   n: k ──subscribe──► k+1      -
//!   n: k ──unsubscribe► k-1      -
//!   n: 1 ──unsubscribe► 0        topic_stop
//! ```
//!
//! # Delivery
//!
//! A failed write is retried in the background up to [`MAX_WRITE_ATTEMPTS`]
//! times in total, [`WRITE_RETRY_INTERVAL`] apart. Retry tasks only hold a
//! weak reference to the subscription and stop as soon as it leaves the
//! registry or the broadcaster finishes shutting down.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{RealtimeError, Result};
use crate::message::{Chunk, Message, MessageKind};
use crate::subscription::{PROTOCOL_MEMORY, PROTOCOL_SSE, PROTOCOL_WS, Subscription};
use crate::topic::Topic;

/// Total write attempts per message and subscription.
pub const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Delay between write attempts.
pub const WRITE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// How long subscribers get to reconnect elsewhere after `close`.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Keepalive cadence per subscription.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Consecutive keepalive failures before a subscription is closed.
pub const MAX_KEEPALIVE_ERRORS: u32 = 3;

/// Upper bound of subscribers written to per topic and publish.
pub const MAX_SUBSCRIBERS_PER_TOPIC: usize = 5000;

/// The publish/subscribe surface shared by every broadcaster flavour.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Register interest of `sub` in `topics`.
    async fn subscribe(&self, sub: Arc<dyn Subscription>, topics: Vec<Topic>) -> Result<()>;

    /// Remove interest of a subscription in a subset of its topics.
    async fn unsubscribe(&self, sub_id: Uuid, topics: &[Topic]) -> Result<()>;

    /// Unsubscribe from every topic and close the transport.
    async fn close_subscription(&self, sub_id: Uuid) -> Result<()>;

    /// Fan a message out to every subscriber of its topics.
    async fn publish(&self, msg: Message);

    /// Fan a stream chunk out to the subscribers of the stream's topics.
    async fn publish_chunk(&self, parent: &Message, chunk: Chunk);

    /// Forward raw bytes to every subscription on any topic of `env_id`/`channel`.
    async fn write(&self, env_id: Uuid, channel: &str, data: &[u8]);

    /// Begin shutdown: reject new subscribers, notify everyone, force-close
    /// after the grace period.
    async fn close(&self) -> Result<()>;
}

/// Hooks fired on the first subscribe and last unsubscribe of a topic.
#[async_trait]
pub trait TopicLifecycle: Send + Sync {
    /// A topic gained its first subscriber.
    async fn topic_start(&self, topic: &Topic) -> Result<()>;

    /// A topic lost its last subscriber.
    async fn topic_stop(&self, topic: &Topic) -> Result<()>;
}

/// Timing knobs of the in-process broadcaster.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Total attempts per write.
    pub max_write_attempts: u32,
    /// Delay between write attempts.
    pub write_retry_interval: Duration,
    /// Keepalive cadence.
    pub keepalive_interval: Duration,
    /// Consecutive keepalive failures tolerated.
    pub max_keepalive_errors: u32,
    /// Delay between `close` and force-closing subscriptions.
    pub shutdown_grace_period: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            max_write_attempts: MAX_WRITE_ATTEMPTS,
            write_retry_interval: WRITE_RETRY_INTERVAL,
            keepalive_interval: KEEPALIVE_INTERVAL,
            max_keepalive_errors: MAX_KEEPALIVE_ERRORS,
            shutdown_grace_period: SHUTDOWN_GRACE_PERIOD,
        }
    }
}

struct ActiveSub {
    sub: Arc<dyn Subscription>,
    topics: HashMap<String, Topic>,
}

struct TopicSubs {
    topic: Topic,
    // Ordered by id for stable iteration while the set changes.
    subscriptions: BTreeMap<Uuid, Arc<dyn Subscription>>,
    ref_count: usize,
}

#[derive(Default)]
struct Registry {
    subs: HashMap<Uuid, ActiveSub>,
    topics: HashMap<String, TopicSubs>,
}

impl Registry {
    /// Drop `sub_id` from the topic entry at `key`. Returns the topic when
    /// the entry became empty.
    fn release(&mut self, key: &str, sub_id: Uuid) -> Option<Topic> {
        let entry = self.topics.get_mut(key)?;
        if entry.subscriptions.remove(&sub_id).is_none() {
            return None;
        }
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0 {
            return self.topics.remove(key).map(|e| e.topic);
        }
        None
    }

    fn snapshot(&self, key: &str) -> Option<(String, Vec<Arc<dyn Subscription>>)> {
        self.topics.get(key).map(|entry| {
            (
                entry.topic.name.clone(),
                entry
                    .subscriptions
                    .values()
                    .take(MAX_SUBSCRIBERS_PER_TOPIC)
                    .cloned()
                    .collect(),
            )
        })
    }
}

#[derive(Clone)]
enum Delivery {
    Message(Message),
    Chunk(Chunk),
}

impl Delivery {
    async fn send(&self, sub: &dyn Subscription) -> Result<()> {
        match self {
            Delivery::Message(msg) => sub.write_message(msg).await,
            Delivery::Chunk(chunk) => sub.write_chunk(chunk).await,
        }
    }
}

struct Inner {
    config: BroadcasterConfig,
    closing: AtomicBool,
    registry: RwLock<Registry>,
    lifecycle: OnceLock<Arc<dyn TopicLifecycle>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// A broadcaster managing subscriptions of this process.
#[derive(Clone)]
pub struct InProcessBroadcaster {
    inner: Arc<Inner>,
}

/// Non-owning handle to an [`InProcessBroadcaster`].
#[derive(Clone)]
pub struct WeakBroadcaster {
    inner: Weak<Inner>,
}

impl WeakBroadcaster {
    /// Upgrade to a live broadcaster, if it still exists.
    pub fn upgrade(&self) -> Option<InProcessBroadcaster> {
        self.inner.upgrade().map(|inner| InProcessBroadcaster { inner })
    }
}

impl Default for InProcessBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InProcessBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBroadcaster")
            .field("config", &self.inner.config)
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl InProcessBroadcaster {
    /// Create a broadcaster with default timings.
    pub fn new() -> Self {
        Self::with_config(BroadcasterConfig::default())
    }

    /// Create a broadcaster with custom timings.
    pub fn with_config(config: BroadcasterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                closing: AtomicBool::new(false),
                registry: RwLock::new(Registry::default()),
                lifecycle: OnceLock::new(),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Install topic lifecycle hooks. Only the first call has an effect.
    pub fn set_lifecycle(&self, lifecycle: Arc<dyn TopicLifecycle>) -> bool {
        self.inner.lifecycle.set(lifecycle).is_ok()
    }

    /// A weak handle, for hooks that call back into the broadcaster.
    pub fn downgrade(&self) -> WeakBroadcaster {
        WeakBroadcaster {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether `close` has been called.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Number of registered subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.inner.registry.read().await.subs.len()
    }

    /// Number of topics with at least one subscriber.
    pub async fn topic_count(&self) -> usize {
        self.inner.registry.read().await.topics.len()
    }

    /// Topics a subscription is currently registered for.
    pub async fn topics_of(&self, sub_id: Uuid) -> Vec<Topic> {
        self.inner
            .registry
            .read()
            .await
            .subs
            .get(&sub_id)
            .map(|a| a.topics.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Active `(websocket, sse)` connection counts.
    pub async fn connection_counts(&self) -> (usize, usize) {
        let registry = self.inner.registry.read().await;
        let mut ws = 0;
        let mut sse = 0;
        for active in registry.subs.values() {
            match active.sub.protocol() {
                PROTOCOL_WS => ws += 1,
                PROTOCOL_SSE => sse += 1,
                _ => {}
            }
        }
        (ws, sse)
    }

    /// Wait for background retry and keepalive tasks after shutdown.
    pub async fn wait(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Publish `msg` to the local subscribers of a single topic.
    ///
    /// Used by replicated broadcasters delivering upstream traffic.
    pub async fn publish_to_topic(&self, topic: &Topic, mut msg: Message) {
        let snapshot = self.inner.registry.read().await.snapshot(&topic.key());
        let Some((name, subs)) = snapshot else {
            return;
        };
        msg.topic = name;
        let delivery = Delivery::Message(msg);
        for sub in subs {
            self.deliver(sub, delivery.clone()).await;
        }
    }

    /// Publish a chunk to the local subscribers of a single topic.
    pub async fn publish_chunk_to_topic(&self, topic: &Topic, chunk: Chunk) {
        let snapshot = self.inner.registry.read().await.snapshot(&topic.key());
        let Some((_, subs)) = snapshot else {
            return;
        };
        let delivery = Delivery::Chunk(chunk);
        for sub in subs {
            self.deliver(sub, delivery.clone()).await;
        }
    }

    async fn fan_out(&self, topics: Vec<Topic>, delivery: Delivery) {
        let mut batches = Vec::new();
        {
            let registry = self.inner.registry.read().await;
            for topic in &topics {
                if let Some(batch) = registry.snapshot(&topic.key()) {
                    batches.push(batch);
                }
            }
        }

        let mut set = JoinSet::new();
        for (name, subs) in batches {
            let this = self.clone();
            let mut delivery = delivery.clone();
            // Messages fan out to built-in topics too; stamp the concrete one.
            if let Delivery::Message(msg) = &mut delivery {
                msg.topic = name;
            }
            set.spawn(async move {
                for sub in subs {
                    this.deliver(sub, delivery.clone()).await;
                }
            });
        }

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "publish task failed");
            }
        }
    }

    async fn deliver(&self, sub: Arc<dyn Subscription>, delivery: Delivery) {
        if delivery.send(sub.as_ref()).await.is_ok() {
            return;
        }

        let weak_sub = Arc::downgrade(&sub);
        let sub_id = sub.id();
        let protocol = sub.protocol();
        drop(sub);

        let broadcaster = self.downgrade();
        let interval = self.inner.config.write_retry_interval;
        let attempts = self.inner.config.max_write_attempts;
        let shutdown = self.inner.shutdown.clone();

        self.inner.tasks.spawn(async move {
            let mut last_err = None;
            for attempt in 1..attempts {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(b) = broadcaster.upgrade() else {
                    return;
                };
                if !b.is_registered(sub_id).await {
                    return;
                }
                let Some(sub) = weak_sub.upgrade() else {
                    return;
                };

                match delivery.send(sub.as_ref()).await {
                    Ok(()) => {
                        debug!(subscription_id = %sub_id, attempt, "write succeeded on retry");
                        return;
                    }
                    Err(e) => last_err = Some(e),
                }
            }

            warn!(
                subscription_id = %sub_id,
                protocol,
                error = ?last_err.map(|e| e.to_string()),
                "error publishing to subscription"
            );
        });
    }

    async fn is_registered(&self, sub_id: Uuid) -> bool {
        self.inner.registry.read().await.subs.contains_key(&sub_id)
    }

    fn spawn_keepalive(&self, sub_id: Uuid) {
        let broadcaster = self.downgrade();
        let interval = self.inner.config.keepalive_interval;
        let max_errors = self.inner.config.max_keepalive_errors;
        let shutdown = self.inner.shutdown.clone();

        self.inner.tasks.spawn(async move {
            let mut errors = 0;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(b) = broadcaster.upgrade() else {
                    return;
                };
                let sub = {
                    let registry = b.inner.registry.read().await;
                    match registry.subs.get(&sub_id) {
                        Some(active) => active.sub.clone(),
                        None => return,
                    }
                };

                match sub.send_keepalive(&Message::new(MessageKind::Ping, "")).await {
                    Ok(()) => errors = 0,
                    Err(e) => {
                        errors += 1;
                        if errors >= max_errors {
                            warn!(
                                subscription_id = %sub_id,
                                protocol = sub.protocol(),
                                error = %e,
                                "max failed keepalives reached"
                            );
                            if let Err(e) = b.close_subscription(sub_id).await {
                                warn!(subscription_id = %sub_id, error = %e, "error closing subscription");
                            }
                            return;
                        }
                    }
                }
            }
        });
    }

    async fn stop_topic(&self, topic: &Topic) {
        if let Some(lifecycle) = self.inner.lifecycle.get()
            && let Err(e) = lifecycle.topic_stop(topic).await
        {
            warn!(topic = %topic, error = %e, "error stopping topic");
        }
    }
}

#[async_trait]
impl Broadcaster for InProcessBroadcaster {
    async fn subscribe(&self, sub: Arc<dyn Subscription>, topics: Vec<Topic>) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }
        if self.is_closing() {
            return Err(RealtimeError::BroadcasterClosed);
        }

        let sub_id = sub.id();
        let mut registry = self.inner.registry.write().await;
        let mut added: Vec<String> = Vec::new();

        for topic in &topics {
            let key = topic.key();
            let seen = registry
                .subs
                .get(&sub_id)
                .is_some_and(|active| active.topics.contains_key(&key))
                || added.contains(&key);
            if seen {
                continue;
            }

            let entry = registry.topics.entry(key.clone()).or_insert_with(|| TopicSubs {
                topic: topic.clone(),
                subscriptions: BTreeMap::new(),
                ref_count: 0,
            });
            entry.subscriptions.insert(sub_id, sub.clone());
            entry.ref_count += 1;
            let first = entry.ref_count == 1;
            added.push(key.clone());

            if first
                && let Some(lifecycle) = self.inner.lifecycle.get()
                && let Err(e) = lifecycle.topic_start(topic).await
            {
                // Undo everything registered by this call.
                for key in added.iter().rev() {
                    if let Some(stopped) = registry.release(key, sub_id)
                        && stopped.key() != topic.key()
                        && let Err(e) = lifecycle.topic_stop(&stopped).await
                    {
                        warn!(topic = %stopped, error = %e, "error stopping topic");
                    }
                }
                return Err(RealtimeError::TopicStart(format!("{}: {}", topic, e)));
            }
        }

        let is_new = !registry.subs.contains_key(&sub_id);
        let active = registry.subs.entry(sub_id).or_insert_with(|| ActiveSub {
            sub: sub.clone(),
            topics: HashMap::new(),
        });
        for topic in topics {
            active.topics.insert(topic.key(), topic);
        }
        drop(registry);

        if is_new {
            debug!(subscription_id = %sub_id, protocol = sub.protocol(), "subscription registered");
            // In-process callbacks need no keepalives.
            if sub.protocol() != PROTOCOL_MEMORY {
                self.spawn_keepalive(sub_id);
            }
        }

        Ok(())
    }

    async fn unsubscribe(&self, sub_id: Uuid, topics: &[Topic]) -> Result<()> {
        if self.is_closing() {
            return Err(RealtimeError::BroadcasterClosed);
        }

        // Stops run under the write lock, like starts.
        let mut registry = self.inner.registry.write().await;
        let Some(active) = registry.subs.get_mut(&sub_id) else {
            return Ok(());
        };

        let keys: Vec<String> = topics
            .iter()
            .map(Topic::key)
            .filter(|key| active.topics.remove(key).is_some())
            .collect();

        for key in keys {
            if let Some(topic) = registry.release(&key, sub_id) {
                self.stop_topic(&topic).await;
            }
        }
        Ok(())
    }

    async fn close_subscription(&self, sub_id: Uuid) -> Result<()> {
        let active = {
            let mut registry = self.inner.registry.write().await;
            let Some(active) = registry.subs.remove(&sub_id) else {
                return Ok(());
            };
            for key in active.topics.keys() {
                if let Some(topic) = registry.release(key, sub_id) {
                    self.stop_topic(&topic).await;
                }
            }
            active
        };

        debug!(subscription_id = %sub_id, "subscription closed");
        active
            .sub
            .close()
            .await
            .map_err(|e| RealtimeError::Write(format!("error closing subscription: {}", e)))
    }

    async fn publish(&self, msg: Message) {
        let topics = msg.topics();
        self.fan_out(topics, Delivery::Message(msg)).await;
    }

    async fn publish_chunk(&self, parent: &Message, chunk: Chunk) {
        self.fan_out(parent.topics(), Delivery::Chunk(chunk)).await;
    }

    async fn write(&self, env_id: Uuid, channel: &str, data: &[u8]) {
        let subs: Vec<Arc<dyn Subscription>> = {
            let registry = self.inner.registry.read().await;
            let mut subs: BTreeMap<Uuid, Arc<dyn Subscription>> = BTreeMap::new();
            for entry in registry.topics.values() {
                if entry.topic.env_id == env_id && entry.topic.channel == channel {
                    for (id, sub) in entry.subscriptions.iter().take(MAX_SUBSCRIBERS_PER_TOPIC) {
                        subs.insert(*id, sub.clone());
                    }
                }
            }
            subs.into_values().collect()
        };

        for sub in subs {
            if let Err(e) = sub.write(data).await {
                warn!(
                    subscription_id = %sub.id(),
                    channel,
                    error = %e,
                    "error writing raw data to subscription"
                );
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Err(RealtimeError::BroadcasterClosed);
        }

        let subs: Vec<Arc<dyn Subscription>> = {
            let registry = self.inner.registry.read().await;
            registry.subs.values().map(|a| a.sub.clone()).collect()
        };
        info!(subscriptions = subs.len(), "closing realtime broadcaster");

        let closing = Delivery::Message(Message::new(MessageKind::Closing, ""));
        for sub in subs {
            self.deliver(sub, closing.clone()).await;
        }

        let broadcaster = self.downgrade();
        let grace = self.inner.config.shutdown_grace_period;
        let shutdown = self.inner.shutdown.clone();
        self.inner.tasks.spawn(async move {
            tokio::time::sleep(grace).await;
            shutdown.cancel();

            let Some(b) = broadcaster.upgrade() else {
                return;
            };
            let subs: Vec<Arc<dyn Subscription>> = {
                let registry = b.inner.registry.read().await;
                registry.subs.values().map(|a| a.sub.clone()).collect()
            };
            for sub in subs {
                if let Err(e) = sub.close().await {
                    warn!(subscription_id = %sub.id(), error = %e, "error closing realtime subscription");
                }
            }
        });

        Ok(())
    }
}
