// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-replicated broadcaster.
//!
//! Every replica keeps its own [`InProcessBroadcaster`]. Publishing goes to a
//! Redis pub/sub channel per topic (the topic key); each replica subscribes
//! to the channels of the topics its local subscribers are interested in and
//! delivers what it reads to them. Local subscribers therefore receive their
//! own replica's publishes through Redis as well, exactly once.
//!
//! Raw channel writes (`write`) are not replicated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broadcaster::{
    Broadcaster, BroadcasterConfig, InProcessBroadcaster, TopicLifecycle, WeakBroadcaster,
};
use crate::error::{RealtimeError, Result};
use crate::message::{Chunk, Message};
use crate::subscription::Subscription;
use crate::topic::Topic;

/// Attempts per Redis publish.
pub const PUBLISH_ATTEMPTS: u32 = 3;

/// Delay between Redis publish attempts.
pub const PUBLISH_RETRY_INTERVAL: Duration = Duration::from_secs(2);

// Delay before re-subscribing after the pub/sub connection dropped.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// A broadcaster replicated across processes via Redis pub/sub.
#[derive(Clone)]
pub struct RedisBroadcaster {
    local: InProcessBroadcaster,
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroadcaster")
            .field("local", &self.local)
            .finish()
    }
}

impl RedisBroadcaster {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str, config: BroadcasterConfig) -> Result<Self> {
        let client = redis::Client::open(url).map_err(replication)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(replication)?;

        let local = InProcessBroadcaster::with_config(config);
        let topics = Arc::new(RedisTopics {
            client,
            local: local.downgrade(),
            running: Mutex::new(HashMap::new()),
        });
        local.set_lifecycle(topics);

        Ok(Self { local, conn })
    }

    /// The replica-local broadcaster.
    pub fn local(&self) -> &InProcessBroadcaster {
        &self.local
    }

    async fn publish_raw(&self, channel: String, payload: Vec<u8>) {
        let mut conn = self.conn.clone();
        for attempt in 1..=PUBLISH_ATTEMPTS {
            match conn.publish::<_, _, ()>(&channel, &payload).await {
                Ok(()) => return,
                Err(e) if attempt < PUBLISH_ATTEMPTS => {
                    debug!(channel = %channel, attempt, error = %e, "redis publish failed, retrying");
                    tokio::time::sleep(PUBLISH_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "error publishing realtime message to redis");
                }
            }
        }
    }
}

fn replication(e: redis::RedisError) -> RealtimeError {
    RealtimeError::Replication(e.to_string())
}

#[async_trait]
impl Broadcaster for RedisBroadcaster {
    async fn subscribe(&self, sub: Arc<dyn Subscription>, topics: Vec<Topic>) -> Result<()> {
        self.local.subscribe(sub, topics).await
    }

    async fn unsubscribe(&self, sub_id: Uuid, topics: &[Topic]) -> Result<()> {
        self.local.unsubscribe(sub_id, topics).await
    }

    async fn close_subscription(&self, sub_id: Uuid) -> Result<()> {
        self.local.close_subscription(sub_id).await
    }

    async fn publish(&self, msg: Message) {
        for topic in msg.topics() {
            let mut msg = msg.clone();
            msg.topic = topic.name.clone();
            match msg.to_json() {
                Ok(payload) => self.publish_raw(topic.key(), payload).await,
                Err(e) => warn!(error = %e, "error encoding realtime message"),
            }
        }
    }

    async fn publish_chunk(&self, parent: &Message, chunk: Chunk) {
        let payload = match chunk.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "error encoding realtime chunk");
                return;
            }
        };
        for topic in parent.topics() {
            self.publish_raw(topic.key(), payload.clone()).await;
        }
    }

    async fn write(&self, env_id: Uuid, channel: &str, data: &[u8]) {
        self.local.write(env_id, channel, data).await
    }

    async fn close(&self) -> Result<()> {
        self.local.close().await
    }
}

/// A payload read from a topic channel.
#[derive(Debug, PartialEq)]
pub enum Upstream {
    /// A regular message.
    Message(Message),
    /// A stream chunk.
    Chunk(Chunk),
}

/// Decode a pub/sub payload. Chunks are recognised by `"kind":"chunk"`.
pub fn decode_payload(payload: &[u8]) -> Result<Upstream> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    if value.get("kind").and_then(|k| k.as_str()) == Some("chunk") {
        return Ok(Upstream::Chunk(serde_json::from_value(value)?));
    }
    Ok(Upstream::Message(serde_json::from_slice(payload)?))
}

struct RedisTopics {
    client: redis::Client,
    local: WeakBroadcaster,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl RedisTopics {
    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        // A poisoned map only ever holds tokens; keep using it.
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TopicLifecycle for RedisTopics {
    async fn topic_start(&self, topic: &Topic) -> Result<()> {
        let key = topic.key();
        let cancel = CancellationToken::new();
        if let Some(previous) = self.running().insert(key.clone(), cancel.clone()) {
            previous.cancel();
        }

        let client = self.client.clone();
        let local = self.local.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            while !cancel.is_cancelled() {
                if let Err(e) = forward(&client, &local, &topic, &key, &cancel).await {
                    warn!(topic = %key, error = %e, "redis topic subscription failed");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                }
            }
            debug!(topic = %key, "redis topic subscription stopped");
        });
        Ok(())
    }

    async fn topic_stop(&self, topic: &Topic) -> Result<()> {
        if let Some(cancel) = self.running().remove(&topic.key()) {
            cancel.cancel();
        }
        Ok(())
    }
}

async fn forward(
    client: &redis::Client,
    local: &WeakBroadcaster,
    topic: &Topic,
    key: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut pubsub = client.get_async_pubsub().await.map_err(replication)?;
    pubsub.subscribe(key).await.map_err(replication)?;
    let mut messages = pubsub.on_message();

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = messages.next() => msg,
        };
        let Some(msg) = msg else {
            return Err(RealtimeError::Replication("pubsub stream ended".to_string()));
        };
        let Some(broadcaster) = local.upgrade() else {
            return Ok(());
        };

        let payload: Vec<u8> = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %key, error = %e, "unreadable redis payload");
                continue;
            }
        };
        match decode_payload(&payload) {
            Ok(Upstream::Message(msg)) => broadcaster.publish_to_topic(topic, msg).await,
            Ok(Upstream::Chunk(chunk)) => broadcaster.publish_chunk_to_topic(topic, chunk).await,
            Err(e) => warn!(topic = %key, error = %e, "error decoding realtime payload"),
        }
    }
}
