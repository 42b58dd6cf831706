// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stepwise-realtime tests.
//!
//! Provides recording subscriptions and lifecycle hooks.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use stepwise_realtime::broadcaster::{BroadcasterConfig, TopicLifecycle};
use stepwise_realtime::memory::InMemorySubscription;
use stepwise_realtime::message::{Chunk, Message};
use stepwise_realtime::subscription::{PROTOCOL_MEMORY, Subscription};
use stepwise_realtime::topic::Topic;
use stepwise_realtime::{RealtimeError, Result};

/// Frames received by a [`recording_subscription`], decoded as JSON.
pub type Received = Arc<Mutex<Vec<serde_json::Value>>>;

/// A memory subscription that records every write.
pub fn recording_subscription() -> (Arc<InMemorySubscription>, Received) {
    let received: Received = Arc::default();
    let sink = received.clone();
    let sub = InMemorySubscription::new(move |bytes| {
        let value = serde_json::from_slice(bytes)?;
        sink.lock().unwrap().push(value);
        Ok(())
    });
    (Arc::new(sub), received)
}

/// Wait until `received` holds at least `n` frames.
pub async fn wait_for(received: &Received, n: usize) -> Vec<serde_json::Value> {
    for _ in 0..200 {
        {
            let frames = received.lock().unwrap();
            if frames.len() >= n {
                return frames.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    received.lock().unwrap().clone()
}

/// Broadcaster timings short enough for tests.
pub fn fast_config() -> BroadcasterConfig {
    BroadcasterConfig {
        write_retry_interval: Duration::from_millis(20),
        keepalive_interval: Duration::from_secs(3600),
        shutdown_grace_period: Duration::from_millis(50),
        ..BroadcasterConfig::default()
    }
}

/// A subscription whose first `failures` writes fail.
pub struct FlakySubscription {
    id: Uuid,
    failures: AtomicUsize,
    pub attempts: AtomicUsize,
    pub delivered: Mutex<Vec<serde_json::Value>>,
}

impl FlakySubscription {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            delivered: Mutex::default(),
        })
    }

    fn record(&self, bytes: Vec<u8>) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RealtimeError::Write("flaky".to_string()));
        }
        self.delivered
            .lock()
            .unwrap()
            .push(serde_json::from_slice(&bytes)?);
        Ok(())
    }
}

#[async_trait]
impl Subscription for FlakySubscription {
    fn id(&self) -> Uuid {
        self.id
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL_MEMORY
    }

    async fn send_keepalive(&self, _msg: &Message) -> Result<()> {
        Ok(())
    }

    async fn write_message(&self, msg: &Message) -> Result<()> {
        self.record(msg.to_json()?)
    }

    async fn write_chunk(&self, chunk: &Chunk) -> Result<()> {
        self.record(chunk.to_json()?)
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.record(bytes.to_vec())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Counts topic starts and stops; optionally fails starts.
#[derive(Default)]
pub struct CountingLifecycle {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub fail_starts: AtomicBool,
}

#[async_trait]
impl TopicLifecycle for CountingLifecycle {
    async fn topic_start(&self, _topic: &Topic) -> Result<()> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(RealtimeError::Internal("upstream unavailable".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn topic_stop(&self, _topic: &Topic) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Tracks `starts - stops` as the hooks run. Stops yield before taking
/// effect, like an upstream unsubscribe over the network.
#[derive(Default)]
pub struct BalanceLifecycle {
    pub balance: AtomicI64,
    pub max_balance: AtomicI64,
    pub min_balance: AtomicI64,
}

#[async_trait]
impl TopicLifecycle for BalanceLifecycle {
    async fn topic_start(&self, _topic: &Topic) -> Result<()> {
        let now = self.balance.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_balance.fetch_max(now, Ordering::SeqCst);
        Ok(())
    }

    async fn topic_stop(&self, _topic: &Topic) -> Result<()> {
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        let now = self.balance.fetch_sub(1, Ordering::SeqCst) - 1;
        self.min_balance.fetch_min(now, Ordering::SeqCst);
        Ok(())
    }
}
