// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process subscriptions backed by a callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{RealtimeError, Result};
use crate::message::{Chunk, Message};
use crate::subscription::{PROTOCOL_MEMORY, Subscription};

/// Callback invoked with the JSON encoding of every write.
pub type WriteCallback = Arc<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;

/// A subscription that hands every write to a callback. Sends no keepalives.
pub struct InMemorySubscription {
    id: Uuid,
    callback: WriteCallback,
    closed: AtomicBool,
}

impl InMemorySubscription {
    /// Create a subscription with a fresh id.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&[u8]) -> Result<()> + Send + Sync + 'static,
    {
        Self::with_id(Uuid::new_v4(), callback)
    }

    /// Create a subscription with a fixed id.
    pub fn with_id<F>(id: Uuid, callback: F) -> Self
    where
        F: Fn(&[u8]) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            id,
            callback: Arc::new(callback),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether [`Subscription::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(RealtimeError::SubscriptionClosed(self.id));
        }
        (self.callback)(bytes)
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
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
        self.emit(&msg.to_json()?)
    }

    async fn write_chunk(&self, chunk: &Chunk) -> Result<()> {
        self.emit(&chunk.to_json()?)
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.emit(bytes)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_writes_json_to_callback() {
        let seen = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sink = seen.clone();
        let sub = InMemorySubscription::new(move |b| {
            sink.lock().unwrap().push(b.to_vec());
            Ok(())
        });

        let msg = Message::new(MessageKind::Data, r#""hi""#).with_topic("t");
        sub.write_message(&msg).await.unwrap();
        sub.write(b"raw").await.unwrap();
        sub.send_keepalive(&Message::new(MessageKind::Ping, ""))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let decoded: Message = serde_json::from_slice(&seen[0]).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(seen[1], b"raw");
    }

    #[tokio::test]
    async fn test_rejects_writes_after_close() {
        let sub = InMemorySubscription::new(|_| Ok(()));
        sub.close().await.unwrap();

        let err = sub.write(b"x").await.unwrap_err();
        assert!(matches!(err, RealtimeError::SubscriptionClosed(id) if id == sub.id()));
    }
}
