// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WebSocket subscriptions.
//!
//! The socket is split on accept. The write half lives inside the
//! subscription and is driven by the broadcaster; the read half is owned by
//! [`serve_websocket`], which handles in-band `sub`/`unsub` requests until the
//! peer goes away and then closes the subscription.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::RealtimeAuth;
use crate::broadcaster::Broadcaster;
use crate::error::{RealtimeError, Result};
use crate::jwt;
use crate::message::{Chunk, Message, MessageKind};
use crate::subscription::{PROTOCOL_WS, Subscription};
use crate::topic::Topic;

/// A subscription writing one text frame per message.
pub struct WebSocketSubscription {
    id: Uuid,
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
    closed: AtomicBool,
}

impl WebSocketSubscription {
    /// Wrap the write half of an accepted socket.
    pub fn new(sink: SplitSink<WebSocket, WsMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    async fn send(&self, frame: WsMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RealtimeError::SubscriptionClosed(self.id));
        }
        self.sink
            .lock()
            .await
            .send(frame)
            .await
            .map_err(|e| RealtimeError::Write(e.to_string()))
    }

    async fn send_json(&self, json: Vec<u8>) -> Result<()> {
        let text = String::from_utf8(json).map_err(|e| RealtimeError::Write(e.to_string()))?;
        self.send(WsMessage::Text(text.into())).await
    }
}

#[async_trait]
impl Subscription for WebSocketSubscription {
    fn id(&self) -> Uuid {
        self.id
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL_WS
    }

    async fn send_keepalive(&self, _msg: &Message) -> Result<()> {
        self.send(WsMessage::Ping(Bytes::new())).await
    }

    async fn write_message(&self, msg: &Message) -> Result<()> {
        self.send_json(msg.to_json()?).await
    }

    async fn write_chunk(&self, chunk: &Chunk) -> Result<()> {
        self.send_json(chunk.to_json()?).await
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let frame = match std::str::from_utf8(bytes) {
            Ok(text) => WsMessage::Text(text.to_string().into()),
            Err(_) => WsMessage::Binary(Bytes::copy_from_slice(bytes)),
        };
        self.send(frame).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        // The peer may already be gone.
        if let Err(e) = sink.send(WsMessage::Close(None)).await {
            debug!(subscription_id = %self.id, error = %e, "close frame not sent");
        }
        if let Err(e) = sink.close().await {
            debug!(subscription_id = %self.id, error = %e, "websocket sink not closed");
        }
        Ok(())
    }
}

/// Drive an accepted WebSocket until the peer disconnects.
///
/// Subscribes to the topics granted by `auth`, then reads control messages:
/// `{"kind":"sub","data":"<token>"}` adds the topics of another token of the
/// same environment, `{"kind":"unsub","data":[<topic>, ...]}` removes topics.
pub async fn serve_websocket(
    socket: WebSocket,
    broadcaster: Arc<dyn Broadcaster>,
    auth: RealtimeAuth,
    secret: Arc<Vec<u8>>,
) {
    let (sink, mut stream) = socket.split();
    let sub = Arc::new(WebSocketSubscription::new(sink));
    let sub_id = sub.id();

    if let Err(e) = broadcaster.subscribe(sub.clone(), auth.topics.clone()).await {
        warn!(subscription_id = %sub_id, error = %e, "error subscribing to topics");
        if let Err(e) = sub.close().await {
            debug!(subscription_id = %sub_id, error = %e, "error closing websocket");
        }
        return;
    }

    info!(
        subscription_id = %sub_id,
        account_id = %auth.account_id,
        env_id = %auth.env_id,
        topics = auth.topics.len(),
        "new realtime connection"
    );

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                if let Err(e) =
                    handle_control(&broadcaster, &sub, &auth, &secret, text.as_str().as_bytes())
                        .await
                {
                    warn!(subscription_id = %sub_id, error = %e, "error handling websocket message");
                }
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(subscription_id = %sub_id, error = %e, "websocket read failed");
                break;
            }
        }
    }

    debug!(subscription_id = %sub_id, "closing websocket conn");
    if let Err(e) = broadcaster.close_subscription(sub_id).await {
        warn!(subscription_id = %sub_id, error = %e, "error closing websocket subscription");
    }
}

async fn handle_control(
    broadcaster: &Arc<dyn Broadcaster>,
    sub: &Arc<WebSocketSubscription>,
    auth: &RealtimeAuth,
    secret: &[u8],
    frame: &[u8],
) -> Result<()> {
    let msg: Message = serde_json::from_slice(frame)
        .map_err(|e| RealtimeError::InvalidBody(e.to_string()))?;

    match msg.kind {
        MessageKind::Subscribe => {
            let token: String = serde_json::from_slice(&msg.data)
                .map_err(|_| RealtimeError::InvalidBody("sub data must be a token".to_string()))?;
            let granted = RealtimeAuth::from_claims(jwt::validate(secret, &token)?)?;
            if granted.env_id != auth.env_id {
                return Err(RealtimeError::InvalidToken);
            }
            broadcaster.subscribe(sub.clone(), granted.topics).await
        }
        MessageKind::Unsubscribe => {
            let mut topics: Vec<Topic> = serde_json::from_slice(&msg.data).map_err(|_| {
                RealtimeError::InvalidBody("unsub data must be a list of topics".to_string())
            })?;
            for topic in &mut topics {
                topic.env_id = auth.env_id;
            }
            broadcaster.unsubscribe(sub.id(), &topics).await
        }
        _ => Ok(()),
    }
}
