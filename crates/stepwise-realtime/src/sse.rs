// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server-Sent Events subscriptions.
//!
//! Writes are queued on a channel drained by the HTTP response body, one
//! frame per write, so frames never interleave.

use std::convert::Infallible;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{RealtimeError, Result};
use crate::message::{Chunk, Message};
use crate::subscription::{PROTOCOL_SSE, Subscription};

/// Server-side cap on the lifetime of an SSE connection.
pub const SSE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const KEEPALIVE_FRAME: &[u8] = b":\n\n";

// Frames buffered per connection before writers wait.
const FRAME_BUFFER: usize = 64;

/// A subscription streaming `text/event-stream` frames.
pub struct SseSubscription {
    id: Uuid,
    tx: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl SseSubscription {
    /// Create a subscription and the response body that drains it.
    pub fn new() -> (Self, Body) {
        let (tx, mut rx) = mpsc::channel::<Bytes>(FRAME_BUFFER);
        let closed = CancellationToken::new();
        let done = closed.clone();

        let stream = async_stream::stream! {
            loop {
                let frame = tokio::select! {
                    // Drain queued frames before honouring close.
                    biased;
                    frame = rx.recv() => frame,
                    _ = done.cancelled() => None,
                };
                match frame {
                    Some(frame) => yield Ok::<Bytes, Infallible>(frame),
                    None => break,
                }
            }
        };

        let sub = Self {
            id: Uuid::new_v4(),
            tx,
            closed,
        };
        (sub, Body::from_stream(stream))
    }

    /// Resolves once the client went away or the subscription was closed.
    pub async fn finished(&self) {
        tokio::select! {
            _ = self.tx.closed() => {}
            _ = self.closed.cancelled() => {}
        }
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(RealtimeError::SubscriptionClosed(self.id));
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| RealtimeError::Write("sse client disconnected".to_string()))
    }
}

/// Frame a JSON payload as an SSE `data:` event.
pub fn frame(json: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(json.len() + 8);
    buf.extend_from_slice(b"data: ");
    buf.extend_from_slice(json);
    buf.extend_from_slice(b"\n\n");
    Bytes::from(buf)
}

/// Wrap an SSE body into a response with the streaming headers set.
pub fn sse_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

#[async_trait]
impl Subscription for SseSubscription {
    fn id(&self) -> Uuid {
        self.id
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL_SSE
    }

    async fn send_keepalive(&self, _msg: &Message) -> Result<()> {
        self.send(Bytes::from_static(KEEPALIVE_FRAME)).await
    }

    async fn write_message(&self, msg: &Message) -> Result<()> {
        self.send(frame(&msg.to_json()?)).await
    }

    async fn write_chunk(&self, chunk: &Chunk) -> Result<()> {
        self.send(frame(&chunk.to_json()?)).await
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.send(Bytes::copy_from_slice(bytes)).await
    }

    async fn close(&self) -> Result<()> {
        // Ends the response body; the server releases the connection.
        self.closed.cancel();
        Ok(())
    }
}
