// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The subscription capability implemented by every transport.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::message::{Chunk, Message};

/// Protocol name of WebSocket subscriptions.
pub const PROTOCOL_WS: &str = "ws";

/// Protocol name of Server-Sent Events subscriptions.
pub const PROTOCOL_SSE: &str = "sse";

/// Protocol name of in-process callback subscriptions.
pub const PROTOCOL_MEMORY: &str = "memory";

/// A live connection receiving messages from the broadcaster.
///
/// The broadcaster holds a strong reference to every registered subscription;
/// the transport owns the underlying socket and releases it on [`close`].
/// Writes to a single subscription are serialized by the implementation.
///
/// [`close`]: Subscription::close
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Stable identifier of this subscription.
    fn id(&self) -> Uuid;

    /// Transport name, one of [`PROTOCOL_WS`], [`PROTOCOL_SSE`] or [`PROTOCOL_MEMORY`].
    fn protocol(&self) -> &'static str;

    /// Send a keepalive frame. `msg` is a `ping` message for transports that
    /// frame keepalives as messages.
    async fn send_keepalive(&self, msg: &Message) -> Result<()>;

    /// Write a message.
    async fn write_message(&self, msg: &Message) -> Result<()>;

    /// Write a stream chunk.
    async fn write_chunk(&self, chunk: &Chunk) -> Result<()>;

    /// Write raw bytes verbatim.
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Close the transport. Later writes fail.
    async fn close(&self) -> Result<()>;
}
