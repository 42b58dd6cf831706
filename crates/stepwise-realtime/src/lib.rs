// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stepwise Realtime - topic based fan-out to WebSocket and SSE clients
//!
//! Functions publish step outputs, run results and arbitrary data to named
//! topics scoped by environment and channel. Clients subscribe with short-lived
//! tokens and receive every message published to those topics while they stay
//! connected. Nothing is persisted; a client that is not connected misses the
//! message.
//!
//! # Architecture
//!
//! ```text
//!   publishers                         subscribers
//!  ┌───────────────┐                  ┌───────────────────┐
//!  │ POST publish  │                  │ GET connect (WS)  │
//!  │ checkpoints   │                  │ GET sse           │
//!  └──────┬────────┘                  └─────────┬─────────┘
//!         │ Message / Chunk                     │ subscribe(topics)
//!         ▼                                     ▼
//!  ┌───────────────────────────────────────────────────────┐
//!  │                    Broadcaster                        │
//!  │   topic key ─► { subscription id ─► Subscription }    │
//!  └──────────────────────────┬────────────────────────────┘
//!                             │ topic_start / topic_stop
//!                             ▼
//!                  ┌─────────────────────┐
//!                  │ Redis pub/sub       │  (feature "redis")
//!                  │ one channel / topic │
//!                  └─────────────────────┘
//! ```
//!
//! # Topics
//!
//! | Kind | Key | Example |
//! |------|-----|---------|
//! | `run` | `{env}:{xxh64(channel)}:{name}` | step output of a run |
//! | `event` | `{env}:{name}` | event stream of an environment |
//!
//! # HTTP API
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/realtime/token` | Mint a subscribe token for a list of topics |
//! | GET | `/realtime/connect` | WebSocket subscription |
//! | GET | `/realtime/sse` | Server-Sent Events subscription |
//! | POST | `/realtime/publish` | Publish a message or stream (`text/stream`) |
//! | POST | `/realtime/publish/tee` | Forward raw bytes to every subscriber of a channel |
//!
//! # Modules
//!
//! - [`broadcaster`]: topic registry, fan-out, retries and keepalives
//! - [`message`]: wire messages and stream chunks
//! - [`topic`]: topic addressing
//! - [`jwt`]: subscribe and publish tokens
//! - [`api`]: axum router exposing the HTTP API

#![deny(missing_docs)]

/// Axum routes for tokens, subscriptions and publishing.
pub mod api;

/// Request authentication.
pub mod auth;

/// Topic registry and publish fan-out.
pub mod broadcaster;

/// Error types with HTTP status mapping.
pub mod error;

/// Realtime JWTs.
pub mod jwt;

/// Callback subscriptions for in-process consumers.
pub mod memory;

/// Wire messages.
pub mod message;

/// Broadcaster replicated through Redis pub/sub.
#[cfg(feature = "redis")]
pub mod replicated;

/// Server-Sent Events transport.
pub mod sse;

/// The subscription abstraction.
pub mod subscription;

/// Topic addressing.
pub mod topic;

/// WebSocket transport.
pub mod ws;

pub use api::{RealtimeState, router};
pub use auth::{AuthContext, AuthFinder, RealtimeAuth};
pub use broadcaster::{Broadcaster, BroadcasterConfig, InProcessBroadcaster, TopicLifecycle};
pub use error::{RealtimeError, Result};
pub use message::{Chunk, Message, MessageKind};
pub use subscription::Subscription;
pub use topic::{Topic, TopicKind};

#[cfg(feature = "redis")]
pub use replicated::RedisBroadcaster;
