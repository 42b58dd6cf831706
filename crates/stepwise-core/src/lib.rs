// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stepwise Core - Durable Checkpoint Engine
//!
//! SDKs run user functions as plain HTTP endpoints and report every step they
//! finish to this crate. Step outputs are persisted so that a retried or
//! resumed run skips the steps it already completed; a finished run is handed
//! to the executor for finalization; a run that needs to sleep, wait or call
//! another function switches from the request/response cycle to the queue.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────────────┐
//! │  SDK (user endpoint)     │        │  Realtime clients (WS / SSE)     │
//! └────────────┬─────────────┘        └────────────────┬─────────────────┘
//!              │ POST /checkpoint/...                  │ /realtime/...
//!              ▼                                       ▼
//! ┌──────────────────────────┐        ┌──────────────────────────────────┐
//! │  api (axum router)       │        │  stepwise-realtime               │
//! └────────────┬─────────────┘        └──────────────────────────────────┘
//!              ▼
//! ┌──────────────────────────┐
//! │  checkpoint::Checkpointer│──► Executor / Queue / TracerProvider / Metrics
//! └────────────┬─────────────┘
//!              ▼
//! ┌──────────────────────────┐
//! │  RunService (SQL)        │  PostgreSQL or SQLite
//! └──────────────────────────┘
//! ```
//!
//! # Checkpoint paths
//!
//! | Path | Caller | Accepts |
//! |------|--------|---------|
//! | Sync | The SDK while serving the original HTTP request | Every opcode; async ones switch the run to async mode |
//! | Async | The SDK while executing a queue item | Step opcodes only |
//!
//! Step writes are first-writer-wins: a second write of the same step id never
//! replaces the stored output, and the retry is reported as a duplicate
//! rather than an error.
//!
//! # Collaborators
//!
//! The engine consumes its surroundings through traits: [`state::RunService`],
//! [`executor::Executor`], [`queue::Queue`], [`trace::TracerProvider`],
//! [`function::FunctionReader`] and [`metrics::MetricsProvider`]. The
//! [`standalone`] module has in-process versions used by the server binary.

#![deny(missing_docs)]

/// Checkpoint HTTP API.
pub mod api;

/// HTTP response returned by a function.
pub mod api_result;

/// Checkpoint engine for sync and async runs.
pub mod checkpoint;

/// Server configuration loaded from environment variables.
pub mod config;

/// Error types with HTTP status mapping.
pub mod error;

/// Secure HTTP client for calls to SDK endpoints.
pub mod exechttp;

/// Executor interface.
pub mod executor;

/// Functions, apps and events.
pub mod function;

/// In-process dispatch of registered functions.
pub mod invoke;

/// Metrics hooks.
pub mod metrics;

/// Embedded SQL migrations.
pub mod migrations;

/// Generator opcodes reported by SDKs.
pub mod opcode;

/// SQL backed run state.
pub mod persistence;

/// Queue items and queue references.
pub mod queue;

/// Context handed to the executor with each opcode.
pub mod run_context;

/// Run-output tokens.
pub mod run_token;

/// Embeddable server.
pub mod runtime;

/// Collaborators for the standalone server.
pub mod standalone;

/// Run identifiers, metadata and the state store interface.
pub mod state;

/// Span emission.
pub mod trace;

pub use checkpoint::{AsyncCheckpoint, Checkpointer, SyncCheckpoint, SyncCheckpointOutcome};
pub use error::{CoreError, Result};
pub use opcode::{GeneratorOpcode, Opcode};
pub use runtime::{Server, ServerBuilder, ServerHandle};
pub use state::{Id, Metadata, RunService};
