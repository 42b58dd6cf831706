// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint HTTP API.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/` | Create a sync run from an `api/request` event |
//! | POST | `/{run_id}/steps` | Checkpoint opcodes of a sync run |
//! | POST | `/{run_id}/async` | Checkpoint opcodes of a queue driven run |
//! | POST | `/{run_id}/response` | Finalize a sync run with its HTTP response |
//! | GET | `/{run_id}/output` | Wait for the output of a run that went async |
//!
//! The router is mounted under a prefix by the caller. Every route except
//! `/output` authenticates through the [`AuthFinder`]; `/output` takes the run
//! token minted when the run went async.

mod error;
mod handlers;
pub mod upsert;

pub use error::{ApiError, ErrorResponse};
pub use handlers::{
    AsyncCheckpointRequest, CheckpointResponse, NewRunRequest, NewRunResponse,
    ResponseCheckpointRequest, StepsCheckpointRequest,
};
pub use upsert::UpsertCache;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::routing::{get, post};
use bytes::Bytes;
use stepwise_realtime::AuthFinder;
use ulid::Ulid;
use uuid::Uuid;

use crate::checkpoint::Checkpointer;
use crate::error::Result;
use crate::executor::Executor;
use crate::function::{AppCreator, EventPublisher, FunctionCreator, FunctionReader};

/// Largest request body accepted by default.
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// How often `/output` checks for the run's output.
pub const OUTPUT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How long `/output` waits for the run to end.
pub const OUTPUT_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Reads the output of finished runs.
#[async_trait]
pub trait RunOutputReader: Send + Sync {
    /// Output of the run, or `None` while it is still running.
    async fn run_output(&self, env_id: Uuid, run_id: Ulid) -> Result<Option<Bytes>>;
}

/// Shared state of the checkpoint routes.
#[derive(Clone)]
pub struct CheckpointApiState {
    /// Checkpoint engine.
    pub checkpointer: Checkpointer,
    /// Request authentication.
    pub auth: Arc<dyn AuthFinder>,
    /// Executor new runs are scheduled on.
    pub executor: Arc<dyn Executor>,
    /// Receives the event that starts a run.
    pub events: Arc<dyn EventPublisher>,
    /// App writes.
    pub apps: Arc<dyn AppCreator>,
    /// Function reads.
    pub functions: Arc<dyn FunctionReader>,
    /// Function writes.
    pub function_writer: Arc<dyn FunctionCreator>,
    /// Output of runs that went async.
    pub output: Option<Arc<dyn RunOutputReader>>,
    /// HS256 secret of run tokens.
    pub run_jwt_secret: Arc<Vec<u8>>,
    /// Remembers which sync functions are up to date.
    pub upserts: Arc<UpsertCache>,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Poll interval of `/output`.
    pub output_poll_interval: Duration,
    /// Wait limit of `/output`.
    pub output_wait_timeout: Duration,
}

impl std::fmt::Debug for CheckpointApiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointApiState")
            .field("checkpointer", &self.checkpointer)
            .field("output", &self.output.is_some())
            .field("max_body_bytes", &self.max_body_bytes)
            .finish_non_exhaustive()
    }
}

impl CheckpointApiState {
    /// State over the given collaborators. `functions` provides function
    /// reads and writes as well as app writes.
    pub fn new<F>(
        checkpointer: Checkpointer,
        auth: Arc<dyn AuthFinder>,
        executor: Arc<dyn Executor>,
        events: Arc<dyn EventPublisher>,
        functions: Arc<F>,
        run_jwt_secret: impl Into<Vec<u8>>,
    ) -> Self
    where
        F: FunctionReader + FunctionCreator + AppCreator + 'static,
    {
        Self {
            checkpointer,
            auth,
            executor,
            events,
            apps: functions.clone(),
            functions: functions.clone(),
            function_writer: functions,
            output: None,
            run_jwt_secret: Arc::new(run_jwt_secret.into()),
            upserts: Arc::new(UpsertCache::new()),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            output_poll_interval: OUTPUT_POLL_INTERVAL,
            output_wait_timeout: OUTPUT_WAIT_TIMEOUT,
        }
    }

    /// Serve `/output` from `reader`.
    pub fn with_output_reader(mut self, reader: Arc<dyn RunOutputReader>) -> Self {
        self.output = Some(reader);
        self
    }

    /// Accept request bodies up to `limit` bytes.
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Poll `/output` every `interval` for at most `timeout`.
    pub fn with_output_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.output_poll_interval = interval;
        self.output_wait_timeout = timeout;
        self
    }
}

/// Build the checkpoint router.
pub fn router(state: CheckpointApiState) -> Router {
    Router::new()
        .route("/", post(handlers::new_run))
        .route("/{run_id}/steps", post(handlers::checkpoint_steps))
        .route("/{run_id}/async", post(handlers::checkpoint_async))
        .route("/{run_id}/response", post(handlers::checkpoint_response))
        .route("/{run_id}/output", get(handlers::run_output))
        .with_state(state)
}
