// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run identifiers, metadata and the state store interface.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;
use uuid::Uuid;

use crate::error::Result;
use crate::trace::SpanReference;

/// Owner of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tenant {
    /// Account the run belongs to.
    pub account_id: Uuid,
    /// Environment the run executes in.
    pub env_id: Uuid,
    /// App the function belongs to.
    pub app_id: Uuid,
}

/// Identifies a single run. Immutable for the lifetime of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    /// Sortable run id.
    pub run_id: Ulid,
    /// Function being run.
    pub function_id: Uuid,
    /// Owner of the run.
    pub tenant: Tenant,
}

/// Whether a run is driven by a request/response cycle or by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Started by an HTTP request to the user's endpoint.
    #[default]
    Sync,
    /// Continued through queue items.
    Async,
}

/// A user-defined concurrency limit applied to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomConcurrency {
    /// Fully qualified concurrency key.
    pub key: String,
    /// Hash of the unevaluated key expression.
    pub hash: String,
    /// Maximum concurrent runs sharing the key.
    pub limit: i64,
}

/// Configuration captured when a run is scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Events that triggered the run.
    #[serde(default)]
    pub event_ids: Vec<Ulid>,
    /// SDK request version.
    #[serde(default)]
    pub request_version: i32,
    /// Idempotency key supplied when scheduling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Original run when this run is a replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_id: Option<Ulid>,
    /// Priority factor in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_factor: Option<i64>,
    /// Custom concurrency keys.
    #[serde(default)]
    pub custom_concurrency_keys: Vec<CustomConcurrency>,
    /// Forces every step to be planned before it runs.
    #[serde(default)]
    pub force_step_plan: bool,
    /// Execution mode.
    #[serde(default)]
    pub run_mode: RunMode,
    /// Span of the run itself; step spans are children of it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_span: Option<SpanReference>,
}

impl RunConfig {
    /// A config for a run starting now.
    pub fn new(run_mode: RunMode) -> Self {
        Self {
            started_at: Utc::now(),
            event_ids: Vec::new(),
            request_version: 0,
            idempotency_key: None,
            replay_id: None,
            priority_factor: None,
            custom_concurrency_keys: Vec::new(),
            force_step_plan: false,
            run_mode,
            run_span: None,
        }
    }
}

/// Counters maintained while a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Bytes of step output stored for the run. Only ever grows.
    pub state_size: u64,
}

/// Durable per-run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Run identifier.
    pub id: Id,
    /// Config captured at schedule time.
    pub config: RunConfig,
    /// Counters.
    #[serde(default)]
    pub metrics: RunMetrics,
}

impl Metadata {
    /// Key deduplicating work derived from this run.
    ///
    /// The custom idempotency key when one was supplied, the run id otherwise,
    /// always scoped to the function.
    pub fn idempotency_key(&self) -> String {
        match &self.config.idempotency_key {
            Some(key) => format!("{}:{}", self.id.function_id, key),
            None => format!("{}:{}", self.id.function_id, self.id.run_id),
        }
    }
}

/// Fields of [`RunConfig`] that may change after scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutableConfig {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// SDK request version.
    pub request_version: i32,
    /// Forces every step to be planned before it runs.
    pub force_step_plan: bool,
}

/// Input to [`RunService::create`].
#[derive(Debug, Clone)]
pub struct CreateState {
    /// Metadata of the new run.
    pub metadata: Metadata,
    /// Triggering events.
    pub events: Vec<Value>,
    /// Step outputs memoized up front, for replays.
    pub steps: Vec<MemoizedStep>,
}

/// A step output known before the run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoizedStep {
    /// Hashed step id.
    pub id: String,
    /// Output of the step.
    pub data: Value,
}

/// Everything stored for a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunState {
    /// Run metadata.
    #[serde(skip)]
    pub metadata: Metadata,
    /// Triggering events.
    pub events: Vec<Value>,
    /// Step outputs keyed by step id.
    pub steps: BTreeMap<String, Value>,
}

/// Durable store of run metadata, events and step outputs.
#[async_trait]
pub trait RunService: Send + Sync {
    /// Persist a new run. Fails with `IdentifierExists` if the run is known.
    async fn create(&self, state: CreateState) -> Result<Metadata>;

    /// Remove a run. Returns whether anything was deleted.
    async fn delete(&self, id: &Id) -> Result<bool>;

    /// Load metadata, events and step outputs.
    async fn load_state(&self, id: &Id) -> Result<RunState>;

    /// Stream the run state as a JSON document of the shape
    /// `{"events":[...],"steps":{...}}`, one step per chunk.
    async fn stream_state(&self, id: &Id) -> Result<BoxStream<'static, Result<Bytes>>> {
        let state = self.load_state(id).await?;

        let mut chunks = Vec::with_capacity(state.steps.len() + 2);
        chunks.push(Ok(Bytes::from(format!(
            "{{\"events\":{},\"steps\":{{",
            serde_json::to_string(&state.events)?
        ))));
        for (n, (step_id, output)) in state.steps.iter().enumerate() {
            let sep = if n == 0 { "" } else { "," };
            chunks.push(Ok(Bytes::from(format!(
                "{}{}:{}",
                sep,
                serde_json::to_string(step_id)?,
                serde_json::to_string(output)?
            ))));
        }
        chunks.push(Ok(Bytes::from_static(b"}}")));

        Ok(stream::iter(chunks).boxed())
    }

    /// Load metadata only. Fails with `RunNotFound` if the run is unknown.
    async fn load_metadata(&self, id: &Id) -> Result<Metadata>;

    /// Replace the mutable part of a run's config.
    async fn update_metadata(&self, id: &Id, config: MutableConfig) -> Result<()>;

    /// Store the output of a step.
    ///
    /// Returns `IdempotentResponse` when the same output is already stored and
    /// `DuplicateResponse` when a different one is.
    async fn save_step(&self, id: &Id, step_id: &str, data: &[u8]) -> Result<()>;
}
