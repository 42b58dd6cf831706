// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue items, queue references and the queue interfaces.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;
use uuid::Uuid;

use crate::error::Result;
use crate::state::{CustomConcurrency, Id};

/// Separator between job id and shard id in a [`QueueRef`].
const QUEUE_REF_SEPARATOR: &str = "::";

/// Address of one queued attempt: `base64(job_id "::" shard_id)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueRef {
    /// Job id of the queue item.
    pub job_id: String,
    /// Shard the item lives on.
    pub shard_id: String,
}

impl QueueRef {
    /// Reference to `job_id` on `shard_id`.
    pub fn new(job_id: impl Into<String>, shard_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            shard_id: shard_id.into(),
        }
    }

    /// Decode a reference. Empty or undecodable input yields an empty reference.
    pub fn decode(encoded: &str) -> Self {
        let Ok(raw) = STANDARD.decode(encoded.as_bytes()) else {
            return Self::default();
        };
        let Ok(raw) = String::from_utf8(raw) else {
            return Self::default();
        };
        match raw.split_once(QUEUE_REF_SEPARATOR) {
            Some((job_id, shard_id)) => Self::new(job_id, shard_id),
            None => Self::new(raw, ""),
        }
    }

    /// Encode the reference.
    pub fn encode(&self) -> String {
        STANDARD.encode(format!(
            "{}{}{}",
            self.job_id, QUEUE_REF_SEPARATOR, self.shard_id
        ))
    }

    /// Whether the reference addresses no job.
    pub fn is_empty(&self) -> bool {
        self.job_id.is_empty()
    }
}

/// What a queue item asks the executor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueKind {
    /// Start a run.
    Start,
    /// Continue a run after a step.
    Edge,
    /// Retry a run after a step error.
    EdgeError,
    /// Wake a sleeping run.
    Sleep,
    /// Time out a pause.
    Pause,
}

/// How parallel steps resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelMode {
    /// Wait for every parallel step.
    #[default]
    Wait,
    /// Continue when the first parallel step finishes.
    Race,
}

/// A unit of work for the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Deterministic job id; enqueueing an existing id is a no-op.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Kind of work.
    pub kind: QueueKind,
    /// Run the item belongs to.
    pub identifier: Id,
    /// Environment, used for partitioning.
    pub workspace_id: Uuid,
    /// Attempt this item represents.
    pub attempt: u32,
    /// Attempts allowed before the step fails permanently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Priority factor in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_factor: Option<i64>,
    /// Concurrency keys of the run.
    #[serde(default)]
    pub custom_concurrency_keys: Vec<CustomConcurrency>,
    /// Parallel step behaviour.
    #[serde(default)]
    pub parallel_mode: ParallelMode,
    /// Kind specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// A queued job as reported by [`JobQueueReader`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResponse {
    /// Job id.
    pub job_id: String,
    /// When the job becomes runnable.
    pub at: DateTime<Utc>,
    /// Position in the queue.
    pub position: i64,
    /// Kind of work.
    pub kind: QueueKind,
    /// Attempt of the job.
    pub attempt: u32,
}

/// Work queue.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue `item` to become runnable at `at`.
    async fn enqueue(&self, item: QueueItem, at: DateTime<Utc>) -> Result<()>;

    /// Reset the attempt counter of a queued job.
    async fn reset_attempts_by_job_id(&self, shard_id: &str, job_id: &str) -> Result<()>;
}

/// Read access to queued jobs of a run.
#[async_trait]
pub trait JobQueueReader: Send + Sync {
    /// Jobs queued for `run_id`.
    async fn run_jobs(
        &self,
        shard_id: &str,
        workspace_id: Uuid,
        function_id: Uuid,
        run_id: Ulid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobResponse>>;
}
