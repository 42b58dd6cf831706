// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Span emission for runs and steps.
//!
//! The tracing backend is external; the engine only talks to a
//! [`TracerProvider`]. [`LogTracerProvider`] records spans as structured log
//! events and is what the standalone server uses.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::Result;

/// Name of the span emitted for every checkpointed step.
pub const SPAN_NAME_STEP: &str = "executor.step";

/// Name of the root span of a run.
pub const SPAN_NAME_RUN: &str = "executor.run";

/// Span attribute keys.
pub mod attrs {
    /// Status shown for the span.
    pub const DYNAMIC_STATUS: &str = "dynamic_status";
    /// Set on spans created by a checkpoint.
    pub const IS_CHECKPOINT: &str = "is_checkpoint";
    /// Name the user gave the step.
    pub const STEP_NAME: &str = "step_name";
    /// Hashed step id.
    pub const STEP_ID: &str = "step_id";
    /// Opcode of the step.
    pub const STEP_OP: &str = "step_op";
    /// Attempt the step ran in.
    pub const STEP_ATTEMPT: &str = "step_attempt";
    /// Error raised by the step.
    pub const STEP_ERROR: &str = "step_error";
    /// Run id.
    pub const RUN_ID: &str = "run_id";
    /// When the step was queued.
    pub const QUEUED_AT: &str = "queued_at";
    /// When the step started.
    pub const STARTED_AT: &str = "started_at";
    /// When the step ended.
    pub const ENDED_AT: &str = "ended_at";
    /// When a sync run switched to async mode.
    pub const DURABLE_ENDPOINT_MODE_CHANGED_AT: &str = "durable_endpoint_mode_changed_at";
}

/// Status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    /// Not known yet.
    Unknown,
    /// Still running.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Errored,
    /// Cancelled before it finished.
    Cancelled,
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpanStatus::Unknown => "unknown",
            SpanStatus::Running => "running",
            SpanStatus::Completed => "completed",
            SpanStatus::Errored => "errored",
            SpanStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Reference to an emitted span.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanReference {
    /// Trace the span belongs to, 16 bytes hex.
    pub trace_id: String,
    /// Span id, 8 bytes hex.
    pub span_id: String,
}

impl SpanReference {
    /// A reference to a span in a fresh trace.
    pub fn root(seed: Option<&[u8]>) -> Self {
        let mut trace = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut trace);
        Self {
            trace_id: hex::encode(trace),
            span_id: span_id(seed),
        }
    }

    /// A reference to a child of `parent`, or a root when there is no parent.
    pub fn child(parent: Option<&SpanReference>, seed: Option<&[u8]>) -> Self {
        match parent {
            Some(parent) => Self {
                trace_id: parent.trace_id.clone(),
                span_id: span_id(seed),
            },
            None => Self::root(seed),
        }
    }
}

/// Span id for `seed`: the first 8 bytes of `sha256(seed)` as hex, or random
/// when no seed is given.
pub fn span_id(seed: Option<&[u8]>) -> String {
    match seed {
        Some(seed) => {
            let digest = Sha256::digest(seed);
            hex::encode(&digest[..8])
        }
        None => {
            let mut id = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut id);
            hex::encode(id)
        }
    }
}

/// Attributes attached to a span.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanAttributes(pub BTreeMap<String, Value>);

impl SpanAttributes {
    /// No attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Set a timestamp attribute, as epoch milliseconds.
    pub fn with_time(self, key: &str, at: DateTime<Utc>) -> Self {
        self.with(key, at.timestamp_millis())
    }

    /// Read an attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

/// Options for creating a span.
#[derive(Debug, Clone, Default)]
pub struct CreateSpanOptions {
    /// Parent span.
    pub parent: Option<SpanReference>,
    /// Seed for a deterministic span id.
    pub seed: Option<Vec<u8>>,
    /// Trace to start a root span in. Ignored when `parent` is set.
    pub trace_id: Option<String>,
    /// Start of the span.
    pub start_time: Option<DateTime<Utc>>,
    /// End of the span.
    pub end_time: Option<DateTime<Utc>>,
    /// Attributes.
    pub attributes: SpanAttributes,
}

/// Options for updating an existing span.
#[derive(Debug, Clone)]
pub struct UpdateSpanOptions {
    /// Span to update.
    pub target: SpanReference,
    /// Attributes to merge into the span.
    pub attributes: SpanAttributes,
    /// New end time.
    pub end_time: Option<DateTime<Utc>>,
}

/// A span that has been allocated but not emitted.
///
/// Call [`DroppableSpan::send`] to emit it, or drop it to discard.
#[derive(Debug, Clone)]
pub struct DroppableSpan {
    /// Reference the span will have once sent.
    pub reference: SpanReference,
    name: String,
    opts: CreateSpanOptions,
}

impl DroppableSpan {
    /// Emit the span.
    pub async fn send(self, tracer: &dyn TracerProvider) -> Result<SpanReference> {
        tracer.create_span(&self.name, self.opts).await
    }
}

/// Tracing backend.
#[async_trait]
pub trait TracerProvider: Send + Sync {
    /// Emit a span and return its reference.
    async fn create_span(&self, name: &str, opts: CreateSpanOptions) -> Result<SpanReference>;

    /// Allocate a span that is only emitted on [`DroppableSpan::send`].
    ///
    /// Without a seed a random one is chosen so that the reference returned
    /// now is the one the span gets when sent.
    async fn create_droppable_span(
        &self,
        name: &str,
        mut opts: CreateSpanOptions,
    ) -> Result<DroppableSpan> {
        let seed = opts.seed.get_or_insert_with(|| {
            let mut seed = vec![0u8; 16];
            rand::thread_rng().fill_bytes(&mut seed);
            seed
        });
        let span_id = span_id(Some(seed));
        let trace_id = match &opts.parent {
            Some(parent) => parent.trace_id.clone(),
            None => opts
                .trace_id
                .get_or_insert_with(|| SpanReference::root(None).trace_id)
                .clone(),
        };

        Ok(DroppableSpan {
            reference: SpanReference { trace_id, span_id },
            name: name.to_string(),
            opts,
        })
    }

    /// Merge attributes into an emitted span.
    async fn update_span(&self, opts: UpdateSpanOptions) -> Result<()>;
}

/// Records spans as structured log events on the `stepwise::trace` target.
#[derive(Debug, Clone, Default)]
pub struct LogTracerProvider;

impl LogTracerProvider {
    /// Create a new log tracer.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TracerProvider for LogTracerProvider {
    async fn create_span(&self, name: &str, opts: CreateSpanOptions) -> Result<SpanReference> {
        let reference = match (&opts.parent, &opts.trace_id) {
            (None, Some(trace_id)) => SpanReference {
                trace_id: trace_id.clone(),
                span_id: span_id(opts.seed.as_deref()),
            },
            (parent, _) => SpanReference::child(parent.as_ref(), opts.seed.as_deref()),
        };
        let attributes = serde_json::to_string(&opts.attributes)?;

        info!(
            target: "stepwise::trace",
            span_name = name,
            trace_id = %reference.trace_id,
            span_id = %reference.span_id,
            parent_span_id = opts.parent.as_ref().map(|p| p.span_id.as_str()).unwrap_or(""),
            start_time = ?opts.start_time,
            end_time = ?opts.end_time,
            attributes = %attributes,
            "span"
        );

        Ok(reference)
    }

    async fn update_span(&self, opts: UpdateSpanOptions) -> Result<()> {
        let attributes = serde_json::to_string(&opts.attributes)?;

        info!(
            target: "stepwise::trace",
            trace_id = %opts.target.trace_id,
            span_id = %opts.target.span_id,
            end_time = ?opts.end_time,
            attributes = %attributes,
            "span updated"
        );

        Ok(())
    }
}
