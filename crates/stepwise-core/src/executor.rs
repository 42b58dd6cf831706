// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The executor interface.
//!
//! The executor owns scheduling, async continuation and run finalization. The
//! checkpoint engine only hands it work.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;
use uuid::Uuid;

use crate::api_result::ApiResult;
use crate::error::Result;
use crate::function::{Function, InternalEvent};
use crate::opcode::GeneratorOpcode;
use crate::run_context::RunContext;
use crate::state::{Id, Metadata, RunMode};

/// Request to schedule a new run.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    /// Run id to use; the executor picks one when unset.
    pub run_id: Option<Ulid>,
    /// Function to run.
    pub function: Function,
    /// Account.
    pub account_id: Uuid,
    /// Environment.
    pub env_id: Uuid,
    /// App.
    pub app_id: Uuid,
    /// Execution mode.
    pub run_mode: RunMode,
    /// Triggering events.
    pub events: Vec<InternalEvent>,
    /// URL the run was started from.
    pub url: Option<String>,
    /// Idempotency key.
    pub idempotency_key: Option<String>,
}

/// What the executor did with a generator opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorOutcome {
    /// Fully handled.
    Handled,
    /// A step error was handled by user code and the step should be retried.
    RetryStep,
}

/// Request to finalize a run.
#[derive(Debug, Clone)]
pub struct FinalizeOpts {
    /// Run metadata.
    pub metadata: Metadata,
    /// Response the function returned.
    pub response: ApiResult,
}

/// Why a run is cancelled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Event that caused the cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Ulid>,
    /// Expression that matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// Result of matching an event against paused runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PauseOutcome {
    /// Pauses evaluated.
    pub processed: usize,
    /// Pauses resumed.
    pub handled: usize,
}

/// Function executor.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Schedule a new run.
    ///
    /// Fails with `IdentifierExists` when the run already exists and with
    /// `RateLimited` when the function is over its limit.
    async fn schedule(&self, req: ScheduleRequest) -> Result<Metadata>;

    /// Act on an opcode the checkpoint engine cannot handle itself.
    async fn handle_generator(
        &self,
        ctx: &dyn RunContext,
        op: &GeneratorOpcode,
    ) -> Result<GeneratorOutcome>;

    /// Finish a run with the response its function returned.
    async fn finalize(&self, opts: FinalizeOpts) -> Result<()>;

    /// Cancel a run.
    async fn cancel(&self, id: &Id, req: CancelRequest) -> Result<()>;

    /// Deliver a signal to the run waiting for it.
    async fn receive_signal(&self, workspace_id: Uuid, signal_id: &str, data: Value)
    -> Result<()>;

    /// Resume runs paused on `event`.
    async fn handle_pauses(&self, event: &InternalEvent) -> Result<PauseOutcome>;
}
