// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The checkpoint engine.
//!
//! SDKs report progress as batches of [`GeneratorOpcode`]s. The engine applies
//! each opcode against the state store, the tracer, the executor and the
//! queue. Every effect is keyed by `(run_id, step_id)` so that redelivered
//! batches leave the same observable state.
//!
//! Two entry points exist:
//!
//! - [`Checkpointer::checkpoint_sync`] for runs whose function is a plain
//!   HTTP endpoint. Steps are persisted only while the run may still resume;
//!   a `RunComplete` finalizes the run; any async opcode switches the run to
//!   async mode through the executor.
//! - [`Checkpointer::checkpoint_async`] for runs already driven by the queue.
//!   Only sync step opcodes are accepted, and a successful batch resets the
//!   attempt counter of the queue item that ran it.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info, instrument, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::api_result::{ApiResult, RunCompleteData};
use crate::error::{CoreError, Result};
use crate::exechttp::RequestExecutor;
use crate::executor::{Executor, FinalizeOpts, GeneratorOutcome};
use crate::function::{Function, FunctionReader};
use crate::metrics::{FinishStatus, MetricCardinality, MetricsProvider, NoopMetrics};
use crate::opcode::{GeneratorOpcode, Opcode};
use crate::queue::{ParallelMode, Queue, QueueItem, QueueKind, QueueRef};
use crate::run_context::{CheckpointRunContext, RunContext};
use crate::run_token::new_run_jwt;
use crate::state::{Id, Metadata, RunService, Tenant};
use crate::trace::{
    CreateSpanOptions, SPAN_NAME_STEP, SpanAttributes, SpanStatus, TracerProvider,
    UpdateSpanOptions, attrs,
};

/// Async checkpoints slower than this are logged.
const SLOW_ASYNC_CHECKPOINT_MS: u128 = 1000;

/// A batch of opcodes from a sync run.
#[derive(Debug, Clone)]
pub struct SyncCheckpoint {
    /// Run id.
    pub run_id: Ulid,
    /// Function id.
    pub fn_id: Uuid,
    /// App id.
    pub app_id: Uuid,
    /// Account id.
    pub account_id: Uuid,
    /// Environment id.
    pub env_id: Uuid,
    /// Opcodes in the order the SDK produced them.
    pub steps: Vec<GeneratorOpcode>,
    /// Metadata, when the caller already has it.
    pub metadata: Option<Metadata>,
    /// Function definition, when the caller already has it.
    pub function: Option<Function>,
}

impl SyncCheckpoint {
    /// Identifier of the run.
    pub fn id(&self) -> Id {
        Id {
            run_id: self.run_id,
            function_id: self.fn_id,
            tenant: Tenant {
                account_id: self.account_id,
                env_id: self.env_id,
                app_id: self.app_id,
            },
        }
    }

    fn cardinality(&self) -> MetricCardinality {
        MetricCardinality {
            account_id: self.account_id,
            env_id: self.env_id,
            app_id: self.app_id,
            fn_id: self.fn_id,
        }
    }
}

/// A batch of opcodes from a queue driven run.
#[derive(Debug, Clone)]
pub struct AsyncCheckpoint {
    /// Run id.
    pub run_id: Ulid,
    /// Function id.
    pub fn_id: Uuid,
    /// App id.
    pub app_id: Uuid,
    /// Account id.
    pub account_id: Uuid,
    /// Environment id.
    pub env_id: Uuid,
    /// Encoded [`QueueRef`] of the queue item executing the run.
    pub queue_item_ref: String,
    /// Opcodes in the order the SDK produced them.
    pub steps: Vec<GeneratorOpcode>,
}

impl AsyncCheckpoint {
    /// Identifier of the run.
    pub fn id(&self) -> Id {
        Id {
            run_id: self.run_id,
            function_id: self.fn_id,
            tenant: Tenant {
                account_id: self.account_id,
                env_id: self.env_id,
                app_id: self.app_id,
            },
        }
    }
}

/// What a sync checkpoint did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCheckpointOutcome {
    /// The batch finished the run.
    pub complete: bool,
    /// The batch switched the run to async mode.
    pub went_async: bool,
    /// Token for the run's output, minted when the run went async.
    pub token: Option<String>,
}

/// Applies opcode batches.
#[derive(Clone)]
pub struct Checkpointer {
    state: Arc<dyn RunService>,
    functions: Arc<dyn FunctionReader>,
    executor: Arc<dyn Executor>,
    tracer: Arc<dyn TracerProvider>,
    queue: Arc<dyn Queue>,
    metrics: Arc<dyn MetricsProvider>,
    http_client: Option<Arc<dyn RequestExecutor>>,
    run_jwt_secret: Option<Arc<Vec<u8>>>,
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer")
            .field("http_client", &self.http_client.is_some())
            .field("run_jwt_secret", &self.run_jwt_secret.is_some())
            .finish_non_exhaustive()
    }
}

impl Checkpointer {
    /// Engine over the given collaborators, reporting no metrics.
    pub fn new(
        state: Arc<dyn RunService>,
        functions: Arc<dyn FunctionReader>,
        executor: Arc<dyn Executor>,
        tracer: Arc<dyn TracerProvider>,
        queue: Arc<dyn Queue>,
    ) -> Self {
        Self {
            state,
            functions,
            executor,
            tracer,
            queue,
            metrics: Arc::new(NoopMetrics),
            http_client: None,
            run_jwt_secret: None,
        }
    }

    /// Report metrics to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Hand `client` to the executor through the run context.
    pub fn with_http_client(mut self, client: Arc<dyn RequestExecutor>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Mint run tokens with `secret` when a run goes async.
    pub fn with_run_jwt_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.run_jwt_secret = Some(Arc::new(secret.into()));
        self
    }

    /// The state store.
    pub fn state(&self) -> &Arc<dyn RunService> {
        &self.state
    }

    /// The metrics sink.
    pub fn metrics(&self) -> &Arc<dyn MetricsProvider> {
        &self.metrics
    }

    /// Apply a batch from a sync run.
    ///
    /// Only a missing run or function aborts the batch. Every other failure is
    /// logged and the remaining opcodes are still applied.
    #[instrument(skip(self, input), fields(run_id = %input.run_id, ops = input.steps.len()))]
    pub async fn checkpoint_sync(&self, input: SyncCheckpoint) -> Result<SyncCheckpointOutcome> {
        let md = match &input.metadata {
            Some(md) => md.clone(),
            None => match self.state.load_metadata(&input.id()).await {
                Ok(md) => md,
                Err(e) if e.is_not_found() => return Err(e),
                Err(e) => {
                    error!(error = %e, "error loading state for sync checkpoint");
                    return Err(e);
                }
            },
        };

        let function = match &input.function {
            Some(f) => f.clone(),
            None => match self.load_function(md.id.function_id).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "error loading function for sync checkpoint");
                    return Err(e);
                }
            },
        };

        let run_ctx = CheckpointRunContext::new(
            md.clone(),
            function.max_attempts(),
            self.http_client.clone(),
        );

        // A finished run never re-enters, so its step outputs are not needed.
        let complete = input.steps.iter().any(|op| op.op == Opcode::RunComplete);
        let mut went_async = false;

        for op in &input.steps {
            match op.op {
                Opcode::StepRun | Opcode::Step => {
                    let output = op.output().unwrap_or_else(|e| {
                        error!(step_id = %op.id, error = %e, "error fetching checkpoint step output");
                        Vec::new()
                    });

                    if !complete {
                        match self.state.save_step(&md.id, &op.id, &output).await {
                            Err(e) if e.is_duplicate() => {
                                warn!(step_id = %op.id, "duplicate checkpoint step");
                                continue;
                            }
                            Err(e) => {
                                error!(step_id = %op.id, error = %e, "error saving checkpointed step state");
                            }
                            Ok(()) => {}
                        }
                    }

                    let span = self.step_span(&md, op, SpanStatus::Completed, run_ctx.attempt_count(), None);
                    if let Err(e) = self.tracer.create_span(SPAN_NAME_STEP, span).await {
                        error!(step_id = %op.id, error = %e, "error saving span for checkpoint op");
                    }

                    let metrics = self.metrics.clone();
                    let cardinality = input.cardinality();
                    tokio::spawn(async move {
                        metrics
                            .on_step_finished(cardinality, FinishStatus::Completed)
                            .await;
                    });
                }

                Opcode::StepError | Opcode::StepFailed => {
                    let span = self.step_span(&md, op, SpanStatus::Errored, run_ctx.attempt_count(), None);
                    if let Err(e) = self.tracer.create_span(SPAN_NAME_STEP, span).await {
                        error!(step_id = %op.id, error = %e, "error saving span for checkpoint step error op");
                    }

                    match self.executor.handle_generator(&run_ctx, op).await {
                        Ok(GeneratorOutcome::RetryStep) => self.enqueue_sync_retry(&run_ctx, op).await,
                        Ok(GeneratorOutcome::Handled) => {}
                        Err(e) => {
                            error!(step_id = %op.id, opcode = %op.op, error = %e, "error handling step error in checkpoint");
                        }
                    }
                }

                Opcode::RunComplete => {
                    let result = match op.data.clone().map(serde_json::from_value::<RunCompleteData>) {
                        Some(Ok(data)) => data.data,
                        Some(Err(e)) => {
                            error!(error = %e, "error unmarshalling api result from sync RunComplete op");
                            ApiResult::default()
                        }
                        None => {
                            error!("sync RunComplete op carries no api result");
                            ApiResult::default()
                        }
                    };

                    let metrics = self.metrics.clone();
                    let cardinality = input.cardinality();
                    tokio::spawn(async move {
                        metrics
                            .on_fn_finished(cardinality, FinishStatus::Completed)
                            .await;
                    });

                    if let Err(e) = self
                        .executor
                        .finalize(FinalizeOpts {
                            metadata: md.clone(),
                            response: result,
                        })
                        .await
                    {
                        error!(error = %e, "error finalizing sync run");
                    }
                }

                _ => {
                    // Async opcodes move the run from sync to async mode.
                    if !went_async {
                        went_async = true;
                        self.mark_mode_changed(&md).await;
                    }

                    if let Err(e) = self.executor.handle_generator(&run_ctx, op).await {
                        error!(step_id = %op.id, opcode = %op.op, error = %e, "error handling generator in checkpoint");
                    }
                }
            }
        }

        let token = match (&self.run_jwt_secret, went_async) {
            (Some(secret), true) => match new_run_jwt(secret, md.id.run_id, md.id.tenant.env_id) {
                Ok(token) => Some(token),
                Err(e) => {
                    error!(error = %e, "error minting run token");
                    None
                }
            },
            _ => None,
        };

        info!(ops = input.steps.len(), complete, "handled sync checkpoint");

        Ok(SyncCheckpointOutcome {
            complete,
            went_async,
            token,
        })
    }

    /// Apply a batch from a queue driven run.
    ///
    /// The whole batch is rejected when it contains an async opcode.
    #[instrument(
        skip(self, input),
        fields(run_id = %input.run_id, account_id = %input.account_id, env_id = %input.env_id)
    )]
    pub async fn checkpoint_async(&self, input: AsyncCheckpoint) -> Result<()> {
        let started = Instant::now();
        let res = self.apply_async(&input).await;
        let elapsed = started.elapsed().as_millis();
        if elapsed > SLOW_ASYNC_CHECKPOINT_MS {
            warn!(duration_ms = elapsed as u64, "slow async checkpoint");
        }
        res
    }

    async fn apply_async(&self, input: &AsyncCheckpoint) -> Result<()> {
        let md = match self.state.load_metadata(&input.id()).await {
            Ok(md) => md,
            Err(e) if e.is_not_found() => return Err(e),
            Err(e) => {
                error!(error = %e, "error loading state for async checkpoint");
                return Err(e);
            }
        };

        if let Some(op) = input.steps.iter().find(|op| op.is_async()) {
            error!(opcode = %op.op, "found async steps in async checkpoint");
            return Err(CoreError::InvalidOpcode {
                opcode: op.op.to_string(),
                message: "async steps cannot be checkpointed from an async run".to_string(),
            });
        }

        for op in &input.steps {
            match op.op {
                Opcode::StepRun | Opcode::Step => {
                    let output = op.output().unwrap_or_else(|e| {
                        error!(step_id = %op.id, error = %e, "error fetching checkpoint step output");
                        Vec::new()
                    });

                    match self.state.save_step(&md.id, &op.id, &output).await {
                        Err(e) if e.is_duplicate() => {
                            warn!(step_id = %op.id, "duplicate checkpoint step");
                            continue;
                        }
                        Err(e) => {
                            error!(step_id = %op.id, error = %e, "error saving checkpointed step state");
                        }
                        Ok(()) => {}
                    }

                    let span = self.step_span(&md, op, SpanStatus::Completed, 0, Some(op.span_seed()));
                    if let Err(e) = self.tracer.create_span(SPAN_NAME_STEP, span).await {
                        error!(step_id = %op.id, error = %e, "error saving span for checkpoint op");
                    }
                }
                _ => {
                    error!(opcode = %op.op, "unimplemented checkpoint op");
                    return Err(CoreError::InvalidOpcode {
                        opcode: op.op.to_string(),
                        message: "unimplemented checkpoint op".to_string(),
                    });
                }
            }
        }

        let qref = QueueRef::decode(&input.queue_item_ref);
        if qref.is_empty() {
            return Ok(());
        }
        if qref.shard_id.is_empty() {
            warn!(job_id = %qref.job_id, "queue item ref without shard, not resetting attempts");
            return Ok(());
        }

        if let Err(e) = self
            .queue
            .reset_attempts_by_job_id(&qref.shard_id, &qref.job_id)
            .await
        {
            error!(job_id = %qref.job_id, shard_id = %qref.shard_id, error = %e, "error resetting queue item attempts");
            return Err(e);
        }

        Ok(())
    }

    async fn load_function(&self, fn_id: Uuid) -> Result<Function> {
        self.functions
            .get_function_by_internal_uuid(fn_id)
            .await?
            .function()
    }

    /// Enqueue the retry of a step error that user code handled.
    async fn enqueue_sync_retry(&self, run_ctx: &CheckpointRunContext, op: &GeneratorOpcode) {
        let md = run_ctx.metadata();
        let job_id = format!("{}-{}-sync-retry", md.idempotency_key(), op.id);
        let item = QueueItem {
            job_id: Some(job_id),
            kind: QueueKind::Edge,
            identifier: md.id,
            workspace_id: md.id.tenant.env_id,
            // The retry is the next attempt.
            attempt: 1,
            max_attempts: Some(run_ctx.max_attempts()),
            priority_factor: run_ctx.priority_factor(),
            custom_concurrency_keys: run_ctx.concurrency_keys().to_vec(),
            parallel_mode: ParallelMode::Wait,
            payload: None,
        };

        if let Err(e) = self.queue.enqueue(item, Utc::now()).await {
            error!(step_id = %op.id, opcode = %op.op, error = %e, "error enqueueing step error in checkpoint");
        }
    }

    /// Record on the run span when the run switched to async mode.
    async fn mark_mode_changed(&self, md: &Metadata) {
        let Some(run_span) = md.config.run_span.clone() else {
            return;
        };
        let res = self
            .tracer
            .update_span(UpdateSpanOptions {
                target: run_span,
                attributes: SpanAttributes::new()
                    .with_time(attrs::DURABLE_ENDPOINT_MODE_CHANGED_AT, Utc::now()),
                end_time: None,
            })
            .await;
        if let Err(e) = res {
            warn!(error = %e, "error updating run span with mode change time");
        }
    }

    fn step_span(
        &self,
        md: &Metadata,
        op: &GeneratorOpcode,
        status: SpanStatus,
        attempt: u32,
        seed: Option<Vec<u8>>,
    ) -> CreateSpanOptions {
        let start_time = op.timing.and_then(|t| t.start_time());
        let end_time = op.timing.and_then(|t| t.end_time());

        let mut attributes = SpanAttributes::new()
            .with(attrs::DYNAMIC_STATUS, status.to_string())
            .with(attrs::IS_CHECKPOINT, true)
            .with(attrs::STEP_ID, op.id.clone())
            .with(attrs::STEP_NAME, op.user_defined_name())
            .with(attrs::STEP_OP, op.op.to_string())
            .with(attrs::STEP_ATTEMPT, attempt)
            .with(attrs::RUN_ID, md.id.run_id.to_string())
            .with("account_id", md.id.tenant.account_id.to_string())
            .with("env_id", md.id.tenant.env_id.to_string())
            .with("app_id", md.id.tenant.app_id.to_string())
            .with("fn_id", md.id.function_id.to_string());
        if let Some(start) = start_time {
            attributes = attributes
                .with_time(attrs::QUEUED_AT, start)
                .with_time(attrs::STARTED_AT, start);
        }
        if let Some(end) = end_time {
            attributes = attributes.with_time(attrs::ENDED_AT, end);
        }
        if status == SpanStatus::Errored
            && let Some(err) = &op.error
        {
            attributes = attributes.with(attrs::STEP_ERROR, format!("{}: {}", err.name, err.message));
        }

        CreateSpanOptions {
            parent: md.config.run_span.clone(),
            seed,
            trace_id: None,
            start_time,
            end_time,
            attributes,
        }
    }
}
