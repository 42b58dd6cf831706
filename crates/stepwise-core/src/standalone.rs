// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborators used by the standalone server.
//!
//! The queue, executor and function registry of a full deployment live in
//! other services. The server binary wires these in-process versions instead:
//! the queue and event publisher only log, the executor creates run state and
//! keeps the output of finished runs in memory, and functions are held in a
//! map.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::api::RunOutputReader;
use crate::error::{CoreError, Result};
use crate::executor::{
    CancelRequest, Executor, FinalizeOpts, GeneratorOutcome, PauseOutcome, ScheduleRequest,
};
use crate::function::{
    AppCreator, EventPublisher, FunctionCreator, FunctionReader, FunctionRecord, InsertFunction,
    InternalEvent, UpsertApp,
};
use crate::opcode::{GeneratorOpcode, Opcode};
use crate::queue::{Queue, QueueItem};
use crate::run_context::RunContext;
use crate::state::{CreateState, Id, Metadata, RunConfig, RunMetrics, RunService, Tenant};
use crate::trace::{CreateSpanOptions, SPAN_NAME_RUN, SpanAttributes, TracerProvider, attrs};

/// Queue that logs what it is given.
#[derive(Debug, Clone, Default)]
pub struct LoggingQueue;

#[async_trait]
impl Queue for LoggingQueue {
    async fn enqueue(&self, item: QueueItem, at: DateTime<Utc>) -> Result<()> {
        info!(
            job_id = item.job_id.as_deref().unwrap_or(""),
            kind = ?item.kind,
            run_id = %item.identifier.run_id,
            attempt = item.attempt,
            at = %at,
            "enqueued item"
        );
        Ok(())
    }

    async fn reset_attempts_by_job_id(&self, shard_id: &str, job_id: &str) -> Result<()> {
        debug!(shard_id, job_id, "reset queue item attempts");
        Ok(())
    }
}

/// Event publisher that logs what it is given.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher;

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: &InternalEvent) -> Result<()> {
        info!(
            internal_id = %event.id,
            event_name = %event.event.name,
            env_id = %event.workspace_id,
            "published event"
        );
        Ok(())
    }
}

struct FinishedRun {
    env_id: Uuid,
    output: Bytes,
}

/// Executor that creates run state and remembers run outputs.
///
/// Async opcodes are acknowledged without being acted on; there is no queue
/// to continue the run on.
pub struct StandaloneExecutor {
    state: Arc<dyn RunService>,
    tracer: Arc<dyn TracerProvider>,
    finished: DashMap<Ulid, FinishedRun>,
}

impl std::fmt::Debug for StandaloneExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandaloneExecutor")
            .field("finished", &self.finished.len())
            .finish_non_exhaustive()
    }
}

impl StandaloneExecutor {
    /// Executor storing runs in `state`.
    pub fn new(state: Arc<dyn RunService>, tracer: Arc<dyn TracerProvider>) -> Self {
        Self {
            state,
            tracer,
            finished: DashMap::new(),
        }
    }

    async fn run_span(&self, id: &Id) -> Option<crate::trace::SpanReference> {
        let opts = CreateSpanOptions {
            start_time: Some(Utc::now()),
            attributes: SpanAttributes::new()
                .with(attrs::RUN_ID, id.run_id.to_string())
                .with("fn_id", id.function_id.to_string())
                .with("env_id", id.tenant.env_id.to_string()),
            ..Default::default()
        };
        match self.tracer.create_span(SPAN_NAME_RUN, opts).await {
            Ok(span) => Some(span),
            Err(e) => {
                warn!(run_id = %id.run_id, error = %e, "error creating run span");
                None
            }
        }
    }
}

#[async_trait]
impl Executor for StandaloneExecutor {
    async fn schedule(&self, req: ScheduleRequest) -> Result<Metadata> {
        let id = Id {
            run_id: req.run_id.unwrap_or_else(Ulid::new),
            function_id: req.function.id,
            tenant: Tenant {
                account_id: req.account_id,
                env_id: req.env_id,
                app_id: req.app_id,
            },
        };

        let mut config = RunConfig::new(req.run_mode);
        config.idempotency_key = req.idempotency_key;
        config.event_ids = req.events.iter().map(|e| e.id).collect();
        config.run_span = self.run_span(&id).await;

        let events = req
            .events
            .iter()
            .map(|e| serde_json::to_value(&e.event))
            .collect::<std::result::Result<Vec<Value>, _>>()?;

        let md = self
            .state
            .create(CreateState {
                metadata: Metadata {
                    id,
                    config,
                    metrics: RunMetrics::default(),
                },
                events,
                steps: Vec::new(),
            })
            .await?;

        info!(run_id = %md.id.run_id, fn_id = %md.id.function_id, url = req.url.as_deref().unwrap_or(""), "created run");
        Ok(md)
    }

    async fn handle_generator(
        &self,
        ctx: &dyn RunContext,
        op: &GeneratorOpcode,
    ) -> Result<GeneratorOutcome> {
        let run_id = ctx.metadata().id.run_id;
        match op.op {
            Opcode::StepError if ctx.should_retry() => {
                info!(%run_id, step_id = %op.id, attempt = ctx.attempt_count(), "retrying step");
                Ok(GeneratorOutcome::RetryStep)
            }
            Opcode::StepError | Opcode::StepFailed => {
                warn!(%run_id, step_id = %op.id, "step failed permanently");
                Ok(GeneratorOutcome::Handled)
            }
            _ => {
                info!(%run_id, step_id = %op.id, opcode = %op.op, "acknowledged opcode");
                Ok(GeneratorOutcome::Handled)
            }
        }
    }

    async fn finalize(&self, opts: FinalizeOpts) -> Result<()> {
        let id = opts.metadata.id;
        let output = Bytes::from(opts.response.body.unwrap_or_default());
        info!(
            run_id = %id.run_id,
            status_code = opts.response.status_code,
            output_bytes = output.len(),
            "finalized run"
        );
        self.finished.insert(
            id.run_id,
            FinishedRun {
                env_id: id.tenant.env_id,
                output,
            },
        );
        Ok(())
    }

    async fn cancel(&self, id: &Id, req: CancelRequest) -> Result<()> {
        info!(run_id = %id.run_id, expression = req.expression.as_deref().unwrap_or(""), "cancelled run");
        self.state.delete(id).await?;
        Ok(())
    }

    async fn receive_signal(&self, workspace_id: Uuid, signal_id: &str, _data: Value) -> Result<()> {
        debug!(env_id = %workspace_id, signal_id, "ignored signal");
        Ok(())
    }

    async fn handle_pauses(&self, event: &InternalEvent) -> Result<PauseOutcome> {
        debug!(internal_id = %event.id, "no pauses to resume");
        Ok(PauseOutcome::default())
    }
}

#[async_trait]
impl RunOutputReader for StandaloneExecutor {
    async fn run_output(&self, env_id: Uuid, run_id: Ulid) -> Result<Option<Bytes>> {
        Ok(self
            .finished
            .get(&run_id)
            .filter(|run| run.env_id == env_id)
            .map(|run| run.output.clone()))
    }
}

/// In-memory store of apps and functions.
#[derive(Debug, Default)]
pub struct MemoryFunctionStore {
    apps: DashMap<Uuid, UpsertApp>,
    functions: DashMap<Uuid, FunctionRecord>,
}

impl MemoryFunctionStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// App by id.
    pub fn app(&self, app_id: Uuid) -> Option<UpsertApp> {
        self.apps.get(&app_id).map(|a| a.clone())
    }

    /// Number of stored functions.
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    fn app_url(&self, app_id: Uuid) -> Option<String> {
        self.apps.get(&app_id).map(|a| a.url.clone())
    }
}

#[async_trait]
impl FunctionReader for MemoryFunctionStore {
    async fn get_function_by_internal_uuid(&self, fn_id: Uuid) -> Result<FunctionRecord> {
        self.functions
            .get(&fn_id)
            .map(|f| f.clone())
            .ok_or_else(|| CoreError::FunctionNotFound {
                function: fn_id.to_string(),
            })
    }

    async fn get_functions_by_app_external_id(
        &self,
        env_id: Uuid,
        app_id: &str,
    ) -> Result<Vec<FunctionRecord>> {
        let mut out: Vec<FunctionRecord> = self
            .functions
            .iter()
            .filter(|f| f.env_id == env_id && self.app_url(f.app_id).as_deref() == Some(app_id))
            .map(|f| f.clone())
            .collect();
        out.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(out)
    }

    async fn get_function_by_external_id(
        &self,
        env_id: Uuid,
        app_id: &str,
        fn_slug: &str,
    ) -> Result<FunctionRecord> {
        self.get_functions_by_app_external_id(env_id, app_id)
            .await?
            .into_iter()
            .find(|f| f.slug == fn_slug)
            .ok_or_else(|| CoreError::FunctionNotFound {
                function: fn_slug.to_string(),
            })
    }
}

#[async_trait]
impl AppCreator for MemoryFunctionStore {
    async fn upsert_app(&self, app: UpsertApp) -> Result<()> {
        self.apps.insert(app.id, app);
        Ok(())
    }
}

#[async_trait]
impl FunctionCreator for MemoryFunctionStore {
    async fn insert_function(&self, function: InsertFunction) -> Result<()> {
        self.functions.insert(
            function.id,
            FunctionRecord {
                id: function.id,
                env_id: function.env_id,
                app_id: function.app_id,
                name: function.name,
                slug: function.slug,
                config: function.config,
                created_at: function.created_at,
            },
        );
        Ok(())
    }

    async fn update_function_config(&self, fn_id: Uuid, config: String) -> Result<()> {
        let mut record =
            self.functions
                .get_mut(&fn_id)
                .ok_or_else(|| CoreError::FunctionNotFound {
                    function: fn_id.to_string(),
                })?;
        record.config = config;
        Ok(())
    }
}
