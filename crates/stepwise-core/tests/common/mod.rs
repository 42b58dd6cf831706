// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stepwise-core tests.
//!
//! Provides recording fakes of every interface the checkpoint engine consumes
//! and a [`Harness`] wiring them into a [`Checkpointer`].

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use ulid::Ulid;
use uuid::Uuid;

use stepwise_core::api_result::ApiResult;
use stepwise_core::checkpoint::Checkpointer;
use stepwise_core::error::{CoreError, Result};
use stepwise_core::executor::{
    CancelRequest, Executor, FinalizeOpts, GeneratorOutcome, PauseOutcome, ScheduleRequest,
};
use stepwise_core::function::{
    AppCreator, EventPublisher, Function, FunctionCreator, FunctionDriver, FunctionReader,
    FunctionRecord, FunctionStep, InsertFunction, InternalEvent, UpsertApp,
};
use stepwise_core::metrics::{FinishStatus, MetricCardinality, MetricsProvider};
use stepwise_core::opcode::{GeneratorOpcode, Opcode};
use stepwise_core::queue::{Queue, QueueItem};
use stepwise_core::run_context::RunContext;
use stepwise_core::state::{
    CreateState, Id, Metadata, MutableConfig, RunConfig, RunMetrics, RunMode, RunService,
    RunState, Tenant,
};
use stepwise_core::trace::{
    CreateSpanOptions, SpanReference, TracerProvider, UpdateSpanOptions,
};

// ============================================================================
// State
// ============================================================================

#[derive(Default)]
struct StoredRun {
    metadata: Option<Metadata>,
    events: Vec<Value>,
    steps: BTreeMap<String, Vec<u8>>,
}

/// In-memory [`RunService`] that records every step write.
#[derive(Default)]
pub struct RecordingState {
    runs: Mutex<BTreeMap<Ulid, StoredRun>>,
    /// Every `save_step` call as `(step_id, output)`, including rejected ones.
    pub save_calls: Mutex<Vec<(String, Vec<u8>)>>,
    /// Fail `load_metadata` with a backend error.
    pub fail_loads: AtomicBool,
}

impl RecordingState {
    /// Insert a run directly.
    pub fn insert(&self, md: Metadata) {
        self.runs.lock().unwrap().insert(
            md.id.run_id,
            StoredRun {
                metadata: Some(md),
                ..Default::default()
            },
        );
    }

    /// Stored step outputs of a run.
    pub fn steps(&self, run_id: Ulid) -> BTreeMap<String, Value> {
        self.runs
            .lock()
            .unwrap()
            .get(&run_id)
            .map(|run| {
                run.steps
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::from_slice(v).unwrap()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of `save_step` calls.
    pub fn save_count(&self) -> usize {
        self.save_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RunService for RecordingState {
    async fn create(&self, state: CreateState) -> Result<Metadata> {
        let mut runs = self.runs.lock().unwrap();
        let run_id = state.metadata.id.run_id;
        if runs.contains_key(&run_id) {
            return Err(CoreError::IdentifierExists {
                run_id: run_id.to_string(),
            });
        }
        let steps = state
            .steps
            .iter()
            .map(|s| (s.id.clone(), serde_json::to_vec(&s.data).unwrap()))
            .collect();
        runs.insert(
            run_id,
            StoredRun {
                metadata: Some(state.metadata.clone()),
                events: state.events,
                steps,
            },
        );
        Ok(state.metadata)
    }

    async fn delete(&self, id: &Id) -> Result<bool> {
        Ok(self.runs.lock().unwrap().remove(&id.run_id).is_some())
    }

    async fn load_state(&self, id: &Id) -> Result<RunState> {
        let metadata = self.load_metadata(id).await?;
        let runs = self.runs.lock().unwrap();
        let run = runs.get(&id.run_id).ok_or_else(|| CoreError::RunNotFound {
            run_id: id.run_id.to_string(),
        })?;
        Ok(RunState {
            metadata,
            events: run.events.clone(),
            steps: run
                .steps
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::from_slice(v).unwrap_or(Value::Null)))
                .collect(),
        })
    }

    async fn load_metadata(&self, id: &Id) -> Result<Metadata> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(CoreError::StateError {
                operation: "load_metadata".to_string(),
                details: "backend down".to_string(),
            });
        }
        self.runs
            .lock()
            .unwrap()
            .get(&id.run_id)
            .and_then(|run| run.metadata.clone())
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: id.run_id.to_string(),
            })
    }

    async fn update_metadata(&self, id: &Id, config: MutableConfig) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        let md = runs
            .get_mut(&id.run_id)
            .and_then(|run| run.metadata.as_mut())
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: id.run_id.to_string(),
            })?;
        md.config.started_at = config.started_at;
        md.config.request_version = config.request_version;
        md.config.force_step_plan = config.force_step_plan;
        Ok(())
    }

    async fn save_step(&self, id: &Id, step_id: &str, data: &[u8]) -> Result<()> {
        self.save_calls
            .lock()
            .unwrap()
            .push((step_id.to_string(), data.to_vec()));

        let mut runs = self.runs.lock().unwrap();
        let run = runs.get_mut(&id.run_id).ok_or_else(|| CoreError::RunNotFound {
            run_id: id.run_id.to_string(),
        })?;
        match run.steps.get(step_id) {
            Some(existing) if existing.as_slice() == data => Err(CoreError::IdempotentResponse {
                step_id: step_id.to_string(),
            }),
            Some(_) => Err(CoreError::DuplicateResponse {
                step_id: step_id.to_string(),
            }),
            None => {
                run.steps.insert(step_id.to_string(), data.to_vec());
                if let Some(md) = run.metadata.as_mut() {
                    md.metrics.state_size += data.len() as u64;
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Tracer
// ============================================================================

/// A span handed to [`RecordingTracer::create_span`].
#[derive(Debug, Clone)]
pub struct RecordedSpan {
    pub name: String,
    pub opts: CreateSpanOptions,
    pub reference: SpanReference,
}

impl RecordedSpan {
    /// Attribute `key` as a string.
    pub fn attr(&self, key: &str) -> Option<String> {
        self.opts.attributes.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Tracer that records spans.
#[derive(Default)]
pub struct RecordingTracer {
    pub spans: Mutex<Vec<RecordedSpan>>,
    pub updates: Mutex<Vec<UpdateSpanOptions>>,
    /// Fail every call.
    pub fail: AtomicBool,
}

impl RecordingTracer {
    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.spans.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<UpdateSpanOptions> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl TracerProvider for RecordingTracer {
    async fn create_span(&self, name: &str, opts: CreateSpanOptions) -> Result<SpanReference> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::Internal {
                message: "tracer down".to_string(),
            });
        }
        let reference = SpanReference::child(opts.parent.as_ref(), opts.seed.as_deref());
        self.spans.lock().unwrap().push(RecordedSpan {
            name: name.to_string(),
            opts,
            reference: reference.clone(),
        });
        Ok(reference)
    }

    async fn update_span(&self, opts: UpdateSpanOptions) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::Internal {
                message: "tracer down".to_string(),
            });
        }
        self.updates.lock().unwrap().push(opts);
        Ok(())
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Queue that records enqueues and attempt resets.
#[derive(Default)]
pub struct RecordingQueue {
    pub enqueued: Mutex<Vec<(QueueItem, DateTime<Utc>)>>,
    pub resets: Mutex<Vec<(String, String)>>,
}

impl RecordingQueue {
    pub fn enqueued(&self) -> Vec<QueueItem> {
        self.enqueued
            .lock()
            .unwrap()
            .iter()
            .map(|(item, _)| item.clone())
            .collect()
    }

    /// Resets as `(shard_id, job_id)`.
    pub fn resets(&self) -> Vec<(String, String)> {
        self.resets.lock().unwrap().clone()
    }
}

#[async_trait]
impl Queue for RecordingQueue {
    async fn enqueue(&self, item: QueueItem, at: DateTime<Utc>) -> Result<()> {
        self.enqueued.lock().unwrap().push((item, at));
        Ok(())
    }

    async fn reset_attempts_by_job_id(&self, shard_id: &str, job_id: &str) -> Result<()> {
        self.resets
            .lock()
            .unwrap()
            .push((shard_id.to_string(), job_id.to_string()));
        Ok(())
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Executor that records what it is asked to do.
///
/// `schedule` stores the run in the wrapped state so later checkpoints find
/// it.
pub struct RecordingExecutor {
    state: Arc<RecordingState>,
    pub scheduled: Mutex<Vec<ScheduleRequest>>,
    pub generated: Mutex<Vec<GeneratorOpcode>>,
    pub finalized: Mutex<Vec<FinalizeOpts>>,
    /// Outcome reported for `StepError` opcodes.
    pub step_error_outcome: Mutex<GeneratorOutcome>,
    /// Error returned by the next `schedule` call.
    pub schedule_error: Mutex<Option<CoreError>>,
}

impl RecordingExecutor {
    pub fn new(state: Arc<RecordingState>) -> Self {
        Self {
            state,
            scheduled: Mutex::default(),
            generated: Mutex::default(),
            finalized: Mutex::default(),
            step_error_outcome: Mutex::new(GeneratorOutcome::Handled),
            schedule_error: Mutex::default(),
        }
    }

    pub fn generated(&self) -> Vec<GeneratorOpcode> {
        self.generated.lock().unwrap().clone()
    }

    pub fn finalized(&self) -> Vec<ApiResult> {
        self.finalized
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.response.clone())
            .collect()
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn schedule(&self, req: ScheduleRequest) -> Result<Metadata> {
        if let Some(err) = self.schedule_error.lock().unwrap().take() {
            return Err(err);
        }
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
        config.idempotency_key = req.idempotency_key.clone();
        self.scheduled.lock().unwrap().push(req);

        self.state
            .create(CreateState {
                metadata: Metadata {
                    id,
                    config,
                    metrics: RunMetrics::default(),
                },
                events: Vec::new(),
                steps: Vec::new(),
            })
            .await
    }

    async fn handle_generator(
        &self,
        _ctx: &dyn RunContext,
        op: &GeneratorOpcode,
    ) -> Result<GeneratorOutcome> {
        self.generated.lock().unwrap().push(op.clone());
        match op.op {
            Opcode::StepError => Ok(*self.step_error_outcome.lock().unwrap()),
            _ => Ok(GeneratorOutcome::Handled),
        }
    }

    async fn finalize(&self, opts: FinalizeOpts) -> Result<()> {
        self.finalized.lock().unwrap().push(opts);
        Ok(())
    }

    async fn cancel(&self, _id: &Id, _req: CancelRequest) -> Result<()> {
        Ok(())
    }

    async fn receive_signal(&self, _workspace_id: Uuid, _signal_id: &str, _data: Value) -> Result<()> {
        Ok(())
    }

    async fn handle_pauses(&self, _event: &InternalEvent) -> Result<PauseOutcome> {
        Ok(PauseOutcome::default())
    }
}

// ============================================================================
// Functions, apps and events
// ============================================================================

/// Function store that records writes.
#[derive(Default)]
pub struct RecordingFunctions {
    pub functions: Mutex<BTreeMap<Uuid, FunctionRecord>>,
    pub apps: Mutex<Vec<UpsertApp>>,
    pub inserts: Mutex<Vec<InsertFunction>>,
    pub updates: Mutex<Vec<(Uuid, String)>>,
}

impl RecordingFunctions {
    /// Store `function` for `env_id`/`app_id`.
    pub fn add(&self, env_id: Uuid, app_id: Uuid, function: &Function) {
        self.functions.lock().unwrap().insert(
            function.id,
            FunctionRecord {
                id: function.id,
                env_id,
                app_id,
                name: function.name.clone(),
                slug: function.slug.clone(),
                config: serde_json::to_string(function).unwrap(),
                created_at: Utc::now(),
            },
        );
    }

    pub fn apps(&self) -> Vec<UpsertApp> {
        self.apps.lock().unwrap().clone()
    }

    pub fn inserts(&self) -> Vec<InsertFunction> {
        self.inserts.lock().unwrap().clone()
    }
}

#[async_trait]
impl FunctionReader for RecordingFunctions {
    async fn get_function_by_internal_uuid(&self, fn_id: Uuid) -> Result<FunctionRecord> {
        self.functions
            .lock()
            .unwrap()
            .get(&fn_id)
            .cloned()
            .ok_or_else(|| CoreError::FunctionNotFound {
                function: fn_id.to_string(),
            })
    }

    async fn get_functions_by_app_external_id(
        &self,
        env_id: Uuid,
        _app_id: &str,
    ) -> Result<Vec<FunctionRecord>> {
        Ok(self
            .functions
            .lock()
            .unwrap()
            .values()
            .filter(|f| f.env_id == env_id)
            .cloned()
            .collect())
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
impl AppCreator for RecordingFunctions {
    async fn upsert_app(&self, app: UpsertApp) -> Result<()> {
        self.apps.lock().unwrap().push(app);
        Ok(())
    }
}

#[async_trait]
impl FunctionCreator for RecordingFunctions {
    async fn insert_function(&self, function: InsertFunction) -> Result<()> {
        self.functions.lock().unwrap().insert(
            function.id,
            FunctionRecord {
                id: function.id,
                env_id: function.env_id,
                app_id: function.app_id,
                name: function.name.clone(),
                slug: function.slug.clone(),
                config: function.config.clone(),
                created_at: function.created_at,
            },
        );
        self.inserts.lock().unwrap().push(function);
        Ok(())
    }

    async fn update_function_config(&self, fn_id: Uuid, config: String) -> Result<()> {
        if let Some(record) = self.functions.lock().unwrap().get_mut(&fn_id) {
            record.config = config.clone();
        }
        self.updates.lock().unwrap().push((fn_id, config));
        Ok(())
    }
}

/// Event publisher that records events.
#[derive(Default)]
pub struct RecordingEvents {
    pub published: Mutex<Vec<InternalEvent>>,
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(&self, event: &InternalEvent) -> Result<()> {
        self.published.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Metrics sink that records every call.
#[derive(Default)]
pub struct RecordingMetrics {
    pub steps: Mutex<Vec<(MetricCardinality, FinishStatus)>>,
    pub finished: Mutex<Vec<(MetricCardinality, FinishStatus)>>,
    pub scheduled: Mutex<Vec<MetricCardinality>>,
}

#[async_trait]
impl MetricsProvider for RecordingMetrics {
    async fn on_step_finished(&self, cardinality: MetricCardinality, status: FinishStatus) {
        self.steps.lock().unwrap().push((cardinality, status));
    }

    async fn on_fn_finished(&self, cardinality: MetricCardinality, status: FinishStatus) {
        self.finished.lock().unwrap().push((cardinality, status));
    }

    async fn on_fn_scheduled(&self, cardinality: MetricCardinality) {
        self.scheduled.lock().unwrap().push(cardinality);
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Every fake wired into a [`Checkpointer`].
pub struct Harness {
    pub state: Arc<RecordingState>,
    pub tracer: Arc<RecordingTracer>,
    pub queue: Arc<RecordingQueue>,
    pub executor: Arc<RecordingExecutor>,
    pub functions: Arc<RecordingFunctions>,
    pub metrics: Arc<RecordingMetrics>,
    pub checkpointer: Checkpointer,
    pub account_id: Uuid,
    pub env_id: Uuid,
    pub app_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        let state = Arc::new(RecordingState::default());
        let tracer = Arc::new(RecordingTracer::default());
        let queue = Arc::new(RecordingQueue::default());
        let executor = Arc::new(RecordingExecutor::new(state.clone()));
        let functions = Arc::new(RecordingFunctions::default());
        let metrics = Arc::new(RecordingMetrics::default());

        let checkpointer = Checkpointer::new(
            state.clone(),
            functions.clone(),
            executor.clone(),
            tracer.clone(),
            queue.clone(),
        )
        .with_metrics(metrics.clone());

        Self {
            state,
            tracer,
            queue,
            executor,
            functions,
            metrics,
            checkpointer,
            account_id: Uuid::new_v4(),
            env_id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
        }
    }

    /// Use `secret` to mint run tokens.
    pub fn with_run_jwt_secret(mut self, secret: &str) -> Self {
        self.checkpointer = self.checkpointer.with_run_jwt_secret(secret);
        self
    }

    /// Store a function with `retries` on its step and a run of it.
    pub fn seed_run(&self, retries: Option<u32>) -> Metadata {
        let fn_id = Uuid::new_v4();
        self.functions
            .add(self.env_id, self.app_id, &function(fn_id, retries));

        let md = Metadata {
            id: Id {
                run_id: Ulid::new(),
                function_id: fn_id,
                tenant: Tenant {
                    account_id: self.account_id,
                    env_id: self.env_id,
                    app_id: self.app_id,
                },
            },
            config: RunConfig::new(RunMode::Sync),
            metrics: RunMetrics::default(),
        };
        self.state.insert(md.clone());
        md
    }
}

/// A single step function.
pub fn function(fn_id: Uuid, retries: Option<u32>) -> Function {
    Function {
        id: fn_id,
        name: "test fn".to_string(),
        slug: "test-fn".to_string(),
        config_version: 1,
        function_version: 1,
        driver: FunctionDriver {
            uri: "https://x.y/p".to_string(),
            metadata: Default::default(),
        },
        steps: vec![FunctionStep {
            id: "step".to_string(),
            name: "step".to_string(),
            uri: "https://x.y/p".to_string(),
            retries,
        }],
    }
}

/// Wait until `f` holds, for at most one second.
pub async fn eventually(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}
