// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route handlers of the checkpoint API.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use stepwise_realtime::AuthContext;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};
use ulid::Ulid;
use uuid::Uuid;

use super::error::ApiError;
use super::upsert::{self, HttpRequestData, SyncFunction};
use super::CheckpointApiState;
use crate::api_result::ApiResult;
use crate::checkpoint::{AsyncCheckpoint, SyncCheckpoint};
use crate::error::CoreError;
use crate::executor::ScheduleRequest;
use crate::function::{Event, InternalEvent};
use crate::invoke::COMPLETE_STEP_ID;
use crate::metrics::MetricCardinality;
use crate::opcode::{GeneratorOpcode, Opcode};
use crate::run_token::verify_run_jwt;
use crate::state::RunMode;

type ApiResponse<T> = std::result::Result<T, ApiError>;

/// Body of `POST /`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRunRequest {
    /// Run id chosen by the SDK.
    #[serde(default)]
    pub run_id: Option<Ulid>,
    /// Idempotency key.
    #[serde(default)]
    pub idempotency: Option<String>,
    /// The `api/request` event.
    pub event: Event,
    /// Opcodes the SDK already produced.
    #[serde(default)]
    pub steps: Vec<GeneratorOpcode>,
}

/// Response of `POST /`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRunResponse {
    /// Run id.
    pub run_id: Ulid,
    /// Function id.
    pub fn_id: Uuid,
    /// App id.
    pub app_id: Uuid,
    /// Run token, when the initial steps switched the run to async mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Body of `POST /{run_id}/steps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepsCheckpointRequest {
    /// Run id, matching the path.
    #[serde(default)]
    pub run_id: Option<Ulid>,
    /// Function id.
    pub fn_id: Uuid,
    /// App id.
    pub app_id: Uuid,
    /// Opcodes.
    #[serde(default)]
    pub steps: Vec<GeneratorOpcode>,
}

/// Response of `POST /{run_id}/steps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointResponse {
    /// The run finished.
    pub complete: bool,
    /// The run switched to async mode.
    #[serde(rename = "async")]
    pub went_async: bool,
    /// Run token, when the run went async.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Body of `POST /{run_id}/async`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncCheckpointRequest {
    /// Run id, matching the path.
    #[serde(default)]
    pub run_id: Option<Ulid>,
    /// Function id.
    pub fn_id: Uuid,
    /// App id.
    pub app_id: Uuid,
    /// Encoded reference of the queue item executing the run.
    #[serde(default)]
    pub queue_item_ref: String,
    /// Opcodes.
    #[serde(default)]
    pub steps: Vec<GeneratorOpcode>,
}

/// Body of `POST /{run_id}/response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCheckpointRequest {
    /// Function id.
    pub fn_id: Uuid,
    /// App id.
    pub app_id: Uuid,
    /// The endpoint's response.
    pub data: ApiResult,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct OutputQuery {
    token: Option<String>,
}

async fn authenticate(state: &CheckpointApiState, headers: &HeaderMap) -> ApiResponse<AuthContext> {
    state
        .auth
        .find(headers)
        .await
        .map_err(|_| ApiError::Unauthorized)
}

async fn decode_body<T: DeserializeOwned>(body: Body, limit: usize) -> ApiResponse<T> {
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| ApiError::BadRequest(format!("error reading request body: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {}", e)))
}

fn parse_run_id(raw: &str) -> ApiResponse<Ulid> {
    Ulid::from_string(raw).map_err(|_| ApiError::BadRequest(format!("invalid run id: {}", raw)))
}

// ============================================================================
// New runs
// ============================================================================

#[instrument(skip_all)]
pub(super) async fn new_run(
    State(state): State<CheckpointApiState>,
    headers: HeaderMap,
    body: Body,
) -> ApiResponse<Json<NewRunResponse>> {
    let auth = authenticate(&state, &headers).await?;
    let req: NewRunRequest = decode_body(body, state.max_body_bytes).await?;
    let data: HttpRequestData = serde_json::from_value(req.event.data.clone())
        .map_err(|e| ApiError::BadRequest(format!("invalid api request event: {}", e)))?;

    let event = InternalEvent::new(auth.account_id, auth.env_id, req.event.clone());
    {
        let publisher = state.events.clone();
        let event = event.clone();
        tokio::spawn(async move {
            if let Err(e) = publisher.publish(&event).await {
                error!(event_id = %event.id, error = %e, "error publishing api request event");
            }
        });
    }

    let app_id = upsert::app_id(auth.env_id, &data.domain);
    let fn_id = upsert::fn_id(app_id, &data.slug());
    let function = upsert::sync_function(fn_id, &data);

    {
        let state = state.clone();
        let sync = SyncFunction {
            account_id: auth.account_id,
            env_id: auth.env_id,
            app_id,
            domain: data.domain.clone(),
            function: function.clone(),
        };
        tokio::spawn(async move {
            let res = upsert::upsert_sync_data(
                &state.upserts,
                state.apps.as_ref(),
                state.functions.as_ref(),
                state.function_writer.as_ref(),
                sync,
            )
            .await;
            if let Err(e) = res {
                error!(fn_id = %fn_id, error = %e, "error upserting sync function");
            }
        });
    }

    let scheduled = state
        .executor
        .schedule(ScheduleRequest {
            run_id: req.run_id,
            function: function.clone(),
            account_id: auth.account_id,
            env_id: auth.env_id,
            app_id,
            run_mode: RunMode::Sync,
            events: vec![event],
            url: Some(data.url()),
            idempotency_key: req.idempotency.clone(),
        })
        .await;

    let md = match scheduled {
        Ok(md) => md,
        Err(CoreError::IdentifierExists { run_id }) => {
            warn!(run_id = %run_id, "run already exists");
            return Err(ApiError::Conflict("Run already exists".to_string()));
        }
        Err(e @ CoreError::RateLimited { .. }) => return Err(e.into()),
        Err(e) => {
            error!(error = %e, "error scheduling sync run");
            return Err(ApiError::Internal("Failed to schedule run".to_string()));
        }
    };

    {
        let metrics = state.checkpointer.metrics().clone();
        let cardinality = MetricCardinality {
            account_id: auth.account_id,
            env_id: auth.env_id,
            app_id,
            fn_id,
        };
        tokio::spawn(async move { metrics.on_fn_scheduled(cardinality).await });
    }

    let mut token = None;
    if !req.steps.is_empty() {
        let outcome = state
            .checkpointer
            .checkpoint_sync(SyncCheckpoint {
                run_id: md.id.run_id,
                fn_id,
                app_id,
                account_id: auth.account_id,
                env_id: auth.env_id,
                steps: req.steps,
                metadata: Some(md.clone()),
                function: Some(function),
            })
            .await?;
        token = outcome.token;
    }

    info!(run_id = %md.id.run_id, fn_id = %fn_id, "scheduled sync run");

    Ok(Json(NewRunResponse {
        run_id: md.id.run_id,
        fn_id,
        app_id,
        token,
    }))
}

// ============================================================================
// Checkpoints
// ============================================================================

#[instrument(skip_all, fields(run_id = %run_id))]
pub(super) async fn checkpoint_steps(
    State(state): State<CheckpointApiState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> ApiResponse<Json<CheckpointResponse>> {
    let auth = authenticate(&state, &headers).await?;
    let run_id = parse_run_id(&run_id)?;
    let req: StepsCheckpointRequest = decode_body(body, state.max_body_bytes).await?;

    let outcome = state
        .checkpointer
        .checkpoint_sync(SyncCheckpoint {
            run_id,
            fn_id: req.fn_id,
            app_id: req.app_id,
            account_id: auth.account_id,
            env_id: auth.env_id,
            steps: req.steps,
            metadata: None,
            function: None,
        })
        .await?;

    Ok(Json(CheckpointResponse {
        complete: outcome.complete,
        went_async: outcome.went_async,
        token: outcome.token,
    }))
}

#[instrument(skip_all, fields(run_id = %run_id))]
pub(super) async fn checkpoint_async(
    State(state): State<CheckpointApiState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> ApiResponse<StatusCode> {
    let auth = authenticate(&state, &headers).await?;
    let run_id = parse_run_id(&run_id)?;
    let req: AsyncCheckpointRequest = decode_body(body, state.max_body_bytes).await?;

    state
        .checkpointer
        .checkpoint_async(AsyncCheckpoint {
            run_id,
            fn_id: req.fn_id,
            app_id: req.app_id,
            account_id: auth.account_id,
            env_id: auth.env_id,
            queue_item_ref: req.queue_item_ref,
            steps: req.steps,
        })
        .await?;

    Ok(StatusCode::OK)
}

#[instrument(skip_all, fields(run_id = %run_id))]
pub(super) async fn checkpoint_response(
    State(state): State<CheckpointApiState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> ApiResponse<StatusCode> {
    let auth = authenticate(&state, &headers).await?;
    let run_id = parse_run_id(&run_id)?;
    let req: ResponseCheckpointRequest = decode_body(body, state.max_body_bytes).await?;

    let op = GeneratorOpcode::new(Opcode::RunComplete, COMPLETE_STEP_ID)
        .with_data(json!({ "data": req.data }));

    state
        .checkpointer
        .checkpoint_sync(SyncCheckpoint {
            run_id,
            fn_id: req.fn_id,
            app_id: req.app_id,
            account_id: auth.account_id,
            env_id: auth.env_id,
            steps: vec![op],
            metadata: None,
            function: None,
        })
        .await?;

    Ok(StatusCode::OK)
}

// ============================================================================
// Output
// ============================================================================

#[instrument(skip_all, fields(run_id = %run_id))]
pub(super) async fn run_output(
    State(state): State<CheckpointApiState>,
    Path(run_id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> ApiResponse<Response> {
    let run_id = parse_run_id(&run_id)?;
    let token = query.token.as_deref().ok_or(ApiError::Unauthorized)?;
    let claims = verify_run_jwt(&state.run_jwt_secret, token)?;
    if claims.run_id()? != run_id {
        return Err(ApiError::Unauthorized);
    }

    let Some(reader) = state.output.clone() else {
        return Ok(Json(json!({
            "status": "unknown",
            "message": "unable to fetch run output",
        }))
        .into_response());
    };

    let deadline = Instant::now() + state.output_wait_timeout;
    loop {
        if let Some(output) = reader.run_output(claims.env, run_id).await? {
            return Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                output,
            )
                .into_response());
        }

        if Instant::now() + state.output_poll_interval > deadline {
            break;
        }
        tokio::time::sleep(state.output_poll_interval).await;
    }

    Ok(Json(json!({
        "status": "running",
        "message": "run did not end within 5 minutes",
    }))
    .into_response())
}
