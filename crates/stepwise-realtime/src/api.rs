// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Realtime HTTP and WebSocket API.
//!
//! | Method | Path | Auth |
//! |--------|------|------|
//! | POST | `/realtime/token` | credentials only |
//! | GET | `/realtime/connect` | realtime token or credentials |
//! | GET | `/realtime/sse` | realtime token or credentials |
//! | POST | `/realtime/publish` | publish token or credentials |
//! | POST | `/realtime/publish/tee` | publish token |
//!
//! Realtime tokens are read from `Authorization: Bearer` or the `token` query
//! parameter. A token that fails verification is treated like no token at
//! all.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::{info, instrument, warn};
use ulid::Ulid;
use xxhash_rust::xxh64::xxh64;

use crate::auth::{AuthFinder, RealtimeAuth, bearer_token};
use crate::broadcaster::Broadcaster;
use crate::error::{RealtimeError, Result};
use crate::jwt;
use crate::message::{Message, MessageKind, chunk_from_message};
use crate::sse::{SSE_CONNECTION_TIMEOUT, SseSubscription, sse_response};
use crate::topic::Topic;
use crate::ws::serve_websocket;

/// Largest body accepted by `/realtime/publish`.
pub const MAX_PUBLISH_BODY_BYTES: usize = 512 * 1024;

/// Size of each chunk of a streamed publish.
pub const STREAMING_CHUNK_SIZE: usize = 1024;

/// Most chunks a single streamed publish may produce.
pub const MAX_STREAMING_CHUNKS: usize = 10_000;

const CONTENT_TYPE_STREAM: &str = "text/stream";

/// Shared state of the realtime routes.
#[derive(Clone)]
pub struct RealtimeState {
    /// Broadcaster subscriptions register with.
    pub broadcaster: Arc<dyn Broadcaster>,
    /// Fallback credential verification.
    pub auth: Arc<dyn AuthFinder>,
    /// HS256 secret of realtime tokens.
    pub jwt_secret: Arc<Vec<u8>>,
}

impl RealtimeState {
    /// Bundle the collaborators of the realtime API.
    pub fn new(
        broadcaster: Arc<dyn Broadcaster>,
        auth: Arc<dyn AuthFinder>,
        jwt_secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            broadcaster,
            auth,
            jwt_secret: Arc::new(jwt_secret.into()),
        }
    }
}

/// Build the realtime router.
pub fn router(state: RealtimeState) -> Router {
    Router::new()
        .route("/realtime/token", post(create_token))
        .route("/realtime/connect", get(connect_websocket))
        .route("/realtime/sse", get(connect_sse))
        .route("/realtime/publish", post(publish))
        .route("/realtime/publish/tee", post(publish_tee))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PublishQuery {
    channel: Option<String>,
    topic: Option<String>,
    run_id: Option<String>,
    metadata: Option<String>,
}

async fn realtime_auth(
    state: &RealtimeState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<RealtimeAuth> {
    if let Some(token) = bearer_token(headers).or(query_token)
        && let Ok(claims) = jwt::validate(&state.jwt_secret, token)
    {
        return RealtimeAuth::from_claims(claims);
    }

    state
        .auth
        .find(headers)
        .await
        .map(RealtimeAuth::from_context)
        .map_err(|_| RealtimeError::Unauthorized)
}

// ============================================================================
// Tokens
// ============================================================================

#[instrument(skip_all)]
async fn create_token(
    State(state): State<RealtimeState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    // Only regular credentials may mint tokens.
    let auth = state
        .auth
        .find(&headers)
        .await
        .map_err(|_| RealtimeError::Unauthorized)?;

    let mut topics: Vec<Topic> = serde_json::from_slice(&body).map_err(|_| {
        RealtimeError::InvalidBody("must provide a list of topics".to_string())
    })?;
    for topic in &mut topics {
        topic.env_id = auth.env_id;
    }

    let token = jwt::new_jwt(&state.jwt_secret, auth.account_id, auth.env_id, topics)?;
    Ok((
        StatusCode::CREATED,
        axum::Json(serde_json::json!({ "jwt": token })),
    )
        .into_response())
}

// ============================================================================
// Subscriptions
// ============================================================================

async fn connect_websocket(
    State(state): State<RealtimeState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let auth = match realtime_auth(&state, &headers, query.token.as_deref()).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let broadcaster = state.broadcaster.clone();
    let secret = state.jwt_secret.clone();
    upgrade.on_upgrade(move |socket| serve_websocket(socket, broadcaster, auth, secret))
}

async fn connect_sse(
    State(state): State<RealtimeState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    let auth = match realtime_auth(&state, &headers, query.token.as_deref()).await {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };

    let (sub, body) = SseSubscription::new();
    let sub = Arc::new(sub);
    let sub_id = crate::subscription::Subscription::id(sub.as_ref());

    if let Err(e) = state.broadcaster.subscribe(sub.clone(), auth.topics.clone()).await {
        warn!(subscription_id = %sub_id, error = %e, "error subscribing to topics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "error subscribing to topics").into_response();
    }

    info!(
        subscription_id = %sub_id,
        account_id = %auth.account_id,
        env_id = %auth.env_id,
        topics = auth.topics.len(),
        "new SSE connection"
    );

    let broadcaster = state.broadcaster.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sub.finished() => {}
            _ = tokio::time::sleep(SSE_CONNECTION_TIMEOUT) => {
                info!(subscription_id = %sub_id, "SSE connection timeout");
            }
        }
        if let Err(e) = broadcaster.close_subscription(sub_id).await {
            warn!(subscription_id = %sub_id, error = %e, "error closing SSE subscription");
        }
    });

    sse_response(body)
}

// ============================================================================
// Publishing
// ============================================================================

fn publish_message(auth: &RealtimeAuth, query: &PublishQuery) -> Message {
    let mut msg = Message::new(MessageKind::Data, Bytes::new())
        .with_env(auth.env_id)
        .with_channel(query.channel.clone().unwrap_or_default())
        .with_topic(query.topic.clone().unwrap_or_default());
    msg.run_id = query.run_id.as_deref().and_then(|id| Ulid::from_string(id).ok());
    msg.metadata = query.metadata.as_ref().map(|raw| {
        serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.clone()))
    });
    msg
}

/// A fresh stream id: hex, never containing `:`.
pub fn new_stream_id() -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut seed = nanos.to_le_bytes().to_vec();
    seed.extend_from_slice(&rand::random::<u64>().to_le_bytes());
    format!("{:x}", xxh64(&seed, 0))
}

#[instrument(skip_all)]
async fn publish(
    State(state): State<RealtimeState>,
    Query(query): Query<PublishQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode> {
    let auth = realtime_auth(&state, &headers, None).await?;
    if !auth.publish {
        return Err(RealtimeError::Unauthorized);
    }

    let streaming = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct == CONTENT_TYPE_STREAM);
    if streaming {
        publish_stream(&state, &auth, &query, body).await?;
        return Ok(StatusCode::OK);
    }

    let bytes = axum::body::to_bytes(body, MAX_PUBLISH_BODY_BYTES)
        .await
        .map_err(|e| RealtimeError::InvalidBody(e.to_string()))?;

    let mut msg = publish_message(&auth, &query);
    msg.data = if serde_json::from_slice::<&RawValue>(&bytes).is_ok() {
        bytes
    } else {
        // Not JSON; publish it as a JSON string.
        Bytes::from(serde_json::to_vec(&String::from_utf8_lossy(&bytes))?)
    };
    msg.validate()?;

    state.broadcaster.publish(msg).await;
    Ok(StatusCode::OK)
}

async fn publish_stream(
    state: &RealtimeState,
    auth: &RealtimeAuth,
    query: &PublishQuery,
    body: Body,
) -> Result<()> {
    let mut start = publish_message(auth, query);
    start.kind = MessageKind::DataStreamStart;
    start.data = Bytes::from(new_stream_id());
    start.validate()?;

    state.broadcaster.publish(start.clone()).await;

    let mut stream = body.into_data_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut chunks = 0;
    let mut total = 0;
    let mut outcome = Ok(());

    'read: loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(error = %e, "error reading streaming publish");
                outcome = Err(RealtimeError::InvalidBody(e.to_string()));
                break;
            }
            None => break,
        };
        total += frame.len();
        buf.extend_from_slice(&frame);

        while let Some(piece) = take_chunk(&mut buf, STREAMING_CHUNK_SIZE, false) {
            if chunks == MAX_STREAMING_CHUNKS {
                break 'read;
            }
            state
                .broadcaster
                .publish_chunk(&start, chunk_from_message(&start, piece))
                .await;
            chunks += 1;
        }
    }

    if outcome.is_ok() {
        while chunks < MAX_STREAMING_CHUNKS
            && let Some(piece) = take_chunk(&mut buf, STREAMING_CHUNK_SIZE, true)
        {
            state
                .broadcaster
                .publish_chunk(&start, chunk_from_message(&start, piece))
                .await;
            chunks += 1;
        }
    }

    // Streams are always terminated.
    let mut end = start;
    end.kind = MessageKind::DataStreamEnd;
    state.broadcaster.publish(end).await;

    info!(chunks, bytes = total, "published stream");
    outcome
}

/// Split up to `max` bytes off the front of `buf`, keeping multi-byte
/// characters whole. Without `flush`, only full chunks are taken.
fn take_chunk(buf: &mut Vec<u8>, max: usize, flush: bool) -> Option<String> {
    if buf.is_empty() || (!flush && buf.len() < max) {
        return None;
    }
    let mut end = buf.len().min(max);
    if let Err(e) = std::str::from_utf8(&buf[..end])
        && e.error_len().is_none()
        && e.valid_up_to() > 0
    {
        end = e.valid_up_to();
    }
    let piece: Vec<u8> = buf.drain(..end).collect();
    Some(String::from_utf8_lossy(&piece).into_owned())
}

#[derive(Debug, Default, Deserialize)]
struct TeeQuery {
    channel: Option<String>,
}

#[instrument(skip_all)]
async fn publish_tee(
    State(state): State<RealtimeState>,
    Query(query): Query<TeeQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode> {
    let auth = match bearer_token(&headers).map(|t| jwt::validate(&state.jwt_secret, t)) {
        Some(Ok(claims)) if claims.publish => RealtimeAuth::from_claims(claims)?,
        _ => return Err(RealtimeError::Unauthorized),
    };

    let channel = query
        .channel
        .filter(|c| !c.is_empty())
        .ok_or_else(|| RealtimeError::Validation("channel query parameter required".to_string()))?;

    let mut stream = body.into_data_stream();
    let mut total = 0;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(frame) => {
                total += frame.len();
                state.broadcaster.write(auth.env_id, &channel, &frame).await;
            }
            Err(e) => {
                warn!(error = %e, "error copying request body to subscribers");
                return Err(RealtimeError::Internal("error forwarding data".to_string()));
            }
        }
    }

    info!(bytes = total, "forwarded raw publish");
    Ok(StatusCode::OK)
}
