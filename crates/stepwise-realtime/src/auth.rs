// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request authentication shared by the HTTP surfaces.
//!
//! Credential verification itself (API keys, signing keys, sessions) lives
//! outside this crate; it is reached through [`AuthFinder`].

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use uuid::Uuid;

use crate::error::{RealtimeError, Result};
use crate::jwt::JwtClaims;
use crate::topic::Topic;

/// Tenant resolved from request credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext {
    /// Account the caller belongs to.
    pub account_id: Uuid,
    /// Environment the caller acts in.
    pub env_id: Uuid,
}

/// Caller of a realtime endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeAuth {
    /// Account of the caller.
    pub account_id: Uuid,
    /// Environment of the caller.
    pub env_id: Uuid,
    /// Topics the caller may subscribe to.
    pub topics: Vec<Topic>,
    /// Whether the caller may publish.
    pub publish: bool,
    /// Whether the caller authenticated with a realtime token.
    pub via_token: bool,
}

impl RealtimeAuth {
    /// Caller authenticated by a realtime token.
    pub fn from_claims(claims: JwtClaims) -> Result<Self> {
        let env_id = claims.env;
        Ok(Self {
            account_id: claims.account_id()?,
            env_id,
            // Tokens never grant topics outside their own environment.
            topics: claims
                .topics
                .into_iter()
                .map(|mut t| {
                    t.env_id = env_id;
                    t
                })
                .collect(),
            publish: claims.publish,
            via_token: true,
        })
    }

    /// Caller authenticated by regular credentials. These may publish but
    /// carry no topics.
    pub fn from_context(ctx: AuthContext) -> Self {
        Self {
            account_id: ctx.account_id,
            env_id: ctx.env_id,
            topics: Vec::new(),
            publish: true,
            via_token: false,
        }
    }
}

/// Resolves the caller of a request.
#[async_trait]
pub trait AuthFinder: Send + Sync {
    /// Authenticate the request from its headers.
    async fn find(&self, headers: &HeaderMap) -> Result<AuthContext>;
}

/// Rejects every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NilAuthFinder;

#[async_trait]
impl AuthFinder for NilAuthFinder {
    async fn find(&self, _headers: &HeaderMap) -> Result<AuthContext> {
        Err(RealtimeError::Unauthorized)
    }
}

/// Authenticates `Authorization: Bearer <key>` against a fixed key table.
#[derive(Debug, Default, Clone)]
pub struct SigningKeyAuthFinder {
    keys: HashMap<String, AuthContext>,
}

impl SigningKeyAuthFinder {
    /// An empty key table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key.
    pub fn with_key(mut self, key: impl Into<String>, ctx: AuthContext) -> Self {
        self.keys.insert(key.into(), ctx);
        self
    }
}

#[async_trait]
impl AuthFinder for SigningKeyAuthFinder {
    async fn find(&self, headers: &HeaderMap) -> Result<AuthContext> {
        let token = bearer_token(headers).ok_or(RealtimeError::Unauthorized)?;
        self.keys
            .get(token)
            .copied()
            .ok_or(RealtimeError::Unauthorized)
    }
}

/// The bearer token of a request, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
