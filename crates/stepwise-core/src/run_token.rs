// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run-scoped tokens granting access to a run's output.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Lifetime of run tokens.
pub const RUN_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Claims of a run token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunClaims {
    /// Run id.
    pub sub: String,
    /// Environment of the run.
    pub env: Uuid,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Issued at, seconds since the epoch.
    pub iat: i64,
}

impl RunClaims {
    /// Run id from the subject claim.
    pub fn run_id(&self) -> Result<Ulid> {
        Ulid::from_string(&self.sub).map_err(|_| CoreError::Unauthorized {
            message: "invalid run token".to_string(),
        })
    }
}

/// Mint a token for the output of `run_id`.
pub fn new_run_jwt(secret: &[u8], run_id: Ulid, env_id: Uuid) -> Result<String> {
    let now = Utc::now().timestamp();
    let claims = RunClaims {
        sub: run_id.to_string(),
        env: env_id,
        exp: now + RUN_TOKEN_LIFETIME.as_secs() as i64,
        iat: now,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| CoreError::Internal {
        message: format!("error signing run token: {}", e),
    })
}

/// Verify a run token. Every failure is reported as `Unauthorized`.
pub fn verify_run_jwt(secret: &[u8], token: &str) -> Result<RunClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp", "sub"]);
    validation.leeway = 0;

    let data = decode::<RunClaims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|_| CoreError::Unauthorized {
            message: "invalid run token".to_string(),
        })?;
    data.claims.run_id()?;
    Ok(data.claims)
}
