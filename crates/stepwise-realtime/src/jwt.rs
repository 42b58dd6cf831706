// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Short-lived realtime tokens.
//!
//! Subscribe tokens embed the topics they grant access to; publish tokens carry
//! `publish: true` and no topics. Both are HS256 only.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::error::{RealtimeError, Result};
use crate::topic::Topic;

/// Issuer stamped into, and required from, every realtime token.
pub const ISSUER: &str = "rt.stepwise";

/// Lifetime of subscribe tokens.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(60);

/// Claims carried by realtime tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtClaims {
    /// Fixed issuer.
    pub iss: String,
    /// Account id.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Issued at, seconds since the epoch.
    pub iat: i64,
    /// Unique token id.
    pub jti: String,
    /// Environment id.
    pub env: Uuid,
    /// Topics the bearer may subscribe to.
    #[serde(default)]
    pub topics: Vec<Topic>,
    /// Whether the bearer may publish.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub publish: bool,
}

impl JwtClaims {
    fn new(account_id: Uuid, env_id: Uuid, topics: Vec<Topic>, publish: bool) -> Self {
        let now = Utc::now().timestamp();
        Self {
            iss: ISSUER.to_string(),
            sub: account_id.to_string(),
            exp: now + TOKEN_LIFETIME.as_secs() as i64,
            iat: now,
            jti: Ulid::new().to_string(),
            env: env_id,
            topics,
            publish,
        }
    }

    /// Account id from the subject claim.
    pub fn account_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| RealtimeError::InvalidToken)
    }
}

/// Mint a subscribe token granting access to `topics`.
pub fn new_jwt(secret: &[u8], account_id: Uuid, env_id: Uuid, topics: Vec<Topic>) -> Result<String> {
    sign(secret, &JwtClaims::new(account_id, env_id, topics, false))
}

/// Mint a publish token for `env_id`.
pub fn new_publish_jwt(secret: &[u8], account_id: Uuid, env_id: Uuid) -> Result<String> {
    sign(secret, &JwtClaims::new(account_id, env_id, Vec::new(), true))
}

/// Sign arbitrary claims.
pub fn sign(secret: &[u8], claims: &JwtClaims) -> Result<String> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| RealtimeError::Internal(format!("error signing token: {}", e)))
}

/// Verify a token and return its claims.
pub fn validate(secret: &[u8], token: &str) -> Result<JwtClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[ISSUER]);
    validation.set_required_spec_claims(&["exp", "iss", "sub"]);
    validation.validate_exp = true;
    validation.leeway = 0;

    let data = decode::<JwtClaims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => RealtimeError::ExpiredToken,
            _ => RealtimeError::InvalidToken,
        })?;

    // Subject must be a valid account id.
    data.claims.account_id()?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret";

    #[test]
    fn test_roundtrip_subscribe_token() {
        let account = Uuid::new_v4();
        let env = Uuid::new_v4();
        let topics = vec![Topic::run(env, "user:123", "ai")];

        let token = new_jwt(SECRET, account, env, topics.clone()).unwrap();
        let claims = validate(SECRET, &token).unwrap();

        assert_eq!(claims.iss, ISSUER);
        assert_eq!(claims.account_id().unwrap(), account);
        assert_eq!(claims.env, env);
        assert_eq!(claims.topics, topics);
        assert!(!claims.publish);
        assert_eq!(claims.exp - claims.iat, 60);
        assert!(Ulid::from_string(&claims.jti).is_ok());
    }

    #[test]
    fn test_publish_token() {
        let token = new_publish_jwt(SECRET, Uuid::new_v4(), Uuid::new_v4()).unwrap();
        let claims = validate(SECRET, &token).unwrap();
        assert!(claims.publish);
        assert!(claims.topics.is_empty());
    }

    #[test]
    fn test_rejects_wrong_secret() {
        let token = new_jwt(SECRET, Uuid::new_v4(), Uuid::new_v4(), vec![]).unwrap();
        assert!(matches!(
            validate(b"other", &token),
            Err(RealtimeError::InvalidToken)
        ));
    }

    #[test]
    fn test_rejects_expired() {
        let mut claims = JwtClaims::new(Uuid::new_v4(), Uuid::new_v4(), vec![], false);
        claims.iat -= 3600;
        claims.exp = claims.iat + 60;
        let token = sign(SECRET, &claims).unwrap();

        assert!(matches!(
            validate(SECRET, &token),
            Err(RealtimeError::ExpiredToken)
        ));
    }

    #[test]
    fn test_rejects_foreign_issuer() {
        let mut claims = JwtClaims::new(Uuid::new_v4(), Uuid::new_v4(), vec![], false);
        claims.iss = "someone-else".to_string();
        let token = sign(SECRET, &claims).unwrap();

        assert!(validate(SECRET, &token).is_err());
    }

    #[test]
    fn test_rejects_other_algorithms() {
        let claims = JwtClaims::new(Uuid::new_v4(), Uuid::new_v4(), vec![], false);
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        assert!(validate(SECRET, &token).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            validate(SECRET, "not.a.token"),
            Err(RealtimeError::InvalidToken)
        ));
    }
}
