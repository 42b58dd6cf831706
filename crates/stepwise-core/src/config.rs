// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Log output format of the server binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Stepwise Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// HTTP listen address for the checkpoint and realtime APIs
    pub http_addr: SocketAddr,
    /// HS256 secret of realtime tokens
    pub realtime_jwt_secret: String,
    /// HS256 secret of run-output tokens
    pub run_jwt_secret: String,
    /// Redis URL enabling the replicated broadcaster
    pub redis_url: Option<String>,
    /// Key SDKs authenticate checkpoint requests with
    pub signing_key: Option<String>,
    /// Longest a function may take to respond
    pub max_function_timeout: Duration,
    /// Largest SDK response body accepted
    pub max_response_body_bytes: usize,
    /// Secure dialer: allow loopback, private, link-local and ULA addresses
    pub allow_private_networks: bool,
    /// Secure dialer: allow the container-host alias
    pub allow_host_docker: bool,
    /// Secure dialer: allow NAT64 prefixes
    pub allow_nat64: bool,
    /// Log output format
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STEPWISE_DATABASE_URL`: PostgreSQL or SQLite connection string
    /// - `STEPWISE_REALTIME_JWT_SECRET`: realtime token secret
    ///
    /// Optional (with defaults):
    /// - `STEPWISE_HTTP_PORT`: HTTP port (default: 8288)
    /// - `STEPWISE_RUN_JWT_SECRET`: run-output token secret (default: realtime secret)
    /// - `STEPWISE_REDIS_URL`: replicate realtime traffic through Redis
    /// - `STEPWISE_SIGNING_KEY`: bearer key accepted from SDKs (default: none, every
    ///   checkpoint request is rejected)
    /// - `STEPWISE_MAX_FUNCTION_TIMEOUT_SECS`: (default: 7200)
    /// - `STEPWISE_MAX_RESPONSE_BODY_BYTES`: (default: 4194304)
    /// - `STEPWISE_ALLOW_PRIVATE_NETWORKS`, `STEPWISE_ALLOW_HOST_DOCKER`,
    ///   `STEPWISE_ALLOW_NAT64`: secure dialer allow-flags (default: false)
    /// - `STEPWISE_LOG_FORMAT`: `text` or `json` (default: text)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STEPWISE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STEPWISE_DATABASE_URL"))?;

        let realtime_jwt_secret = std::env::var("STEPWISE_REALTIME_JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("STEPWISE_REALTIME_JWT_SECRET"))?;

        let run_jwt_secret = std::env::var("STEPWISE_RUN_JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| realtime_jwt_secret.clone());

        let http_port: u16 = std::env::var("STEPWISE_HTTP_PORT")
            .unwrap_or_else(|_| "8288".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("STEPWISE_HTTP_PORT", "must be a valid port number")
            })?;

        let max_function_timeout_secs: u64 = std::env::var("STEPWISE_MAX_FUNCTION_TIMEOUT_SECS")
            .unwrap_or_else(|_| "7200".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "STEPWISE_MAX_FUNCTION_TIMEOUT_SECS",
                    "must be a positive integer",
                )
            })?;

        let max_response_body_bytes: usize = std::env::var("STEPWISE_MAX_RESPONSE_BODY_BYTES")
            .unwrap_or_else(|_| "4194304".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "STEPWISE_MAX_RESPONSE_BODY_BYTES",
                    "must be a positive integer",
                )
            })?;

        let log_format = match std::env::var("STEPWISE_LOG_FORMAT").as_deref() {
            Err(_) | Ok("") | Ok("text") => LogFormat::Text,
            Ok("json") => LogFormat::Json,
            Ok(_) => {
                return Err(ConfigError::Invalid(
                    "STEPWISE_LOG_FORMAT",
                    "must be 'text' or 'json'",
                ));
            }
        };

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            realtime_jwt_secret,
            run_jwt_secret,
            redis_url: std::env::var("STEPWISE_REDIS_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            signing_key: std::env::var("STEPWISE_SIGNING_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            max_function_timeout: Duration::from_secs(max_function_timeout_secs),
            max_response_body_bytes,
            allow_private_networks: env_bool("STEPWISE_ALLOW_PRIVATE_NETWORKS")?,
            allow_host_docker: env_bool("STEPWISE_ALLOW_HOST_DOCKER")?,
            allow_nat64: env_bool("STEPWISE_ALLOW_NAT64")?,
            log_format,
        })
    }
}

fn env_bool(var: &'static str) -> Result<bool, ConfigError> {
    match std::env::var(var).as_deref() {
        Err(_) | Ok("") => Ok(false),
        Ok("true") | Ok("1") => Ok(true),
        Ok("false") | Ok("0") => Ok(false),
        Ok(_) => Err(ConfigError::Invalid(var, "must be true, false, 1 or 0")),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
