// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stepwise Core - Checkpoint Server
//!
//! Serves:
//! - The checkpoint API (`/checkpoint`, `/http/runs`) SDKs report steps to
//! - The realtime API (`/realtime/*`) for topic subscriptions and publishing
//!
//! Queueing, scheduling and tracing backends are external; this binary wires
//! logging stand-ins for them.

use std::sync::Arc;

use anyhow::Result;
use stepwise_realtime::auth::{NilAuthFinder, SigningKeyAuthFinder};
use stepwise_realtime::{AuthContext, AuthFinder, Broadcaster, InProcessBroadcaster};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use stepwise_core::config::{Config, LogFormat};
use stepwise_core::exechttp::{ClientOptions, SecureClient};
use stepwise_core::persistence;
use stepwise_core::runtime::ServerBuilder;

const DEFAULT_LOG_DIRECTIVES: &str = "stepwise_core=info,stepwise_realtime=info";

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn broadcaster(config: &Config) -> Result<Arc<dyn Broadcaster>> {
    match config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => {
            info!("Connecting realtime broadcaster to Redis...");
            let redis = stepwise_realtime::RedisBroadcaster::connect(
                url,
                stepwise_realtime::BroadcasterConfig::default(),
            )
            .await?;
            Ok(Arc::new(redis))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("STEPWISE_REDIS_URL is set but the redis feature is disabled; using in-process broadcaster");
            Ok(Arc::new(InProcessBroadcaster::new()))
        }
        None => Ok(Arc::new(InProcessBroadcaster::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    let config = Config::from_env().inspect_err(|e| {
        eprintln!("Configuration error: {}", e);
    })?;

    init_tracing(config.log_format);

    info!("Starting Stepwise Core");
    info!(
        http_addr = %config.http_addr,
        redis = config.redis_url.is_some(),
        max_function_timeout_secs = config.max_function_timeout.as_secs(),
        "Configuration loaded"
    );

    info!("Connecting to state store and running migrations...");
    let state = persistence::connect(&config.database_url).await?;
    info!("State store ready");

    let client = SecureClient::new(ClientOptions::from(&config))?;
    let broadcaster = broadcaster(&config).await?;

    let auth: Arc<dyn AuthFinder> = match &config.signing_key {
        Some(key) => Arc::new(SigningKeyAuthFinder::new().with_key(
            key.clone(),
            AuthContext {
                account_id: Uuid::nil(),
                env_id: Uuid::nil(),
            },
        )),
        None => {
            warn!("STEPWISE_SIGNING_KEY is not set; checkpoint requests will be rejected");
            Arc::new(NilAuthFinder)
        }
    };

    let server = ServerBuilder::new()
        .state(state)
        .auth(auth)
        .broadcaster(broadcaster.clone())
        .secure_client(client)
        .realtime_jwt_secret(config.realtime_jwt_secret.clone())
        .run_jwt_secret(config.run_jwt_secret.clone())
        .bind_addr(config.http_addr)
        .start()
        .await?;

    info!(addr = %server.local_addr(), "Stepwise Core initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Err(e) = broadcaster.close().await {
        error!("Error closing broadcaster: {}", e);
    }
    server.shutdown().await?;

    info!("Shutdown complete");
    Ok(())
}
