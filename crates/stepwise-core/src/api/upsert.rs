// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deterministic apps and functions for sync endpoints.
//!
//! A sync endpoint is identified by its domain and route. The first request
//! to an endpoint creates its app and function; later requests only touch the
//! stores when the function definition changed.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;
use xxhash_rust::xxh64::xxh64;

use crate::error::{CoreError, Result};
use crate::function::{
    AppCreator, Function, FunctionCreator, FunctionDriver, FunctionReader, FunctionStep,
    InsertFunction, UpsertApp,
};

/// Functions whose config hash is remembered.
pub const UPSERT_CACHE_CAPACITY: usize = 10_000;

/// How long a remembered hash is trusted.
pub const UPSERT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Registration method recorded on apps created by sync endpoints.
pub const SYNC_APP_METHOD: &str = "API";

/// Id of the single step of a sync function.
pub const SYNC_STEP_ID: &str = "step";

/// Payload of the `api/request` event that starts a sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestData {
    /// Scheme and host, such as `https://example.com`.
    pub domain: String,
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Explicit function slug overriding `"{method} {path}"`.
    #[serde(rename = "fn", default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Client IP.
    #[serde(default)]
    pub ip: String,
    /// Request content type.
    #[serde(default)]
    pub content_type: String,
    /// Query string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_params: Option<String>,
    /// Request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl HttpRequestData {
    /// Slug of the function serving this request.
    pub fn slug(&self) -> String {
        match &self.function {
            Some(slug) if !slug.is_empty() => slug.clone(),
            _ => format!("{} {}", self.method, self.path),
        }
    }

    /// URL of the endpoint.
    pub fn url(&self) -> String {
        format!("{}{}", self.domain, self.path)
    }
}

/// App id of `domain` in `env_id`.
pub fn app_id(env_id: Uuid, domain: &str) -> Uuid {
    let mut name = env_id.as_bytes().to_vec();
    name.extend_from_slice(domain.as_bytes());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, &name)
}

/// Function id of `slug` in `app_id`.
pub fn fn_id(app_id: Uuid, slug: &str) -> Uuid {
    let mut name = app_id.as_bytes().to_vec();
    name.extend_from_slice(slug.as_bytes());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, &name)
}

/// Function definition for a sync endpoint. Sync steps are never retried.
pub fn sync_function(fn_id: Uuid, req: &HttpRequestData) -> Function {
    let slug = req.slug();
    let uri = req.url();

    let mut metadata = Map::new();
    metadata.insert("type".to_string(), Value::from("sync"));
    metadata.insert("method".to_string(), Value::from(req.method.clone()));

    Function {
        id: fn_id,
        name: slug.clone(),
        slug: slug.clone(),
        config_version: 1,
        function_version: 1,
        driver: FunctionDriver {
            uri: uri.clone(),
            metadata,
        },
        steps: vec![FunctionStep {
            id: SYNC_STEP_ID.to_string(),
            name: slug,
            uri,
            retries: Some(0),
        }],
    }
}

/// Hash of a JSON encoded function config.
pub fn config_hash(config: &str) -> String {
    format!("{:016x}", xxh64(config.as_bytes(), 0))
}

#[derive(Debug, Clone)]
struct CachedConfig {
    hash: String,
    inserted_at: Instant,
}

/// Remembers the config hash last written for each function.
#[derive(Debug)]
pub struct UpsertCache {
    entries: DashMap<Uuid, CachedConfig>,
    capacity: usize,
    ttl: Duration,
}

impl Default for UpsertCache {
    fn default() -> Self {
        Self::with_limits(UPSERT_CACHE_CAPACITY, UPSERT_CACHE_TTL)
    }
}

impl UpsertCache {
    /// Cache with the default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache holding at most `capacity` entries for `ttl` each.
    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Remembered hash of `fn_id`, if still fresh.
    pub fn get(&self, fn_id: &Uuid) -> Option<String> {
        {
            let entry = self.entries.get(fn_id)?;
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.hash.clone());
            }
        }
        self.entries.remove(fn_id);
        None
    }

    /// Remember `hash` for `fn_id`.
    pub fn insert(&self, fn_id: Uuid, hash: String) {
        if !self.entries.contains_key(&fn_id) && self.entries.len() >= self.capacity {
            self.evict();
        }
        self.entries.insert(
            fn_id,
            CachedConfig {
                hash,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries, or the oldest one when none expired.
    fn evict(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, v| v.inserted_at.elapsed() < ttl);
        if self.entries.len() < self.capacity {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().inserted_at)
            .map(|e| *e.key());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    /// Number of remembered functions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A sync function to make sure exists.
#[derive(Debug, Clone)]
pub struct SyncFunction {
    /// Account.
    pub account_id: Uuid,
    /// Environment.
    pub env_id: Uuid,
    /// App.
    pub app_id: Uuid,
    /// Domain of the app.
    pub domain: String,
    /// Definition.
    pub function: Function,
}

/// Create or update the app and function of a sync endpoint.
pub async fn upsert_sync_data(
    cache: &UpsertCache,
    apps: &dyn AppCreator,
    reader: &dyn FunctionReader,
    writer: &dyn FunctionCreator,
    data: SyncFunction,
) -> Result<()> {
    let fn_id = data.function.id;
    let config = serde_json::to_string(&data.function)?;
    let hash = config_hash(&config);

    match cache.get(&fn_id) {
        Some(cached) if cached == hash => {
            debug!(fn_id = %fn_id, "sync function unchanged");
            return Ok(());
        }
        Some(_) => {
            writer.update_function_config(fn_id, config).await?;
            cache.insert(fn_id, hash);
            return Ok(());
        }
        None => {}
    }

    apps.upsert_app(UpsertApp {
        id: data.app_id,
        env_id: data.env_id,
        name: data.domain.clone(),
        url: data.domain.clone(),
        method: SYNC_APP_METHOD.to_string(),
    })
    .await?;

    match reader.get_function_by_internal_uuid(fn_id).await {
        Ok(existing) if existing.config == config => {}
        Ok(_) => writer.update_function_config(fn_id, config).await?,
        Err(CoreError::FunctionNotFound { .. }) => {
            writer
                .insert_function(InsertFunction {
                    id: fn_id,
                    account_id: data.account_id,
                    env_id: data.env_id,
                    app_id: data.app_id,
                    name: data.function.name.clone(),
                    slug: data.function.slug.clone(),
                    config,
                    created_at: chrono::Utc::now(),
                })
                .await?
        }
        Err(e) => return Err(e),
    }

    cache.insert(fn_id, hash);
    Ok(())
}
