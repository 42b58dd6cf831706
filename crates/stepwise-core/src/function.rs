// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function definitions, apps, triggering events and the stores behind them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Retries of a step when its function does not configure any.
pub const DEFAULT_RETRIES: u32 = 3;

/// How the executor reaches a function.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FunctionDriver {
    /// Endpoint URL.
    pub uri: String,
    /// Driver metadata, such as `{"type":"sync","method":"POST"}`.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A step of a function definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionStep {
    /// Step id.
    pub id: String,
    /// Step name.
    pub name: String,
    /// Endpoint URL.
    pub uri: String,
    /// Retries after the first attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// A function definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// Internal id.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Slug, unique within the app.
    pub slug: String,
    /// Version of the config format.
    pub config_version: i32,
    /// Version of the function.
    pub function_version: i32,
    /// How to reach the function.
    pub driver: FunctionDriver,
    /// Steps.
    pub steps: Vec<FunctionStep>,
}

impl Function {
    /// Attempts allowed per step: retries of the first step plus one.
    pub fn max_attempts(&self) -> u32 {
        let retries = self
            .steps
            .first()
            .and_then(|s| s.retries)
            .unwrap_or(DEFAULT_RETRIES);
        retries + 1
    }
}

/// A stored function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// Internal id.
    pub id: Uuid,
    /// Environment.
    pub env_id: Uuid,
    /// App.
    pub app_id: Uuid,
    /// Display name.
    pub name: String,
    /// Slug.
    pub slug: String,
    /// JSON encoded [`Function`].
    pub config: String,
    /// When the function was first seen.
    pub created_at: DateTime<Utc>,
}

impl FunctionRecord {
    /// Decode the function definition.
    pub fn function(&self) -> Result<Function> {
        serde_json::from_str(&self.config).map_err(|e| CoreError::Internal {
            message: format!("invalid config for function {}: {}", self.id, e),
        })
    }
}

/// Read access to stored functions.
#[async_trait]
pub trait FunctionReader: Send + Sync {
    /// Function by internal id. Fails with `FunctionNotFound`.
    async fn get_function_by_internal_uuid(&self, fn_id: Uuid) -> Result<FunctionRecord>;

    /// Functions of the app whose external id (its URL) is `app_id`.
    async fn get_functions_by_app_external_id(
        &self,
        env_id: Uuid,
        app_id: &str,
    ) -> Result<Vec<FunctionRecord>>;

    /// Function by app external id and slug. Fails with `FunctionNotFound`.
    async fn get_function_by_external_id(
        &self,
        env_id: Uuid,
        app_id: &str,
        fn_slug: &str,
    ) -> Result<FunctionRecord>;
}

/// An app to create or update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertApp {
    /// Deterministic app id.
    pub id: Uuid,
    /// Environment.
    pub env_id: Uuid,
    /// Display name.
    pub name: String,
    /// App URL, which doubles as its external id.
    pub url: String,
    /// How the app was registered.
    pub method: String,
}

/// A function to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertFunction {
    /// Deterministic function id.
    pub id: Uuid,
    /// Account.
    pub account_id: Uuid,
    /// Environment.
    pub env_id: Uuid,
    /// App.
    pub app_id: Uuid,
    /// Display name.
    pub name: String,
    /// Slug.
    pub slug: String,
    /// JSON encoded [`Function`].
    pub config: String,
    /// When the function was first seen.
    pub created_at: DateTime<Utc>,
}

/// Writes apps.
#[async_trait]
pub trait AppCreator: Send + Sync {
    /// Create the app or update its name and URL.
    async fn upsert_app(&self, app: UpsertApp) -> Result<()>;
}

/// Writes functions.
#[async_trait]
pub trait FunctionCreator: Send + Sync {
    /// Insert a new function.
    async fn insert_function(&self, function: InsertFunction) -> Result<()>;

    /// Replace the config of an existing function.
    async fn update_function_config(&self, fn_id: Uuid, config: String) -> Result<()>;
}

/// An event sent into the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Event name.
    pub name: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
    /// Epoch milliseconds; 0 means now.
    #[serde(default)]
    pub ts: i64,
}

/// An event accepted for a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalEvent {
    /// Internal id.
    pub id: Ulid,
    /// Account.
    pub account_id: Uuid,
    /// Environment.
    pub workspace_id: Uuid,
    /// The event.
    pub event: Event,
}

impl InternalEvent {
    /// Accept `event` for a tenant, filling in its id and timestamp.
    pub fn new(account_id: Uuid, workspace_id: Uuid, mut event: Event) -> Self {
        let id = Ulid::new();
        if event.ts == 0 {
            event.ts = Utc::now().timestamp_millis();
        }
        if event.id.as_deref().is_none_or(str::is_empty) {
            event.id = Some(Ulid::new().to_string());
        }
        Self {
            id,
            account_id,
            workspace_id,
            event,
        }
    }
}

/// Publishes events to the event stream.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish `event`.
    async fn publish(&self, event: &InternalEvent) -> Result<()>;
}
