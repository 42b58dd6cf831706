// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQL backed [`RunService`] implementations.
//!
//! Runs are stored as one row of JSON encoded metadata and events; step
//! outputs as one row per `(run_id, step_id)`. The primary key on step rows
//! is what makes step writes first-writer-wins.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresRunService;
pub use self::sqlite::SqliteRunService;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use crate::error::{CoreError, Result};
use crate::migrations;
use crate::state::{CreateState, Metadata, MutableConfig, RunService, RunState};

/// Run row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    /// Run id.
    pub run_id: String,
    /// JSON encoded [`Metadata`].
    pub metadata: String,
    /// JSON encoded triggering events.
    pub events: String,
    /// Bytes of stored step output.
    pub state_size: i64,
}

impl RunRecord {
    /// Decode the metadata, with the live state size.
    pub fn metadata(&self) -> Result<Metadata> {
        let mut md: Metadata = serde_json::from_str(&self.metadata)?;
        md.metrics.state_size = self.state_size.max(0) as u64;
        Ok(md)
    }

    /// Decode the events.
    pub fn events(&self) -> Result<Vec<Value>> {
        Ok(serde_json::from_str(&self.events)?)
    }
}

/// Step output row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepRecord {
    /// Hashed step id.
    pub step_id: String,
    /// Stored output.
    pub output: Vec<u8>,
}

/// A run ready to insert.
struct EncodedRun {
    metadata: String,
    events: String,
    steps: Vec<(String, Vec<u8>)>,
    state_size: i64,
}

fn encode_run(state: &CreateState) -> Result<EncodedRun> {
    let metadata = serde_json::to_string(&state.metadata)?;
    let events = serde_json::to_string(&state.events)?;
    let steps = state
        .steps
        .iter()
        .map(|s| Ok((s.id.clone(), serde_json::to_vec(&s.data)?)))
        .collect::<Result<Vec<_>>>()?;
    let state_size = (events.len() + steps.iter().map(|(_, o)| o.len()).sum::<usize>()) as i64;
    Ok(EncodedRun {
        metadata,
        events,
        steps,
        state_size,
    })
}

fn decode_state(record: &RunRecord, steps: Vec<StepRecord>) -> Result<RunState> {
    let mut outputs = BTreeMap::new();
    for step in steps {
        let value = if step.output.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&step.output)?
        };
        outputs.insert(step.step_id, value);
    }
    Ok(RunState {
        metadata: record.metadata()?,
        events: record.events()?,
        steps: outputs,
    })
}

fn apply_mutable(md: &mut Metadata, config: MutableConfig) {
    md.config.started_at = config.started_at;
    md.config.request_version = config.request_version;
    md.config.force_step_plan = config.force_step_plan;
}

/// Error for a step write that lost to an earlier one.
fn existing_step_error(step_id: &str, existing: &[u8], data: &[u8]) -> CoreError {
    if existing == data {
        CoreError::IdempotentResponse {
            step_id: step_id.to_string(),
        }
    } else {
        CoreError::DuplicateResponse {
            step_id: step_id.to_string(),
        }
    }
}

fn migrate_error(e: sqlx::migrate::MigrateError) -> CoreError {
    CoreError::StateError {
        operation: "migrate".to_string(),
        details: format!("Failed to run migrations: {}", e),
    }
}

/// Connect to `database_url`, run migrations and return the matching store.
///
/// `postgres://` and `postgresql://` URLs select Postgres; `sqlite:` URLs
/// select SQLite.
pub async fn connect(database_url: &str) -> Result<Arc<dyn RunService>> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        migrations::run_postgres(&pool).await.map_err(migrate_error)?;
        info!(backend = "postgres", "run store ready");
        return Ok(Arc::new(PostgresRunService::new(pool)));
    }

    if database_url.starts_with("sqlite:") {
        // Every in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        migrations::run_sqlite(&pool).await.map_err(migrate_error)?;
        info!(backend = "sqlite", "run store ready");
        return Ok(Arc::new(SqliteRunService::new(pool)));
    }

    Err(CoreError::StateError {
        operation: "connect".to_string(),
        details: format!("unsupported database url scheme: {}", database_url),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Id, MemoizedStep, RunConfig, RunMetrics, RunMode, Tenant};
    use serde_json::json;
    use ulid::Ulid;
    use uuid::Uuid;

    fn state() -> CreateState {
        CreateState {
            metadata: Metadata {
                id: Id {
                    run_id: Ulid::new(),
                    function_id: Uuid::new_v4(),
                    tenant: Tenant {
                        account_id: Uuid::new_v4(),
                        env_id: Uuid::new_v4(),
                        app_id: Uuid::new_v4(),
                    },
                },
                config: RunConfig::new(RunMode::Sync),
                metrics: RunMetrics::default(),
            },
            events: vec![json!({ "name": "api/request" })],
            steps: vec![MemoizedStep {
                id: "s1".to_string(),
                data: json!({ "data": 1 }),
            }],
        }
    }

    #[test]
    fn test_encode_run_counts_state() {
        let encoded = encode_run(&state()).unwrap();
        assert_eq!(encoded.steps.len(), 1);
        assert_eq!(
            encoded.state_size as usize,
            encoded.events.len() + encoded.steps[0].1.len()
        );
    }

    #[test]
    fn test_existing_step_error() {
        assert!(matches!(
            existing_step_error("s", b"a", b"a"),
            CoreError::IdempotentResponse { .. }
        ));
        assert!(matches!(
            existing_step_error("s", b"a", b"b"),
            CoreError::DuplicateResponse { .. }
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let err = connect("mysql://localhost/db").await.err().unwrap();
        assert!(matches!(err, CoreError::StateError { .. }));
    }
}
