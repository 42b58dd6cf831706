// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed run store.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{CoreError, Result};
use crate::migrations;
use crate::state::{CreateState, Id, Metadata, MutableConfig, RunService, RunState};

use super::{
    RunRecord, StepRecord, apply_mutable, decode_state, encode_run, existing_step_error,
    migrate_error,
};

/// SQLite-backed [`RunService`].
#[derive(Debug, Clone)]
pub struct SqliteRunService {
    pool: SqlitePool,
}

impl SqliteRunService {
    /// Store over an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open or create the database file at `path` and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::StateError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::StateError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        migrations::run_sqlite(&pool).await.map_err(migrate_error)?;

        Ok(Self { pool })
    }

    async fn record(&self, id: &Id) -> Result<RunRecord> {
        sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT run_id, metadata, events, state_size
            FROM runs
            WHERE run_id = ?
            "#,
        )
        .bind(id.run_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::RunNotFound {
            run_id: id.run_id.to_string(),
        })
    }
}

#[async_trait]
impl RunService for SqliteRunService {
    async fn create(&self, state: CreateState) -> Result<Metadata> {
        let encoded = encode_run(&state)?;
        let id = state.metadata.id;
        let run_id = id.run_id.to_string();

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO runs (run_id, function_id, account_id, env_id, app_id, metadata, events, state_size, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(&run_id)
        .bind(id.function_id.to_string())
        .bind(id.tenant.account_id.to_string())
        .bind(id.tenant.env_id.to_string())
        .bind(id.tenant.app_id.to_string())
        .bind(&encoded.metadata)
        .bind(&encoded.events)
        .bind(encoded.state_size)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(CoreError::IdentifierExists { run_id });
        }

        for (step_id, output) in &encoded.steps {
            sqlx::query(
                r#"
                INSERT INTO run_steps (run_id, step_id, output, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (run_id, step_id) DO NOTHING
                "#,
            )
            .bind(&run_id)
            .bind(step_id)
            .bind(output)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let mut md = state.metadata;
        md.metrics.state_size = encoded.state_size as u64;
        Ok(md)
    }

    async fn delete(&self, id: &Id) -> Result<bool> {
        let run_id = id.run_id.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM run_steps WHERE run_id = ?")
            .bind(&run_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM runs WHERE run_id = ?")
            .bind(&run_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn load_state(&self, id: &Id) -> Result<RunState> {
        let record = self.record(id).await?;
        let steps = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT step_id, output
            FROM run_steps
            WHERE run_id = ?
            "#,
        )
        .bind(&record.run_id)
        .fetch_all(&self.pool)
        .await?;

        decode_state(&record, steps)
    }

    async fn load_metadata(&self, id: &Id) -> Result<Metadata> {
        self.record(id).await?.metadata()
    }

    async fn update_metadata(&self, id: &Id, config: MutableConfig) -> Result<()> {
        let mut md = self.load_metadata(id).await?;
        apply_mutable(&mut md, config);

        sqlx::query("UPDATE runs SET metadata = ? WHERE run_id = ?")
            .bind(serde_json::to_string(&md)?)
            .bind(id.run_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn save_step(&self, id: &Id, step_id: &str, data: &[u8]) -> Result<()> {
        let record = self.record(id).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO run_steps (run_id, step_id, output, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (run_id, step_id) DO NOTHING
            "#,
        )
        .bind(&record.run_id)
        .bind(step_id)
        .bind(data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            let existing: Vec<u8> = sqlx::query_scalar(
                "SELECT output FROM run_steps WHERE run_id = ? AND step_id = ?",
            )
            .bind(&record.run_id)
            .bind(step_id)
            .fetch_one(&self.pool)
            .await?;
            return Err(existing_step_error(step_id, &existing, data));
        }

        sqlx::query("UPDATE runs SET state_size = state_size + ? WHERE run_id = ?")
            .bind(data.len() as i64)
            .bind(&record.run_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
