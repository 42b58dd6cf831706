// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run and step metrics.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Labels every metric is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricCardinality {
    /// Account.
    pub account_id: Uuid,
    /// Environment.
    pub env_id: Uuid,
    /// App.
    pub app_id: Uuid,
    /// Function.
    pub fn_id: Uuid,
}

/// Terminal status of a step or run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishStatus {
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled.
    Cancelled,
}

/// Metrics sink.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// A step finished.
    async fn on_step_finished(&self, cardinality: MetricCardinality, status: FinishStatus);

    /// A run finished.
    async fn on_fn_finished(&self, cardinality: MetricCardinality, status: FinishStatus);

    /// A run was scheduled.
    async fn on_fn_scheduled(&self, cardinality: MetricCardinality);
}

/// Discards every metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

#[async_trait]
impl MetricsProvider for NoopMetrics {
    async fn on_step_finished(&self, _cardinality: MetricCardinality, _status: FinishStatus) {}

    async fn on_fn_finished(&self, _cardinality: MetricCardinality, _status: FinishStatus) {}

    async fn on_fn_scheduled(&self, _cardinality: MetricCardinality) {}
}
