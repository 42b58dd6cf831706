// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution-time context handed to the executor with each opcode.

use std::sync::Arc;

use uuid::Uuid;

use crate::exechttp::RequestExecutor;
use crate::function::InternalEvent;
use crate::opcode::GeneratorOpcode;
use crate::queue::{ParallelMode, QueueItem, QueueKind};
use crate::state::{CustomConcurrency, Metadata};

/// What the executor knows about the run an opcode belongs to.
pub trait RunContext: Send + Sync {
    /// Run metadata.
    fn metadata(&self) -> &Metadata;

    /// Zero based attempt of the current execution.
    fn attempt_count(&self) -> u32;

    /// Attempts allowed per step.
    fn max_attempts(&self) -> u32;

    /// Whether another attempt is allowed after this one.
    fn should_retry(&self) -> bool {
        self.attempt_count() + 1 < self.max_attempts()
    }

    /// Priority factor in seconds.
    fn priority_factor(&self) -> Option<i64>;

    /// Concurrency keys of the run.
    fn concurrency_keys(&self) -> &[CustomConcurrency];

    /// Parallel step behaviour.
    fn parallel_mode(&self) -> ParallelMode;

    /// Triggering events.
    fn events(&self) -> &[InternalEvent];

    /// Client for outgoing requests made on behalf of the run.
    fn http_client(&self) -> Option<Arc<dyn RequestExecutor>>;

    /// Groups the opcodes of one checkpoint request.
    fn group_id(&self) -> Uuid;

    /// Queue item describing the current execution.
    fn lifecycle_item(&self) -> QueueItem {
        let md = self.metadata();
        QueueItem {
            job_id: None,
            kind: QueueKind::Edge,
            identifier: md.id,
            workspace_id: md.id.tenant.env_id,
            attempt: self.attempt_count(),
            max_attempts: Some(self.max_attempts()),
            priority_factor: self.priority_factor(),
            custom_concurrency_keys: self.concurrency_keys().to_vec(),
            parallel_mode: self.parallel_mode(),
            payload: None,
        }
    }

    /// Count another attempt.
    fn increment_attempt(&self);

    /// Record the status code returned by the function.
    fn set_status_code(&self, code: u16);

    /// Record an error raised by the function.
    fn set_error(&self, err: &str);

    /// Replace the output of an opcode.
    fn update_opcode_output(&self, op: &GeneratorOpcode, output: &[u8]);
}

/// Context of a sync checkpoint. Mutations are no-ops: the request that
/// carried the opcodes is the only attempt.
#[derive(Clone)]
pub struct CheckpointRunContext {
    metadata: Metadata,
    max_attempts: u32,
    attempt: u32,
    parallel_mode: ParallelMode,
    group_id: Uuid,
    events: Vec<InternalEvent>,
    http_client: Option<Arc<dyn RequestExecutor>>,
}

impl std::fmt::Debug for CheckpointRunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointRunContext")
            .field("run_id", &self.metadata.id.run_id)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("group_id", &self.group_id)
            .finish()
    }
}

impl CheckpointRunContext {
    /// Context for a sync checkpoint of `metadata`: attempt 0, wait mode, no
    /// triggering events.
    pub fn new(
        metadata: Metadata,
        max_attempts: u32,
        http_client: Option<Arc<dyn RequestExecutor>>,
    ) -> Self {
        Self {
            metadata,
            max_attempts,
            attempt: 0,
            parallel_mode: ParallelMode::Wait,
            group_id: Uuid::new_v4(),
            events: Vec::new(),
            http_client,
        }
    }

    /// Use `attempt` instead of 0.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

impl RunContext for CheckpointRunContext {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn attempt_count(&self) -> u32 {
        self.attempt
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn priority_factor(&self) -> Option<i64> {
        self.metadata.config.priority_factor
    }

    fn concurrency_keys(&self) -> &[CustomConcurrency] {
        &self.metadata.config.custom_concurrency_keys
    }

    fn parallel_mode(&self) -> ParallelMode {
        self.parallel_mode
    }

    fn events(&self) -> &[InternalEvent] {
        &self.events
    }

    fn http_client(&self) -> Option<Arc<dyn RequestExecutor>> {
        self.http_client.clone()
    }

    fn group_id(&self) -> Uuid {
        self.group_id
    }

    fn increment_attempt(&self) {}

    fn set_status_code(&self, _code: u16) {}

    fn set_error(&self, _err: &str) {}

    fn update_opcode_output(&self, _op: &GeneratorOpcode, _output: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Id, RunConfig, RunMetrics, RunMode, Tenant};
    use ulid::Ulid;

    fn metadata() -> Metadata {
        let mut config = RunConfig::new(RunMode::Sync);
        config.priority_factor = Some(30);
        config.custom_concurrency_keys = vec![CustomConcurrency {
            key: "f:user".to_string(),
            hash: "abc".to_string(),
            limit: 2,
        }];
        Metadata {
            id: Id {
                run_id: Ulid::new(),
                function_id: Uuid::new_v4(),
                tenant: Tenant {
                    account_id: Uuid::new_v4(),
                    env_id: Uuid::new_v4(),
                    app_id: Uuid::new_v4(),
                },
            },
            config,
            metrics: RunMetrics::default(),
        }
    }

    #[test]
    fn test_should_retry() {
        let ctx = CheckpointRunContext::new(metadata(), 4, None);
        assert_eq!(ctx.attempt_count(), 0);
        assert!(ctx.should_retry());

        let last = CheckpointRunContext::new(metadata(), 4, None).with_attempt(3);
        assert!(!last.should_retry());

        let single = CheckpointRunContext::new(metadata(), 1, None);
        assert!(!single.should_retry());
    }

    #[test]
    fn test_lifecycle_item_mirrors_run() {
        let md = metadata();
        let ctx = CheckpointRunContext::new(md.clone(), 4, None);
        let item = ctx.lifecycle_item();

        assert_eq!(item.identifier, md.id);
        assert_eq!(item.workspace_id, md.id.tenant.env_id);
        assert_eq!(item.attempt, 0);
        assert_eq!(item.max_attempts, Some(4));
        assert_eq!(item.priority_factor, Some(30));
        assert_eq!(item.custom_concurrency_keys.len(), 1);
        assert_eq!(item.parallel_mode, ParallelMode::Wait);
        assert!(ctx.events().is_empty());
    }

    #[test]
    fn test_group_ids_are_per_context() {
        let a = CheckpointRunContext::new(metadata(), 1, None);
        let b = CheckpointRunContext::new(metadata(), 1, None);
        assert_ne!(a.group_id(), b.group_id());
    }
}
