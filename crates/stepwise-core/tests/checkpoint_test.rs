// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint engine tests against recording collaborators.
//!
//! Sync checkpoints persist steps only while the run may still resume; async
//! checkpoints accept step opcodes only and reset the attempt counter of the
//! queue item that carried them.

mod common;

use std::sync::atomic::Ordering;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde_json::{Value, json};

use common::*;
use stepwise_core::checkpoint::{AsyncCheckpoint, SyncCheckpoint};
use stepwise_core::error::CoreError;
use stepwise_core::executor::GeneratorOutcome;
use stepwise_core::metrics::FinishStatus;
use stepwise_core::opcode::{GeneratorOpcode, Opcode, Timing, UserError};
use stepwise_core::queue::{QueueKind, QueueRef};
use stepwise_core::run_token::verify_run_jwt;
use stepwise_core::state::Metadata;
use stepwise_core::trace::{SPAN_NAME_STEP, SpanReference, attrs};

fn sync_input(md: &Metadata, steps: Vec<GeneratorOpcode>) -> SyncCheckpoint {
    SyncCheckpoint {
        run_id: md.id.run_id,
        fn_id: md.id.function_id,
        app_id: md.id.tenant.app_id,
        account_id: md.id.tenant.account_id,
        env_id: md.id.tenant.env_id,
        steps,
        metadata: None,
        function: None,
    }
}

fn async_input(md: &Metadata, queue_item_ref: String, steps: Vec<GeneratorOpcode>) -> AsyncCheckpoint {
    AsyncCheckpoint {
        run_id: md.id.run_id,
        fn_id: md.id.function_id,
        app_id: md.id.tenant.app_id,
        account_id: md.id.tenant.account_id,
        env_id: md.id.tenant.env_id,
        queue_item_ref,
        steps,
    }
}

fn step_run(id: &str, data: Value) -> GeneratorOpcode {
    GeneratorOpcode::new(Opcode::StepRun, id)
        .with_name(id)
        .with_data(data)
}

fn run_complete() -> GeneratorOpcode {
    GeneratorOpcode::new(Opcode::RunComplete, "done").with_data(json!({
        "data": {"status_code": 200, "headers": {}, "body": null, "duration": 0}
    }))
}

// ============================================================================
// Sync path
// ============================================================================

#[tokio::test]
async fn test_sync_step_then_complete_skips_persistence() {
    let h = Harness::new();
    let md = h.seed_run(None);
    let t0 = Utc::now().timestamp_millis();

    let outcome = h
        .checkpointer
        .checkpoint_sync(sync_input(
            &md,
            vec![
                step_run("s1", json!({"result": 1})).with_timing(Timing::from((t0, t0 + 50))),
                run_complete(),
            ],
        ))
        .await
        .unwrap();

    assert!(outcome.complete);
    assert!(!outcome.went_async);
    assert_eq!(h.state.save_count(), 0);

    let spans = h.tracer.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, SPAN_NAME_STEP);
    assert_eq!(spans[0].attr(attrs::STEP_ID).as_deref(), Some("s1"));
    assert_eq!(spans[0].attr(attrs::DYNAMIC_STATUS).as_deref(), Some("completed"));
    assert_eq!(spans[0].attr(attrs::IS_CHECKPOINT).as_deref(), Some("true"));
    assert!(spans[0].opts.start_time.is_some());

    let finalized = h.executor.finalized();
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].status_code, 200);
    assert_eq!(finalized[0].body, None);

    assert!(eventually(|| h.metrics.finished.lock().unwrap().len() == 1).await);
    let (cardinality, status) = h.metrics.finished.lock().unwrap()[0];
    assert_eq!(status, FinishStatus::Completed);
    assert_eq!(cardinality.fn_id, md.id.function_id);
}

#[tokio::test]
async fn test_complete_anywhere_in_batch_skips_persistence() {
    let h = Harness::new();
    let md = h.seed_run(None);

    h.checkpointer
        .checkpoint_sync(sync_input(
            &md,
            vec![
                run_complete(),
                step_run("a", json!(1)),
                step_run("b", json!(2)),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(h.state.save_count(), 0);
    assert!(h.state.steps(md.id.run_id).is_empty());
    assert_eq!(h.tracer.spans().len(), 2);
}

#[tokio::test]
async fn test_repeated_batches_store_each_step_once() {
    let h = Harness::new();
    let md = h.seed_run(None);

    let batch = vec![
        step_run("a", json!({"n": 1})),
        step_run("b", json!("two")),
        step_run("c", Value::Null),
    ];
    let mut reversed = batch.clone();
    reversed.reverse();

    for steps in [batch.clone(), reversed, batch] {
        h.checkpointer
            .checkpoint_sync(sync_input(&md, steps))
            .await
            .unwrap();
    }

    let stored = h.state.steps(md.id.run_id);
    assert_eq!(stored.len(), 3);
    assert_eq!(stored["a"], json!({"data": {"n": 1}}));
    assert_eq!(stored["b"], json!({"data": "two"}));
    assert_eq!(stored["c"], json!({"data": null}));

    // Duplicates are reported by the store and not traced again.
    assert_eq!(h.state.save_count(), 9);
    assert_eq!(h.tracer.spans().len(), 3);
}

#[tokio::test]
async fn test_first_writer_wins() {
    let h = Harness::new();
    let md = h.seed_run(None);

    h.checkpointer
        .checkpoint_sync(sync_input(&md, vec![step_run("a", json!("first"))]))
        .await
        .unwrap();
    h.checkpointer
        .checkpoint_sync(sync_input(&md, vec![step_run("a", json!("second"))]))
        .await
        .unwrap();

    assert_eq!(h.state.steps(md.id.run_id)["a"], json!({"data": "first"}));
}

#[tokio::test]
async fn test_step_error_retry_enqueues_edge() {
    let h = Harness::new();
    let md = h.seed_run(Some(2));
    *h.executor.step_error_outcome.lock().unwrap() = GeneratorOutcome::RetryStep;

    let op = GeneratorOpcode::new(Opcode::StepError, "s-err").with_error(UserError {
        name: "Error".to_string(),
        message: "boom".to_string(),
        stack: None,
        data: None,
    });
    h.checkpointer
        .checkpoint_sync(sync_input(&md, vec![op]))
        .await
        .unwrap();

    let spans = h.tracer.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].attr(attrs::DYNAMIC_STATUS).as_deref(), Some("errored"));
    assert_eq!(spans[0].attr(attrs::STEP_ERROR).as_deref(), Some("Error: boom"));

    assert_eq!(h.executor.generated().len(), 1);
    let enqueued = h.queue.enqueued();
    assert_eq!(enqueued.len(), 1);
    assert_eq!(
        enqueued[0].job_id.as_deref(),
        Some(format!("{}:{}-s-err-sync-retry", md.id.function_id, md.id.run_id).as_str())
    );
    assert_eq!(enqueued[0].kind, QueueKind::Edge);
    assert_eq!(enqueued[0].attempt, 1);
    assert_eq!(enqueued[0].max_attempts, Some(3));
    assert_eq!(enqueued[0].identifier, md.id);
    assert_eq!(h.state.save_count(), 0);
}

#[tokio::test]
async fn test_step_error_handled_does_not_enqueue() {
    let h = Harness::new();
    let md = h.seed_run(None);

    h.checkpointer
        .checkpoint_sync(sync_input(
            &md,
            vec![GeneratorOpcode::new(Opcode::StepFailed, "s-failed")],
        ))
        .await
        .unwrap();

    assert_eq!(h.executor.generated().len(), 1);
    assert!(h.queue.enqueued().is_empty());
}

#[tokio::test]
async fn test_async_opcodes_switch_mode_once_and_mint_token() {
    let h = Harness::new().with_run_jwt_secret("run-secret");
    let mut md = h.seed_run(None);
    md.config.run_span = Some(SpanReference::root(Some(b"run".as_slice())));
    h.state.insert(md.clone());

    let outcome = h
        .checkpointer
        .checkpoint_sync(sync_input(
            &md,
            vec![
                step_run("a", json!(1)),
                GeneratorOpcode::new(Opcode::Sleep, "nap"),
                GeneratorOpcode::new(Opcode::WaitForEvent, "wait"),
                GeneratorOpcode::new(Opcode::from("Teleport"), "future"),
            ],
        ))
        .await
        .unwrap();

    assert!(outcome.went_async);
    assert!(!outcome.complete);
    assert_eq!(h.state.steps(md.id.run_id).len(), 1);

    let generated: Vec<String> = h.executor.generated().into_iter().map(|op| op.id).collect();
    assert_eq!(generated, vec!["nap", "wait", "future"]);

    let updates = h.tracer.updates();
    assert_eq!(updates.len(), 1);
    assert!(updates[0]
        .attributes
        .get(attrs::DURABLE_ENDPOINT_MODE_CHANGED_AT)
        .is_some());

    let token = outcome.token.expect("token minted");
    let claims = verify_run_jwt(b"run-secret", &token).unwrap();
    assert_eq!(claims.run_id().unwrap(), md.id.run_id);
    assert_eq!(claims.env, md.id.tenant.env_id);
}

#[tokio::test]
async fn test_no_token_without_secret_or_async_op() {
    let h = Harness::new();
    let md = h.seed_run(None);
    let outcome = h
        .checkpointer
        .checkpoint_sync(sync_input(&md, vec![GeneratorOpcode::new(Opcode::Sleep, "nap")]))
        .await
        .unwrap();
    assert!(outcome.went_async);
    assert_eq!(outcome.token, None);

    let h = Harness::new().with_run_jwt_secret("run-secret");
    let md = h.seed_run(None);
    let outcome = h
        .checkpointer
        .checkpoint_sync(sync_input(&md, vec![step_run("a", json!(1))]))
        .await
        .unwrap();
    assert_eq!(outcome.token, None);
}

#[tokio::test]
async fn test_tracer_failure_does_not_abort_batch() {
    let h = Harness::new();
    let md = h.seed_run(None);
    h.tracer.fail.store(true, Ordering::SeqCst);

    h.checkpointer
        .checkpoint_sync(sync_input(
            &md,
            vec![step_run("a", json!(1)), step_run("b", json!(2))],
        ))
        .await
        .unwrap();

    assert_eq!(h.state.steps(md.id.run_id).len(), 2);
}

#[tokio::test]
async fn test_sync_missing_run_or_function_is_fatal() {
    let h = Harness::new();
    let md = h.seed_run(None);

    let mut unknown = md.clone();
    unknown.id.run_id = ulid::Ulid::new();
    let err = h
        .checkpointer
        .checkpoint_sync(sync_input(&unknown, vec![step_run("a", json!(1))]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::RunNotFound { .. }));

    h.functions.functions.lock().unwrap().clear();
    let err = h
        .checkpointer
        .checkpoint_sync(sync_input(&md, vec![step_run("a", json!(1))]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::FunctionNotFound { .. }));
    assert_eq!(h.state.save_count(), 0);

    h.state.fail_loads.store(true, Ordering::SeqCst);
    let err = h
        .checkpointer
        .checkpoint_sync(sync_input(&md, vec![step_run("a", json!(1))]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StateError { .. }));
}

#[tokio::test]
async fn test_preloaded_function_skips_lookup() {
    let h = Harness::new();
    let md = h.seed_run(None);
    h.functions.functions.lock().unwrap().clear();

    let mut input = sync_input(&md, vec![step_run("a", json!(1))]);
    input.metadata = Some(md.clone());
    input.function = Some(function(md.id.function_id, None));

    h.checkpointer.checkpoint_sync(input).await.unwrap();
    assert_eq!(h.state.steps(md.id.run_id).len(), 1);
}

// ============================================================================
// Async path
// ============================================================================

#[tokio::test]
async fn test_async_three_steps_reset_queue_item() {
    let h = Harness::new();
    let md = h.seed_run(None);
    let t0 = Utc::now().timestamp_millis();

    let steps = (1..=3)
        .map(|n| {
            let start = t0 + (n - 1) * 100;
            step_run(&format!("step-{}", n), json!({"result": format!("step {} output", n)}))
                .with_timing(Timing::from((start, start + 100)))
        })
        .collect();

    h.checkpointer
        .checkpoint_async(async_input(
            &md,
            QueueRef::new("job-123", "shard-1").encode(),
            steps,
        ))
        .await
        .unwrap();

    let saves = h.state.save_calls.lock().unwrap().clone();
    assert_eq!(saves.len(), 3);
    for (n, (step_id, output)) in saves.iter().enumerate() {
        assert_eq!(step_id, &format!("step-{}", n + 1));
        let output: Value = serde_json::from_slice(output).unwrap();
        assert_eq!(
            output,
            json!({"data": {"result": format!("step {} output", n + 1)}})
        );
    }

    let spans = h.tracer.spans();
    assert_eq!(spans.len(), 3);
    for span in &spans {
        assert_eq!(span.name, SPAN_NAME_STEP);
        assert_eq!(span.attr(attrs::DYNAMIC_STATUS).as_deref(), Some("completed"));
        assert!(span.opts.seed.is_some());
    }

    assert_eq!(
        h.queue.resets(),
        vec![("shard-1".to_string(), "job-123".to_string())]
    );
}

#[tokio::test]
async fn test_async_spans_are_seeded_by_step_and_timing() {
    let h = Harness::new();
    let md = h.seed_run(None);
    let op = step_run("a", json!(1)).with_timing(Timing::from((10, 20)));

    h.checkpointer
        .checkpoint_async(async_input(&md, String::new(), vec![op.clone()]))
        .await
        .unwrap();

    let spans = h.tracer.spans();
    assert_eq!(spans[0].opts.seed.as_deref(), Some(b"a10-20".as_slice()));
    assert_eq!(op.span_seed(), b"a10-20".to_vec());
}

#[tokio::test]
async fn test_async_rejects_batches_with_async_opcodes() {
    let h = Harness::new();
    let md = h.seed_run(None);

    let err = h
        .checkpointer
        .checkpoint_async(async_input(
            &md,
            QueueRef::new("job-123", "shard-1").encode(),
            vec![
                GeneratorOpcode::new(Opcode::Sleep, "nap"),
                step_run("a", json!(1)),
            ],
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::InvalidOpcode { .. }));
    assert_eq!(err.http_status(), axum::http::StatusCode::BAD_REQUEST);
    assert_eq!(h.state.save_count(), 0);
    assert!(h.tracer.spans().is_empty());
    assert!(h.queue.resets().is_empty());
}

#[tokio::test]
async fn test_async_rejects_unimplemented_sync_opcodes() {
    let h = Harness::new();
    let md = h.seed_run(None);

    let err = h
        .checkpointer
        .checkpoint_async(async_input(
            &md,
            QueueRef::new("job-123", "shard-1").encode(),
            vec![step_run("a", json!(1)), run_complete()],
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::InvalidOpcode { .. }));
    assert_eq!(h.state.steps(md.id.run_id).len(), 1);
    assert!(h.queue.resets().is_empty());
}

#[tokio::test]
async fn test_async_ref_without_job_or_shard_skips_reset() {
    let h = Harness::new();
    let md = h.seed_run(None);

    for qref in [
        String::new(),
        "%%%not base64".to_string(),
        QueueRef::new("job-123", "").encode(),
        STANDARD.encode("job-123"),
    ] {
        h.checkpointer
            .checkpoint_async(async_input(&md, qref, vec![step_run("a", json!(1))]))
            .await
            .unwrap();
    }

    assert!(h.queue.resets().is_empty());
}

#[tokio::test]
async fn test_async_missing_run() {
    let h = Harness::new();
    let mut md = h.seed_run(None);
    md.id.run_id = ulid::Ulid::new();

    let err = h
        .checkpointer
        .checkpoint_async(async_input(&md, String::new(), vec![step_run("a", json!(1))]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::RunNotFound { .. }));
    assert_eq!(err.http_status(), axum::http::StatusCode::NOT_FOUND);
}
