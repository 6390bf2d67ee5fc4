// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle tests: invocation, the run loop, transforms, retry,
//! limits, and wake-handler idempotence.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use kestrel_model::StateType;
use proptest::prelude::*;
use serde_json::{json, Value};

#[tokio::test]
async fn test_two_state_noop_chain_completes() {
    let h = Harness::new().await;
    h.put_workflow(
        "two-noop",
        json!({
            "states": [
                {"id": "a", "type": "noop", "transform": ". + {\"b\": 2}", "transition": "b"},
                {"id": "b", "type": "noop"}
            ]
        }),
    )
    .await;

    let id = h
        .engine
        .direct_invoke(NS, "two-noop", br#"{"a": 1}"#)
        .await
        .unwrap();

    let record = h.wait_for_status(&id, "complete").await;
    assert_eq!(record.flow, vec!["a".to_string(), "b".to_string()]);
    let output: Value = serde_json::from_str(record.output.as_deref().unwrap()).unwrap();
    assert_eq!(output, json!({"a": 1, "b": 2}));
    assert!(record.end_time.is_some());
    assert!(record.error_code.is_none());
}

#[tokio::test]
async fn test_instance_id_format() {
    let h = Harness::new().await;
    h.put_workflow("fmt", json!({"states": [{"id": "a", "type": "noop"}]}))
        .await;

    let id = h.engine.direct_invoke(NS, "fmt", b"{}").await.unwrap();
    let re = regex::Regex::new(r"^[^/]+/[^/]+/[A-Za-z]{6}$").unwrap();
    assert!(re.is_match(&id), "bad instance id: {id}");
    assert!(id.starts_with("test/fmt/"));
}

#[tokio::test]
async fn test_non_object_input_is_wrapped() {
    let h = Harness::new().await;
    h.put_workflow("wrap", json!({"states": [{"id": "a", "type": "noop"}]}))
        .await;

    let id = h.engine.direct_invoke(NS, "wrap", b"[1, 2]").await.unwrap();
    let record = h.wait_for_status(&id, "complete").await;
    let output: Value = serde_json::from_str(record.output.as_deref().unwrap()).unwrap();
    assert_eq!(output, json!({"input": [1, 2]}));
}

#[tokio::test]
async fn test_invoking_missing_workflow_fails() {
    let h = Harness::new().await;
    let err = h.engine.direct_invoke(NS, "ghost", b"{}").await.unwrap_err();
    assert_eq!(err.code(), "direktiv.subflow.notExist");
}

#[tokio::test]
async fn test_start_type_gates_invocation() {
    let h = Harness::new().await;
    h.put_workflow(
        "cron-only",
        json!({
            "start": {"type": "scheduled"},
            "states": [{"id": "a", "type": "noop"}]
        }),
    )
    .await;
    let wf_default = h
        .put_workflow("api-only", json!({"states": [{"id": "a", "type": "noop"}]}))
        .await;

    let err = h
        .engine
        .direct_invoke(NS, "cron-only", b"{}")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "direktiv.workflow.start");

    let err = h.engine.cron_invoke(wf_default).await.unwrap_err();
    assert_eq!(err.code(), "direktiv.workflow.start");
}

#[tokio::test]
async fn test_cron_invoke_runs_with_empty_input() {
    let h = Harness::new().await;
    let wf_id = h
        .put_workflow(
            "nightly",
            json!({
                "start": {"type": "scheduled"},
                "states": [{"id": "a", "type": "noop"}]
            }),
        )
        .await;

    let id = h.engine.cron_invoke(wf_id).await.unwrap();
    let record = h.wait_for_status(&id, "complete").await;
    let output: Value = serde_json::from_str(record.output.as_deref().unwrap()).unwrap();
    assert_eq!(output, json!({}));
}

#[tokio::test]
async fn test_events_invoke_synthesizes_input() {
    use cloudevents::{EventBuilder, EventBuilderV10};

    let h = Harness::new().await;
    let wf_id = h
        .put_workflow(
            "on-event",
            json!({
                "start": {"type": "event"},
                "states": [{"id": "a", "type": "noop"}]
            }),
        )
        .await;

    let event = EventBuilderV10::new()
        .id("ev-1")
        .ty("typeA")
        .source("tests")
        .data("application/json", json!({"k": 1}))
        .build()
        .unwrap();
    h.engine.events_invoke(wf_id, vec![event]).await;

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let id = loop {
        let ids = h.store.instance_ids();
        if let Some(id) = ids.first() {
            break id.clone();
        }
        assert!(std::time::Instant::now() < deadline, "no instance created");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let record = h.wait_for_status(&id, "complete").await;
    let output: Value = serde_json::from_str(record.output.as_deref().unwrap()).unwrap();
    assert_eq!(output, json!({"typeA": {"k": 1}}));
}

#[tokio::test]
async fn test_events_invoke_rejects_default_start() {
    use cloudevents::{EventBuilder, EventBuilderV10};

    let h = Harness::new().await;
    let wf_id = h
        .put_workflow("plain", json!({"states": [{"id": "a", "type": "noop"}]}))
        .await;

    let event = EventBuilderV10::new()
        .id("ev-1")
        .ty("typeA")
        .source("tests")
        .build()
        .unwrap();
    h.engine.events_invoke(wf_id, vec![event]).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.store.instance_count(), 0);
}

#[tokio::test]
async fn test_step_limit_aborts_instance() {
    let h = Harness::new().await;
    let states: Vec<Value> = (1..=12)
        .map(|i| {
            if i < 12 {
                json!({"id": format!("s{i}"), "type": "noop", "transition": format!("s{}", i + 1)})
            } else {
                json!({"id": "s12", "type": "noop"})
            }
        })
        .collect();
    h.put_workflow("runaway", json!({ "states": states })).await;

    let id = h.engine.direct_invoke(NS, "runaway", b"{}").await.unwrap();
    let record = h.wait_for_status(&id, "failed").await;
    assert_eq!(record.error_code.as_deref(), Some("direktiv.limits.steps"));
    // the eleventh state was entered but never executed
    assert_eq!(record.flow.len(), 11);
}

#[tokio::test]
async fn test_retry_converges_after_transient_failures() {
    let h = Harness::with_builder(|b| b.logic(StateType::Validate, flaky_factory())).await;
    h.put_workflow(
        "flaky",
        json!({
            "states": [{
                "id": "s",
                "type": "validate",
                "succeedAfter": 2,
                "catch": [{
                    "error": "direktiv\\.test\\..*",
                    "retry": {"maxAttempts": 3, "delay": "PT0S", "multiplier": 2.0},
                    "transition": "recover"
                }]
            }, {
                "id": "recover",
                "type": "noop"
            }]
        }),
    )
    .await;

    let id = h.engine.direct_invoke(NS, "flaky", b"{}").await.unwrap();
    let record = h.wait_for_status(&id, "complete").await;
    // the third attempt succeeded in place
    assert_eq!(record.attempts, 2);
    assert_eq!(record.flow, vec!["s".to_string()]);
    assert!(record.error_code.is_none());
}

#[tokio::test]
async fn test_exhausted_retries_fall_through_to_catcher_transition() {
    let h = Harness::with_builder(|b| b.logic(StateType::Validate, flaky_factory())).await;
    h.put_workflow(
        "stubborn",
        json!({
            "states": [{
                "id": "s",
                "type": "validate",
                "succeedAfter": 99,
                "catch": [{
                    "error": "direktiv\\.test\\..*",
                    "retry": {"maxAttempts": 2, "delay": "PT0S", "multiplier": 0.0},
                    "transition": "recover"
                }]
            }, {
                "id": "recover",
                "type": "noop"
            }]
        }),
    )
    .await;

    let id = h.engine.direct_invoke(NS, "stubborn", b"{}").await.unwrap();
    let record = h.wait_for_status(&id, "complete").await;
    assert_eq!(record.flow, vec!["s".to_string(), "recover".to_string()]);
    // caught errors are not recorded on the instance
    assert!(record.error_code.is_none());
}

#[tokio::test]
async fn test_first_matching_catcher_wins() {
    let h = Harness::with_builder(|b| b.logic(StateType::Validate, flaky_factory())).await;
    h.put_workflow(
        "ordered",
        json!({
            "states": [{
                "id": "s",
                "type": "validate",
                "succeedAfter": 99,
                "catch": [
                    {"error": ".*", "transition": "first"},
                    {"error": "direktiv\\..*", "transition": "second"}
                ]
            }, {
                "id": "first",
                "type": "noop"
            }, {
                "id": "second",
                "type": "noop"
            }]
        }),
    )
    .await;

    let id = h.engine.direct_invoke(NS, "ordered", b"{}").await.unwrap();
    let record = h.wait_for_status(&id, "complete").await;
    assert_eq!(record.flow, vec!["s".to_string(), "first".to_string()]);
}

#[tokio::test]
async fn test_uncaught_error_fails_instance() {
    let h = Harness::with_builder(|b| b.logic(StateType::Validate, flaky_factory())).await;
    h.put_workflow(
        "doomed",
        json!({
            "states": [{
                "id": "s",
                "type": "validate",
                "succeedAfter": 99,
                "catch": [{"error": "some\\.other\\.code", "transition": "s"}]
            }]
        }),
    )
    .await;

    let id = h.engine.direct_invoke(NS, "doomed", b"{}").await.unwrap();
    let record = h.wait_for_status(&id, "failed").await;
    assert_eq!(record.error_code.as_deref(), Some("direktiv.test.x"));
    assert_eq!(record.error_message.as_deref(), Some("flaky state failed"));
    assert!(record.end_time.is_some());
}

#[tokio::test]
async fn test_error_code_is_written_at_most_once() {
    let second_raise = Arc::new(Mutex::new(None));
    let h = Harness::with_builder(|b| {
        b.logic(StateType::Error, double_raise_factory(second_raise.clone()))
    })
    .await;
    h.put_workflow(
        "double-raise",
        json!({"states": [{"id": "s", "type": "error"}]}),
    )
    .await;

    let id = h
        .engine
        .direct_invoke(NS, "double-raise", b"{}")
        .await
        .unwrap();
    let record = h.wait_for_status(&id, "failed").await;

    // the first raise sticks, the second was refused
    assert_eq!(record.error_code.as_deref(), Some("direktiv.test.first"));
    assert_eq!(
        second_raise.lock().unwrap().as_deref(),
        Some("direktiv.workflow.multipleErrors")
    );
}

#[tokio::test]
async fn test_bad_transform_is_a_catchable_failure() {
    let h = Harness::new().await;
    h.put_workflow(
        "bad-transform",
        json!({
            "states": [{"id": "a", "type": "noop", "transform": ".foo + \"x\" + 1"}]
        }),
    )
    .await;

    let id = h
        .engine
        .direct_invoke(NS, "bad-transform", b"{}")
        .await
        .unwrap();
    let record = h.wait_for_status(&id, "failed").await;
    assert_eq!(record.error_code.as_deref(), Some("direktiv.jq.badCommand"));
}

#[tokio::test]
async fn test_non_object_transform_result_fails() {
    let h = Harness::new().await;
    h.put_workflow(
        "scalar-transform",
        json!({
            "states": [{"id": "a", "type": "noop", "transform": "1 + 1"}]
        }),
    )
    .await;

    let id = h
        .engine
        .direct_invoke(NS, "scalar-transform", b"{}")
        .await
        .unwrap();
    let record = h.wait_for_status(&id, "failed").await;
    assert_eq!(record.error_code.as_deref(), Some("direktiv.jq.notObject"));
}

#[tokio::test]
async fn test_sleep_wakeup_resumes_delay_state() {
    let h = Harness::new().await;
    h.put_workflow(
        "nap",
        json!({
            "states": [
                {"id": "d", "type": "delay", "duration": "PT0.05S", "transition": "end"},
                {"id": "end", "type": "noop"}
            ]
        }),
    )
    .await;

    let id = h.engine.direct_invoke(NS, "nap", b"{}").await.unwrap();
    let record = h.wait_for_status(&id, "complete").await;
    assert_eq!(record.flow, vec!["d".to_string(), "end".to_string()]);
}

#[tokio::test]
async fn test_duplicate_sleep_wakeup_is_idempotent() {
    let h = Harness::new().await;
    h.put_workflow(
        "long-nap",
        json!({
            "states": [
                {"id": "d", "type": "delay", "duration": "PT1H", "transition": "end"},
                {"id": "end", "type": "noop"}
            ]
        }),
    )
    .await;

    let id = h.engine.direct_invoke(NS, "long-nap", b"{}").await.unwrap();
    h.wait_for(&id, "suspension", |r| r.flow.len() == 1 && r.status == "running")
        .await;

    let payload =
        serde_json::to_vec(&json!({"instance_id": id, "state": "d", "step": 1})).unwrap();

    // first delivery wakes the instance
    h.engine.sleep_wakeup(&payload).await;
    let record = h.wait_for_status(&id, "complete").await;
    assert_eq!(record.flow.len(), 2);
    let end_time = record.end_time;

    // second delivery observes the step mismatch and aborts
    h.engine.sleep_wakeup(&payload).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.instance(&id).await;
    assert_eq!(record.status, "complete");
    assert_eq!(record.flow.len(), 2);
    assert_eq!(record.end_time, end_time);
}

#[tokio::test]
async fn test_stale_retry_wakeup_aborts() {
    let h = Harness::new().await;
    h.put_workflow(
        "parked",
        json!({
            "states": [{"id": "d", "type": "delay", "duration": "PT1H"}]
        }),
    )
    .await;

    let id = h.engine.direct_invoke(NS, "parked", b"{}").await.unwrap();
    h.wait_for(&id, "suspension", |r| r.flow.len() == 1 && r.status == "running")
        .await;

    for stale_step in [0usize, 2] {
        let payload = serde_json::to_vec(
            &json!({"instance_id": id, "state": "d", "step": stale_step}),
        )
        .unwrap();
        h.engine.retry_wakeup(&payload).await;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.instance(&id).await;
    assert_eq!(record.status, "running");
    assert_eq!(record.flow.len(), 1);
}

proptest! {
    #[test]
    fn prop_backoff_with_unit_multiplier_is_identity(secs in 0u64..3600, attempt in 0i32..10) {
        let base = Duration::from_secs(secs);
        prop_assert_eq!(kestrel_core::duration::backoff(base, 1.0, attempt), base);
        prop_assert_eq!(kestrel_core::duration::backoff(base, 0.0, attempt), base);
    }

    #[test]
    fn prop_backoff_grows_with_attempts(secs in 1u64..3600, attempt in 0i32..10) {
        let base = Duration::from_secs(secs);
        let this = kestrel_core::duration::backoff(base, 2.0, attempt);
        let next = kestrel_core::duration::backoff(base, 2.0, attempt + 1);
        prop_assert!(next >= this);
        prop_assert_eq!(next.as_secs_f64(), this.as_secs_f64() * 2.0);
    }
}
