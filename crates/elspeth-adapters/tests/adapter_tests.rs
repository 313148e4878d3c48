//! Tests de los plugins de referencia contra el contrato del core.

use std::io::Write;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use elspeth_adapters::{builtin_registry, ConditionGate, MemorySink, StaticSource};
use elspeth_core::landscape::{InMemoryLandscape, InMemoryPayloadStore};
use elspeth_core::plugin::{GateDecision, GatePlugin, PluginContext, SinkPlugin, SourcePlugin, SourcePoll,
                           TransformPlugin, TransformResult};
use elspeth_core::ratelimit::RateLimitRegistry;

fn test_ctx() -> PluginContext {
    PluginContext { run_id: Uuid::new_v4(),
                    row_id: "row-0".to_string(),
                    token_id: Uuid::new_v4(),
                    node_id: "node".to_string(),
                    effective_options: Value::Null,
                    landscape: Arc::new(InMemoryLandscape::new()),
                    payloads: Arc::new(InMemoryPayloadStore::new()),
                    rate_limits: Arc::new(RateLimitRegistry::new()),
                    telemetry: None }
}

#[test]
fn static_source_emits_rows_then_exhausts() {
    let mut source = StaticSource::new(vec![json!({"id": 1}), json!({"id": 2})]);
    let ctx = test_ctx();

    assert!(matches!(source.next_row(&ctx).unwrap(), SourcePoll::Row(row) if row == json!({"id": 1})));
    assert!(matches!(source.next_row(&ctx).unwrap(), SourcePoll::Row(row) if row == json!({"id": 2})));
    assert!(matches!(source.next_row(&ctx).unwrap(), SourcePoll::Exhausted));
    // Exhausted es estable.
    assert!(matches!(source.next_row(&ctx).unwrap(), SourcePoll::Exhausted));
}

#[test]
fn jsonl_source_reads_one_row_per_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input.jsonl");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "{}", json!({"id": 1})).unwrap();
    writeln!(file).unwrap();
    writeln!(file, "{}", json!({"id": 2})).unwrap();

    let registry = builtin_registry();
    let mut source = registry.make_source("jsonl", &json!({"path": path.to_str().unwrap()})).unwrap();
    let ctx = test_ctx();

    assert!(matches!(source.next_row(&ctx).unwrap(), SourcePoll::Row(row) if row == json!({"id": 1})));
    // La línea en blanco se saltea.
    assert!(matches!(source.next_row(&ctx).unwrap(), SourcePoll::Row(row) if row == json!({"id": 2})));
    assert!(matches!(source.next_row(&ctx).unwrap(), SourcePoll::Exhausted));
}

#[test]
fn condition_gate_routes_on_threshold() {
    let gate = ConditionGate::from_options(&json!({
        "name": "threshold",
        "condition": "score > 50",
        "routes": {"flag": "flagged_sink"}
    })).unwrap();
    let ctx = test_ctx();

    assert_eq!(gate.decide(&json!({"score": 90}), &ctx).unwrap(), GateDecision::Route("flag".to_string()));
    assert_eq!(gate.decide(&json!({"score": 10}), &ctx).unwrap(), GateDecision::Route("continue".to_string()));
    // Campo ausente: la condición no matchea.
    assert_eq!(gate.decide(&json!({}), &ctx).unwrap(), GateDecision::Route("continue".to_string()));
}

#[test]
fn condition_gate_supports_equality_on_strings() {
    let gate = ConditionGate::from_options(&json!({
        "name": "kind",
        "condition": "kind == 'priority'",
        "routes": {"fast": "fast_sink"}
    })).unwrap();
    let ctx = test_ctx();

    assert_eq!(gate.decide(&json!({"kind": "priority"}), &ctx).unwrap(),
               GateDecision::Route("fast".to_string()));
    assert_eq!(gate.decide(&json!({"kind": "bulk"}), &ctx).unwrap(),
               GateDecision::Route("continue".to_string()));
}

#[test]
fn fork_gate_decides_fork_when_condition_holds() {
    let gate = ConditionGate::from_options(&json!({
        "name": "splitter",
        "condition": "true",
        "fork_to": ["a", "b"]
    })).unwrap();
    let ctx = test_ctx();

    assert_eq!(gate.decide(&json!({"id": 1}), &ctx).unwrap(), GateDecision::Fork);
    assert_eq!(gate.fork_branches(), Some(vec!["a".to_string(), "b".to_string()]));
}

#[test]
fn invalid_conditions_fail_at_construction() {
    let err = ConditionGate::from_options(&json!({
        "name": "broken",
        "condition": "score maybe 50"
    }));
    assert!(err.is_err());

    let err = ConditionGate::from_options(&json!({
        "name": "broken",
        "condition": ">= 50"
    }));
    assert!(err.is_err());
}

#[test]
fn memory_sink_dedup_requires_idempotent_flag() {
    let ctx = test_ctx();
    let mut plain = MemorySink::new();
    plain.write(&json!({"id": 1}), &ctx).unwrap();
    let ack = plain.write(&json!({"id": 1}), &ctx).unwrap();
    assert!(!ack.deduplicated);
    assert_eq!(plain.capture_handle().lock().unwrap().len(), 2);

    let mut dedup = MemorySink::new().idempotent();
    dedup.write(&json!({"id": 1}), &ctx).unwrap();
    let ack = dedup.write(&json!({"id": 1}), &ctx).unwrap();
    assert!(ack.deduplicated);
    assert_eq!(dedup.capture_handle().lock().unwrap().len(), 1);
}

#[test]
fn jsonl_sink_round_trips_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.jsonl");
    let registry = builtin_registry();
    let mut sink = registry.make_sink("jsonl", &json!({"path": path.to_str().unwrap()})).unwrap();
    let ctx = test_ctx();

    sink.write(&json!({"id": 1, "v": "a"}), &ctx).unwrap();
    sink.write(&json!({"id": 2, "v": "b"}), &ctx).unwrap();
    sink.close().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(lines, vec![json!({"id": 1, "v": "a"}), json!({"id": 2, "v": "b"})]);
}

#[test]
fn split_transform_produces_success_multi() {
    let registry = builtin_registry();
    let transform = registry.make_transform("split", &json!({"field": "items"})).unwrap();
    let ctx = test_ctx();

    match transform.process(json!({"id": 1, "items": ["x", "y"]}), &ctx) {
        TransformResult::SuccessMulti { rows, .. } => {
            assert_eq!(rows, vec![json!({"id": 1, "items": "x"}), json!({"id": 1, "items": "y"})]);
        }
        other => panic!("expected SuccessMulti, got {other:?}"),
    }

    // Campo que no es array: error terminal.
    assert!(matches!(transform.process(json!({"id": 1, "items": 7}), &ctx), TransformResult::Error(_)));
}

#[test]
fn set_fields_declares_added_fields() {
    let registry = builtin_registry();
    let transform = registry.make_transform("set_fields", &json!({"fields": {"stage": "enriched"}})).unwrap();
    let ctx = test_ctx();

    match transform.process(json!({"id": 1}), &ctx) {
        TransformResult::Success { row, reason } => {
            assert_eq!(row, json!({"id": 1, "stage": "enriched"}));
            assert_eq!(reason.unwrap().fields_added, vec!["stage".to_string()]);
        }
        other => panic!("expected Success, got {other:?}"),
    }
}

#[test]
fn registry_rejects_unknown_plugin_names() {
    let registry = builtin_registry();
    assert!(registry.make_source("nope", &Value::Null).is_err());
    assert!(registry.make_transform("nope", &Value::Null).is_err());
    assert!(registry.make_gate("nope", &Value::Null).is_err());
    assert!(registry.make_sink("nope", &Value::Null).is_err());
}
