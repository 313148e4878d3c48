//! Hashes de contenido: forma canónica y kinds con nombre.

use serde_json::json;

use elspeth_core::hashing::{canonical_json, config_fingerprint, content_hash, error_hash, payload_address};

#[test]
fn canonical_json_sorts_object_keys_at_every_level() {
    let value = json!({"z": 1, "a": {"d": true, "b": [2, 1]}});
    assert_eq!(canonical_json(&value), r#"{"a":{"b":[2,1],"d":true},"z":1}"#);
}

#[test]
fn canonical_json_escapes_keys_and_strings() {
    let value = json!({"qu\"ote": "line\nbreak"});
    assert_eq!(canonical_json(&value), r#"{"qu\"ote":"line\nbreak"}"#);
}

#[test]
fn content_hash_ignores_key_insertion_order() {
    let a = json!({"id": 1, "v": "a", "nested": {"x": 1, "y": 2}});
    let b = json!({"nested": {"y": 2, "x": 1}, "v": "a", "id": 1});
    assert_eq!(content_hash(&a), content_hash(&b));
}

#[test]
fn content_hash_is_sensitive_to_array_order() {
    // El orden de un array ES contenido; no se normaliza.
    assert_ne!(content_hash(&json!({"items": [1, 2]})), content_hash(&json!({"items": [2, 1]})));
}

#[test]
fn identical_error_reasons_share_a_hash() {
    let reason = json!({"error_type": "plugin", "kind": "rate_limit", "message": "quota"});
    assert_eq!(error_hash(&reason), error_hash(&reason.clone()));
    assert_ne!(error_hash(&reason), error_hash(&json!({"error_type": "schema_validation"})));
}

#[test]
fn config_fingerprint_changes_with_the_document() {
    let base = json!({"default_sink": "out", "engine_version": "1.0"});
    let mut changed = base.clone();
    changed["default_sink"] = json!("elsewhere");
    assert_ne!(config_fingerprint(&base), config_fingerprint(&changed));
}

#[test]
fn payload_address_hashes_raw_bytes() {
    // Sobre bytes crudos, sin canonicalización: el mismo JSON con distinto
    // orden textual tiene direcciones distintas.
    let a = payload_address(br#"{"a":1,"b":2}"#);
    let b = payload_address(br#"{"b":2,"a":1}"#);
    assert_ne!(a, b);
    assert_eq!(a.len(), 64, "hex digest");
}
