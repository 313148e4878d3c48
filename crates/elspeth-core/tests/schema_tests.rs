//! Compatibilidad de esquemas y validación de filas.

use serde_json::json;

use elspeth_core::schema::{missing_required_fields, validate_row, FieldDef, FieldType, Schema};

fn strict(fields: Vec<FieldDef>) -> Schema {
    Schema::strict(fields)
}

#[test]
fn dynamic_schemas_are_trivially_compatible() {
    let typed = strict(vec![FieldDef::required("a", FieldType::Int)]);
    assert!(missing_required_fields(&Schema::Dynamic, &typed).is_empty());
    assert!(missing_required_fields(&typed, &Schema::Dynamic).is_empty());
    assert!(missing_required_fields(&Schema::Dynamic, &Schema::Dynamic).is_empty());
}

#[test]
fn missing_required_fields_are_sorted() {
    let producer = strict(vec![FieldDef::required("a", FieldType::Int)]);
    let consumer = strict(vec![FieldDef::required("z", FieldType::Str),
                               FieldDef::required("a", FieldType::Int),
                               FieldDef::required("b", FieldType::Bool)]);
    assert_eq!(missing_required_fields(&producer, &consumer), vec!["b".to_string(), "z".to_string()]);
}

#[test]
fn optional_consumer_fields_do_not_count_as_missing() {
    let producer = strict(vec![FieldDef::required("a", FieldType::Int)]);
    let consumer = strict(vec![FieldDef::required("a", FieldType::Int),
                               FieldDef::optional("extra", FieldType::Str)]);
    assert!(missing_required_fields(&producer, &consumer).is_empty());
}

#[test]
fn numeric_widening_int_to_float_is_the_only_subtype_edge() {
    let int_producer = strict(vec![FieldDef::required("x", FieldType::Int)]);
    let float_consumer = strict(vec![FieldDef::required("x", FieldType::Float)]);
    assert!(missing_required_fields(&int_producer, &float_consumer).is_empty());

    // La dirección inversa no ensancha.
    let float_producer = strict(vec![FieldDef::required("x", FieldType::Float)]);
    let int_consumer = strict(vec![FieldDef::required("x", FieldType::Int)]);
    assert_eq!(missing_required_fields(&float_producer, &int_consumer), vec!["x".to_string()]);

    // Tipos distintos no numéricos: igualdad exacta.
    let str_consumer = strict(vec![FieldDef::required("x", FieldType::Str)]);
    assert_eq!(missing_required_fields(&int_producer, &str_consumer), vec!["x".to_string()]);
}

#[test]
fn type_mismatch_counts_as_missing() {
    let producer = strict(vec![FieldDef::required("a", FieldType::Str)]);
    let consumer = strict(vec![FieldDef::required("a", FieldType::Bool)]);
    assert_eq!(missing_required_fields(&producer, &consumer), vec!["a".to_string()]);
}

#[test]
fn validate_row_reports_structured_field_errors() {
    let schema = strict(vec![FieldDef::required("id", FieldType::Int),
                             FieldDef::required("name", FieldType::Str),
                             FieldDef::optional("score", FieldType::Float)]);

    assert!(validate_row(&schema, &json!({"id": 1, "name": "x"})).is_ok());
    assert!(validate_row(&schema, &json!({"id": 1, "name": "x", "score": 0.5})).is_ok());
    // Int satisface Float en runtime también.
    assert!(validate_row(&schema, &json!({"id": 1, "name": "x", "score": 2})).is_ok());

    let errors = validate_row(&schema, &json!({"id": "oops"})).unwrap_err();
    let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
    assert_eq!(fields, vec!["id", "name"], "sorted by field name");
}

#[test]
fn declared_default_covers_a_missing_required_field() {
    let mut with_default = FieldDef::required("mode", FieldType::Str);
    with_default.default = Some(json!("standard"));
    let schema = strict(vec![with_default]);
    assert!(validate_row(&schema, &json!({})).is_ok());
}

#[test]
fn validate_row_rejects_non_object_rows() {
    let schema = strict(vec![FieldDef::required("id", FieldType::Int)]);
    assert!(validate_row(&schema, &json!([1, 2, 3])).is_err());
    assert!(validate_row(&Schema::Dynamic, &json!([1, 2, 3])).is_ok());
}

#[test]
fn datetime_fields_require_rfc3339_strings() {
    let schema = strict(vec![FieldDef::required("ts", FieldType::DateTime)]);
    assert!(validate_row(&schema, &json!({"ts": "2026-01-15T10:30:00Z"})).is_ok());
    assert!(validate_row(&schema, &json!({"ts": "yesterday"})).is_err());
}
