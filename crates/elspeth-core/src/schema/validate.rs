//! Validación de filas concretas contra un esquema en runtime.
//!
//! Distinto de la compatibilidad entre esquemas (build time): aquí se valida
//! el shape real de una fila antes de entregarla a un nodo. El resultado es
//! estructurado (`FieldError`) para que pueda viajar dentro de un
//! `TransformErrorReason` y quedar en el audit trail.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Schema;

/// Error de validación de un campo concreto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

/// Valida `row` contra `schema`. `Ok(())` para esquemas dinámicos o filas
/// conformes; `Err` con la lista de errores por campo, ordenada por nombre.
pub fn validate_row(schema: &Schema, row: &Value) -> Result<(), Vec<FieldError>> {
    let fields = match schema {
        Schema::Dynamic => return Ok(()),
        Schema::Strict { fields } => fields,
    };

    let obj = match row.as_object() {
        Some(obj) => obj,
        None => {
            return Err(vec![FieldError { field: String::new(),
                                         reason: "row is not a JSON object".to_string() }])
        }
    };

    let mut errors: Vec<FieldError> = Vec::new();
    for def in fields {
        match obj.get(&def.name) {
            None | Some(Value::Null) => {
                // Un default declarado cubre la ausencia; required sin default no.
                if def.required && def.default.is_none() {
                    errors.push(FieldError { field: def.name.clone(),
                                             reason: "required field missing".to_string() });
                }
            }
            Some(v) => {
                if !def.ty.matches_value(v) {
                    errors.push(FieldError { field: def.name.clone(),
                                             reason: format!("expected {:?}", def.ty) });
                }
            }
        }
    }
    errors.sort_by(|a, b| a.field.cmp(&b.field));

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
