//! Overrides de opciones por asignación de experimento (opcional).
//!
//! La asignación se registra una vez por fila (`experiment_assignments`);
//! los hijos de fork/expand heredan la asignación de su fila, no se
//! re-asignan. El procesador consulta las asignaciones y fusiona los
//! overrides sobre las opciones del transform antes de invocarlo.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::errors::RecorderError;
use crate::landscape::Landscape;

/// Merge shallow determinista: claves de `b` reemplazan a las de `a` cuando
/// ambos son objetos; si alguno no es objeto, `b` tiene precedencia.
pub fn merge_overrides(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            let mut out = ma.clone();
            for (k, v) in mb.iter() {
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        // Non-objects: override
        (_, other) => other.clone(),
    }
}

/// Resuelve las opciones efectivas de un nodo para una fila: opciones base
/// del snapshot de config + overrides de cada asignación, en orden de
/// registro.
pub fn effective_options(landscape: &Arc<dyn Landscape>,
                         run_id: Uuid,
                         row_id: &str,
                         base: &Value)
                         -> Result<Value, RecorderError> {
    let assignments = landscape.assignments_for_row(run_id, row_id)?;
    let mut options = base.clone();
    for assignment in assignments {
        if let Some(overrides) = &assignment.overrides_json {
            options = merge_overrides(&options, overrides);
        }
    }
    Ok(options)
}
