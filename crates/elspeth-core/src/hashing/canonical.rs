//! Forma canónica de JSON para los hashes de contenido del landscape.
//!
//! Reglas:
//! - Claves de objeto en orden lexicográfico, en todos los niveles.
//! - Arrays en su orden original (el orden de un array ES contenido).
//! - Escalares con la representación compacta por defecto de serde_json;
//!   no usar NaN/Inf en filas del pipeline.
//!
//! La forma se escribe sobre un único buffer: dos valores lógicamente
//! iguales producen el mismo string sin importar el orden de inserción de
//! sus claves.

use serde_json::Value;

pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();
            out.push('{');
            for (position, key) in keys.into_iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_escaped_key(key, out);
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Escalares: el Display de Value ya emite la forma compacta JSON
        // (strings con escapes incluidos).
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_escaped_key(key: &str, out: &mut String) {
    // Mismo escape que cualquier string JSON.
    out.push_str(&Value::from(key).to_string());
}
