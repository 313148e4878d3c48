//! Hashes de contenido del audit trail.
//!
//! Cada hash que el landscape persiste tiene acá su entrada con nombre:
//! - `content_hash`: identidad de una fila o valor JSON; alimenta la
//!   derivación de `row_id` y los `input_hash`/`output_hash` de node_states.
//! - `error_hash`: huella de una razón de error estructurada, referenciada
//!   por los outcomes FAILED/QUARANTINED.
//! - `config_fingerprint`: huella de la configuración de un run
//!   (`runs.config_fingerprint`).
//! - `payload_address`: dirección write-once de un blob en el payload store
//!   (`store/<hash[:2]>/<hash>`).
//!
//! Todos pasan por BLAKE3; los basados en JSON canonicalizan primero (ver
//! `canonical`). El algoritmo queda encapsulado en este módulo para poder
//! migrarlo sin tocar el resto del core ni invalidar las firmas por
//! accidente.

mod canonical;

pub use canonical::canonical_json;

use blake3::Hasher;
use serde_json::Value;

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize().to_hex().to_string()
}

/// Hash de contenido de una fila o valor JSON: mismo contenido lógico,
/// mismo hash, sin importar el orden de claves del productor.
pub fn content_hash(value: &Value) -> String {
    digest(canonical_json(value).as_bytes())
}

/// Hash de una razón de error estructurada. Dos fallos idénticos comparten
/// `error_hash`, lo que permite agrupar cuarentenas por causa.
pub fn error_hash(reason: &Value) -> String {
    content_hash(reason)
}

/// Fingerprint de la configuración con la que se lanzó un run. Un cambio de
/// configuración (o de versión del engine, que viaja dentro del documento)
/// produce un fingerprint distinto.
pub fn config_fingerprint(settings: &Value) -> String {
    content_hash(settings)
}

/// Dirección de un blob en el payload store. Sobre bytes crudos: el payload
/// de una llamada externa no tiene por qué ser JSON.
pub fn payload_address(bytes: &[u8]) -> String {
    digest(bytes)
}
