//! Payload store direccionado por contenido.
//!
//! Los registros de auditoría sólo guardan hashes; los blobs grandes
//! (request/response de llamadas externas, snapshots opcionales de filas)
//! viven aparte, direccionados por su hash BLAKE3. Write-once: escritores
//! concurrentes del mismo hash son idempotentes.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::errors::RecorderError;
use crate::hashing::{canonical_json, payload_address};

pub trait PayloadStore: Send + Sync {
    /// Guarda bytes y devuelve su hash. Reescrituras del mismo contenido son
    /// no-ops.
    fn put_bytes(&self, bytes: &[u8]) -> Result<String, RecorderError>;

    fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, RecorderError>;

    /// Guarda un JSON canonicalizado (mismo contenido lógico, mismo hash).
    fn put(&self, value: &Value) -> Result<String, RecorderError> {
        self.put_bytes(canonical_json(value).as_bytes())
    }
}

/// Backend en memoria (tests y runs efímeros).
pub struct InMemoryPayloadStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryPayloadStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }
}

impl Default for InMemoryPayloadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadStore for InMemoryPayloadStore {
    fn put_bytes(&self, bytes: &[u8]) -> Result<String, RecorderError> {
        let hash = payload_address(bytes);
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(hash.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, RecorderError> {
        Ok(self.inner.lock().unwrap_or_else(|p| p.into_inner()).get(hash).cloned())
    }
}
