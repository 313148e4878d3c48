//! Contexto entregado a cada invocación de plugin.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::landscape::{CallRecord, Landscape, PayloadStore};
use crate::ratelimit::RateLimitRegistry;
use crate::telemetry::TelemetryEmitter;

/// Contexto de invocación. Todo el alcance del run viaja aquí; el core no
/// tiene estado global.
#[derive(Clone)]
pub struct PluginContext {
    pub run_id: Uuid,
    pub row_id: String,
    pub token_id: Uuid,
    pub node_id: String,
    /// Opciones efectivas del nodo para esta fila: snapshot de config con
    /// los overrides de asignaciones de experimento ya fusionados.
    pub effective_options: Value,
    /// Handle del landscape para registrar llamadas externas.
    pub landscape: Arc<dyn Landscape>,
    /// Payload store direccionado por contenido (request/response grandes).
    pub payloads: Arc<dyn PayloadStore>,
    /// Limitadores por servicio externo; adquirir antes de emitir IO.
    pub rate_limits: Arc<RateLimitRegistry>,
    pub telemetry: Option<TelemetryEmitter>,
}

impl PluginContext {
    /// Registra una llamada externa (request/response referenciados por hash
    /// en el payload store). Best-effort: un fallo del registro de la llamada
    /// se loguea pero no tumba la invocación del plugin.
    pub fn record_call(&self, service: &str, request: &Value, response: &Value, status: &str) {
        let request_hash = match self.payloads.put(request) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("payload store put failed for call request: {e}");
                return;
            }
        };
        let response_hash = match self.payloads.put(response) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("payload store put failed for call response: {e}");
                return;
            }
        };
        let record = CallRecord { call_id: Uuid::new_v4(),
                                  run_id: self.run_id,
                                  token_id: self.token_id,
                                  node_id: self.node_id.clone(),
                                  service: service.to_string(),
                                  request_hash,
                                  response_hash,
                                  status: status.to_string(),
                                  recorded_at: chrono::Utc::now() };
        if let Err(e) = self.landscape.record_call(&record) {
            log::warn!("call record failed for token {}: {e}", self.token_id);
        }
    }
}
