//! Documento de configuración del pipeline (superficie de config de §6).
//!
//! El shape serde es neutral al formato; la CLI lo carga desde YAML. La
//! validación de etiquetas reservadas ocurre aquí, al parsear: una ruta de
//! usuario con prefijo `__` se rechaza antes de tocar el grafo.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{is_reserved_label, ENGINE_VERSION};
use crate::errors::ConfigError;
use crate::hashing::config_fingerprint;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub source: SourceSettings,
    #[serde(default)]
    pub transforms: Vec<TransformSettings>,
    #[serde(default)]
    pub aggregations: Vec<AggregationSettings>,
    #[serde(default)]
    pub gates: Vec<GateSettings>,
    #[serde(default)]
    pub coalesce: Vec<CoalesceSettings>,
    pub sinks: IndexMap<String, SinkSettings>,
    pub default_sink: String,
    #[serde(default)]
    pub landscape: LandscapeSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    pub plugin: String,
    #[serde(default)]
    pub options: Value,
    /// "discard" o nombre de sink (crea un edge DIVERT `__quarantine__`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_validation_failure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSettings {
    /// Id de nodo; por defecto el nombre del plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub plugin: String,
    #[serde(default)]
    pub options: Value,
    /// "discard" o nombre de sink (edge DIVERT `__error_<n>__`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSettings {
    pub name: String,
    pub plugin: String,
    #[serde(default)]
    pub options: Value,
    pub trigger: TriggerSettings,
}

/// Disparador de flush de una aggregation. Al menos uno debe declararse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSettings {
    pub name: String,
    /// Expresión de condición (`campo op literal`), evaluada por el gate.
    pub condition: String,
    /// label -> "continue" | nombre de sink.
    #[serde(default)]
    pub routes: IndexMap<String, String>,
    /// Branches de fork; cada uno debe calzar un branch de coalesce o un
    /// nombre de sink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_to: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CoalesceStrategySettings {
    RequireAll,
    BestEffort,
    FirstComplete,
    Quorum { threshold: usize },
}

impl Default for CoalesceStrategySettings {
    fn default() -> Self {
        CoalesceStrategySettings::RequireAll
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalesceSettings {
    pub name: String,
    pub branches: Vec<String>,
    #[serde(default)]
    pub strategy: CoalesceStrategySettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSettings {
    pub plugin: String,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LandscapeSettings {
    /// Conexión Postgres; sin ella el run usa el backend in-memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// Directorio del payload store (`store/<hash[:2]>/<hash>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 3, backoff_ms: 15 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    pub workers: usize,
    /// High-water mark de la cola de trabajo; la fuente se frena al llenarse.
    pub queue_depth: usize,
    pub retry: RetrySettings,
    pub drain_timeout_ms: u64,
    /// Deadline por defecto de barreras de coalesce sin timeout propio.
    pub coalesce_timeout_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self { workers: 4,
               queue_depth: 64,
               retry: RetrySettings::default(),
               drain_timeout_ms: 30_000,
               coalesce_timeout_ms: 30_000 }
    }
}

impl PipelineSettings {
    /// Chequeos de superficie, previos a construir el grafo.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.sinks.contains_key(&self.default_sink) {
            return Err(ConfigError::Invalid(format!("default_sink '{}' is not declared in sinks", self.default_sink)));
        }
        for gate in &self.gates {
            for (label, target) in &gate.routes {
                if is_reserved_label(label) {
                    return Err(ConfigError::ReservedLabel(label.clone()));
                }
                if target != "continue" && !self.sinks.contains_key(target) {
                    return Err(ConfigError::UnknownRouteTarget { gate: gate.name.clone(),
                                                                label: label.clone(),
                                                                target: target.clone() });
                }
            }
            if let Some(branches) = &gate.fork_to {
                for branch in branches {
                    if is_reserved_label(branch) {
                        return Err(ConfigError::ReservedLabel(branch.clone()));
                    }
                }
            }
        }
        for agg in &self.aggregations {
            let t = &agg.trigger;
            if t.count.is_none() && t.size_bytes.is_none() && t.interval_ms.is_none() {
                return Err(ConfigError::Invalid(format!("aggregation '{}' declares no trigger", agg.name)));
            }
        }
        for c in &self.coalesce {
            if c.branches.is_empty() {
                return Err(ConfigError::Invalid(format!("coalesce '{}' declares no branches", c.name)));
            }
            if let CoalesceStrategySettings::Quorum { threshold } = c.strategy {
                if threshold == 0 || threshold > c.branches.len() {
                    return Err(ConfigError::Invalid(format!("coalesce '{}' quorum threshold {} out of range",
                                                            c.name, threshold)));
                }
            }
        }
        Ok(())
    }

    /// Fingerprint canónico de la configuración + versión del engine. Queda
    /// en `runs.config_fingerprint`.
    pub fn fingerprint(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert("engine_version".to_string(), Value::String(ENGINE_VERSION.to_string()));
        }
        config_fingerprint(&value)
    }
}
