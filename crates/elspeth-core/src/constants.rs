//! Constantes del motor.
//!
//! Valores estáticos que participan en fingerprints de configuración y en la
//! validación de etiquetas de rutas. Cambios en `ENGINE_VERSION` invalidan
//! deterministamente los fingerprints de run aunque la configuración no
//! cambie.

/// Versión lógica del motor. Entra en el `config_fingerprint` de cada run.
pub const ENGINE_VERSION: &str = "1.0";

/// Prefijo reservado para etiquetas de edges del sistema. Las rutas de
/// usuario no pueden empezar con este prefijo; se rechazan al parsear la
/// configuración.
pub const RESERVED_LABEL_PREFIX: &str = "__";

/// Etiqueta del edge DIVERT hacia el sink de cuarentena.
pub const QUARANTINE_LABEL: &str = "__quarantine__";

/// Etiqueta sintética de continuación secuencial entre posiciones del
/// pipeline.
pub const CONTINUE_LABEL: &str = "continue";

/// Etiqueta del edge DIVERT de error para el nodo `n`.
pub fn error_label(n: usize) -> String {
    format!("__error_{n}__")
}

/// `true` si la etiqueta usa el prefijo reservado del sistema.
pub fn is_reserved_label(label: &str) -> bool {
    label.starts_with(RESERVED_LABEL_PREFIX)
}
