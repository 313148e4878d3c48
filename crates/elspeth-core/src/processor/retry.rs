//! Política de reintentos por nodo.
//!
//! Presupuesto y backoff configurables; el backoff es lineal
//! (`backoff_ms * attempt`) y el sueño respeta la cancelación del run.
//! Los reintentos abren attempts nuevos de node_state, nunca sobreescriben.

use std::time::Duration;

use crate::config::RetrySettings;
use crate::orchestrator::CancelFlag;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, backoff_ms: 15 }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self { max_attempts: settings.max_attempts.max(1),
               backoff_ms: settings.backoff_ms }
    }
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms * attempt as u64)
    }

    /// Duerme el backoff del attempt en tramos cortos, abortando temprano si
    /// llega la cancelación. Devuelve `false` si se canceló.
    pub fn sleep_backoff(&self, attempt: u32, cancel: &CancelFlag) -> bool {
        let mut remaining = self.backoff_for(attempt);
        let slice = Duration::from_millis(5);
        while !remaining.is_zero() {
            if cancel.is_canceled() {
                return false;
            }
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining -= step;
        }
        !cancel.is_canceled()
    }
}
