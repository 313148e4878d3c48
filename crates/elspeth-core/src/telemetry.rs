//! Exportación de telemetría en background (opcional).
//!
//! Cola acotada separada de la cola de trabajo, con dos políticas de
//! overflow:
//! - `Block`: backpressure al emisor (el worker espera lugar).
//! - `Drop`: se descartan eventos al llenarse; el contador
//!   `events_dropped` crece monotónicamente y se expone en el snapshot de
//!   salud.
//!
//! El consumidor corre en su propio hilo y drena hasta que todos los
//! emisores se sueltan.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowMode {
    Block,
    Drop,
}

#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub name: String,
    pub data: Value,
    pub ts: DateTime<Utc>,
}

/// Snapshot de salud del canal de telemetría.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryHealth {
    pub events_dropped: u64,
    pub queue_len: usize,
}

#[derive(Clone)]
pub struct TelemetryEmitter {
    sender: Sender<TelemetryEvent>,
    mode: OverflowMode,
    dropped: Arc<AtomicU64>,
}

impl TelemetryEmitter {
    /// Entrega un evento según la política. En modo `Drop` retorna enseguida
    /// incluso bajo saturación.
    pub fn handle_event(&self, name: &str, data: Value) {
        let event = TelemetryEvent { name: name.to_string(), data, ts: Utc::now() };
        match self.mode {
            OverflowMode::Block => {
                // Backpressure hacia el emisor; sólo falla si el consumidor murió.
                if self.sender.send(event).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            OverflowMode::Drop => match self.sender.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
        }
    }

    pub fn health(&self) -> TelemetryHealth {
        TelemetryHealth { events_dropped: self.dropped.load(Ordering::Relaxed),
                          queue_len: self.sender.len() }
    }
}

/// Consumidor: drena el canal y loguea. Se corta cuando el último emisor se
/// suelta.
pub struct TelemetryConsumer {
    receiver: Receiver<TelemetryEvent>,
}

impl TelemetryConsumer {
    pub fn run(self) {
        for event in self.receiver.iter() {
            log::debug!("telemetry {} {}", event.name, event.data);
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::spawn(move || self.run())
    }
}

/// Crea el par emisor/consumidor con capacidad acotada.
pub fn telemetry_channel(capacity: usize, mode: OverflowMode) -> (TelemetryEmitter, TelemetryConsumer) {
    let (sender, receiver) = bounded(capacity);
    (TelemetryEmitter { sender, mode, dropped: Arc::new(AtomicU64::new(0)) },
     TelemetryConsumer { receiver })
}
