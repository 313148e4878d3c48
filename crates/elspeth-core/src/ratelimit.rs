//! Limitadores token-bucket por servicio externo.
//!
//! Toda llamada de plugin a un servicio registrado adquiere un permiso antes
//! de emitir el IO. `acquire` duerme en tramos cortos y respeta la
//! cancelación del run.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::orchestrator::CancelFlag;

struct Bucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
pub struct RateLimitRegistry {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un límite para `service`: `rate_per_sec` sostenido con
    /// ráfaga hasta `burst`.
    pub fn register(&self, service: &str, rate_per_sec: f64, burst: f64) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        buckets.insert(service.to_string(),
                       Bucket { capacity: burst,
                                refill_per_sec: rate_per_sec,
                                tokens: burst,
                                last_refill: Instant::now() });
    }

    /// Adquiere un permiso para `service`. Servicios no registrados pasan
    /// directo. Devuelve `false` si la cancelación llegó antes del permiso.
    pub fn acquire(&self, service: &str, cancel: &CancelFlag) -> bool {
        loop {
            {
                let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
                match buckets.get_mut(service) {
                    None => return true,
                    Some(bucket) => {
                        if bucket.try_take() {
                            return true;
                        }
                    }
                }
            }
            if cancel.is_canceled() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
