//! Limitadores token-bucket por servicio.

use std::time::Instant;

use elspeth_core::orchestrator::CancelFlag;
use elspeth_core::ratelimit::RateLimitRegistry;

#[test]
fn unregistered_services_pass_through() {
    let registry = RateLimitRegistry::new();
    let cancel = CancelFlag::new();
    assert!(registry.acquire("unknown", &cancel));
}

#[test]
fn burst_is_consumed_then_acquire_waits_for_refill() {
    let registry = RateLimitRegistry::new();
    let cancel = CancelFlag::new();
    // 100 permisos/seg con ráfaga de 2: el tercero espera ~10ms.
    registry.register("svc", 100.0, 2.0);

    let started = Instant::now();
    assert!(registry.acquire("svc", &cancel));
    assert!(registry.acquire("svc", &cancel));
    let burst_elapsed = started.elapsed();
    assert!(burst_elapsed.as_millis() < 50, "burst is immediate");

    assert!(registry.acquire("svc", &cancel));
    assert!(started.elapsed() > burst_elapsed, "third permit waited for refill");
}

#[test]
fn cancellation_aborts_the_wait() {
    let registry = RateLimitRegistry::new();
    // Refill casi nulo: sin cancelación esto esperaría indefinidamente.
    registry.register("slow", 0.001, 1.0);
    let cancel = CancelFlag::new();
    assert!(registry.acquire("slow", &cancel), "burst permit");

    cancel.cancel();
    let started = Instant::now();
    assert!(!registry.acquire("slow", &cancel), "canceled acquire returns false");
    assert!(started.elapsed().as_millis() < 500);
}
