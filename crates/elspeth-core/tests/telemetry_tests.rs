//! Canal de telemetría: políticas Block y Drop.

use std::time::{Duration, Instant};

use serde_json::json;

use elspeth_core::telemetry::{telemetry_channel, OverflowMode};

#[test]
fn drop_mode_returns_promptly_and_counts_drops_monotonically() {
    // Bajo saturación (sin consumidor), handle_event retorna enseguida
    // y events_dropped crece monotónicamente.
    let (emitter, _consumer) = telemetry_channel(4, OverflowMode::Drop);

    let started = Instant::now();
    let mut last_dropped = 0;
    for n in 0..100 {
        emitter.handle_event("event", json!({"n": n}));
        let health = emitter.health();
        assert!(health.events_dropped >= last_dropped, "monotonic counter");
        last_dropped = health.events_dropped;
    }
    assert!(started.elapsed() < Duration::from_secs(1), "drop mode never blocks");

    let health = emitter.health();
    assert_eq!(health.queue_len, 4, "queue saturated at capacity");
    assert_eq!(health.events_dropped, 96, "everything beyond capacity dropped");
}

#[test]
fn block_mode_delivers_every_event_to_the_consumer() {
    let (emitter, consumer) = telemetry_channel(8, OverflowMode::Block);
    let handle = consumer.spawn();

    for n in 0..64 {
        emitter.handle_event("event", json!({"n": n}));
    }
    assert_eq!(emitter.health().events_dropped, 0);

    drop(emitter);
    handle.join().expect("consumer drains and exits");
}
