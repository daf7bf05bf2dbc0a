//! Process-wide counters for the link core.
//! Cheap relaxed atomics; read them through [`snapshot`].
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static TRANSPORT_DISPATCHED: AtomicU64 = AtomicU64::new(0);
static TRANSPORT_TIMED_OUT: AtomicU64 = AtomicU64::new(0);
static TRANSPORT_FAILED: AtomicU64 = AtomicU64::new(0);
static PACKETS_ENQUEUED: AtomicU64 = AtomicU64::new(0);
static PACKETS_DELIVERED: AtomicU64 = AtomicU64::new(0);
static PACKETS_FAILED: AtomicU64 = AtomicU64::new(0);
static PACKETS_TIMED_OUT: AtomicU64 = AtomicU64::new(0);
static ROUTING_RETRIES: AtomicU64 = AtomicU64::new(0);
static PROTOCOL_ERRORS: AtomicU64 = AtomicU64::new(0);
static QUEUE_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static QUEUE_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn inc_transport_dispatched() {
    TRANSPORT_DISPATCHED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transport_timed_out() {
    TRANSPORT_TIMED_OUT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transport_failed() {
    TRANSPORT_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_enqueued() {
    PACKETS_ENQUEUED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_delivered() {
    PACKETS_DELIVERED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_failed() {
    PACKETS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_timed_out() {
    PACKETS_TIMED_OUT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_routing_retries() {
    ROUTING_RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_protocol_errors() {
    PROTOCOL_ERRORS.fetch_add(1, Ordering::Relaxed);
}
/// Time from dispatch to device queue-status resolution.
pub fn observe_queue_latency(sent_at: Instant) {
    let ms = sent_at.elapsed().as_millis() as u64;
    QUEUE_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    QUEUE_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub transport_dispatched: u64,
    pub transport_timed_out: u64,
    pub transport_failed: u64,
    pub packets_enqueued: u64,
    pub packets_delivered: u64,
    pub packets_failed: u64,
    pub packets_timed_out: u64,
    pub routing_retries: u64,
    pub protocol_errors: u64,
    pub queue_latency_avg_ms: Option<u64>,
}

pub fn snapshot() -> Snapshot {
    let sum = QUEUE_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = QUEUE_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        transport_dispatched: TRANSPORT_DISPATCHED.load(Ordering::Relaxed),
        transport_timed_out: TRANSPORT_TIMED_OUT.load(Ordering::Relaxed),
        transport_failed: TRANSPORT_FAILED.load(Ordering::Relaxed),
        packets_enqueued: PACKETS_ENQUEUED.load(Ordering::Relaxed),
        packets_delivered: PACKETS_DELIVERED.load(Ordering::Relaxed),
        packets_failed: PACKETS_FAILED.load(Ordering::Relaxed),
        packets_timed_out: PACKETS_TIMED_OUT.load(Ordering::Relaxed),
        routing_retries: ROUTING_RETRIES.load(Ordering::Relaxed),
        protocol_errors: PROTOCOL_ERRORS.load(Ordering::Relaxed),
        queue_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let before = snapshot();
        inc_protocol_errors();
        inc_packets_enqueued();
        observe_queue_latency(Instant::now());
        let after = snapshot();
        assert!(after.protocol_errors > before.protocol_errors);
        assert!(after.packets_enqueued > before.packets_enqueued);
        assert!(after.queue_latency_avg_ms.is_some());
    }
}
