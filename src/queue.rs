//! Outbound packet queue.
//!
//! Packets are written one at a time, in FIFO order, and only while the queue is running (the
//! connection is `Connected`). After each write the worker waits for the first of:
//! the radio's `QueueStatus` for that packet id, an explicit [`PacketQueue::resolve`] (routing
//! ack), the status timeout, or the queue being stopped.
//!
//! A `QueueStatus` without a packet id is attributed to the most recently registered pending
//! packet. Firmware that omits the id only does so for the packet it just accepted, so this
//! is right in practice but is a best-effort guess.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;

use crate::connection::{ConnectionState, StateObserver};
use crate::error::TransportError;
use crate::metrics;
use crate::protobuf::{mesh_packet, Data, MeshPacket, PortNum, Priority, QueueStatus};

#[derive(Debug, Clone)]
pub struct QueueTuning {
    pub status_timeout: Duration,
}

impl Default for QueueTuning {
    fn default() -> Self {
        Self {
            status_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Delivered,
    Error,
    TimedOut,
}

/// Allocates non-zero packet ids, starting from a random point.
pub struct PacketIdGenerator {
    next: AtomicU32,
}

impl PacketIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(rand::random())
    }

    pub fn starting_at(start: u32) -> Self {
        Self {
            next: AtomicU32::new(start),
        }
    }

    pub fn next_id(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for PacketIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct OutboundPacket {
    /// 0 opts out of queue-status correlation.
    pub id: u32,
    pub destination: u32,
    pub channel: u32,
    pub data: Data,
    pub priority: Priority,
    pub want_ack: bool,
    pub hop_limit: u32,
    pub created_at: Instant,
}

impl OutboundPacket {
    pub fn new(id: u32, destination: u32, portnum: PortNum, payload: Bytes) -> Self {
        Self {
            id,
            destination,
            channel: 0,
            data: Data {
                portnum: portnum as i32,
                payload,
                ..Default::default()
            },
            priority: Priority::Reliable,
            want_ack: true,
            hop_limit: 3,
            created_at: Instant::now(),
        }
    }

    pub fn text(id: u32, destination: u32, channel: u32, text: &str) -> Self {
        let mut packet = Self::new(
            id,
            destination,
            PortNum::TextMessageApp,
            Bytes::copy_from_slice(text.as_bytes()),
        );
        packet.channel = channel;
        packet
    }

    pub fn to_mesh_packet(&self) -> MeshPacket {
        MeshPacket {
            to: self.destination,
            channel: self.channel,
            id: self.id,
            hop_limit: self.hop_limit,
            want_ack: self.want_ack,
            priority: self.priority as i32,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(self.data.clone())),
            ..Default::default()
        }
    }
}

/// Writes one packet through the link; resolves when the link accepted it.
#[async_trait]
pub trait PacketWriter: Send + Sync {
    async fn write_packet(&self, packet: MeshPacket) -> Result<(), TransportError>;
}

/// Terminal status of an enqueued packet. Dropping the queue resolves it as `Error`.
pub struct DeliveryReceipt {
    id: u32,
    rx: oneshot::Receiver<DeliveryStatus>,
}

impl DeliveryReceipt {
    pub(crate) fn from_parts(id: u32, rx: oneshot::Receiver<DeliveryStatus>) -> Self {
        Self { id, rx }
    }

    pub fn packet_id(&self) -> u32 {
        self.id
    }
}

impl Future for DeliveryReceipt {
    type Output = DeliveryStatus;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<DeliveryStatus> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(status)) => Poll::Ready(status),
            Poll::Ready(Err(_)) => Poll::Ready(DeliveryStatus::Error),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Queued {
    packet: OutboundPacket,
    receipt: oneshot::Sender<DeliveryStatus>,
}

struct PendingAck {
    seq: u64,
    tx: oneshot::Sender<DeliveryStatus>,
}

struct QueueInner {
    queued: Mutex<VecDeque<Queued>>,
    pending: Mutex<HashMap<u32, PendingAck>>,
    seq: AtomicU64,
    running: watch::Sender<bool>,
    closed: AtomicBool,
    work: Notify,
    writer: Arc<dyn PacketWriter>,
    tuning: QueueTuning,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct PacketQueue {
    inner: Arc<QueueInner>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PacketQueue {
    /// Creates the queue stopped; call [`PacketQueue::start`] (or register it as a
    /// [`StateObserver`]) to begin draining. Must be called inside a tokio runtime.
    pub fn new(writer: Arc<dyn PacketWriter>, tuning: QueueTuning) -> Self {
        let (running, _) = watch::channel(false);
        let inner = Arc::new(QueueInner {
            queued: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            running,
            closed: AtomicBool::new(false),
            work: Notify::new(),
            writer,
            tuning,
        });
        let worker = tokio::spawn(run_worker(inner.clone()));
        Self {
            inner,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    pub fn enqueue(&self, packet: OutboundPacket) -> DeliveryReceipt {
        let (tx, rx) = oneshot::channel();
        let id = packet.id;
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!("queue closed; rejecting packet id=0x{:08x}", id);
            let _ = tx.send(DeliveryStatus::Error);
            return DeliveryReceipt { id, rx };
        }
        let depth = {
            let mut q = lock(&self.inner.queued);
            q.push_back(Queued {
                packet,
                receipt: tx,
            });
            q.len()
        };
        metrics::inc_packets_enqueued();
        trace!("enqueued packet id=0x{:08x} depth={}", id, depth);
        self.inner.work.notify_one();
        DeliveryReceipt { id, rx }
    }

    pub fn start(&self) {
        if !self.inner.running.send_replace(true) {
            debug!("packet queue started");
        }
    }

    /// Stop draining. Unsent packets stay queued; the packet awaiting resolution fails.
    pub fn stop(&self) {
        if self.inner.running.send_replace(false) {
            debug!("packet queue stopped");
        }
        let failed: Vec<(u32, PendingAck)> = lock(&self.inner.pending).drain().collect();
        for (id, pending) in failed {
            debug!("failing in-flight packet id=0x{:08x} on stop", id);
            let _ = pending.tx.send(DeliveryStatus::Error);
        }
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// Packets waiting to be written.
    pub fn queued_len(&self) -> usize {
        lock(&self.inner.queued).len()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Apply a `QueueStatus` from the radio. Returns whether it resolved a pending packet.
    pub fn handle_queue_status(&self, status: &QueueStatus) -> bool {
        let success = status.res == 0;
        let is_full = status.free == 0;
        trace!(
            "queue status res={} free={}/{} id=0x{:08x}",
            status.res,
            status.free,
            status.maxlen,
            status.mesh_packet_id
        );
        if success && is_full {
            debug!("radio queue full; waiting for the next status");
            return false;
        }
        let outcome = if success {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Error
        };
        let entry = {
            let mut pending = lock(&self.inner.pending);
            if status.mesh_packet_id != 0 {
                pending.remove(&status.mesh_packet_id)
            } else {
                let newest = pending
                    .iter()
                    .max_by_key(|(_, p)| p.seq)
                    .map(|(id, _)| *id);
                newest.and_then(|id| pending.remove(&id))
            }
        };
        match entry {
            Some(p) => p.tx.send(outcome).is_ok(),
            None => {
                debug!(
                    "queue status for id=0x{:08x} has no pending packet",
                    status.mesh_packet_id
                );
                false
            }
        }
    }

    /// Resolve a pending packet from outside the queue, e.g. on a routing ack.
    pub fn resolve(&self, id: u32, status: DeliveryStatus) -> bool {
        if id == 0 {
            return false;
        }
        match lock(&self.inner.pending).remove(&id) {
            Some(p) => p.tx.send(status).is_ok(),
            None => false,
        }
    }

    /// Stop, fail everything, and end the worker.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.stop();
        let queued: Vec<Queued> = lock(&self.inner.queued).drain(..).collect();
        for q in queued {
            let _ = q.receipt.send(DeliveryStatus::Error);
        }
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
    }
}

impl StateObserver for PacketQueue {
    fn on_state_change(&self, _from: ConnectionState, to: ConnectionState) {
        if to == ConnectionState::Connected {
            self.start();
        } else {
            self.stop();
        }
    }
}

async fn run_worker(inner: Arc<QueueInner>) {
    let mut running = inner.running.subscribe();
    loop {
        if running.wait_for(|r| *r).await.is_err() {
            return;
        }
        let next = lock(&inner.queued).pop_front();
        let Some(queued) = next else {
            tokio::select! {
                _ = inner.work.notified() => {}
                _ = running.changed() => {}
            }
            continue;
        };
        let status = send_one(&inner, &mut running, &queued.packet).await;
        match status {
            DeliveryStatus::Delivered => metrics::inc_packets_delivered(),
            DeliveryStatus::Error => metrics::inc_packets_failed(),
            DeliveryStatus::TimedOut => metrics::inc_packets_timed_out(),
        }
        let _ = queued.receipt.send(status);
    }
}

async fn send_one(
    inner: &QueueInner,
    running: &mut watch::Receiver<bool>,
    packet: &OutboundPacket,
) -> DeliveryStatus {
    let id = packet.id;
    let rx = if id != 0 {
        let (tx, rx) = oneshot::channel();
        let seq = inner.seq.fetch_add(1, Ordering::Relaxed);
        lock(&inner.pending).insert(id, PendingAck { seq, tx });
        Some(rx)
    } else {
        None
    };

    let sent_at = Instant::now();
    if let Err(e) = inner.writer.write_packet(packet.to_mesh_packet()).await {
        warn!("write of packet id=0x{:08x} failed: {}", id, e);
        lock(&inner.pending).remove(&id);
        return DeliveryStatus::Error;
    }
    let Some(mut rx) = rx else {
        return DeliveryStatus::Delivered;
    };

    let status = tokio::select! {
        res = &mut rx => res.unwrap_or(DeliveryStatus::Error),
        _ = tokio::time::sleep(inner.tuning.status_timeout) => DeliveryStatus::TimedOut,
        _ = running.wait_for(|r| !*r) => DeliveryStatus::Error,
    };
    // Whoever resolved it already removed it; this covers timeout and stop.
    lock(&inner.pending).remove(&id);
    match status {
        DeliveryStatus::TimedOut => info!(
            "no queue status for packet id=0x{:08x} within {:?}",
            id, inner.tuning.status_timeout
        ),
        _ => metrics::observe_queue_latency(sent_at),
    }
    debug!("packet id=0x{:08x} resolved {:?}", id, status);
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AcceptAll;

    #[async_trait]
    impl PacketWriter for AcceptAll {
        async fn write_packet(&self, _packet: MeshPacket) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn id_generator_skips_zero() {
        let ids = PacketIdGenerator::starting_at(u32::MAX);
        assert_eq!(ids.next_id(), u32::MAX);
        assert_eq!(ids.next_id(), 1);
    }

    #[tokio::test]
    async fn id_zero_resolves_optimistically() {
        let queue = PacketQueue::new(Arc::new(AcceptAll), QueueTuning::default());
        queue.start();
        let receipt = queue.enqueue(OutboundPacket::text(0, 5, 0, "hi"));
        assert_eq!(receipt.await, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn full_radio_queue_is_not_a_resolution() {
        let queue = PacketQueue::new(Arc::new(AcceptAll), QueueTuning::default());
        let (tx, _rx) = oneshot::channel();
        lock(&queue.inner.pending).insert(9, PendingAck { seq: 0, tx });
        assert!(!queue.handle_queue_status(&QueueStatus {
            res: 0,
            free: 0,
            maxlen: 16,
            mesh_packet_id: 9,
        }));
        assert_eq!(queue.pending_len(), 1);
        assert!(queue.handle_queue_status(&QueueStatus {
            res: 0,
            free: 3,
            maxlen: 16,
            mesh_packet_id: 9,
        }));
    }

    #[tokio::test]
    async fn idless_status_takes_newest_pending() {
        let queue = PacketQueue::new(Arc::new(AcceptAll), QueueTuning::default());
        let (tx_old, mut rx_old) = oneshot::channel();
        let (tx_new, rx_new) = oneshot::channel();
        {
            let mut pending = lock(&queue.inner.pending);
            pending.insert(1, PendingAck { seq: 1, tx: tx_old });
            pending.insert(2, PendingAck { seq: 2, tx: tx_new });
        }
        assert!(queue.handle_queue_status(&QueueStatus {
            res: 3,
            free: 4,
            maxlen: 16,
            mesh_packet_id: 0,
        }));
        assert_eq!(rx_new.await, Ok(DeliveryStatus::Error));
        assert!(rx_old.try_recv().is_err());
    }
}
