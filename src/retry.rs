//! Routing ack/nak handling and user-confirmed retries.
//!
//! Every routing message for a packet we sent lands in [`AckRetryController::handle_routing`].
//! Acks and ordinary naks update the stored message and are published on the status channel.
//! A `MAX_RETRANSMIT` nak for a text message or reaction we originated instead asks the user,
//! through the [`RetryBroker`], whether to try again. Silence within the decision window
//! counts as "no".
//!
//! An accepted retry gets a fresh packet id, an incremented `retry_count`, and is re-queued
//! after an exponential backoff that is cut short if the link reconnects in the meantime.

use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Notify};

use crate::error::RadioError;
use crate::logutil::escape_log;
use crate::metrics;
use crate::protobuf::{routing, PortNum};
use crate::queue::{DeliveryReceipt, DeliveryStatus, OutboundPacket, PacketIdGenerator, PacketQueue};
use crate::storage::{MessageKind, MessageStatus, MessageStore, StoredMessage};

#[derive(Debug, Clone)]
pub struct RetryTuning {
    /// Extra attempts after the first send.
    pub max_attempts: u32,
    pub decision_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryTuning {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            decision_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl RetryTuning {
    /// Backoff before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .checked_mul(1u32 << shift)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    MessageRetry {
        packet_id: u32,
        text: String,
        attempt_number: u32,
        max_attempts: u32,
    },
    ReactionRetry {
        packet_id: u32,
        emoji: String,
        attempt_number: u32,
        max_attempts: u32,
    },
}

impl RetryEvent {
    pub fn packet_id(&self) -> u32 {
        match self {
            RetryEvent::MessageRetry { packet_id, .. }
            | RetryEvent::ReactionRetry { packet_id, .. } => *packet_id,
        }
    }
}

/// Pending retry questions and their answers.
pub struct RetryBroker {
    pending: Mutex<HashMap<u32, oneshot::Sender<bool>>>,
    events: watch::Sender<Option<RetryEvent>>,
}

impl Default for RetryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBroker {
    pub fn new() -> Self {
        let (events, _) = watch::channel(None);
        Self {
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, oneshot::Sender<bool>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The question currently awaiting an answer, if any.
    pub fn subscribe(&self) -> watch::Receiver<Option<RetryEvent>> {
        self.events.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn clear_event_for(&self, packet_id: u32) {
        self.events.send_if_modified(|current| {
            if current.as_ref().map(RetryEvent::packet_id) == Some(packet_id) {
                *current = None;
                true
            } else {
                false
            }
        });
    }

    /// Publish `event` and wait up to `timeout` for an answer. No answer is a decline.
    pub async fn request_retry(&self, event: RetryEvent, timeout: Duration) -> bool {
        let packet_id = event.packet_id();
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.lock().insert(packet_id, tx) {
            let _ = previous.send(false);
        }
        debug!("retry requested for packet id=0x{:08x}", packet_id);
        self.events.send_replace(Some(event));

        let decision = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(proceed)) => proceed,
            Ok(Err(_)) => false,
            Err(_) => {
                info!(
                    "no retry decision for packet id=0x{:08x} within {:?}; declining",
                    packet_id, timeout
                );
                self.lock().remove(&packet_id);
                false
            }
        };
        self.clear_event_for(packet_id);
        decision
    }

    /// Answer a pending question. Returns whether one was waiting.
    pub fn respond_to_retry(&self, packet_id: u32, proceed: bool) -> bool {
        let waiting = self.lock().remove(&packet_id);
        self.clear_event_for(packet_id);
        match waiting {
            Some(tx) => tx.send(proceed).is_ok(),
            None => {
                debug!("no pending retry for packet id=0x{:08x}", packet_id);
                false
            }
        }
    }

    /// Decline everything outstanding.
    pub fn cancel_pending_retries(&self) {
        let drained: Vec<(u32, oneshot::Sender<bool>)> = self.lock().drain().collect();
        if !drained.is_empty() {
            debug!("declining {} pending retries", drained.len());
        }
        for (_, tx) in drained {
            let _ = tx.send(false);
        }
        self.events.send_replace(None);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Acked by the final destination.
    Delivered,
    /// Acked by some relay along the way.
    RelayAcknowledged,
    Error,
    /// Re-queued under a new packet id.
    Retrying { new_packet_id: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub packet_id: u32,
    pub status: MessageStatus,
}

pub struct AckRetryController {
    store: Arc<dyn MessageStore>,
    broker: Arc<RetryBroker>,
    queue: PacketQueue,
    ids: Arc<PacketIdGenerator>,
    tuning: RetryTuning,
    reconnected: Arc<Notify>,
    status_tx: broadcast::Sender<StatusUpdate>,
    /// Serializes read-modify-write of stored message status.
    status_lock: Arc<tokio::sync::Mutex<()>>,
    closed: watch::Sender<bool>,
}

impl AckRetryController {
    pub fn new(
        store: Arc<dyn MessageStore>,
        broker: Arc<RetryBroker>,
        queue: PacketQueue,
        ids: Arc<PacketIdGenerator>,
        tuning: RetryTuning,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(256);
        Self {
            store,
            broker,
            queue,
            ids,
            tuning,
            reconnected: Arc::new(Notify::new()),
            status_tx,
            status_lock: Arc::new(tokio::sync::Mutex::new(())),
            closed: watch::channel(false).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status_tx.subscribe()
    }

    pub fn broker(&self) -> &Arc<RetryBroker> {
        &self.broker
    }

    /// Abandon retries in backoff and decline any pending decisions. Later naks fail directly.
    pub fn close(&self) {
        self.closed.send_replace(true);
        self.broker.cancel_pending_retries();
    }

    /// Wake any retry sitting out its backoff; the link just came back.
    pub fn notify_reconnected(&self) {
        self.reconnected.notify_waiters();
    }

    fn publish(&self, packet_id: u32, status: MessageStatus) {
        let _ = self.status_tx.send(StatusUpdate { packet_id, status });
    }

    /// Apply a routing ack/nak for `request_id`, reported by node `from`.
    pub async fn handle_routing(
        &self,
        request_id: u32,
        from: u32,
        error_reason: i32,
        relay_node: Option<u32>,
    ) -> AckOutcome {
        let is_ack = error_reason == routing::Error::None as i32;
        let stored = match self.store.get(request_id).await {
            Ok(m) => m,
            Err(e) => {
                warn!("message lookup for id=0x{:08x} failed: {}", request_id, e);
                None
            }
        };
        let Some(msg) = stored else {
            debug!(
                "routing for unknown packet id=0x{:08x} from=!{:08x} reason={}",
                request_id, from, error_reason
            );
            return if is_ack {
                AckOutcome::RelayAcknowledged
            } else {
                AckOutcome::Error
            };
        };

        if error_reason == routing::Error::MaxRetransmit as i32 && self.may_retry(&msg) {
            let mut retry = msg.clone();
            if let Some(new_packet_id) = self.try_retry(&mut retry).await {
                return AckOutcome::Retrying { new_packet_id };
            }
        }

        let _guard = self.status_lock.lock().await;
        // Re-read: a queue verdict may have landed while we were waiting.
        let mut msg = match self.store.get(request_id).await {
            Ok(Some(fresh)) => fresh,
            _ => msg,
        };

        let (outcome, status) = if !is_ack {
            info!(
                "packet id=0x{:08x} failed: {}",
                request_id,
                RadioError::routing(error_reason)
            );
            (AckOutcome::Error, MessageStatus::Error)
        } else if from == msg.to {
            (AckOutcome::Delivered, MessageStatus::Received)
        } else {
            (AckOutcome::RelayAcknowledged, MessageStatus::Delivered)
        };
        // Once the destination has acked, later routing news changes nothing.
        if msg.status == MessageStatus::Received {
            debug!(
                "id=0x{:08x} already received; ignoring routing from !{:08x}",
                request_id, from
            );
            return outcome;
        }
        msg.routing_error = (!is_ack).then_some(error_reason);
        if is_ack {
            msg.relays += 1;
            if relay_node.is_some() {
                msg.relay_node = relay_node;
            }
        }
        msg.status = status;
        if let Err(e) = self.store.save(&msg).await {
            warn!("failed to persist status for id=0x{:08x}: {}", request_id, e);
        }
        self.publish(request_id, status);
        outcome
    }

    /// Reflect the radio's queue verdict on a stored message: accepted (or written without a
    /// verdict) means `Enroute`, rejected means `Error`. Never touches a message that already
    /// has an ack.
    pub async fn handle_queue_result(&self, packet_id: u32, result: DeliveryStatus) {
        apply_queue_result(
            &self.store,
            &self.status_lock,
            &self.status_tx,
            packet_id,
            result,
        )
        .await;
    }

    /// Keep the stored message for `receipt` in step with the queue. The returned receipt
    /// resolves once the stored status has been updated.
    pub fn track(&self, receipt: DeliveryReceipt) -> DeliveryReceipt {
        let id = receipt.packet_id();
        let store = self.store.clone();
        let status_lock = self.status_lock.clone();
        let status_tx = self.status_tx.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = receipt.await;
            apply_queue_result(&store, &status_lock, &status_tx, id, status).await;
            let _ = tx.send(status);
        });
        DeliveryReceipt::from_parts(id, rx)
    }

    fn may_retry(&self, msg: &StoredMessage) -> bool {
        !*self.closed.borrow()
            && msg.from_local
            && matches!(
                msg.kind,
                MessageKind::Text { .. } | MessageKind::Reaction { .. }
            )
            && msg.retry_count < self.tuning.max_attempts
    }

    /// Ask, and if accepted re-queue under a new id. `None` when declined.
    async fn try_retry(&self, msg: &mut StoredMessage) -> Option<u32> {
        let old_id = msg.packet_id;
        let attempt_number = msg.retry_count + 1;
        let event = match &msg.kind {
            MessageKind::Text { text } => RetryEvent::MessageRetry {
                packet_id: old_id,
                text: text.clone(),
                attempt_number,
                max_attempts: self.tuning.max_attempts,
            },
            MessageKind::Reaction { emoji, .. } => RetryEvent::ReactionRetry {
                packet_id: old_id,
                emoji: emoji.clone(),
                attempt_number,
                max_attempts: self.tuning.max_attempts,
            },
            MessageKind::Other { .. } => return None,
        };
        if !self
            .broker
            .request_retry(event, self.tuning.decision_timeout)
            .await
        {
            debug!("retry of id=0x{:08x} declined", old_id);
            return None;
        }

        let new_id = self.ids.next_id();
        msg.packet_id = new_id;
        msg.status = MessageStatus::Queued;
        msg.retry_count = attempt_number;
        msg.relay_node = None;
        msg.relays = 0;
        msg.routing_error = None;
        msg.last_attempt = Some(Utc::now());
        if let Err(e) = self.store.replace(old_id, msg).await {
            warn!("failed to persist retry of id=0x{:08x}: {}", old_id, e);
        }
        metrics::inc_routing_retries();
        self.publish(new_id, MessageStatus::Queued);

        let delay = self.tuning.backoff(attempt_number);
        info!(
            "retrying id=0x{:08x} as id=0x{:08x} (attempt {}/{}) in {:?}",
            old_id, new_id, attempt_number, self.tuning.max_attempts, delay
        );
        let mut closed = self.closed.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.reconnected.notified() => debug!("link reconnected; skipping backoff"),
            _ = async { let _ = closed.wait_for(|c| *c).await; } => {
                debug!("shutting down; dropping retry of id=0x{:08x}", new_id);
                msg.status = MessageStatus::Error;
                if let Err(e) = self.store.save(msg).await {
                    warn!("failed to persist status for id=0x{:08x}: {}", new_id, e);
                }
                self.publish(new_id, MessageStatus::Error);
                return Some(new_id);
            }
        }

        let packet = outbound_for(msg)?;
        if let MessageKind::Text { text } = &msg.kind {
            debug!("re-sending '{}'", escape_log(text));
        }
        drop(self.track(self.queue.enqueue(packet)));
        Some(new_id)
    }
}

async fn apply_queue_result(
    store: &Arc<dyn MessageStore>,
    status_lock: &tokio::sync::Mutex<()>,
    status_tx: &broadcast::Sender<StatusUpdate>,
    packet_id: u32,
    result: DeliveryStatus,
) {
    let next = match result {
        DeliveryStatus::Delivered | DeliveryStatus::TimedOut => MessageStatus::Enroute,
        DeliveryStatus::Error => MessageStatus::Error,
    };
    let _guard = status_lock.lock().await;
    let mut msg = match store.get(packet_id).await {
        Ok(Some(m)) => m,
        Ok(None) => return,
        Err(e) => {
            warn!("message lookup for id=0x{:08x} failed: {}", packet_id, e);
            return;
        }
    };
    if !matches!(msg.status, MessageStatus::Queued | MessageStatus::Enroute) {
        return;
    }
    msg.status = next;
    if let Err(e) = store.save(&msg).await {
        warn!("failed to persist status for id=0x{:08x}: {}", packet_id, e);
    }
    let _ = status_tx.send(StatusUpdate {
        packet_id,
        status: next,
    });
}

/// Rebuild the packet for a stored outgoing message.
pub fn outbound_for(msg: &StoredMessage) -> Option<OutboundPacket> {
    let mut packet = match &msg.kind {
        MessageKind::Text { text } => {
            OutboundPacket::text(msg.packet_id, msg.to, msg.channel, text)
        }
        MessageKind::Reaction { emoji, reply_id } => {
            let mut p = OutboundPacket::new(
                msg.packet_id,
                msg.to,
                PortNum::TextMessageApp,
                Bytes::copy_from_slice(emoji.as_bytes()),
            );
            p.data.reply_id = *reply_id;
            p.data.emoji = 1;
            p
        }
        MessageKind::Other { .. } => return None,
    };
    packet.channel = msg.channel;
    Some(packet)
}
