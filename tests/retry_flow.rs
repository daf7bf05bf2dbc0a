use async_trait::async_trait;
use meshlink::error::TransportError;
use meshlink::protobuf::{routing, MeshPacket};
use meshlink::queue::{
    DeliveryStatus, OutboundPacket, PacketIdGenerator, PacketQueue, PacketWriter, QueueTuning,
};
use meshlink::retry::{AckOutcome, AckRetryController, RetryBroker, RetryEvent, RetryTuning};
use meshlink::storage::{
    MemoryMessageStore, MessageKind, MessageStatus, MessageStore, StoredMessage,
};
use std::sync::Arc;
use std::time::Duration;

const DEST: u32 = 9;
const RELAY: u32 = 4;

struct Discard;

#[async_trait]
impl PacketWriter for Discard {
    async fn write_packet(&self, _packet: MeshPacket) -> Result<(), TransportError> {
        Ok(())
    }
}

struct Harness {
    store: Arc<MemoryMessageStore>,
    broker: Arc<RetryBroker>,
    queue: PacketQueue,
    controller: AckRetryController,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryMessageStore::new());
    let broker = Arc::new(RetryBroker::new());
    // Never started, so retried packets stay visible in the queue.
    let queue = PacketQueue::new(Arc::new(Discard), QueueTuning::default());
    let controller = AckRetryController::new(
        store.clone(),
        broker.clone(),
        queue.clone(),
        Arc::new(PacketIdGenerator::starting_at(1000)),
        RetryTuning {
            max_attempts: 2,
            decision_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        },
    );
    Harness {
        store,
        broker,
        queue,
        controller,
    }
}

async fn sent_text(h: &Harness, id: u32) {
    save_sent_text(&h.store, id).await;
}

async fn save_sent_text(store: &MemoryMessageStore, id: u32) {
    let msg = StoredMessage::outgoing(
        id,
        DEST,
        0,
        MessageKind::Text {
            text: "hello mesh".into(),
        },
    );
    store.save(&msg).await.unwrap();
}

/// Answer every retry question with `proceed`.
fn auto_answer(
    broker: Arc<RetryBroker>,
    proceed: bool,
) -> tokio::task::JoinHandle<Vec<RetryEvent>> {
    let mut events = broker.subscribe();
    tokio::spawn(async move {
        let mut asked = Vec::new();
        while events.changed().await.is_ok() {
            let event = events.borrow_and_update().clone();
            if let Some(event) = event {
                broker.respond_to_retry(event.packet_id(), proceed);
                asked.push(event);
                if asked.len() == 2 {
                    break;
                }
            }
        }
        asked
    })
}

const MAX_RETRANSMIT: i32 = routing::Error::MaxRetransmit as i32;

#[tokio::test(start_paused = true)]
async fn accepted_retries_stop_at_the_cap() {
    let h = harness();
    sent_text(&h, 1).await;
    let answers = auto_answer(h.broker.clone(), true);

    let first = h.controller.handle_routing(1, DEST, MAX_RETRANSMIT, None).await;
    assert_eq!(first, AckOutcome::Retrying { new_packet_id: 1000 });
    assert!(h.store.get(1).await.unwrap().is_none());

    let second = h
        .controller
        .handle_routing(1000, DEST, MAX_RETRANSMIT, None)
        .await;
    assert_eq!(second, AckOutcome::Retrying { new_packet_id: 1001 });

    let third = h
        .controller
        .handle_routing(1001, DEST, MAX_RETRANSMIT, None)
        .await;
    assert_eq!(third, AckOutcome::Error);

    let msg = h.store.get(1001).await.unwrap().expect("stored under last id");
    assert_eq!(msg.retry_count, 2);
    assert_eq!(msg.status, MessageStatus::Error);
    assert_eq!(h.queue.queued_len(), 2);

    let asked = answers.await.unwrap();
    assert!(matches!(
        &asked[0],
        RetryEvent::MessageRetry { packet_id: 1, attempt_number: 1, max_attempts: 2, text }
            if text == "hello mesh"
    ));
    assert!(matches!(
        &asked[1],
        RetryEvent::MessageRetry { packet_id: 1000, attempt_number: 2, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn unanswered_retry_marks_error() {
    let h = harness();
    sent_text(&h, 1).await;
    let started = tokio::time::Instant::now();
    let outcome = h.controller.handle_routing(1, DEST, MAX_RETRANSMIT, None).await;
    assert_eq!(outcome, AckOutcome::Error);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(h.broker.pending_count(), 0);
    let msg = h.store.get(1).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Error);
    assert_eq!(msg.retry_count, 0);
    assert_eq!(h.queue.queued_len(), 0);
}

#[tokio::test]
async fn declined_retry_marks_error() {
    let h = harness();
    sent_text(&h, 1).await;
    let _answers = auto_answer(h.broker.clone(), false);
    let outcome = h.controller.handle_routing(1, DEST, MAX_RETRANSMIT, None).await;
    assert_eq!(outcome, AckOutcome::Error);
    assert_eq!(h.queue.queued_len(), 0);
}

#[tokio::test]
async fn destination_ack_is_not_downgraded_by_relay_ack() {
    let h = harness();
    sent_text(&h, 1).await;
    let mut updates = h.controller.subscribe();

    let outcome = h.controller.handle_routing(1, DEST, 0, None).await;
    assert_eq!(outcome, AckOutcome::Delivered);
    let late = h.controller.handle_routing(1, RELAY, 0, Some(RELAY)).await;
    assert_eq!(late, AckOutcome::RelayAcknowledged);

    // The late relay ack leaves the received message untouched.
    let msg = h.store.get(1).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Received);
    assert_eq!(msg.relays, 1);
    assert_eq!(msg.relay_node, None);
    assert_eq!(updates.recv().await.unwrap().status, MessageStatus::Received);
    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn relay_ack_marks_delivered() {
    let h = harness();
    sent_text(&h, 1).await;
    let outcome = h.controller.handle_routing(1, RELAY, 0, Some(RELAY)).await;
    assert_eq!(outcome, AckOutcome::RelayAcknowledged);
    let msg = h.store.get(1).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Delivered);
}

#[tokio::test]
async fn other_naks_fail_without_asking() {
    let h = harness();
    sent_text(&h, 1).await;
    let questions = h.broker.subscribe();
    let outcome = h
        .controller
        .handle_routing(1, DEST, routing::Error::NoRoute as i32, None)
        .await;
    assert_eq!(outcome, AckOutcome::Error);
    let msg = h.store.get(1).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Error);
    assert_eq!(msg.routing_error, Some(routing::Error::NoRoute as i32));
    assert!(questions.borrow().is_none());
    assert!(!questions.has_changed().unwrap());
}

#[tokio::test]
async fn queue_results_never_override_acks() {
    let h = harness();
    sent_text(&h, 1).await;
    h.controller
        .handle_queue_result(1, DeliveryStatus::Delivered)
        .await;
    assert_eq!(
        h.store.get(1).await.unwrap().unwrap().status,
        MessageStatus::Enroute
    );
    h.controller.handle_routing(1, DEST, 0, None).await;
    h.controller.handle_queue_result(1, DeliveryStatus::Error).await;
    assert_eq!(
        h.store.get(1).await.unwrap().unwrap().status,
        MessageStatus::Received
    );
}

#[tokio::test]
async fn tracked_packet_rejected_by_queue_is_an_error() {
    let h = harness();
    sent_text(&h, 1).await;
    let mut updates = h.controller.subscribe();
    h.queue.close();

    let receipt = h
        .controller
        .track(h.queue.enqueue(OutboundPacket::text(1, DEST, 0, "hello mesh")));
    assert_eq!(receipt.packet_id(), 1);
    assert_eq!(receipt.await, DeliveryStatus::Error);
    assert_eq!(
        h.store.get(1).await.unwrap().unwrap().status,
        MessageStatus::Error
    );
    assert_eq!(updates.recv().await.unwrap().status, MessageStatus::Error);
}

#[tokio::test]
async fn routing_for_unknown_packet_is_harmless() {
    let h = harness();
    assert_eq!(
        h.controller.handle_routing(77, DEST, 0, None).await,
        AckOutcome::RelayAcknowledged
    );
    assert_eq!(
        h.controller.handle_routing(78, DEST, 3, None).await,
        AckOutcome::Error
    );
}

#[tokio::test(start_paused = true)]
async fn close_abandons_retry_in_backoff() {
    let h = harness();
    sent_text(&h, 1).await;
    let _answers = auto_answer(h.broker.clone(), true);
    let controller = Arc::new(h.controller);

    let c = controller.clone();
    let routing =
        tokio::spawn(async move { c.handle_routing(1, DEST, MAX_RETRANSMIT, None).await });
    // Let the question be answered and the backoff start.
    while h.store.get(1000).await.unwrap().is_none() {
        tokio::task::yield_now().await;
    }
    controller.close();

    assert_eq!(
        routing.await.unwrap(),
        AckOutcome::Retrying { new_packet_id: 1000 }
    );
    let msg = h.store.get(1000).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Error);
    assert_eq!(h.queue.queued_len(), 0);

    // Once closed, max-retransmit naks fail without asking.
    save_sent_text(&h.store, 2).await;
    assert_eq!(
        controller.handle_routing(2, DEST, MAX_RETRANSMIT, None).await,
        AckOutcome::Error
    );
}
