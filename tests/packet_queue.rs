use async_trait::async_trait;
use meshlink::error::TransportError;
use meshlink::protobuf::{MeshPacket, QueueStatus};
use meshlink::queue::{DeliveryStatus, OutboundPacket, PacketQueue, PacketWriter, QueueTuning};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_pending, task};

/// Forwards every written packet id to the test.
struct Recorder {
    tx: mpsc::UnboundedSender<u32>,
}

#[async_trait]
impl PacketWriter for Recorder {
    async fn write_packet(&self, packet: MeshPacket) -> Result<(), TransportError> {
        let _ = self.tx.send(packet.id);
        Ok(())
    }
}

fn queue() -> (PacketQueue, mpsc::UnboundedReceiver<u32>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = PacketQueue::new(
        Arc::new(Recorder { tx }),
        QueueTuning {
            status_timeout: Duration::from_secs(5),
        },
    );
    (queue, rx)
}

fn status(id: u32, res: i32, free: u32) -> QueueStatus {
    QueueStatus {
        res,
        free,
        maxlen: 16,
        mesh_packet_id: id,
    }
}

#[tokio::test]
async fn queue_status_delivers_promptly() {
    let (queue, mut written) = queue();
    queue.start();
    let receipt = queue.enqueue(OutboundPacket::text(42, 7, 0, "ping"));
    assert_eq!(written.recv().await, Some(42));
    assert!(queue.handle_queue_status(&status(42, 0, 5)));
    let result = tokio::time::timeout(Duration::from_secs(1), receipt)
        .await
        .expect("resolved within a second");
    assert_eq!(result, DeliveryStatus::Delivered);
}

#[tokio::test(start_paused = true)]
async fn missing_status_times_out_and_late_status_is_ignored() {
    let (queue, mut written) = queue();
    queue.start();
    let started = tokio::time::Instant::now();
    let receipt = queue.enqueue(OutboundPacket::text(42, 7, 0, "ping"));
    assert_eq!(written.recv().await, Some(42));
    assert_eq!(receipt.await, DeliveryStatus::TimedOut);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(queue.pending_len(), 0);
    assert!(!queue.handle_queue_status(&status(42, 0, 5)));
}

#[tokio::test]
async fn packets_are_written_in_order() {
    let (queue, mut written) = queue();
    let receipts: Vec<_> = [10, 11, 12]
        .into_iter()
        .map(|id| queue.enqueue(OutboundPacket::text(id, 7, 0, "x")))
        .collect();
    assert_eq!(queue.queued_len(), 3);
    queue.start();
    for expected in [10, 11, 12] {
        assert_eq!(written.recv().await, Some(expected));
        assert!(queue.resolve(expected, DeliveryStatus::Delivered));
    }
    for receipt in receipts {
        assert_eq!(receipt.await, DeliveryStatus::Delivered);
    }
}

#[tokio::test]
async fn receipt_stays_pending_until_resolved() {
    let (queue, mut written) = queue();
    queue.start();
    let mut receipt = task::spawn(queue.enqueue(OutboundPacket::text(8, 7, 0, "x")));
    assert_eq!(written.recv().await, Some(8));
    assert_pending!(receipt.poll());
    // Radio queue full: not a verdict yet.
    assert!(!queue.handle_queue_status(&status(8, 0, 0)));
    assert_pending!(receipt.poll());
    assert!(queue.handle_queue_status(&status(8, 0, 1)));
    // The worker forwards the verdict to the receipt.
    let result = loop {
        if let Poll::Ready(s) = receipt.poll() {
            break s;
        }
        tokio::task::yield_now().await;
    };
    assert_eq!(result, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn rejected_status_is_an_error() {
    let (queue, mut written) = queue();
    queue.start();
    let receipt = queue.enqueue(OutboundPacket::text(5, 7, 0, "x"));
    assert_eq!(written.recv().await, Some(5));
    assert!(queue.handle_queue_status(&status(5, 2, 3)));
    assert_eq!(receipt.await, DeliveryStatus::Error);
}

#[tokio::test]
async fn stop_fails_in_flight_and_keeps_unsent() {
    let (queue, mut written) = queue();
    queue.start();
    let first = queue.enqueue(OutboundPacket::text(1, 7, 0, "a"));
    let second = queue.enqueue(OutboundPacket::text(2, 7, 0, "b"));
    assert_eq!(written.recv().await, Some(1));
    queue.stop();
    assert_eq!(first.await, DeliveryStatus::Error);
    assert!(!queue.is_running());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.queued_len(), 1);

    queue.start();
    assert_eq!(written.recv().await, Some(2));
    assert!(queue.resolve(2, DeliveryStatus::Delivered));
    assert_eq!(second.await, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn close_fails_everything_queued() {
    let (queue, _written) = queue();
    let receipt = queue.enqueue(OutboundPacket::text(3, 7, 0, "x"));
    queue.close();
    assert_eq!(receipt.await, DeliveryStatus::Error);
}
