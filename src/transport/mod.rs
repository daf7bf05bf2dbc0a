//! Radio transports.
//!
//! A transport moves already-encoded protocol messages to the radio and reports what happens on
//! the link through a [`TransportEvent`] channel. It performs no queueing of its own: the
//! [`serializer::TransportSerializer`] above it guarantees that at most one operation is
//! outstanding at a time, and each transport reports the end of that operation with
//! [`TransportEvent::OperationComplete`].
//!
//! ```text
//!   PacketQueue / MeshService
//!            │ submit(tag, start_fn)
//!   ┌─────────────────────┐
//!   │ TransportSerializer │  single flight, per-op timeout
//!   └─────────────────────┘
//!            │ send_bytes
//!   ┌─────────────────────┐     TransportEvent::{Connected, Disconnected,
//!   │   RadioTransport    │ ──▶                  Received, OperationComplete}
//!   └─────────────────────┘
//! ```

pub mod framer;
pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;
pub mod serializer;
pub mod stream;

use bytes::Bytes;
use tokio::sync::mpsc;

pub use serializer::{PendingWork, TransportSerializer, WorkId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link is up and ready for a configuration request.
    Connected,
    /// Link dropped. `permanent` means the transport will not come back without a new open.
    Disconnected { permanent: bool },
    /// One complete inbound protocol message.
    Received(Bytes),
    /// The outstanding write finished; 0 is success.
    OperationComplete { status: i32 },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Byte-level link to a radio.
pub trait RadioTransport: Send + Sync + 'static {
    /// Hand one encoded `ToRadio` message to the link. `false` means it was refused
    /// synchronously; asynchronous failures surface as [`TransportEvent`]s.
    fn send_bytes(&self, payload: Bytes) -> bool;

    /// Ask the link to re-establish itself. Returns `false` when the transport cannot.
    fn reconnect(&self) -> bool {
        false
    }

    fn close(&self);

    fn name(&self) -> &str;
}
