//! Framed TCP transport (the firmware's network API on port 4403).
//!
//! One session task owns the socket: it forwards whole frames to the event channel, logs
//! device console text, and writes outbound frames one at a time, reporting each write as
//! [`TransportEvent::OperationComplete`]. `reconnect` replaces the session task.

use bytes::Bytes;
use log::{debug, info, trace, warn};
use std::io;
use std::sync::{Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::framer::{encode_frame, Decoded, FrameDecoder, START2};
use super::{EventSender, RadioTransport, TransportEvent};
use crate::error::STATUS_RELIABLE_WRITE_FAILED;
use crate::logutil::{escape_log, hex_snippet};

/// Bytes sent ahead of the first frame so a sleeping radio wakes its stream API.
const WAKE_PREAMBLE: [u8; 32] = [START2; 32];

/// Forward everything the decoder can produce.
pub(crate) fn drain_decoder(decoder: &mut FrameDecoder, events: &EventSender, link: &str) {
    while let Some(item) = decoder.next_item() {
        match item {
            Decoded::Frame(frame) => {
                trace!("{} rx frame len={} {}", link, frame.len(), hex_snippet(&frame, 16));
                let _ = events.send(TransportEvent::Received(frame));
            }
            Decoded::Console(line) => debug!("{} console: {}", link, escape_log(&line)),
        }
    }
}

struct Session {
    frames: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

pub struct TcpTransport {
    addr: String,
    name: String,
    events: EventSender,
    handle: Handle,
    session: Mutex<Option<Session>>,
    closed: Mutex<bool>,
}

impl TcpTransport {
    /// Start connecting to `addr`. Progress is reported on `events`; must be called inside a
    /// tokio runtime.
    pub fn open(addr: impl Into<String>, events: EventSender) -> Self {
        let addr = addr.into();
        let transport = Self {
            name: format!("tcp:{}", addr),
            addr,
            events,
            handle: Handle::current(),
            session: Mutex::new(None),
            closed: Mutex::new(false),
        };
        transport.spawn_session();
        transport
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        *self
            .closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_session(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = self.addr.clone();
        let events = self.events.clone();
        let task = self.handle.spawn(async move {
            match run_session(&addr, &events, rx).await {
                Ok(()) => debug!("tcp session {} ended", addr),
                Err(e) => warn!("tcp session {} dropped: {}", addr, e),
            }
            let _ = events.send(TransportEvent::Disconnected { permanent: false });
        });
        if let Some(old) = self.session().replace(Session { frames: tx, task }) {
            old.task.abort();
        }
    }
}

async fn run_session(
    addr: &str,
    events: &EventSender,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let (mut rd, mut wr) = stream.into_split();
    wr.write_all(&WAKE_PREAMBLE).await?;
    info!("tcp link {} up", addr);
    let _ = events.send(TransportEvent::Connected);

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            n = rd.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
                }
                decoder.push(&buf[..n]);
                drain_decoder(&mut decoder, events, addr);
            }
            frame = frames.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                match wr.write_all(&frame).await {
                    Ok(()) => {
                        let _ = events.send(TransportEvent::OperationComplete { status: 0 });
                    }
                    Err(e) => {
                        let _ = events.send(TransportEvent::OperationComplete {
                            status: STATUS_RELIABLE_WRITE_FAILED,
                        });
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl RadioTransport for TcpTransport {
    fn send_bytes(&self, payload: Bytes) -> bool {
        let frame = match encode_frame(&payload) {
            Ok(f) => f,
            Err(e) => {
                warn!("{}: {}", self.name, e);
                return false;
            }
        };
        match self.session().as_ref() {
            Some(session) => session.frames.send(frame).is_ok(),
            None => false,
        }
    }

    fn reconnect(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        info!("{}: reconnecting", self.name);
        self.spawn_session();
        true
    }

    fn close(&self) {
        *self
            .closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        if let Some(session) = self.session().take() {
            session.task.abort();
        }
        let _ = self
            .events
            .send(TransportEvent::Disconnected { permanent: true });
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::event_channel;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let (events, mut rx) = event_channel();
        let transport = TcpTransport::open(addr, events);

        let (mut peer, _) = listener.accept().await.expect("accept");
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));

        let mut preamble = [0u8; 32];
        peer.read_exact(&mut preamble).await.expect("preamble");
        assert!(preamble.iter().all(|b| *b == START2));

        assert!(transport.send_bytes(Bytes::from_static(&[1, 2])));
        let mut out = [0u8; 6];
        peer.read_exact(&mut out).await.expect("frame");
        assert_eq!(out, [0x94, 0xc3, 0, 2, 1, 2]);
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::OperationComplete { status: 0 })
        );

        peer.write_all(b"INFO boot\n").await.expect("console");
        peer.write_all(&encode_frame(&[7]).expect("encode"))
            .await
            .expect("write");
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Received(Bytes::from_static(&[7])))
        );

        transport.close();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Disconnected { permanent: true })
        );
        assert!(!transport.reconnect());
    }
}
