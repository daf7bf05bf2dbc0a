//! Framed serial transport for USB/UART-attached radios.
//!
//! The port is driven from two OS threads: a reader polling with a short timeout and a writer
//! draining the outbound frame channel. Both stop when the session's stop flag is raised.

use bytes::Bytes;
use log::{debug, info, warn};
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

use super::framer::{encode_frame, FrameDecoder, START2};
use super::stream::drain_decoder;
use super::{EventSender, RadioTransport, TransportEvent};
use crate::error::STATUS_RELIABLE_WRITE_FAILED;

const READ_TIMEOUT: Duration = Duration::from_millis(500);

struct Session {
    frames: mpsc::UnboundedSender<Bytes>,
    stop: Arc<AtomicBool>,
}

impl Session {
    fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    name: String,
    events: EventSender,
    session: Mutex<Option<Session>>,
    closed: AtomicBool,
}

fn open_port(port_name: &str, baud_rate: u32) -> io::Result<Box<dyn SerialPort>> {
    debug!("Opening serial port {} at {} baud", port_name, baud_rate);
    let mut builder = serialport::new(port_name, baud_rate).timeout(READ_TIMEOUT);
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder.open().map_err(io::Error::from)?;

    // Toggle DTR/RTS so the device wakes
    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    thread::sleep(Duration::from_millis(150));
    let _ = port.clear(serialport::ClearBuffer::All);
    Ok(port)
}

impl SerialTransport {
    pub fn open(
        port_name: impl Into<String>,
        baud_rate: u32,
        events: EventSender,
    ) -> io::Result<Self> {
        let port_name = port_name.into();
        let transport = Self {
            name: format!("serial:{}", port_name),
            port_name,
            baud_rate,
            events,
            session: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        transport.start_session()?;
        Ok(transport)
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_session(&self) -> io::Result<()> {
        let mut port = open_port(&self.port_name, self.baud_rate)?;
        port.write_all(&[START2; 32])?;
        let mut writer = port.try_clone().map_err(io::Error::from)?;
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let reader_stop = stop.clone();
        let reader_events = self.events.clone();
        let link = self.name.clone();
        thread::spawn(move || {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 512];
            while !reader_stop.load(Ordering::SeqCst) {
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        decoder.push(&buf[..n]);
                        drain_decoder(&mut decoder, &reader_events, &link);
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        if !reader_stop.swap(true, Ordering::SeqCst) {
                            warn!("{} read failed: {}", link, e);
                            let _ = reader_events
                                .send(TransportEvent::Disconnected { permanent: false });
                        }
                        break;
                    }
                }
            }
        });

        let writer_stop = stop.clone();
        let writer_events = self.events.clone();
        let link = self.name.clone();
        thread::spawn(move || {
            while let Some(frame) = rx.blocking_recv() {
                if writer_stop.load(Ordering::SeqCst) {
                    break;
                }
                let status = match writer.write_all(&frame).and_then(|_| writer.flush()) {
                    Ok(()) => 0,
                    Err(e) => {
                        warn!("{} write failed: {}", link, e);
                        STATUS_RELIABLE_WRITE_FAILED
                    }
                };
                let _ = writer_events.send(TransportEvent::OperationComplete { status });
            }
        });

        if let Some(old) = self.session().replace(Session { frames: tx, stop }) {
            old.shutdown();
        }
        info!("{} open", self.name);
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }
}

impl RadioTransport for SerialTransport {
    fn send_bytes(&self, payload: Bytes) -> bool {
        let frame = match encode_frame(&payload) {
            Ok(f) => f,
            Err(e) => {
                warn!("{}: {}", self.name, e);
                return false;
            }
        };
        match self.session().as_ref() {
            Some(s) if !s.stop.load(Ordering::SeqCst) => s.frames.send(frame).is_ok(),
            _ => false,
        }
    }

    fn reconnect(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(old) = self.session().take() {
            old.shutdown();
        }
        match self.start_session() {
            Ok(()) => true,
            Err(e) => {
                warn!("{} reopen failed: {}", self.name, e);
                let _ = self
                    .events
                    .send(TransportEvent::Disconnected { permanent: false });
                false
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(session) = self.session().take() {
            session.shutdown();
        }
        let _ = self
            .events
            .send(TransportEvent::Disconnected { permanent: true });
    }

    fn name(&self) -> &str {
        &self.name
    }
}
