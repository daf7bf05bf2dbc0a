//! # Meshlink - link core for Meshtastic radios
//!
//! Meshlink keeps one connection to a Meshtastic radio healthy and gives applications a
//! reliable way to send through it.
//!
//! ## Features
//!
//! - **Transports**: USB/UART serial (feature `serial`), TCP, and an in-process mock radio.
//! - **Serialized writes**: every operation on the link runs one at a time with its own timeout.
//! - **Connection lifecycle**: `Disconnected → Connecting → Connected`, plus `DeviceSleep` for
//!   radios that go quiet in light sleep.
//! - **Packet queue**: FIFO send with per-packet delivery receipts driven by radio queue status.
//! - **Ack/retry**: routing acks update stored messages; `MAX_RETRANSMIT` failures can be retried
//!   under a new packet id after an application decision.
//! - **Node database**: merges node announcements, positions and telemetry, persisted as JSON.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshlink::config::Config;
//! use meshlink::service::{MeshService, ServiceOptions};
//! use meshlink::transport::{event_channel, stream::TcpTransport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshlink.toml").await?;
//!     let (events_tx, events_rx) = event_channel();
//!     let transport = Arc::new(TcpTransport::open(&config.radio.tcp_address, events_tx));
//!     let service =
//!         MeshService::start(transport, events_rx, ServiceOptions::from_config(&config)).await;
//!     let receipt = service.send_text(meshlink::protobuf::BROADCAST_NUM, 0, "hello").await?;
//!     println!("{:?}", receipt.await);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`transport`] - framing, the operation serializer and the concrete links
//! - [`connection`] - connection state machine and the configuration handshake
//! - [`queue`] - outbound packet queue and delivery receipts
//! - [`retry`] - routing acknowledgements and retry decisions
//! - [`nodes`] - node database
//! - [`storage`] - node and message persistence
//! - [`service`] - wires the above to one radio
//! - [`config`] - configuration file handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   MeshService   │ ← event loop, public API
//! └─────────────────┘
//!     │         │
//! ┌────────┐ ┌───────────────┐
//! │ Queue  │ │ Nodes / Retry │ ← delivery, node state, acks
//! └────────┘ └───────────────┘
//!     │
//! ┌─────────────────┐
//! │   Serializer    │ ← one operation at a time
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Transport     │ ← serial / tcp / mock
//! └─────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod logutil;
pub mod metrics;
pub mod nodes;
pub mod protobuf;
pub mod queue;
pub mod retry;
pub mod service;
pub mod storage;
pub mod transport;

pub use connection::{ConnectionState, ConnectionStateMachine};
pub use error::{ConnectError, RadioError, TransportError};
pub use queue::{DeliveryStatus, OutboundPacket, PacketQueue};
pub use service::{MeshService, ServiceOptions};
