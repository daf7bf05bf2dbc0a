//! In-process simulated radio.
//!
//! `MockRadio` behaves like a cooperative device: every accepted write is completed, config
//! requests are answered with the configured identity, node list and power settings, and mesh
//! packets get a queue status and (optionally) a routing ack or nak. Every behaviour can be
//! switched off so tests can drive the protocol by hand with [`MockRadio::inject`].

use bytes::Bytes;
use log::debug;
use prost::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{EventSender, RadioTransport, TransportEvent};
use crate::protobuf::{
    config, from_radio, routing, to_radio, Config, Data, FromRadio, MeshPacket, MyNodeInfo,
    NodeInfo, PortNum, QueueStatus, Routing, ToRadio, CONFIG_ONLY_NONCE, NODE_INFO_NONCE,
};

/// How the simulated mesh answers packets that asked for an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Send nothing.
    Silent,
    /// Ack from the destination node.
    Ack,
    /// Ack relayed by `relay`, not the destination.
    RelayAck { relay: u32 },
    /// Nak with the given `routing::Error` code.
    Nak(i32),
}

#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Refuse writes synchronously.
    pub refuse_sends: bool,
    /// Emit `OperationComplete` for every accepted write.
    pub complete_writes: bool,
    /// Answer `want_config_id` requests.
    pub answer_config: bool,
    /// Answer packets with a queue status.
    pub queue_status: bool,
    /// `free` slots reported in queue statuses.
    pub queue_free: u32,
    pub ack_mode: AckMode,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            refuse_sends: false,
            complete_writes: true,
            answer_config: true,
            queue_status: true,
            queue_free: 16,
            ack_mode: AckMode::Ack,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    pub my_node_num: u32,
    pub nodes: Vec<NodeInfo>,
    pub role: i32,
    pub is_power_saving: bool,
    pub ls_secs: u32,
}

pub struct MockRadio {
    events: EventSender,
    device: Mutex<MockDevice>,
    behavior: Mutex<MockBehavior>,
    sent: Mutex<Vec<ToRadio>>,
    closed: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockRadio {
    pub fn new(device: MockDevice, events: EventSender) -> Self {
        Self {
            events,
            device: Mutex::new(device),
            behavior: Mutex::new(MockBehavior::default()),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Report the link as up.
    pub fn connect(&self) {
        self.closed.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Connected);
    }

    /// Simulate the radio going away (sleep or unplug).
    pub fn drop_link(&self, permanent: bool) {
        let _ = self.events.send(TransportEvent::Disconnected { permanent });
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *lock(&self.behavior) = behavior;
    }

    pub fn update_behavior(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut lock(&self.behavior));
    }

    pub fn update_device(&self, f: impl FnOnce(&mut MockDevice)) {
        f(&mut lock(&self.device));
    }

    /// Deliver a message as if the radio had sent it.
    pub fn inject(&self, msg: FromRadio) {
        let _ = self
            .events
            .send(TransportEvent::Received(Bytes::from(msg.encode_to_vec())));
    }

    pub fn inject_raw(&self, bytes: Bytes) {
        let _ = self.events.send(TransportEvent::Received(bytes));
    }

    pub fn complete_write(&self, status: i32) {
        let _ = self
            .events
            .send(TransportEvent::OperationComplete { status });
    }

    /// Everything written so far, decoded.
    pub fn sent(&self) -> Vec<ToRadio> {
        lock(&self.sent).clone()
    }

    /// Mesh packets written so far.
    pub fn sent_packets(&self) -> Vec<MeshPacket> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m.payload_variant {
                Some(to_radio::PayloadVariant::Packet(p)) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Config nonces requested so far.
    pub fn config_requests(&self) -> Vec<u32> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m.payload_variant {
                Some(to_radio::PayloadVariant::WantConfigId(n)) => Some(n),
                _ => None,
            })
            .collect()
    }

    fn emit(&self, variant: from_radio::PayloadVariant) {
        self.inject(FromRadio {
            id: 0,
            payload_variant: Some(variant),
        });
    }

    fn answer_config(&self, nonce: u32) {
        let device = lock(&self.device).clone();
        if nonce != NODE_INFO_NONCE {
            self.emit(from_radio::PayloadVariant::MyInfo(MyNodeInfo {
                my_node_num: device.my_node_num,
                ..Default::default()
            }));
            self.emit(from_radio::PayloadVariant::Config(Config {
                payload_variant: Some(config::PayloadVariant::Device(config::DeviceConfig {
                    role: device.role,
                })),
            }));
            self.emit(from_radio::PayloadVariant::Config(Config {
                payload_variant: Some(config::PayloadVariant::Power(config::PowerConfig {
                    is_power_saving: device.is_power_saving,
                    ls_secs: device.ls_secs,
                    ..Default::default()
                })),
            }));
        }
        if nonce != CONFIG_ONLY_NONCE {
            for node in device.nodes {
                self.emit(from_radio::PayloadVariant::NodeInfo(node));
            }
        }
        self.emit(from_radio::PayloadVariant::ConfigCompleteId(nonce));
    }

    fn answer_packet(&self, packet: &MeshPacket, behavior: &MockBehavior) {
        if behavior.queue_status {
            self.emit(from_radio::PayloadVariant::QueueStatus(QueueStatus {
                res: 0,
                free: behavior.queue_free,
                maxlen: 16,
                mesh_packet_id: packet.id,
            }));
        }
        if !packet.want_ack || packet.id == 0 {
            return;
        }
        let my_num = lock(&self.device).my_node_num;
        let (from, reason, relay) = match behavior.ack_mode {
            AckMode::Silent => return,
            AckMode::Ack => (packet.to, routing::Error::None as i32, 0),
            AckMode::RelayAck { relay } => (relay, routing::Error::None as i32, relay),
            AckMode::Nak(code) => (my_num, code, 0),
        };
        let body = Routing {
            variant: Some(routing::Variant::ErrorReason(reason)),
        };
        self.emit(from_radio::PayloadVariant::Packet(MeshPacket {
            from,
            to: my_num,
            channel: packet.channel,
            relay_node: relay,
            payload_variant: Some(crate::protobuf::mesh_packet::PayloadVariant::Decoded(
                Data {
                    portnum: PortNum::RoutingApp as i32,
                    payload: Bytes::from(body.encode_to_vec()),
                    request_id: packet.id,
                    ..Default::default()
                },
            )),
            ..Default::default()
        }));
    }
}

impl RadioTransport for MockRadio {
    fn send_bytes(&self, payload: Bytes) -> bool {
        let behavior = lock(&self.behavior).clone();
        if behavior.refuse_sends || self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let msg = match ToRadio::decode(payload) {
            Ok(m) => m,
            Err(e) => {
                debug!("mock radio: undecodable write: {}", e);
                return false;
            }
        };
        lock(&self.sent).push(msg.clone());
        if behavior.complete_writes {
            self.complete_write(0);
        }
        match msg.payload_variant {
            Some(to_radio::PayloadVariant::WantConfigId(nonce)) if behavior.answer_config => {
                self.answer_config(nonce)
            }
            Some(to_radio::PayloadVariant::Packet(ref p)) => self.answer_packet(p, &behavior),
            _ => {}
        }
        true
    }

    fn reconnect(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.connect();
        true
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.drop_link(true);
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::event_channel;

    #[tokio::test]
    async fn config_request_is_answered_in_order() {
        let (events, mut rx) = event_channel();
        let radio = MockRadio::new(
            MockDevice {
                my_node_num: 0x1234,
                nodes: vec![NodeInfo {
                    num: 0x99,
                    ..Default::default()
                }],
                ..Default::default()
            },
            events,
        );
        assert!(radio.send_bytes(ToRadio::want_config(CONFIG_ONLY_NONCE).to_bytes()));
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::OperationComplete { status: 0 })
        );
        let mut variants = Vec::new();
        while let Ok(TransportEvent::Received(b)) = rx.try_recv() {
            variants.push(FromRadio::decode(b).expect("decode").payload_variant);
        }
        assert!(matches!(
            variants.first(),
            Some(Some(from_radio::PayloadVariant::MyInfo(_)))
        ));
        assert!(!variants
            .iter()
            .any(|v| matches!(v, Some(from_radio::PayloadVariant::NodeInfo(_)))));
        assert_eq!(
            variants.last(),
            Some(&Some(from_radio::PayloadVariant::ConfigCompleteId(
                CONFIG_ONLY_NONCE
            )))
        );
    }

    #[tokio::test]
    async fn refused_write_is_not_recorded() {
        let (events, _rx) = event_channel();
        let radio = MockRadio::new(MockDevice::default(), events);
        radio.update_behavior(|b| b.refuse_sends = true);
        assert!(!radio.send_bytes(ToRadio::heartbeat().to_bytes()));
        assert!(radio.sent().is_empty());
    }
}
