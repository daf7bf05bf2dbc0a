//! # Mesh service
//!
//! Owns one radio link and everything that depends on it:
//!
//! ```text
//!   TransportEvent ──▶ event loop ──▶ ConnectionStateMachine ──▶ PacketQueue (start/stop)
//!                          │
//!                          ├──▶ NodeDatabase      (my_info, node_info, user/position/telemetry)
//!                          ├──▶ PacketQueue       (queue_status, routing resolution)
//!                          └──▶ AckRetryController (routing ack/nak, retry decisions)
//! ```
//!
//! Every write to the radio, whether a mesh packet, config request or heartbeat, goes through
//! the link's [`TransportSerializer`], which is rebuilt each time the link comes up.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use prost::Message;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::{
    ConfigRequester, ConnectAttempt, ConnectionState, ConnectionStateMachine, ConnectionTuning,
    StateObserver,
};
use crate::error::{RadioError, TransportError};
use crate::logutil::{escape_log, hex_snippet};
use crate::metrics;
use crate::nodes::NodeDatabase;
use crate::protobuf::{
    config, decode_from_radio, from_radio, telemetry, FromRadio, MeshPacket, PortNum, Position,
    Routing, Telemetry, ToRadio, User,
};
use crate::queue::{
    DeliveryReceipt, DeliveryStatus, OutboundPacket, PacketIdGenerator, PacketQueue,
    PacketWriter, QueueTuning,
};
use crate::retry::{AckRetryController, RetryBroker, RetryTuning, StatusUpdate};
use crate::storage::{MemoryMessageStore, MessageKind, MessageStore, NodeStore, StoredMessage};
use crate::transport::{EventReceiver, RadioTransport, TransportEvent, TransportSerializer};

/// Bound on any single serialized write.
const OP_TIMEOUT: Duration = Duration::from_secs(10);
/// Consecutive undecodable frames before the link is considered broken.
const MAX_CONSECUTIVE_PROTOCOL_ERRORS: u32 = 5;
/// Largest application payload a mesh packet carries.
pub const MAX_DATA_PAYLOAD: usize = 233;

pub struct ServiceOptions {
    pub queue: QueueTuning,
    pub retry: RetryTuning,
    pub connection: ConnectionTuning,
    pub node_store: Option<Arc<dyn NodeStore>>,
    pub message_store: Arc<dyn MessageStore>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            queue: QueueTuning::default(),
            retry: RetryTuning::default(),
            connection: ConnectionTuning::default(),
            node_store: None,
            message_store: Arc::new(MemoryMessageStore::new()),
        }
    }
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue: config.queue_tuning(),
            retry: config.retry_tuning(),
            connection: config.connection_tuning(),
            ..Default::default()
        }
    }

    pub fn with_node_store(mut self, store: Arc<dyn NodeStore>) -> Self {
        self.node_store = Some(store);
        self
    }

    pub fn with_message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = store;
        self
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The transport plus the serializer for the current connection.
struct Link {
    transport: Arc<dyn RadioTransport>,
    serializer: Mutex<TransportSerializer<()>>,
}

impl Link {
    fn serializer(&self) -> TransportSerializer<()> {
        lock(&self.serializer).clone()
    }

    /// Start a fresh serializer for a new connection, closing the old one.
    fn renew(&self) {
        let old = std::mem::replace(&mut *lock(&self.serializer), TransportSerializer::new());
        old.close();
    }

    async fn write(&self, tag: &'static str, msg: ToRadio) -> Result<(), TransportError> {
        let bytes: Bytes = msg.to_bytes();
        trace!("{} write {} {}", tag, bytes.len(), hex_snippet(&bytes, 16));
        let transport = self.transport.clone();
        self.serializer()
            .submit(tag, move |_| transport.send_bytes(bytes), Some(OP_TIMEOUT))
            .await
    }
}

#[async_trait]
impl PacketWriter for Link {
    async fn write_packet(&self, packet: MeshPacket) -> Result<(), TransportError> {
        self.write("send_packet", ToRadio::packet(packet)).await
    }
}

#[async_trait]
impl ConfigRequester for Arc<Link> {
    async fn request_config(&self, nonce: u32) -> Result<(), TransportError> {
        self.write("want_config", ToRadio::want_config(nonce)).await
    }
}

pub struct MeshService {
    link: Arc<Link>,
    state: ConnectionStateMachine,
    queue: PacketQueue,
    nodes: Arc<NodeDatabase>,
    controller: Arc<AckRetryController>,
    broker: Arc<RetryBroker>,
    messages: Arc<dyn MessageStore>,
    ids: Arc<PacketIdGenerator>,
    config_complete: watch::Sender<Option<u32>>,
    inbound: broadcast::Sender<MeshPacket>,
    tuning: ConnectionTuning,
    protocol_errors: AtomicU32,
    handshake: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshService {
    /// Wire up the link core around `transport` and start consuming `events`.
    pub async fn start(
        transport: Arc<dyn RadioTransport>,
        events: EventReceiver,
        options: ServiceOptions,
    ) -> Arc<Self> {
        let nodes = Arc::new(NodeDatabase::new(options.node_store));
        nodes.load_snapshot().await;

        let link = Arc::new(Link {
            transport,
            serializer: Mutex::new(TransportSerializer::new()),
        });
        let queue = PacketQueue::new(link.clone(), options.queue);
        let state = ConnectionStateMachine::new(options.connection.clone());
        state.add_observer(Arc::new(queue.clone()));

        let ids = Arc::new(PacketIdGenerator::new());
        let broker = Arc::new(RetryBroker::new());
        let controller = Arc::new(AckRetryController::new(
            options.message_store.clone(),
            broker.clone(),
            queue.clone(),
            ids.clone(),
            options.retry,
        ));
        let (config_complete, _) = watch::channel(None);
        let (inbound, _) = broadcast::channel(256);

        let service = Arc::new(Self {
            link,
            state,
            queue,
            nodes,
            controller,
            broker,
            messages: options.message_store,
            ids,
            config_complete,
            inbound,
            tuning: options.connection,
            protocol_errors: AtomicU32::new(0),
            handshake: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        let event_loop = tokio::spawn(service.clone().run_events(events));
        lock(&service.tasks).push(event_loop);
        if let Some(period) = service.tuning.heartbeat {
            let heartbeat = tokio::spawn(run_heartbeat(Arc::downgrade(&service), period));
            lock(&service.tasks).push(heartbeat);
        }
        info!("mesh service started on {}", service.link.transport.name());
        service
    }

    async fn run_events(self: Arc<Self>, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("transport event stream ended");
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_link_up(),
            TransportEvent::Disconnected { permanent } => self.on_link_lost(permanent),
            TransportEvent::Received(frame) => self.handle_frame(&frame).await,
            TransportEvent::OperationComplete { status } => {
                self.link.serializer().complete_current_status(status, ());
            }
        }
    }

    fn on_link_up(self: &Arc<Self>) {
        info!("link up via {}", self.link.transport.name());
        self.protocol_errors.store(0, Ordering::SeqCst);
        self.link.renew();
        self.nodes.set_ready(false);
        self.config_complete.send_replace(None);
        self.state.link_up();
        self.controller.notify_reconnected();

        let attempt = ConnectAttempt::new(
            self.link.clone(),
            self.config_complete.subscribe(),
            &self.tuning,
        );
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let result = attempt.run().await;
            let Some(service) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(()) => {
                    info!("configuration complete ({} nodes)", service.nodes.len());
                    service.nodes.set_ready(true);
                    service.state.config_complete();
                }
                Err(e) => {
                    warn!("handshake failed: {}", e);
                    service.force_reconnect("handshake failed");
                }
            }
        });
        if let Some(previous) = lock(&self.handshake).replace(task) {
            previous.abort();
        }
    }

    fn on_link_lost(&self, permanent: bool) {
        info!(
            "link lost via {} (permanent={})",
            self.link.transport.name(),
            permanent
        );
        if let Some(handshake) = lock(&self.handshake).take() {
            handshake.abort();
        }
        self.link
            .serializer()
            .lost_link(if permanent { "link closed" } else { "link lost" });
        self.state.link_lost(permanent);
        if permanent {
            self.broker.cancel_pending_retries();
        }
    }

    /// Treat the link as failed and ask the transport to re-establish it.
    fn force_reconnect(&self, reason: &str) {
        warn!("{}: dropping link ({})", self.link.transport.name(), reason);
        self.on_link_lost(false);
        if !self.link.transport.reconnect() {
            debug!("{} cannot reconnect on its own", self.link.transport.name());
        }
    }

    async fn handle_frame(&self, frame: &[u8]) {
        match decode_from_radio(frame) {
            Ok(msg) => {
                self.protocol_errors.store(0, Ordering::SeqCst);
                self.handle_from_radio(msg).await;
            }
            Err(e) => {
                metrics::inc_protocol_errors();
                let count = self.protocol_errors.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "dropping malformed frame ({} in a row): {} [{}]",
                    count,
                    e,
                    hex_snippet(frame, 16)
                );
                if count >= MAX_CONSECUTIVE_PROTOCOL_ERRORS {
                    warn!("too many malformed frames; forcing reconnect");
                    self.protocol_errors.store(0, Ordering::SeqCst);
                    self.force_reconnect("protocol errors");
                }
            }
        }
    }

    async fn handle_from_radio(&self, msg: FromRadio) {
        use from_radio::PayloadVariant as FR;
        match msg.payload_variant {
            Some(FR::Packet(packet)) => self.handle_mesh_packet(packet).await,
            Some(FR::MyInfo(info)) => self.nodes.set_my_node_num(info.my_node_num),
            Some(FR::NodeInfo(info)) => {
                self.nodes.install_node_info(info).await;
            }
            Some(FR::Config(cfg)) => self.handle_config(cfg),
            Some(FR::ConfigCompleteId(nonce)) => {
                debug!("config_complete_id={}", nonce);
                self.config_complete.send_replace(Some(nonce));
            }
            Some(FR::Rebooted(_)) => info!("radio reports reboot"),
            Some(FR::QueueStatus(status)) => {
                self.queue.handle_queue_status(&status);
            }
            None => trace!("empty FromRadio id={}", msg.id),
        }
    }

    fn handle_config(&self, cfg: crate::protobuf::Config) {
        match cfg.payload_variant {
            Some(config::PayloadVariant::Device(device)) => {
                let is_router = device.role == config::device_config::Role::Router as i32;
                self.state.update_power(|p| p.is_router = is_router);
            }
            Some(config::PayloadVariant::Power(power)) => {
                self.state.update_power(|p| {
                    p.is_power_saving = power.is_power_saving;
                    p.ls_secs = power.ls_secs;
                });
            }
            None => {}
        }
    }

    async fn handle_mesh_packet(&self, packet: MeshPacket) {
        self.nodes.handle_packet_heard(&packet).await;
        let Some(data) = packet.decoded() else {
            trace!("encrypted packet from !{:08x}", packet.from);
            return;
        };
        let port = PortNum::try_from(data.portnum).unwrap_or(PortNum::UnknownApp);
        match port {
            PortNum::RoutingApp => match Routing::decode(data.payload.clone()) {
                Ok(routing) => self.handle_routing(&packet, data.request_id, routing.error_reason()),
                Err(e) => {
                    metrics::inc_protocol_errors();
                    warn!("bad routing payload from !{:08x}: {}", packet.from, e);
                }
            },
            PortNum::NodeinfoApp => match User::decode(data.payload.clone()) {
                Ok(user) => {
                    self.nodes
                        .handle_received_user(packet.from, user, packet.channel, false)
                        .await;
                }
                Err(e) => warn!("bad user payload from !{:08x}: {}", packet.from, e),
            },
            PortNum::PositionApp => match Position::decode(data.payload.clone()) {
                Ok(position) => {
                    self.nodes
                        .handle_received_position(packet.from, &position, packet.rx_time)
                        .await;
                }
                Err(e) => warn!("bad position payload from !{:08x}: {}", packet.from, e),
            },
            PortNum::TelemetryApp => match Telemetry::decode(data.payload.clone()) {
                Ok(Telemetry {
                    variant: Some(telemetry::Variant::DeviceMetrics(m)),
                    ..
                }) => {
                    self.nodes.handle_received_telemetry(packet.from, &m).await;
                }
                Ok(_) => trace!("non-device telemetry from !{:08x}", packet.from),
                Err(e) => warn!("bad telemetry payload from !{:08x}: {}", packet.from, e),
            },
            PortNum::TextMessageApp => info!(
                "text from !{:08x} ch={}: {}",
                packet.from,
                packet.channel,
                escape_log(&String::from_utf8_lossy(&data.payload))
            ),
            other => trace!("packet on {:?} from !{:08x}", other, packet.from),
        }
        let _ = self.inbound.send(packet);
    }

    fn handle_routing(&self, packet: &MeshPacket, request_id: u32, error_reason: i32) {
        if request_id == 0 {
            trace!("routing without request id from !{:08x}", packet.from);
            return;
        }
        // Any routing answer means the radio put the packet on air; the ack or nak itself is
        // the controller's business.
        self.queue.resolve(request_id, DeliveryStatus::Delivered);

        let controller = self.controller.clone();
        let from = packet.from;
        let relay = (packet.relay_node != 0).then_some(packet.relay_node);
        tokio::spawn(async move {
            let outcome = controller
                .handle_routing(request_id, from, error_reason, relay)
                .await;
            debug!("routing for id=0x{:08x}: {:?}", request_id, outcome);
        });
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    /// Wait until the connection reaches `target`, or `timeout` passes.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let reached = tokio::time::timeout(timeout, async move {
            rx.wait_for(|s| *s == target).await.is_ok()
        })
        .await;
        reached.unwrap_or(false)
    }

    pub fn add_state_observer(&self, observer: Arc<dyn StateObserver>) {
        self.state.add_observer(observer);
    }

    pub fn nodes(&self) -> &Arc<NodeDatabase> {
        &self.nodes
    }

    pub fn retry_broker(&self) -> &Arc<RetryBroker> {
        &self.broker
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusUpdate> {
        self.controller.subscribe()
    }

    /// Every decoded mesh packet heard from the radio.
    pub fn subscribe_packets(&self) -> broadcast::Receiver<MeshPacket> {
        self.inbound.subscribe()
    }

    pub fn generate_packet_id(&self) -> u32 {
        self.ids.next_id()
    }

    pub fn enqueue_packet(&self, packet: OutboundPacket) -> DeliveryReceipt {
        self.queue.enqueue(packet)
    }

    /// Queue a packet and wait for the radio's verdict.
    pub async fn send_packet(&self, packet: OutboundPacket) -> DeliveryStatus {
        self.queue.enqueue(packet).await
    }

    pub async fn send_text(
        &self,
        to: u32,
        channel: u32,
        text: &str,
    ) -> Result<DeliveryReceipt, RadioError> {
        self.send_tracked(
            to,
            channel,
            MessageKind::Text {
                text: text.to_string(),
            },
        )
        .await
    }

    pub async fn send_reaction(
        &self,
        to: u32,
        channel: u32,
        reply_id: u32,
        emoji: &str,
    ) -> Result<DeliveryReceipt, RadioError> {
        self.send_tracked(
            to,
            channel,
            MessageKind::Reaction {
                emoji: emoji.to_string(),
                reply_id,
            },
        )
        .await
    }

    /// Store a message, queue it, and keep its stored status in step with the queue.
    async fn send_tracked(
        &self,
        to: u32,
        channel: u32,
        kind: MessageKind,
    ) -> Result<DeliveryReceipt, RadioError> {
        let id = self.generate_packet_id();
        let msg = StoredMessage::outgoing(id, to, channel, kind);
        let packet = crate::retry::outbound_for(&msg)
            .ok_or_else(|| RadioError::Protocol("message kind cannot be sent".into()))?;
        if packet.data.payload.len() > MAX_DATA_PAYLOAD {
            return Err(RadioError::Protocol(format!(
                "payload of {} bytes exceeds {}",
                packet.data.payload.len(),
                MAX_DATA_PAYLOAD
            )));
        }
        if let Err(e) = self.messages.save(&msg).await {
            warn!("failed to store outgoing message id=0x{:08x}: {}", id, e);
        }

        Ok(self.controller.track(self.queue.enqueue(packet)))
    }

    /// Shut everything down: pending work fails, pending retry questions are declined.
    pub fn close(&self) {
        info!("closing mesh service");
        if let Some(handshake) = lock(&self.handshake).take() {
            handshake.abort();
        }
        self.controller.close();
        self.queue.close();
        self.link.serializer().close();
        self.state.link_lost(true);
        self.link.transport.close();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

async fn run_heartbeat(service: Weak<MeshService>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(service) = service.upgrade() else {
            return;
        };
        if service.state() != ConnectionState::Connected {
            continue;
        }
        if let Err(e) = service.link.write("heartbeat", ToRadio::heartbeat()).await {
            debug!("heartbeat failed: {}", e);
        }
    }
}
