//! Meshtastic envelope messages
//!
//! Only the subset of the Meshtastic protobuf schema the link core needs is declared here,
//! using `prost` derives with the upstream field numbers. Message bodies the core does not
//! interpret (admin, store-and-forward, module config) are skipped as unknown fields on decode.
//!
//! Field numbers follow `meshtastic/mesh.proto`, `config.proto` and `portnums.proto`.

use bytes::Bytes;
use prost::Message;

use crate::error::RadioError;

/// Destination value used for broadcasts.
pub const BROADCAST_NUM: u32 = 0xffff_ffff;
/// User id reported for the broadcast address.
pub const ID_BROADCAST: &str = "^all";

/// `want_config_id` nonce requesting configuration without the node database.
pub const CONFIG_ONLY_NONCE: u32 = 69420;
/// `want_config_id` nonce requesting only the node database.
pub const NODE_INFO_NONCE: u32 = 69421;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    RemoteHardwareApp = 2,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    AdminApp = 6,
    TextMessageCompressedApp = 7,
    WaypointApp = 8,
    TelemetryApp = 67,
    TracerouteApp = 70,
    NeighborinfoApp = 71,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HardwareModel {
    Unset = 0,
    TloraV2 = 1,
    TloraV1 = 2,
    TloraV211p6 = 3,
    Tbeam = 4,
    HeltecV20 = 5,
    TbeamV0p7 = 6,
    TEcho = 7,
    TloraV11p3 = 8,
    Rak4631 = 9,
    HeltecV3 = 43,
    PrivateHw = 255,
}

/// Transmit priority of a [`MeshPacket`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Priority {
    Unset = 0,
    Min = 1,
    Background = 10,
    Default = 64,
    Reliable = 70,
    Response = 80,
    High = 100,
    Ack = 120,
    Max = 127,
}

#[derive(Clone, PartialEq, Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    #[prost(fixed32, tag = "8")]
    pub emoji: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<mesh_packet::PayloadVariant>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(enumeration = "Priority", tag = "11")]
    pub priority: i32,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(bool, tag = "14")]
    pub via_mqtt: bool,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
    #[prost(uint32, tag = "19")]
    pub relay_node: u32,
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        #[prost(bytes = "bytes", tag = "5")]
        Encrypted(::bytes::Bytes),
    }
}

impl MeshPacket {
    /// Decoded payload, if the packet was not left encrypted by the radio.
    pub fn decoded(&self) -> Option<&Data> {
        match &self.payload_variant {
            Some(mesh_packet::PayloadVariant::Decoded(d)) => Some(d),
            _ => None,
        }
    }

    /// Number of hops this packet travelled, when the radio reported enough to tell.
    pub fn hops_away(&self) -> Option<u32> {
        if self.hop_start == 0 || self.hop_limit > self.hop_start {
            None
        } else {
            Some(self.hop_start - self.hop_limit)
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Routing {
    #[prost(oneof = "routing::Variant", tags = "3")]
    pub variant: Option<routing::Variant>,
}

pub mod routing {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Variant {
        #[prost(enumeration = "Error", tag = "3")]
        ErrorReason(i32),
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Error {
        None = 0,
        NoRoute = 1,
        GotNak = 2,
        Timeout = 3,
        NoInterface = 4,
        MaxRetransmit = 5,
        NoChannel = 6,
        TooLarge = 7,
        NoResponse = 8,
        DutyCycleLimit = 9,
        BadRequest = 32,
        NotAuthorized = 33,
        PkiFailed = 34,
        PkiUnknownPubkey = 35,
        AdminBadSessionKey = 36,
        AdminPublicKeyUnauthorized = 37,
        RateLimitExceeded = 38,
    }
}

impl Routing {
    /// Raw error reason; a routing message without one is an ack.
    pub fn error_reason(&self) -> i32 {
        match self.variant {
            Some(routing::Variant::ErrorReason(e)) => e,
            None => routing::Error::None as i32,
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct QueueStatus {
    #[prost(int32, tag = "1")]
    pub res: i32,
    #[prost(uint32, tag = "2")]
    pub free: u32,
    #[prost(uint32, tag = "3")]
    pub maxlen: u32,
    #[prost(uint32, tag = "4")]
    pub mesh_packet_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(enumeration = "HardwareModel", tag = "5")]
    pub hw_model: i32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(bytes = "bytes", tag = "8")]
    pub public_key: Bytes,
}

#[derive(Clone, PartialEq, Message)]
pub struct Position {
    #[prost(sfixed32, optional, tag = "1")]
    pub latitude_i: Option<i32>,
    #[prost(sfixed32, optional, tag = "2")]
    pub longitude_i: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub altitude: Option<i32>,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceMetrics {
    #[prost(uint32, optional, tag = "1")]
    pub battery_level: Option<u32>,
    #[prost(float, optional, tag = "2")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub channel_utilization: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub air_util_tx: Option<f32>,
    #[prost(uint32, optional, tag = "5")]
    pub uptime_seconds: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(oneof = "telemetry::Variant", tags = "2")]
    pub variant: Option<telemetry::Variant>,
}

pub mod telemetry {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "2")]
        DeviceMetrics(super::DeviceMetrics),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeInfo {
    #[prost(uint32, tag = "1")]
    pub num: u32,
    #[prost(message, optional, tag = "2")]
    pub user: Option<User>,
    #[prost(message, optional, tag = "3")]
    pub position: Option<Position>,
    #[prost(float, tag = "4")]
    pub snr: f32,
    #[prost(fixed32, tag = "5")]
    pub last_heard: u32,
    #[prost(message, optional, tag = "6")]
    pub device_metrics: Option<DeviceMetrics>,
    #[prost(uint32, tag = "7")]
    pub channel: u32,
    #[prost(bool, tag = "8")]
    pub via_mqtt: bool,
    #[prost(uint32, optional, tag = "9")]
    pub hops_away: Option<u32>,
    #[prost(bool, tag = "10")]
    pub is_favorite: bool,
    #[prost(bool, tag = "11")]
    pub is_ignored: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
    #[prost(uint32, tag = "8")]
    pub reboot_count: u32,
    #[prost(uint32, tag = "11")]
    pub min_app_version: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Config {
    #[prost(oneof = "config::PayloadVariant", tags = "1, 3")]
    pub payload_variant: Option<config::PayloadVariant>,
}

pub mod config {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Device(DeviceConfig),
        #[prost(message, tag = "3")]
        Power(PowerConfig),
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeviceConfig {
        #[prost(enumeration = "device_config::Role", tag = "1")]
        pub role: i32,
    }

    pub mod device_config {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum Role {
            Client = 0,
            ClientMute = 1,
            Router = 2,
            RouterClient = 3,
            Repeater = 4,
            Tracker = 5,
            Sensor = 6,
            Tak = 7,
            ClientHidden = 8,
            LostAndFound = 9,
            TakTracker = 10,
            RouterLate = 11,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PowerConfig {
        #[prost(bool, tag = "1")]
        pub is_power_saving: bool,
        #[prost(uint32, tag = "2")]
        pub on_battery_shutdown_after_secs: u32,
        #[prost(uint32, tag = "4")]
        pub wait_bluetooth_secs: u32,
        #[prost(uint32, tag = "6")]
        pub sds_secs: u32,
        #[prost(uint32, tag = "7")]
        pub ls_secs: u32,
        #[prost(uint32, tag = "8")]
        pub min_wake_secs: u32,
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Heartbeat {
    #[prost(uint32, tag = "1")]
    pub nonce: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "from_radio::PayloadVariant", tags = "2, 3, 4, 5, 7, 8, 11")]
    pub payload_variant: Option<from_radio::PayloadVariant>,
}

pub mod from_radio {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "2")]
        Packet(super::MeshPacket),
        #[prost(message, tag = "3")]
        MyInfo(super::MyNodeInfo),
        #[prost(message, tag = "4")]
        NodeInfo(super::NodeInfo),
        #[prost(message, tag = "5")]
        Config(super::Config),
        #[prost(uint32, tag = "7")]
        ConfigCompleteId(u32),
        #[prost(bool, tag = "8")]
        Rebooted(bool),
        #[prost(message, tag = "11")]
        QueueStatus(super::QueueStatus),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ToRadio {
    #[prost(oneof = "to_radio::PayloadVariant", tags = "1, 3, 4, 7")]
    pub payload_variant: Option<to_radio::PayloadVariant>,
}

pub mod to_radio {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Packet(super::MeshPacket),
        #[prost(uint32, tag = "3")]
        WantConfigId(u32),
        #[prost(bool, tag = "4")]
        Disconnect(bool),
        #[prost(message, tag = "7")]
        Heartbeat(super::Heartbeat),
    }
}

impl ToRadio {
    pub fn packet(packet: MeshPacket) -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
        }
    }

    pub fn want_config(nonce: u32) -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::WantConfigId(nonce)),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::Heartbeat(Heartbeat::default())),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }
}

/// Decode one inbound protocol message as delivered by a transport.
pub fn decode_from_radio(frame: &[u8]) -> Result<FromRadio, RadioError> {
    FromRadio::decode(frame).map_err(|e| RadioError::Protocol(e.to_string()))
}

/// Default `!xxxxxxxx` user id derived from a node number.
pub fn node_num_to_default_id(num: u32) -> String {
    format!("!{:08x}", num)
}

/// Encode a message into a `Bytes` payload; used for the bodies carried inside [`Data`].
pub fn encode_body<M: Message>(msg: &M) -> Bytes {
    Bytes::from(msg.encode_to_vec())
}
