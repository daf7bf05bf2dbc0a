//! Node database: everything known about mesh participants.
//!
//! Records are keyed by node number and, once the node has announced itself, by user id. The
//! merge rules keep a radio's auto-generated placeholder identity ("Meshtastic abcd", no
//! hardware model) from overwriting a real identity learned earlier, and refuse to silently
//! swap a node's public key.
//!
//! [`NodeDatabase::update`] is the single write path. It applies a mutation under the lock,
//! re-indexes the user id, then releases the lock before persisting. Callers get a
//! [`NodeUpdate`] back and decide whether to publish it with [`NodeDatabase::publish`].

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::logutil::escape_log;
use crate::protobuf::{
    node_num_to_default_id, DeviceMetrics, HardwareModel, MeshPacket, NodeInfo, Position, User,
    BROADCAST_NUM, ID_BROADCAST,
};
use crate::storage::NodeStore;

const MQTT_SUFFIX: &str = " (MQTT)";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub long_name: String,
    pub short_name: String,
    pub hw_model: i32,
    #[serde(default)]
    pub is_licensed: bool,
    #[serde(default)]
    pub public_key: Vec<u8>,
}

impl From<User> for UserInfo {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            long_name: u.long_name,
            short_name: u.short_name,
            hw_model: u.hw_model,
            is_licensed: u.is_licensed,
            public_key: u.public_key.to_vec(),
        }
    }
}

impl UserInfo {
    pub fn has_hw_model(&self) -> bool {
        self.hw_model != HardwareModel::Unset as i32
    }

    pub fn has_public_key(&self) -> bool {
        !self.public_key.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub latitude_i: i32,
    pub longitude_i: i32,
    #[serde(default)]
    pub altitude: Option<i32>,
    #[serde(default)]
    pub time: u32,
}

impl PositionInfo {
    pub fn from_proto(p: &Position) -> Self {
        Self {
            latitude_i: p.latitude_i.unwrap_or(0),
            longitude_i: p.longitude_i.unwrap_or(0),
            altitude: p.altitude,
            time: p.time,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.latitude_i == 0 && self.longitude_i == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsInfo {
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
}

impl From<&DeviceMetrics> for MetricsInfo {
    fn from(m: &DeviceMetrics) -> Self {
        Self {
            battery_level: m.battery_level,
            voltage: m.voltage,
            channel_utilization: m.channel_utilization,
            air_util_tx: m.air_util_tx,
            uptime_seconds: m.uptime_seconds,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub num: u32,
    pub user: UserInfo,
    #[serde(default)]
    pub position: Option<PositionInfo>,
    #[serde(default)]
    pub device_metrics: Option<MetricsInfo>,
    #[serde(default)]
    pub snr: f32,
    #[serde(default)]
    pub rssi: i32,
    /// Seconds since the epoch.
    #[serde(default)]
    pub last_heard: u32,
    #[serde(default)]
    pub channel: u32,
    #[serde(default)]
    pub hops_away: Option<u32>,
    #[serde(default)]
    pub via_mqtt: bool,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub is_ignored: bool,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub manually_verified: bool,
    /// Set when an identity arrived with a key different from the one on record.
    #[serde(default)]
    pub key_mismatch: bool,
}

impl NodeRecord {
    /// Record for a node we have only seen a number for.
    pub fn placeholder(num: u32) -> Self {
        let id = node_num_to_default_id(num);
        let last4 = id[id.len() - 4..].to_string();
        Self {
            num,
            user: UserInfo {
                long_name: format!("Meshtastic {}", last4),
                short_name: last4,
                id,
                hw_model: HardwareModel::Unset as i32,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// `Meshtastic XXXX` where XXXX is four hex digits.
/// A default-named, hardware-less announcement must not replace a known identity.
fn keeps_established_identity(node: &NodeRecord, incoming: &UserInfo) -> bool {
    let placeholder = is_placeholder_name(&incoming.long_name) && !incoming.has_hw_model();
    let established = !node.user.id.is_empty() && node.user.has_hw_model();
    placeholder && established
}

pub fn is_placeholder_name(name: &str) -> bool {
    match name.strip_prefix("Meshtastic ") {
        Some(rest) => rest.len() == 4 && rest.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub changed: bool,
    pub snapshot: NodeRecord,
}

#[derive(Default)]
struct Maps {
    by_num: HashMap<u32, NodeRecord>,
    by_id: HashMap<String, u32>,
}

impl Maps {
    fn reindex(&mut self, num: u32, old_id: &str, new_id: &str) {
        if old_id == new_id {
            return;
        }
        if !old_id.is_empty() && self.by_id.get(old_id) == Some(&num) {
            self.by_id.remove(old_id);
        }
        if !new_id.is_empty() {
            self.by_id.insert(new_id.to_string(), num);
        }
    }
}

pub struct NodeDatabase {
    maps: Mutex<Maps>,
    my_node_num: AtomicU32,
    ready: AtomicBool,
    writes_allowed: AtomicBool,
    store: Option<Arc<dyn NodeStore>>,
    changes: broadcast::Sender<NodeRecord>,
}

impl NodeDatabase {
    pub fn new(store: Option<Arc<dyn NodeStore>>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            maps: Mutex::new(Maps::default()),
            my_node_num: AtomicU32::new(0),
            ready: AtomicBool::new(false),
            writes_allowed: AtomicBool::new(false),
            store,
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeRecord> {
        self.changes.subscribe()
    }

    /// Broadcast the update if it changed anything.
    pub fn publish(&self, update: &NodeUpdate) {
        if update.changed {
            let _ = self.changes.send(update.snapshot.clone());
        }
    }

    pub fn my_node_num(&self) -> Option<u32> {
        match self.my_node_num.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn set_my_node_num(&self, num: u32) {
        debug!("local node is !{:08x}", num);
        self.my_node_num.store(num, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Mark the database as loaded from the radio; opens the persistence gate.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
        self.writes_allowed.store(ready, Ordering::SeqCst);
    }

    pub fn get(&self, num: u32) -> Option<NodeRecord> {
        self.lock().by_num.get(&num).cloned()
    }

    pub fn get_by_id(&self, id: &str) -> Option<NodeRecord> {
        let maps = self.lock();
        maps.by_id.get(id).and_then(|n| maps.by_num.get(n)).cloned()
    }

    pub fn get_or_create(&self, num: u32) -> NodeRecord {
        self.lock()
            .by_num
            .entry(num)
            .or_insert_with(|| NodeRecord::placeholder(num))
            .clone()
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        let mut all: Vec<NodeRecord> = self.lock().by_num.values().cloned().collect();
        all.sort_by_key(|n| n.num);
        all
    }

    pub fn len(&self) -> usize {
        self.lock().by_num.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// User id for a node number; unknown nodes get their default `!xxxxxxxx` id.
    pub fn to_node_id(&self, num: u32) -> String {
        if num == BROADCAST_NUM {
            return ID_BROADCAST.to_string();
        }
        self.lock()
            .by_num
            .get(&num)
            .map(|n| n.user.id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| node_num_to_default_id(num))
    }

    pub fn node_num_for_id(&self, id: &str) -> Option<u32> {
        self.lock().by_id.get(id).copied()
    }

    /// Apply `mutator` to the record for `num`, creating it if needed.
    pub async fn update<F>(&self, num: u32, mutator: F) -> NodeUpdate
    where
        F: FnOnce(&mut NodeRecord),
    {
        let update = {
            let mut maps = self.lock();
            let record = maps
                .by_num
                .entry(num)
                .or_insert_with(|| NodeRecord::placeholder(num));
            let before = record.clone();
            mutator(record);
            let snapshot = record.clone();
            maps.reindex(num, &before.user.id, &snapshot.user.id);
            NodeUpdate {
                changed: before != snapshot,
                snapshot,
            }
        };

        if update.changed
            && !update.snapshot.user.id.is_empty()
            && self.writes_allowed.load(Ordering::SeqCst)
        {
            if let Some(store) = &self.store {
                if let Err(e) = store.upsert(&update.snapshot).await {
                    warn!("failed to persist node !{:08x}: {}", num, e);
                }
            }
        }
        update
    }

    /// Apply an announced identity (NODEINFO_APP).
    pub async fn handle_received_user(
        &self,
        from: u32,
        user: User,
        channel: u32,
        manually_verified: bool,
    ) -> NodeUpdate {
        let update = self
            .update(from, |node| {
                let incoming = UserInfo::from(user);
                if keeps_established_identity(node, &incoming) {
                    debug!(
                        "keeping identity of !{:08x} over placeholder '{}'",
                        from,
                        escape_log(&incoming.long_name)
                    );
                    node.channel = channel;
                    node.manually_verified = manually_verified;
                    return;
                }

                let mut incoming = incoming;
                let key_match = !node.user.has_public_key()
                    || node.user.public_key == incoming.public_key;
                if !key_match {
                    warn!(
                        "public key mismatch from !{:08x} ({}); dropping announced key",
                        from,
                        escape_log(&incoming.long_name)
                    );
                    incoming.public_key = node.user.public_key.clone();
                    node.key_mismatch = true;
                }
                if incoming.is_licensed {
                    incoming.public_key.clear();
                }
                node.user = incoming;
                node.channel = channel;
                node.manually_verified = manually_verified;
            })
            .await;
        self.publish(&update);
        update
    }

    /// Install a full record delivered during the configuration exchange.
    pub async fn install_node_info(&self, info: NodeInfo) -> NodeUpdate {
        let num = info.num;
        let update = self
            .update(num, |node| {
                if let Some(user) = info.user {
                    let mut user = UserInfo::from(user);
                    if keeps_established_identity(node, &user) {
                        debug!(
                            "keeping identity of !{:08x} over placeholder '{}'",
                            num,
                            escape_log(&user.long_name)
                        );
                    } else {
                        if user.is_licensed {
                            user.public_key.clear();
                        }
                        if info.via_mqtt && !user.long_name.ends_with(MQTT_SUFFIX) {
                            user.long_name.push_str(MQTT_SUFFIX);
                        }
                        node.user = user;
                    }
                }
                if let Some(position) = info.position.as_ref() {
                    node.position = Some(PositionInfo::from_proto(position));
                }
                if let Some(metrics) = info.device_metrics.as_ref() {
                    node.device_metrics = Some(MetricsInfo::from(metrics));
                }
                node.snr = info.snr;
                node.last_heard = info.last_heard;
                node.channel = info.channel;
                node.via_mqtt = info.via_mqtt;
                node.hops_away = info.hops_away;
                node.is_favorite = info.is_favorite;
                node.is_ignored = info.is_ignored;
            })
            .await;
        self.publish(&update);
        update
    }

    /// Apply a position report. An all-zero position from the local node means "no fix" and
    /// is ignored.
    pub async fn handle_received_position(
        &self,
        from: u32,
        position: &Position,
        rx_time: u32,
    ) -> Option<NodeUpdate> {
        let info = PositionInfo::from_proto(position);
        if self.my_node_num() == Some(from) && info.is_empty() {
            debug!("ignoring empty position from local node");
            return None;
        }
        let update = self
            .update(from, |node| {
                node.position = Some(info);
                if rx_time != 0 {
                    node.last_heard = rx_time;
                }
            })
            .await;
        self.publish(&update);
        Some(update)
    }

    pub async fn handle_received_telemetry(
        &self,
        from: u32,
        metrics: &DeviceMetrics,
    ) -> NodeUpdate {
        let update = self
            .update(from, |node| {
                node.device_metrics = Some(MetricsInfo::from(metrics));
            })
            .await;
        self.publish(&update);
        update
    }

    /// Refresh link-quality fields from any packet heard from a node.
    pub async fn handle_packet_heard(&self, packet: &MeshPacket) -> Option<NodeUpdate> {
        if packet.from == 0 {
            return None;
        }
        let hops = packet.hops_away();
        let update = self
            .update(packet.from, |node| {
                if packet.rx_time != 0 {
                    node.last_heard = packet.rx_time;
                }
                node.snr = packet.rx_snr;
                node.rssi = packet.rx_rssi;
                if hops.is_some() {
                    node.hops_away = hops;
                }
                node.via_mqtt = packet.via_mqtt;
            })
            .await;
        trace!("heard !{:08x} changed={}", packet.from, update.changed);
        self.publish(&update);
        Some(update)
    }

    pub async fn set_favorite(&self, num: u32, favorite: bool) -> NodeUpdate {
        let update = self.update(num, |n| n.is_favorite = favorite).await;
        self.publish(&update);
        update
    }

    pub async fn set_ignored(&self, num: u32, ignored: bool) -> NodeUpdate {
        let update = self.update(num, |n| n.is_ignored = ignored).await;
        self.publish(&update);
        update
    }

    pub async fn set_muted(&self, num: u32, muted: bool) -> NodeUpdate {
        let update = self.update(num, |n| n.is_muted = muted).await;
        self.publish(&update);
        update
    }

    /// Evict a node from both indices and the store.
    pub async fn remove(&self, num: u32) -> Option<NodeRecord> {
        let removed = {
            let mut maps = self.lock();
            let removed = maps.by_num.remove(&num);
            if let Some(r) = &removed {
                if maps.by_id.get(&r.user.id) == Some(&num) {
                    maps.by_id.remove(&r.user.id);
                }
            }
            removed
        };
        if removed.is_some() {
            if let Some(store) = &self.store {
                if let Err(e) = store.remove(num).await {
                    warn!("failed to remove node !{:08x} from store: {}", num, e);
                }
            }
        }
        removed
    }

    /// Forget everything; the database is not ready until the next configuration exchange.
    pub fn clear(&self) {
        let mut maps = self.lock();
        maps.by_num.clear();
        maps.by_id.clear();
        self.ready.store(false, Ordering::SeqCst);
        self.writes_allowed.store(false, Ordering::SeqCst);
        self.my_node_num.store(0, Ordering::SeqCst);
    }

    /// Seed from the store without writing back.
    pub async fn load_snapshot(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let records = match store.load_all().await {
            Ok(r) => r,
            Err(e) => {
                warn!("failed to load node snapshot: {}", e);
                return 0;
            }
        };
        let mut maps = self.lock();
        let count = records.len();
        for record in records {
            let num = record.num;
            let id = record.user.id.clone();
            maps.by_num.insert(num, record);
            maps.reindex(num, "", &id);
        }
        debug!("loaded {} nodes from snapshot", count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, long: &str, hw: HardwareModel, key: &[u8]) -> User {
        User {
            id: id.to_string(),
            long_name: long.to_string(),
            short_name: long.chars().take(4).collect(),
            hw_model: hw as i32,
            public_key: bytes::Bytes::copy_from_slice(key),
            ..Default::default()
        }
    }

    #[test]
    fn placeholder_names() {
        assert!(is_placeholder_name("Meshtastic a1B2"));
        assert!(!is_placeholder_name("Meshtastic a1B2x"));
        assert!(!is_placeholder_name("Meshtastic zzzz"));
        assert!(!is_placeholder_name("Base Camp"));
    }

    #[test]
    fn get_or_create_uses_default_identity() {
        let db = NodeDatabase::new(None);
        let rec = db.get_or_create(0x1234abcd);
        assert_eq!(rec.user.id, "!1234abcd");
        assert_eq!(rec.user.long_name, "Meshtastic abcd");
        assert_eq!(rec.user.short_name, "abcd");
        assert!(!rec.user.has_hw_model());
        assert_eq!(db.get_or_create(0x1234abcd), rec);
        assert_eq!(db.len(), 1);
    }

    #[tokio::test]
    async fn update_reindexes_user_id() {
        let db = NodeDatabase::new(None);
        db.update(7, |n| n.user.id = "!old".into()).await;
        db.update(7, |n| n.user.id = "!new".into()).await;
        assert_eq!(db.node_num_for_id("!new"), Some(7));
        assert_eq!(db.node_num_for_id("!old"), None);
    }

    #[tokio::test]
    async fn unchanged_update_reports_no_change() {
        let db = NodeDatabase::new(None);
        let first = db.update(3, |n| n.channel = 2).await;
        assert!(first.changed);
        let second = db.update(3, |n| n.channel = 2).await;
        assert!(!second.changed);
        assert_eq!(second.snapshot.channel, 2);
    }

    #[tokio::test]
    async fn licensed_identity_drops_key() {
        let db = NodeDatabase::new(None);
        let mut u = user("!00000005", "Ham", HardwareModel::Tbeam, &[1; 32]);
        u.is_licensed = true;
        let upd = db.handle_received_user(5, u, 0, false).await;
        assert!(upd.snapshot.user.public_key.is_empty());
        assert!(upd.snapshot.user.is_licensed);
    }

    #[tokio::test]
    async fn mqtt_suffix_applied_once() {
        let db = NodeDatabase::new(None);
        let info = NodeInfo {
            num: 8,
            user: Some(user("!00000008", "Remote", HardwareModel::Rak4631, &[])),
            via_mqtt: true,
            ..Default::default()
        };
        db.install_node_info(info.clone()).await;
        let mut again = info;
        if let Some(u) = again.user.as_mut() {
            u.long_name = "Remote (MQTT)".into();
        }
        let upd = db.install_node_info(again).await;
        assert_eq!(upd.snapshot.user.long_name, "Remote (MQTT)");
    }

    #[tokio::test]
    async fn local_empty_position_is_ignored() {
        let db = NodeDatabase::new(None);
        db.set_my_node_num(10);
        let empty = Position::default();
        assert!(db.handle_received_position(10, &empty, 5).await.is_none());
        assert!(db.handle_received_position(11, &empty, 5).await.is_some());
    }

    #[tokio::test]
    async fn broadcast_id() {
        let db = NodeDatabase::new(None);
        assert_eq!(db.to_node_id(BROADCAST_NUM), "^all");
        assert_eq!(db.to_node_id(0xdeadbeef), "!deadbeef");
    }

    #[tokio::test]
    async fn remove_evicts_both_indices() {
        let db = NodeDatabase::new(None);
        db.handle_received_user(4, user("!00000004", "Four", HardwareModel::TEcho, &[]), 0, false)
            .await;
        assert!(db.remove(4).await.is_some());
        assert!(db.get(4).is_none());
        assert!(db.get_by_id("!00000004").is_none());
    }

    #[tokio::test]
    async fn clear_resets_gates() {
        let db = NodeDatabase::new(None);
        db.set_ready(true);
        db.set_my_node_num(1);
        db.get_or_create(1);
        db.clear();
        assert!(!db.is_ready());
        assert!(db.is_empty());
        assert_eq!(db.my_node_num(), None);
    }
}
