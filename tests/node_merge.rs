use bytes::Bytes;
use meshlink::nodes::NodeDatabase;
use meshlink::protobuf::{HardwareModel, MeshPacket, NodeInfo, Position, User};
use meshlink::storage::{JsonNodeStore, MemoryNodeStore, NodeStore};
use std::sync::Arc;

const PEER: u32 = 0x0a0b_0c0d;

fn user(long: &str, hw: HardwareModel, key: &[u8]) -> User {
    User {
        id: "!0a0b0c0d".into(),
        long_name: long.into(),
        short_name: long.chars().take(4).collect(),
        hw_model: hw as i32,
        public_key: Bytes::copy_from_slice(key),
        ..Default::default()
    }
}

#[tokio::test]
async fn placeholder_announcement_keeps_known_identity() {
    let db = NodeDatabase::new(None);
    db.install_node_info(NodeInfo {
        num: PEER,
        user: Some(user("Base Camp", HardwareModel::Rak4631, b"k1")),
        ..Default::default()
    })
    .await;

    let update = db
        .handle_received_user(PEER, user("Meshtastic 0c0d", HardwareModel::Unset, b""), 2, false)
        .await;
    assert_eq!(update.snapshot.user.long_name, "Base Camp");
    assert_eq!(update.snapshot.user.hw_model, HardwareModel::Rak4631 as i32);
    assert_eq!(update.snapshot.channel, 2);
}

#[tokio::test]
async fn installed_placeholder_keeps_known_identity() {
    let db = NodeDatabase::new(None);
    db.handle_received_user(PEER, user("Base Camp", HardwareModel::Tbeam, b"k1"), 0, false)
        .await;

    let update = db
        .install_node_info(NodeInfo {
            num: PEER,
            user: Some(user("Meshtastic 0c0d", HardwareModel::Unset, b"")),
            channel: 3,
            last_heard: 1_700_000_500,
            ..Default::default()
        })
        .await;
    assert_eq!(update.snapshot.user.long_name, "Base Camp");
    assert_eq!(update.snapshot.user.hw_model, HardwareModel::Tbeam as i32);
    assert_eq!(update.snapshot.channel, 3);
    assert_eq!(update.snapshot.last_heard, 1_700_000_500);
}

#[tokio::test]
async fn placeholder_for_unknown_node_is_accepted() {
    let db = NodeDatabase::new(None);
    let update = db
        .handle_received_user(PEER, user("Meshtastic 0c0d", HardwareModel::Unset, b""), 0, false)
        .await;
    assert_eq!(update.snapshot.user.long_name, "Meshtastic 0c0d");
    assert_eq!(db.node_num_for_id("!0a0b0c0d"), Some(PEER));
}

#[tokio::test]
async fn changed_key_is_flagged_not_adopted() {
    let db = NodeDatabase::new(None);
    db.handle_received_user(PEER, user("Base Camp", HardwareModel::Tbeam, b"first"), 0, false)
        .await;
    let update = db
        .handle_received_user(PEER, user("Base Camp 2", HardwareModel::Tbeam, b"other"), 0, false)
        .await;
    assert!(update.snapshot.key_mismatch);
    assert_eq!(update.snapshot.user.public_key, Bytes::from_static(b"first"));
    assert_eq!(update.snapshot.user.long_name, "Base Camp 2");
}

#[tokio::test]
async fn licensed_operator_never_keeps_a_key() {
    let db = NodeDatabase::new(None);
    let mut ham = user("KD9XYZ", HardwareModel::Tbeam, b"key");
    ham.is_licensed = true;
    let update = db.handle_received_user(PEER, ham, 0, false).await;
    assert!(update.snapshot.user.public_key.is_empty());
}

#[tokio::test]
async fn heard_packets_refresh_link_quality() {
    let db = NodeDatabase::new(None);
    let mut changes = db.subscribe();
    db.handle_packet_heard(&MeshPacket {
        from: PEER,
        rx_time: 1_700_000_000,
        rx_snr: 6.5,
        rx_rssi: -90,
        hop_start: 3,
        hop_limit: 1,
        ..Default::default()
    })
    .await;
    let node = db.get(PEER).expect("created on first contact");
    assert_eq!(node.last_heard, 1_700_000_000);
    assert_eq!(node.hops_away, Some(2));
    assert_eq!(node.rssi, -90);
    assert_eq!(changes.recv().await.unwrap().num, PEER);
}

#[tokio::test]
async fn position_updates_merge() {
    let db = NodeDatabase::new(None);
    db.handle_received_position(
        PEER,
        &Position {
            latitude_i: Some(515_000_000),
            longitude_i: Some(-1_200_000),
            altitude: Some(40),
            time: 0,
        },
        1_700_000_100,
    )
    .await
    .expect("remote positions apply");
    let node = db.get(PEER).unwrap();
    assert!(node.position.is_some());
    assert_eq!(node.last_heard, 1_700_000_100);
}

#[tokio::test]
async fn nothing_persists_before_ready() {
    let store = Arc::new(MemoryNodeStore::new());
    let db = NodeDatabase::new(Some(store.clone()));
    db.handle_received_user(PEER, user("Base Camp", HardwareModel::Tbeam, b""), 0, false)
        .await;
    assert!(store.load_all().await.unwrap().is_empty());

    db.set_ready(true);
    db.set_favorite(PEER, true).await;
    let saved = store.load_all().await.unwrap();
    assert_eq!(saved.len(), 1);
    assert!(saved[0].is_favorite);

    db.remove(PEER).await;
    assert!(store.load_all().await.unwrap().is_empty());
    assert!(db.node_num_for_id("!0a0b0c0d").is_none());
}

#[tokio::test]
async fn snapshot_reloads_from_json_store() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Arc::new(JsonNodeStore::in_dir(dir.path()));
        let db = NodeDatabase::new(Some(store));
        db.set_ready(true);
        db.handle_received_user(PEER, user("Base Camp", HardwareModel::Tbeam, b""), 0, false)
            .await;
    }
    let db = NodeDatabase::new(Some(Arc::new(JsonNodeStore::in_dir(dir.path()))));
    assert_eq!(db.load_snapshot().await, 1);
    assert_eq!(db.get_by_id("!0a0b0c0d").unwrap().user.long_name, "Base Camp");
    // Loading does not open the persistence gate.
    assert!(!db.is_ready());
}
