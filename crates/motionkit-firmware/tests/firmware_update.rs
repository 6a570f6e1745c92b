//! Multi-target firmware update runs against the simulated bus

use motionkit_firmware::{
    run_updates, ErrorCode, HexRecord, Message, MessageBus, NodeBehavior, NodeId, RecordType,
    SimulatedBus, UpdateError, UpdatePhase, UpdateSettings, UpdateStatus,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn settings() -> UpdateSettings {
    UpdateSettings {
        retry_count: 2,
        timeout: Duration::from_millis(50),
        erase: true,
        ack_wait: Duration::from_millis(50),
    }
}

/// Hex image of `len` bytes at 0x08000000, 16 bytes per line
fn write_image(dir: &TempDir, name: &str, len: usize) -> PathBuf {
    let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let mut lines = vec![HexRecord::new(RecordType::ExtendedLinearAddress, 0, vec![0x08, 0x00]).to_line()];
    for (i, line) in bytes.chunks(16).enumerate() {
        lines.push(HexRecord::new(RecordType::Data, (i * 16) as u16, line.to_vec()).to_line());
    }
    lines.push(HexRecord::new(RecordType::EndOfFile, 0, vec![]).to_line());
    let path = dir.path().join(name);
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

fn statuses_for(all: &[(NodeId, UpdateStatus)], node: NodeId) -> Vec<UpdateStatus> {
    all.iter()
        .filter(|(n, _)| *n == node)
        .map(|(_, s)| *s)
        .collect()
}

#[tokio::test]
async fn test_single_target_reaches_done() {
    let dir = TempDir::new().unwrap();
    let image = write_image(&dir, "head.hex", 100);
    let sim = Arc::new(SimulatedBus::new());
    sim.add_node(NodeId::Head, NodeBehavior::default());
    let bus: Arc<dyn MessageBus> = sim.clone();

    let targets = BTreeMap::from([(NodeId::Head, image)]);
    let all = run_updates(bus, targets, settings()).collect().await.unwrap();
    let head = statuses_for(&all, NodeId::Head);

    // 100 bytes -> chunks of 48, 48 and 4
    assert_eq!(head.len(), 6);
    assert_eq!(head[0], UpdateStatus::updating(0.0));
    assert_eq!(head[1], UpdateStatus::updating(0.1));
    assert!(head.windows(2).all(|w| w[0].progress <= w[1].progress));
    assert_eq!(*head.last().unwrap(), UpdateStatus::done());

    let image: Vec<u8> = sim
        .received_image(NodeId::Head)
        .into_iter()
        .flat_map(|(_, bytes)| bytes)
        .collect();
    assert_eq!(image.len(), 100);
    assert_eq!(
        sim.sent_to(NodeId::HeadBootloader).last(),
        Some(&Message::StartApp)
    );
    assert!(sim
        .sent_to(NodeId::HeadBootloader)
        .contains(&Message::Complete { num_messages: 3 }));
}

#[tokio::test]
async fn test_erase_timeout_stalls_only_that_target() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedBus::new());
    sim.add_node(
        NodeId::GantryX,
        NodeBehavior {
            ack_erase: false,
            ..NodeBehavior::default()
        },
    );
    sim.add_node(NodeId::GantryY, NodeBehavior::default());
    let bus: Arc<dyn MessageBus> = sim.clone();

    let targets = BTreeMap::from([
        (NodeId::GantryX, write_image(&dir, "x.hex", 64)),
        (NodeId::GantryY, write_image(&dir, "y.hex", 64)),
    ]);
    let mut stream = run_updates(bus, targets, settings());
    let mut all = Vec::new();
    while let Some(item) = stream.next().await {
        all.push(item.unwrap());
    }

    assert_eq!(
        statuses_for(&all, NodeId::GantryX),
        vec![UpdateStatus::updating(0.0)]
    );
    assert_eq!(
        statuses_for(&all, NodeId::GantryY).last(),
        Some(&UpdateStatus::done())
    );
    assert_eq!(
        stream.status(NodeId::GantryX).map(|s| s.phase),
        Some(UpdatePhase::Updating)
    );
    assert!(sim.received_image(NodeId::GantryX).is_empty());
}

#[tokio::test]
async fn test_never_ready_target_ends_quietly() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedBus::new());
    sim.add_node(
        NodeId::Gripper,
        NodeBehavior {
            ready: false,
            ..NodeBehavior::default()
        },
    );
    let bus: Arc<dyn MessageBus> = sim.clone();

    let targets = BTreeMap::from([(NodeId::Gripper, write_image(&dir, "g.hex", 10))]);
    let all = run_updates(bus, targets, settings()).collect().await.unwrap();
    assert_eq!(all, vec![(NodeId::Gripper, UpdateStatus::updating(0.0))]);
    assert_eq!(sim.sent_to(NodeId::GripperBootloader).len(), 2);
}

#[tokio::test]
async fn test_error_response_aborts_run() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedBus::new());
    sim.add_node(
        NodeId::Head,
        NodeBehavior {
            complete_error: Some(ErrorCode::BAD_CHECKSUM),
            ..NodeBehavior::default()
        },
    );
    let bus: Arc<dyn MessageBus> = sim.clone();

    let targets = BTreeMap::from([(NodeId::Head, write_image(&dir, "head.hex", 20))]);
    let mut stream = run_updates(bus, targets, settings());
    let mut error = None;
    while let Some(item) = stream.next().await {
        if let Err(e) = item {
            error = Some(e);
        }
    }
    assert_eq!(
        error,
        Some(UpdateError::ErrorResponse {
            node: NodeId::HeadBootloader,
            message: "update complete".to_string(),
            code: ErrorCode::BAD_CHECKSUM,
        })
    );
    assert!(!sim.sent_to(NodeId::HeadBootloader).contains(&Message::StartApp));
}

#[tokio::test]
async fn test_dropped_data_ack_times_out() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedBus::new());
    sim.add_node(
        NodeId::PipetteLeft,
        NodeBehavior {
            drop_data_acks: true,
            ..NodeBehavior::default()
        },
    );
    let bus: Arc<dyn MessageBus> = sim.clone();

    let targets = BTreeMap::from([(NodeId::PipetteLeft, write_image(&dir, "p.hex", 20))]);
    let err = run_updates(bus, targets, settings())
        .collect()
        .await
        .unwrap_err();
    match err {
        UpdateError::Timeout { node, message } => {
            assert_eq!(node, NodeId::PipetteLeftBootloader);
            assert_eq!(message, "data at 0x08000000");
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_file_fails_run() {
    let sim = Arc::new(SimulatedBus::new());
    sim.add_node(NodeId::Head, NodeBehavior::default());
    let bus: Arc<dyn MessageBus> = sim.clone();

    let missing = PathBuf::from("/nonexistent/head.hex");
    let targets = BTreeMap::from([(NodeId::Head, missing.clone())]);
    let err = run_updates(bus, targets, settings())
        .collect()
        .await
        .unwrap_err();
    assert_eq!(err, UpdateError::FileNotFound { path: missing });
    assert!(sim.sent().is_empty());
}

#[tokio::test]
async fn test_corrupt_hex_fails_run() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.hex");
    std::fs::write(&path, ":0100000041BF\n:00000001FF\n").unwrap();
    let sim = Arc::new(SimulatedBus::new());
    sim.add_node(NodeId::Head, NodeBehavior::default());
    let bus: Arc<dyn MessageBus> = sim.clone();

    let err = run_updates(bus, BTreeMap::from([(NodeId::Head, path)]), settings())
        .collect()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Hex(motionkit_firmware::HexError::Checksum { line_number: 1, .. })
    ));
}

#[tokio::test]
async fn test_dropping_stream_cancels_targets() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedBus::new());
    sim.add_node(
        NodeId::Head,
        NodeBehavior {
            ready: false,
            ..NodeBehavior::default()
        },
    );
    let bus: Arc<dyn MessageBus> = sim.clone();

    let slow = UpdateSettings {
        retry_count: 100,
        timeout: Duration::from_millis(20),
        ..settings()
    };
    let mut stream = run_updates(
        bus,
        BTreeMap::from([(NodeId::Head, write_image(&dir, "h.hex", 8))]),
        slow,
    );
    assert_eq!(
        stream.next().await.unwrap().unwrap(),
        (NodeId::Head, UpdateStatus::updating(0.0))
    );
    drop(stream);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let polled = sim.sent_to(NodeId::HeadBootloader).len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sim.sent_to(NodeId::HeadBootloader).len(), polled);
    assert!(polled < 100);
}

#[tokio::test]
async fn test_run_starts_on_first_poll() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedBus::new());
    sim.add_node(NodeId::Head, NodeBehavior::default());
    let bus: Arc<dyn MessageBus> = sim.clone();

    let mut stream = run_updates(
        bus,
        BTreeMap::from([(NodeId::Head, write_image(&dir, "h.hex", 8))]),
        settings(),
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(sim.sent().is_empty());
    assert_eq!(stream.status(NodeId::Head), Some(UpdateStatus::queued()));

    assert_eq!(
        stream.next().await.unwrap().unwrap(),
        (NodeId::Head, UpdateStatus::updating(0.0))
    );
    while let Some(item) = stream.next().await {
        item.unwrap();
    }
    assert_eq!(stream.status(NodeId::Head), Some(UpdateStatus::done()));
}

#[tokio::test]
async fn test_dropping_unpolled_stream_sends_nothing() {
    let dir = TempDir::new().unwrap();
    let sim = Arc::new(SimulatedBus::new());
    sim.add_node(NodeId::Gripper, NodeBehavior::default());
    let bus: Arc<dyn MessageBus> = sim.clone();

    drop(run_updates(
        bus,
        BTreeMap::from([(NodeId::Gripper, write_image(&dir, "g.hex", 8))]),
        settings(),
    ));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(sim.sent().is_empty());
}
