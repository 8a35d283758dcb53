//! Integration Tests for the LAN Link Protocol
//!
//! These tests run real connection servers on loopback and drive the public
//! engine API end to end: messaging, resource transfer, resume, remote
//! exploration and download.

use lanlink_protocol::{
    Config, CoreEvent, Device, Direction, Engine, EventBus, FileEntry, FileTransfer, Registry,
    Server, Transfer,
};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout, Duration};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn test_config(id: &str, inbox: &Path, port: u16) -> Config {
    Config {
        device_id: id.to_string(),
        device_name: format!("{id} box"),
        os: "linux".to_string(),
        inbox_dir: inbox.to_path_buf(),
        port,
        buffer_size: 1024,
        ..Config::default()
    }
}

/// Engine with a running connection server on an ephemeral loopback port.
/// The config's dial port matches the listening port, so two such nodes
/// cannot dial each other; pair a listening node with a dialing node.
async fn listening_node(
    id: &str,
    inbox: &Path,
) -> (Arc<Engine>, UnboundedReceiver<CoreEvent>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = Arc::new(test_config(id, inbox, port));
    let (events, rx) = EventBus::channel();
    let engine = Arc::new(Engine::new(config, Arc::new(Registry::new()), events));

    let server = Server::with_listener(Arc::clone(&engine), listener);
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    (engine, rx, port)
}

/// Engine that only dials, toward the given port
fn dialing_node(id: &str, inbox: &Path, port: u16) -> (Arc<Engine>, UnboundedReceiver<CoreEvent>) {
    let config = Arc::new(test_config(id, inbox, port));
    let (events, rx) = EventBus::channel();
    let engine = Arc::new(Engine::new(config, Arc::new(Registry::new()), events));
    (engine, rx)
}

fn register_peer(engine: &Engine, id: &str) {
    engine
        .registry()
        .upsert_device(Device::new(id, LOCALHOST, id, "linux"));
}

/// The responder finishes its bookkeeping shortly after the initiator's
/// call returns; poll instead of racing it.
async fn wait_for_file(path: &Path) {
    timeout(Duration::from_secs(5), async {
        while !path.exists() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("file never arrived");
}

async fn next_event(rx: &mut UnboundedReceiver<CoreEvent>) -> CoreEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event within deadline")
        .expect("event channel closed")
}

#[tokio::test]
async fn message_reaches_the_peer_and_both_histories() {
    let inbox = TempDir::new().unwrap();
    let (receiver, mut rx, port) = listening_node("bob", inbox.path()).await;
    let (sender, _tx_rx) = dialing_node("alice", inbox.path(), port);
    register_peer(&sender, "bob");

    sender.send_message("bob", "meet at noon?").await.unwrap();

    loop {
        match next_event(&mut rx).await {
            CoreEvent::MessageReceived {
                peer_id,
                sender_name,
                text,
            } => {
                assert_eq!(peer_id, "alice");
                assert_eq!(sender_name, "alice box");
                assert_eq!(text, "meet at noon?");
                break;
            }
            _ => continue,
        }
    }

    // Sender records the outbound message under its own id
    let outbound = sender.registry().history_for_peer("bob");
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].direction, Direction::Outbound);
    assert_eq!(outbound[0].message.as_deref(), Some("meet at noon?"));
    assert!(outbound[0].error.is_none());

    // Receiver records it inbound with the R-prefixed id and a notification
    let inbound = receiver.registry().history_for_peer("alice");
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].direction, Direction::Inbound);
    assert!(inbound[0].id.starts_with('R'));
    assert_eq!(
        receiver.registry().find_device("alice").unwrap().notifications,
        1
    );
}

#[tokio::test]
async fn file_transfer_delivers_identical_bytes() {
    let src_dir = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();

    // Larger than one chunk so the flow-control loop runs several rounds
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let src = src_dir.path().join("data.bin");
    std::fs::write(&src, &payload).unwrap();

    let (receiver, _rx, port) = listening_node("bob", inbox.path()).await;
    let (sender, _srx) = dialing_node("alice", src_dir.path(), port);
    register_peer(&sender, "bob");

    let transfer_id = sender.send_resources("bob", &[src]).await.unwrap();

    let dest = inbox.path().join("data.bin");
    wait_for_file(&dest).await;
    assert_eq!(std::fs::read(&dest).unwrap(), payload);

    // Sender side is fully accounted
    let record = sender.registry().find_transfer(&transfer_id).unwrap();
    let files = record.payload.unwrap();
    assert!(files.is_complete());
    assert_eq!(files.transferred_bytes, payload.len() as u64);

    // Receiver side carries the R-prefixed copy
    let inbound_id = format!("R{transfer_id}");
    assert!(receiver.registry().find_transfer(&inbound_id).is_some());
}

#[tokio::test]
async fn directory_transfer_preserves_relative_layout() {
    let src_dir = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();

    let root = src_dir.path().join("photos");
    std::fs::create_dir_all(root.join("2024")).unwrap();
    std::fs::write(root.join("cover.jpg"), b"cover").unwrap();
    std::fs::write(root.join("2024").join("trip.jpg"), b"trip").unwrap();

    let (_receiver, _rx, port) = listening_node("bob", inbox.path()).await;
    let (sender, _srx) = dialing_node("alice", src_dir.path(), port);
    register_peer(&sender, "bob");

    sender.send_resources("bob", &[root]).await.unwrap();

    let trip = inbox.path().join("photos").join("2024").join("trip.jpg");
    wait_for_file(&trip).await;
    assert_eq!(std::fs::read(trip).unwrap(), b"trip");
    assert_eq!(
        std::fs::read(inbox.path().join("photos").join("cover.jpg")).unwrap(),
        b"cover"
    );
}

#[tokio::test]
async fn colliding_names_get_numbered_copies() {
    let src_dir = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let src = src_dir.path().join("report.pdf");
    std::fs::write(&src, b"first").unwrap();

    let (_receiver, _rx, port) = listening_node("bob", inbox.path()).await;
    let (sender, _srx) = dialing_node("alice", src_dir.path(), port);
    register_peer(&sender, "bob");

    sender.send_resources("bob", &[src.clone()]).await.unwrap();
    wait_for_file(&inbox.path().join("report.pdf")).await;

    std::fs::write(&src, b"second").unwrap();
    sender.send_resources("bob", &[src]).await.unwrap();

    let renamed = inbox.path().join("report_(1).pdf");
    wait_for_file(&renamed).await;
    assert_eq!(std::fs::read(inbox.path().join("report.pdf")).unwrap(), b"first");
    assert_eq!(std::fs::read(renamed).unwrap(), b"second");
}

#[tokio::test]
async fn outbound_resume_completes_a_half_sent_file() {
    let src_dir = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();

    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 199) as u8).collect();
    let src = src_dir.path().join("archive.tar");
    std::fs::write(&src, &payload).unwrap();

    let (_receiver, _rx, port) = listening_node("bob", inbox.path()).await;
    let (sender, _srx) = dialing_node("alice", src_dir.path(), port);
    register_peer(&sender, "bob");

    // Reconstruct the state after an interrupted send: the first half was
    // delivered, the receiver holds it in the partial file.
    let transfer_id = "resume-test";
    let half = 4096u64;
    let mut entry = FileEntry::new(&src, "archive.tar", payload.len() as u64);
    entry.progress = half;
    let mut files = FileTransfer::new(vec![entry], payload.len() as u64);
    files.transferred_bytes = half;
    let mut record = Transfer::resources(transfer_id, "bob", Direction::Outbound, files);
    record.error = Some("IO error: connection reset".to_string());
    sender.registry().upsert_transfer(record);

    let tmp = inbox.path().join(format!("archive.tar_R{transfer_id}.tmp"));
    std::fs::write(&tmp, &payload[..half as usize]).unwrap();

    sender.continue_transfer("bob", transfer_id).await.unwrap();

    let dest = inbox.path().join("archive.tar");
    wait_for_file(&dest).await;
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
    assert!(!tmp.exists());

    let record = sender.registry().find_transfer(transfer_id).unwrap();
    assert!(record.error.is_none());
    assert!(record.payload.unwrap().is_complete());
}

#[tokio::test]
async fn inbound_resume_asks_the_sender_to_replay() {
    let src_dir = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();

    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 193) as u8).collect();
    let src = src_dir.path().join("backup.db");
    std::fs::write(&src, &payload).unwrap();

    // The original sender listens; the receiver dials to resume.
    let (sender, _rx, port) = listening_node("alice", src_dir.path()).await;
    let (receiver, _rrx) = dialing_node("bob", inbox.path(), port);
    register_peer(&receiver, "alice");

    let transfer_id = "inbound-resume";
    let half = 4096u64;

    // Sender retains its outbound record with the agreed resume state
    let mut entry = FileEntry::new(&src, "backup.db", payload.len() as u64);
    entry.progress = half;
    let mut files = FileTransfer::new(vec![entry], payload.len() as u64);
    files.transferred_bytes = half;
    sender.registry().upsert_transfer(Transfer::resources(
        transfer_id,
        "bob",
        Direction::Outbound,
        files,
    ));

    // Receiver retains the R-prefixed inbound record and the partial file
    let inbound_id = format!("R{transfer_id}");
    let mut entry = FileEntry::new(inbox.path().join("backup.db"), "backup.db", payload.len() as u64);
    entry.progress = half;
    let mut files = FileTransfer::new(vec![entry], payload.len() as u64);
    files.transferred_bytes = half;
    let mut record = Transfer::resources(&inbound_id, "alice", Direction::Inbound, files);
    record.error = Some("IO error: connection reset".to_string());
    receiver.registry().upsert_transfer(record);

    let tmp = inbox.path().join(format!("backup.db_{inbound_id}.tmp"));
    std::fs::write(&tmp, &payload[..half as usize]).unwrap();

    receiver.continue_transfer("alice", &inbound_id).await.unwrap();

    let dest = inbox.path().join("backup.db");
    wait_for_file(&dest).await;
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
}

#[tokio::test]
async fn canceled_transfer_leaves_no_final_file() {
    let src_dir = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();
    let src = src_dir.path().join("huge.bin");
    std::fs::write(&src, vec![7u8; 4096]).unwrap();

    let (receiver, _rx, port) = listening_node("bob", inbox.path()).await;
    let (sender, _srx) = dialing_node("alice", src_dir.path(), port);
    register_peer(&sender, "bob");

    // Pre-canceled record: the chunk loop signals at the first boundary
    let transfer_id = "cancel-test";
    let entry = FileEntry::new(&src, "huge.bin", 4096);
    let mut files = FileTransfer::new(vec![entry], 4096);
    files.canceled = true;
    sender.registry().upsert_transfer(Transfer::resources(
        transfer_id,
        "bob",
        Direction::Outbound,
        files,
    ));

    sender.send_transfer("bob", transfer_id).await.unwrap();

    // Give the responder time to finish its side
    let inbound_id = format!("R{transfer_id}");
    timeout(Duration::from_secs(5), async {
        loop {
            let canceled = receiver
                .registry()
                .find_transfer(&inbound_id)
                .and_then(|t| t.payload)
                .map(|p| p.canceled)
                .unwrap_or(false);
            if canceled {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("receiver never observed the cancellation");

    assert!(!inbox.path().join("huge.bin").exists());
}

#[tokio::test]
async fn receiver_cancellation_stops_the_sender_cleanly() {
    let src_dir = TempDir::new().unwrap();
    let inbox = TempDir::new().unwrap();

    // Many chunks so the cancellation lands mid-stream
    let payload = vec![3u8; 512 * 1024];
    let src = src_dir.path().join("huge.bin");
    std::fs::write(&src, &payload).unwrap();

    let (receiver, _rx, port) = listening_node("bob", inbox.path()).await;
    let (sender, _srx) = dialing_node("alice", src_dir.path(), port);
    register_peer(&sender, "bob");

    // Cancel the inbound record as soon as the manifest registers it
    let canceler = Arc::clone(&receiver);
    let watcher = tokio::spawn(async move {
        loop {
            let inbound = canceler.registry().history_for_peer("alice");
            if let Some(record) = inbound.first() {
                canceler.cancel_transfer(&record.id);
                return record.id.clone();
            }
            sleep(Duration::from_millis(1)).await;
        }
    });

    let transfer_id = sender.send_resources("bob", &[src]).await.unwrap();
    let inbound_id = watcher.await.unwrap();
    assert_eq!(inbound_id, format!("R{transfer_id}"));

    // The sender saw the Canceled ack: canceled cleanly, not errored
    let record = sender.registry().find_transfer(&transfer_id).unwrap();
    assert!(record.error.is_none());
    assert!(record.payload.unwrap().canceled);

    // The receiver side is canceled too, and nothing was finalized
    let inbound = receiver.registry().find_transfer(&inbound_id).unwrap();
    assert!(inbound.payload.unwrap().canceled);
    assert!(!inbox.path().join("huge.bin").exists());
}

#[tokio::test]
async fn seen_notice_marks_the_conversation() {
    let inbox = TempDir::new().unwrap();
    let (receiver, mut rx, port) = listening_node("bob", inbox.path()).await;
    let (sender, _srx) = dialing_node("alice", inbox.path(), port);
    register_peer(&sender, "bob");
    register_peer(&receiver, "alice");

    receiver.registry().upsert_transfer(Transfer::message(
        "Rm1",
        "alice",
        Direction::Inbound,
        "unread",
    ));
    receiver.registry().bump_notifications("alice");

    sender.send_seen_notice("bob").await.unwrap();

    loop {
        if let CoreEvent::ConversationSeen { peer_id } = next_event(&mut rx).await {
            assert_eq!(peer_id, "alice");
            break;
        }
    }
    assert!(receiver.registry().history_for_peer("alice")[0].seen);
    assert_eq!(receiver.registry().find_device("alice").unwrap().notifications, 0);
}

#[tokio::test]
async fn remote_exploration_lists_sorted_entries() {
    let shared = TempDir::new().unwrap();
    std::fs::create_dir(shared.path().join("music")).unwrap();
    std::fs::write(shared.path().join("a-note.txt"), b"x").unwrap();
    std::fs::write(shared.path().join("z-note.txt"), b"x").unwrap();

    let inbox = TempDir::new().unwrap();
    let (_responder, _rx, port) = listening_node("bob", inbox.path()).await;
    let (explorer, _erx) = dialing_node("alice", inbox.path(), port);

    let entries = explorer
        .explore_remote(LOCALHOST, shared.path().to_str().unwrap())
        .await
        .unwrap();

    let names: Vec<&str> = entries.iter().map(|e| e.name()).collect();
    assert_eq!(names, ["music", "a-note.txt", "z-note.txt"]);
    assert!(entries[0].is_dir);
}

#[tokio::test]
async fn remote_exploration_surfaces_peer_errors() {
    let inbox = TempDir::new().unwrap();
    let (_responder, _rx, port) = listening_node("bob", inbox.path()).await;
    let (explorer, _erx) = dialing_node("alice", inbox.path(), port);

    let err = explorer
        .explore_remote(LOCALHOST, "/definitely/not/here")
        .await
        .unwrap_err();
    assert!(matches!(err, lanlink_protocol::ProtocolError::Remote(_)));
}

#[tokio::test]
async fn remote_download_pulls_files_into_the_inbox() {
    let shared = TempDir::new().unwrap();
    let served = shared.path().join("manual.pdf");
    std::fs::write(&served, b"downloadable content").unwrap();

    let inbox = TempDir::new().unwrap();
    let (_responder, _rx, port) = listening_node("bob", shared.path()).await;
    let (downloader, _drx) = dialing_node("alice", inbox.path(), port);

    let transfer_id = downloader
        .download_remote(LOCALHOST, &[served.to_string_lossy().into_owned()])
        .await
        .unwrap();
    assert!(transfer_id.starts_with('R'));

    let dest = inbox.path().join("manual.pdf");
    wait_for_file(&dest).await;
    assert_eq!(std::fs::read(dest).unwrap(), b"downloadable content");
}

#[tokio::test]
async fn sending_to_an_unknown_device_fails_fast() {
    let inbox = TempDir::new().unwrap();
    let (engine, _rx) = dialing_node("alice", inbox.path(), 1);

    let err = engine.send_message("nobody", "hello?").await.unwrap_err();
    assert!(matches!(
        err,
        lanlink_protocol::ProtocolError::DeviceNotFound(_)
    ));

    let history = engine.registry().history_for_peer("nobody");
    assert_eq!(history.len(), 1);
    assert!(history[0].error.is_some());
}

#[tokio::test]
async fn history_is_kept_per_peer() {
    let inbox_a = TempDir::new().unwrap();
    let inbox_b = TempDir::new().unwrap();

    let (receiver, _rx, port) = listening_node("bob", inbox_b.path()).await;
    let (sender, _srx) = dialing_node("alice", inbox_a.path(), port);
    register_peer(&sender, "bob");

    sender.send_message("bob", "one").await.unwrap();
    sender.send_message("bob", "two").await.unwrap();

    timeout(Duration::from_secs(5), async {
        while receiver.registry().history_for_peer("alice").len() < 2 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("messages never arrived");

    let texts: Vec<String> = receiver
        .registry()
        .history_for_peer("alice")
        .into_iter()
        .filter_map(|t| t.message)
        .collect();
    assert_eq!(texts, ["one", "two"]);
}
