//! End-to-end run against a scripted rig on loopback.

use std::time::Duration;

use doser::protocol::{self, Message};
use doser::sink::{COMMANDS_FILE, list_results};
use doser::{ClientConfig, Doser, LinkState, Phase};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const WAIT: Duration = Duration::from_secs(5);
const SHEET: &str = "material,target,density,particle,vial\nsalt,10,2,3,9.7\nsugar,12,1.5,1,9.7\n";

async fn read_record(socket: &mut TcpStream) -> Option<String> {
    let mut buf = vec![0u8; 512];
    match tokio::time::timeout(Duration::from_millis(500), socket.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => Some(String::from_utf8_lossy(&buf[..n]).into_owned()),
        _ => None,
    }
}

/// Runs the control handshake for every row, then asks for one row too many.
async fn control_rig(
    listener: TcpListener,
    started: oneshot::Receiver<()>,
    rows: usize,
) -> Vec<String> {
    let (mut socket, _) = listener.accept().await.expect("accept control");
    started.await.expect("run started");

    let mut packets = Vec::new();
    for _ in 0..rows {
        socket.write_all(b"new_target\n").await.expect("write");
        packets.push(read_record(&mut socket).await.expect("packet for new target"));
        // Leave the data channel a few poll periods with this target active.
        tokio::time::sleep(Duration::from_millis(200)).await;
        socket.write_all(b"target\n").await.expect("write");
        socket.write_all(b"executing 50%\n").await.expect("write");
        packets.push(read_record(&mut socket).await.expect("packet for executing"));
    }

    socket.write_all(b"new_target\n").await.expect("write");
    assert_eq!(read_record(&mut socket).await, None, "no packet after the last row");
    packets
}

/// Answers every poll with one sample.
async fn data_rig(listener: TcpListener) -> usize {
    let (mut socket, _) = listener.accept().await.expect("accept data");
    let mut polls = 0;
    let mut buf = vec![0u8; 512];
    while let Ok(n) = socket.read(&mut buf).await {
        if n == 0 {
            break;
        }
        polls += 1;
        let reply: &[u8] = if polls % 2 == 0 { b"9 9 9\n" } else { b"0.95 0.2 10.0 3.5\n" };
        if socket.write_all(reply).await.is_err() {
            break;
        }
    }
    polls
}

#[tokio::test]
async fn full_run_completes_and_records_results() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempfile::tempdir().expect("tempdir");
    let sheet = dir.path().join("batch.csv");
    std::fs::write(&sheet, SHEET).expect("write sheet");

    let control_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let data_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");

    let mut config = ClientConfig::default();
    config.set_control_endpoint("127.0.0.1", control_listener.local_addr().unwrap().port());
    config.set_data_endpoint("127.0.0.1", data_listener.local_addr().unwrap().port());
    config.communication.timeout = 0.2;
    config.communication.poll_interval_ms = 50;
    config.files.results_dir = dir.path().join("results");

    let (started_tx, started_rx) = oneshot::channel();
    let control_rig = tokio::spawn(control_rig(control_listener, started_rx, 2));
    let data_rig = tokio::spawn(data_rig(data_listener));

    let doser = Doser::new(config).expect("client");
    doser.connect().await.expect("connect");
    assert_eq!(doser.load_targets(&sheet).await.expect("load"), 2);
    doser.start().await.expect("start");
    started_tx.send(()).expect("rig listening");

    let packets =
        tokio::time::timeout(WAIT, control_rig).await.expect("rig timed out").expect("rig");
    let status = tokio::time::timeout(WAIT, doser.wait_for_phase(Phase::Completed))
        .await
        .expect("completion timed out")
        .expect("driver alive");

    assert_eq!(status.row, 2);
    assert_eq!(status.control, LinkState::Connected);
    assert!(doser.start().await.is_err(), "completed runs do not restart");

    assert_eq!(packets.len(), 4);
    for packet in &packets {
        assert!(protocol::validate_packet(packet), "invalid packet {packet:?}");
    }
    let targets: Vec<f64> = packets
        .iter()
        .map(|packet| match protocol::parse_response(packet) {
            Message::Data(command) => command.target_weight,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(targets, vec![10.0, 0.0, 12.0, 0.0]);

    doser.shutdown().await;
    let polls =
        tokio::time::timeout(WAIT, data_rig).await.expect("data rig timed out").expect("rig");
    assert!(polls > 0, "data channel was polled");

    let results_dir = dir.path().join("results");
    let commands = std::fs::read_to_string(results_dir.join(COMMANDS_FILE)).expect("command log");
    assert_eq!(commands.lines().count(), 4);

    let results = list_results(&results_dir).expect("list results");
    assert!(results.iter().all(|r| r.sheet == "batch"));
    assert!(results.iter().any(|r| r.material == "salt"));
}

#[tokio::test]
async fn start_is_refused_without_control_link() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = ClientConfig::default();
    config.files.results_dir = dir.path().to_path_buf();

    let doser = Doser::new(config).expect("client");
    let table = doser::TargetTable::parse("s", SHEET, &doser.config().parameters);
    doser.load_table(table).await.expect("load");

    let error = doser.start().await.expect_err("control link is down");
    assert!(matches!(error, doser::DoserError::InvalidState { .. }));
    assert_eq!(doser.status().phase, Phase::Idle);
    doser.shutdown().await;
}
