//! Raw-socket transport against a local line server.

use rust_tsp::config::SessionConfig;
use rust_tsp::session::{CommandSet, TspSession};
use rust_tsp::transport::{SocketTransport, Transport};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

const IDENTITY: &str = "Keithley Instruments Inc., Model 2602B, 04089762, 3.0.2";

/// Line server speaking just enough TSP for a session.
///
/// Lines are handled in order; a `waitcomplete()` line holds everything behind
/// it for `completion`.
async fn spawn_instrument(status: u8, completion: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = if line == "*IDN?" {
                Some(IDENTITY.to_string())
            } else if line.contains("'STB:'") {
                Some(format!("STB:{status}"))
            } else if line.contains("errorqueue.next()") {
                Some("0,\"Queue Is Empty\",0".to_string())
            } else if line.contains("localnode.revision") {
                Some("3.0.2".to_string())
            } else if line.contains("waitcomplete()") {
                tokio::time::sleep(completion).await;
                Some("1".to_string())
            } else {
                None
            };
            if let Some(reply) = reply {
                if write.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    });
    address
}

#[tokio::test]
async fn status_read_buffers_earlier_replies() {
    let address = spawn_instrument(0x04, Duration::ZERO).await;
    let mut transport = SocketTransport::new();
    transport.open(&address, None).await.unwrap();
    assert!(transport.is_open());

    transport.write_line("*IDN?").await.unwrap();
    let status = transport.read_status_byte(Duration::from_secs(1)).await.unwrap();

    assert_eq!(status, Some(0x14), "EAV from the instrument plus MAV for the buffered reply");
    let reply = transport.read_line(Duration::from_secs(1)).await.unwrap();
    assert!(reply.starts_with("Keithley Instruments"));

    let status = transport.read_status_byte(Duration::from_secs(1)).await.unwrap();
    assert_eq!(status, Some(0x04));
}

#[tokio::test]
async fn status_behind_blocking_command_stays_owed() {
    let address = spawn_instrument(0, Duration::from_millis(300)).await;
    let mut transport = SocketTransport::new();
    transport.open(&address, None).await.unwrap();

    transport.write_line("_G.waitcomplete() _G.print(1)").await.unwrap();
    let first = transport.read_status_byte(Duration::from_millis(50)).await.unwrap();
    let second = transport.read_status_byte(Duration::from_millis(50)).await.unwrap();
    assert_eq!(first, None);
    assert_eq!(second, None);

    assert_eq!(transport.read_line(Duration::from_secs(2)).await.unwrap(), "1");
    transport.write_line("*IDN?").await.unwrap();
    let reply = transport.read_line(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply, IDENTITY, "late status reply must not surface as a reply");
}

#[tokio::test]
async fn completion_wait_times_out_as_an_outcome() {
    let address = spawn_instrument(0, Duration::from_millis(400)).await;
    let session = TspSession::connect(
        Box::new(SocketTransport::new()),
        SessionConfig::for_resource(address),
        CommandSet::default(),
    )
    .await
    .unwrap();

    let outcome = session
        .await_operation_completion(session.controller(), Duration::from_millis(100))
        .await
        .unwrap();
    assert!(outcome.timed_out());
    assert!(outcome.elapsed < Duration::from_millis(400));

    let identity = session.identity().await.unwrap();
    assert_eq!(identity, IDENTITY);
    session.close().await.unwrap();
}

#[tokio::test]
async fn read_times_out_without_reply() {
    let address = spawn_instrument(0, Duration::ZERO).await;
    let mut transport = SocketTransport::new();
    transport.open(&address, None).await.unwrap();

    transport.write_line("_G.beeper.beep(0.1, 2400)").await.unwrap();
    let err = transport
        .read_line(Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn close_releases_the_socket() {
    let address = spawn_instrument(0, Duration::ZERO).await;
    let mut transport = SocketTransport::new().with_connect_timeout(Duration::from_secs(1));
    transport.open(&address, Some("2602B")).await.unwrap();

    transport.close().await.unwrap();

    assert!(!transport.is_open());
    assert!(transport.write_line("*CLS").await.is_err());
}

#[tokio::test]
async fn connect_failure_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let mut transport = SocketTransport::new().with_connect_timeout(Duration::from_millis(500));
    let err = transport.open(&address, None).await.unwrap_err();

    assert!(err.to_string().contains(&address));
    assert!(!transport.is_open());
}
