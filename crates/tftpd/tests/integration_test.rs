//! Integration tests for the TFTP server
//!
//! These bind a real server on the loopback and exercise it with a hand
//! rolled UDP client speaking the wire protocol.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tftp::{DirHandler, DirPolicy, ErrorCode, Mode, Packet, Server, ServerConfig, TransferConfig, BLOCK_SIZE};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const CLIENT_WAIT: Duration = Duration::from_secs(2);

async fn start_server(
    root: &Path,
    policy: DirPolicy,
    transfer_timeout: Duration,
) -> (Arc<Server<DirHandler>>, SocketAddr, JoinHandle<anyhow::Result<()>>) {
    let config = ServerConfig {
        address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        transfer: TransferConfig {
            timeout: transfer_timeout,
        },
    };
    let server = Arc::new(Server::bind(config, DirHandler::new(root, policy)).await.unwrap());
    let addr = server.local_addr().unwrap();

    let runner = Arc::clone(&server);
    let task = tokio::spawn(async move { runner.run().await });
    (server, addr, task)
}

async fn recv_from(sock: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = [0u8; 1500];
    let (len, from) = timeout(CLIENT_WAIT, sock.recv_from(&mut buf)).await.unwrap().unwrap();
    (Packet::decode(&buf[..len]).unwrap(), from)
}

/// Fetch a file, acknowledging every block. Returns the file content and
/// the session port it came from, or the error packet the server sent.
async fn download(server: SocketAddr, filename: &str) -> Result<(Vec<u8>, u16), (ErrorCode, String)> {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rrq = Packet::ReadRequest {
        filename: filename.into(),
        mode: Mode::Octet,
    };
    sock.send_to(&rrq.encode(), server).await.unwrap();

    let mut data = Vec::new();
    let mut expected: u16 = 1;
    let mut session: Option<SocketAddr> = None;

    loop {
        let (pkt, from) = recv_from(&sock).await;
        match session {
            Some(addr) => assert_eq!(from, addr, "datagram from outside the session"),
            None => {
                assert_ne!(from.port(), server.port(), "session must use a fresh TID");
                session = Some(from);
            }
        }
        match pkt {
            Packet::Data { block, payload } => {
                assert_eq!(block, expected);
                data.extend_from_slice(&payload);
                sock.send_to(&Packet::Ack { block }.encode(), from).await.unwrap();
                if payload.len() < BLOCK_SIZE {
                    return Ok((data, from.port()));
                }
                expected = expected.wrapping_add(1);
            }
            Packet::Error { code, message } => return Err((code, message)),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}

/// Store a file block by block. Returns the session port, or the error
/// packet the server sent instead of accepting the transfer.
async fn upload(server: SocketAddr, filename: &str, content: &[u8]) -> Result<u16, (ErrorCode, String)> {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let wrq = Packet::WriteRequest {
        filename: filename.into(),
        mode: Mode::Octet,
    };
    sock.send_to(&wrq.encode(), server).await.unwrap();

    let (pkt, session) = recv_from(&sock).await;
    assert_ne!(session.port(), server.port());
    match pkt {
        Packet::Ack { block: 0 } => {}
        Packet::Error { code, message } => return Err((code, message)),
        other => panic!("unexpected reply to WRQ: {:?}", other),
    }

    let mut block: u16 = 1;
    let mut offset = 0;
    loop {
        let end = usize::min(offset + BLOCK_SIZE, content.len());
        let chunk = &content[offset..end];
        let pkt = Packet::Data {
            block,
            payload: chunk.to_vec(),
        };
        sock.send_to(&pkt.encode(), session).await.unwrap();

        let (reply, _) = recv_from(&sock).await;
        assert_eq!(reply, Packet::Ack { block });

        offset = end;
        if chunk.len() < BLOCK_SIZE {
            return Ok(session.port());
        }
        block = block.wrapping_add(1);
    }
}

async fn shutdown(server: Arc<Server<DirHandler>>, task: JoinHandle<anyhow::Result<()>>) {
    server.stop().await.unwrap();
    timeout(CLIENT_WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_download_small_file() {
    let dir = tempdir().unwrap();
    let content: Vec<u8> = (0..1300u32).map(|i| i as u8).collect();
    std::fs::write(dir.path().join("boot.img"), &content).unwrap();

    let (server, addr, task) = start_server(dir.path(), DirPolicy::default(), Duration::from_secs(5)).await;

    let (data, _) = download(addr, "boot.img").await.unwrap();
    assert_eq!(data, content);

    shutdown(server, task).await;
}

#[tokio::test]
async fn test_download_exact_block_multiple() {
    let dir = tempdir().unwrap();
    let content = vec![0x7fu8; BLOCK_SIZE * 2];
    std::fs::write(dir.path().join("exact.bin"), &content).unwrap();

    let (server, addr, task) = start_server(dir.path(), DirPolicy::default(), Duration::from_secs(5)).await;

    // The transfer must close with an empty terminal block.
    let (data, _) = download(addr, "exact.bin").await.unwrap();
    assert_eq!(data, content);

    shutdown(server, task).await;
}

#[tokio::test]
async fn test_download_missing_file() {
    let dir = tempdir().unwrap();
    let (server, addr, task) = start_server(dir.path(), DirPolicy::default(), Duration::from_secs(5)).await;

    let err = download(addr, "nope.bin").await.unwrap_err();
    assert_eq!(err.0, ErrorCode::FileNotFound);

    shutdown(server, task).await;
}

#[tokio::test]
async fn test_download_denied_by_policy() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("secret.txt"), b"data").unwrap();

    let policy = DirPolicy {
        read: false,
        ..DirPolicy::default()
    };
    let (server, addr, task) = start_server(dir.path(), policy, Duration::from_secs(5)).await;

    let err = download(addr, "secret.txt").await.unwrap_err();
    assert_eq!(err.0, ErrorCode::AccessViolation);

    shutdown(server, task).await;
}

#[tokio::test]
async fn test_upload_round_trip() {
    let dir = tempdir().unwrap();
    let content: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

    let (server, addr, task) = start_server(dir.path(), DirPolicy::default(), Duration::from_secs(5)).await;

    upload(addr, "incoming.bin", &content).await.unwrap();

    // The session flushes before acknowledging the terminal block.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(std::fs::read(dir.path().join("incoming.bin")).unwrap(), content);

    shutdown(server, task).await;
}

#[tokio::test]
async fn test_upload_denied_by_policy() {
    let dir = tempdir().unwrap();
    let policy = DirPolicy {
        write: false,
        ..DirPolicy::default()
    };
    let (server, addr, task) = start_server(dir.path(), policy, Duration::from_secs(5)).await;

    let err = upload(addr, "incoming.bin", b"payload").await.unwrap_err();
    assert_eq!(err.0, ErrorCode::AccessViolation);
    assert!(!dir.path().join("incoming.bin").exists());

    shutdown(server, task).await;
}

#[tokio::test]
async fn test_upload_existing_file_policies() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("taken.txt"), b"original").unwrap();

    // With overwrite disabled the request is refused.
    let policy = DirPolicy {
        overwrite: false,
        ..DirPolicy::default()
    };
    let (server, addr, task) = start_server(dir.path(), policy, Duration::from_secs(5)).await;
    let err = upload(addr, "taken.txt", b"replacement").await.unwrap_err();
    assert_eq!(err.0, ErrorCode::FileAlreadyExists);
    assert_eq!(std::fs::read(dir.path().join("taken.txt")).unwrap(), b"original");
    shutdown(server, task).await;

    // The default policy replaces the file.
    let (server, addr, task) = start_server(dir.path(), DirPolicy::default(), Duration::from_secs(5)).await;
    upload(addr, "taken.txt", b"replacement").await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(std::fs::read(dir.path().join("taken.txt")).unwrap(), b"replacement");
    shutdown(server, task).await;
}

#[tokio::test]
async fn test_concurrent_downloads_use_distinct_tids() {
    let dir = tempdir().unwrap();
    let content = vec![0x55u8; BLOCK_SIZE * 3 + 17];
    std::fs::write(dir.path().join("shared.bin"), &content).unwrap();

    let (server, addr, task) = start_server(dir.path(), DirPolicy::default(), Duration::from_secs(5)).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        handles.push(tokio::spawn(async move { download(addr, "shared.bin").await.unwrap() }));
    }

    let mut ports = HashSet::new();
    for handle in handles {
        let (data, port) = handle.await.unwrap();
        assert_eq!(data, content);
        assert!(ports.insert(port), "session port {} reused concurrently", port);
    }

    // All sessions are done; their TIDs are free again.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.active_sessions(), 0);

    shutdown(server, task).await;
}

#[tokio::test]
async fn test_abandoned_upload_times_out_and_cleans_up() {
    let dir = tempdir().unwrap();
    let (server, addr, task) = start_server(dir.path(), DirPolicy::default(), Duration::from_millis(200)).await;

    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let wrq = Packet::WriteRequest {
        filename: "partial.bin".into(),
        mode: Mode::Octet,
    };
    sock.send_to(&wrq.encode(), addr).await.unwrap();

    let (pkt, session) = recv_from(&sock).await;
    assert_eq!(pkt, Packet::Ack { block: 0 });

    // One full block, then walk away mid-transfer.
    let data = Packet::Data {
        block: 1,
        payload: vec![0x11; BLOCK_SIZE],
    };
    sock.send_to(&data.encode(), session).await.unwrap();
    let (reply, _) = recv_from(&sock).await;
    assert_eq!(reply, Packet::Ack { block: 1 });

    // The session aborts after its timeout, removes the partial file and
    // releases its TID.
    sleep(Duration::from_millis(600)).await;
    assert!(!dir.path().join("partial.bin").exists());
    assert_eq!(server.active_sessions(), 0);

    shutdown(server, task).await;
}

#[tokio::test]
async fn test_abandoned_download_times_out() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("slow.bin"), vec![0u8; BLOCK_SIZE * 2]).unwrap();

    let (server, addr, task) = start_server(dir.path(), DirPolicy::default(), Duration::from_millis(200)).await;

    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rrq = Packet::ReadRequest {
        filename: "slow.bin".into(),
        mode: Mode::Octet,
    };
    sock.send_to(&rrq.encode(), addr).await.unwrap();

    // Take the first block and never acknowledge it.
    let (pkt, _) = recv_from(&sock).await;
    assert!(matches!(pkt, Packet::Data { block: 1, .. }));

    sleep(Duration::from_millis(600)).await;
    assert_eq!(server.active_sessions(), 0);

    shutdown(server, task).await;
}

#[tokio::test]
async fn test_stop_is_graceful() {
    let dir = tempdir().unwrap();
    let (server, addr, task) = start_server(dir.path(), DirPolicy::default(), Duration::from_secs(5)).await;

    // The server answers before the stop and not after.
    let err = download(addr, "missing").await.unwrap_err();
    assert_eq!(err.0, ErrorCode::FileNotFound);

    server.stop().await.unwrap();
    timeout(CLIENT_WAIT, task).await.unwrap().unwrap().unwrap();

    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rrq = Packet::ReadRequest {
        filename: "missing".into(),
        mode: Mode::Octet,
    };
    sock.send_to(&rrq.encode(), addr).await.unwrap();
    let mut buf = [0u8; 64];
    assert!(timeout(Duration::from_millis(300), sock.recv_from(&mut buf)).await.is_err());
}
