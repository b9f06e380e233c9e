//! Integration tests for client-server file transfer.
//!
//! These tests validate the complete protocol flow including:
//! - Version exchange and algorithm negotiation
//! - Key exchange and cipher setup
//! - Password authentication (including retry after failure)
//! - Single, multi-file and empty-file uploads
//! - Chunk reordering, duplicate chunks and early FILE_END
//! - Tamper detection on the encrypted channel

use kimcloud_platform::{CloudError, CloudResult};
use kimcloud_proto::ssh::auth::{self, CredentialStore};
use kimcloud_proto::ssh::client::FileClient;
use kimcloud_proto::ssh::config::{ClientConfig, ServerConfig};
use kimcloud_proto::ssh::kex::AlgorithmLists;
use kimcloud_proto::ssh::kex_dh::DhParams;
use kimcloud_proto::ssh::message::FrameType;
use kimcloud_proto::ssh::server::{serve_connection, FileServer, ServerContext, SessionSummary};
use kimcloud_proto::ssh::transfer::{send_file, FileData, FileStart};
use kimcloud_proto::ssh::transport::{Role, State, TransportConfig, TransportSession};
use rand::rngs::OsRng;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

async fn start_server(upload_dir: &Path) -> Result<(FileServer, String), Box<dyn std::error::Error>> {
    let config = ServerConfig::builder()
        .with_bind_addr("127.0.0.1:0")
        .with_upload_dir(upload_dir)
        .build()?;
    let server = FileServer::bind(config, CredentialStore::with_defaults()).await?;
    let addr = format!("127.0.0.1:{}", server.local_addr()?.port());
    Ok((server, addr))
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Upload one multi-chunk file and compare the stored bytes.
#[tokio::test]
async fn test_upload_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let uploads = tempfile::tempdir()?;
    let source_dir = tempfile::tempdir()?;
    let (server, addr) = start_server(uploads.path()).await?;

    let accept = tokio::spawn(async move { server.accept_one().await });

    let source = source_dir.path().join("report.bin");
    let content = pattern(20_000);
    tokio::fs::write(&source, &content).await?;

    let mut client = timeout(Duration::from_secs(5), FileClient::connect(&addr)).await??;
    assert_eq!(client.state(), State::CipherReady);

    client.authenticate("hosung", "kim").await?;
    assert_eq!(client.state(), State::Authenticated);

    let report = timeout(Duration::from_secs(5), client.upload(&source)).await??;
    assert_eq!(report.remote_name, "report.bin");
    assert_eq!(report.bytes_sent, 20_000);
    assert_eq!(report.chunks, 3);
    assert_eq!(client.state(), State::Transferring);

    client.disconnect().await?;

    let worker = accept.await??;
    let summary = timeout(Duration::from_secs(5), worker).await???;
    assert_eq!(summary.username, "hosung");
    assert_eq!(summary.files.len(), 1);
    assert!(summary.files[0].is_complete());

    let stored = tokio::fs::read(uploads.path().join("hosung_report.bin")).await?;
    assert_eq!(stored, content);

    Ok(())
}

/// A rejected login keeps the connection open for another attempt.
#[tokio::test]
async fn test_auth_failure_then_retry() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let uploads = tempfile::tempdir()?;
    let (server, addr) = start_server(uploads.path()).await?;
    let accept = tokio::spawn(async move { server.accept_one().await });

    let mut client = timeout(Duration::from_secs(5), FileClient::connect(&addr)).await??;

    let result = client.authenticate("nobody", "kim").await;
    assert!(matches!(result, Err(CloudError::AuthFailure(_))));
    assert_eq!(client.state(), State::CipherReady);

    let result = client.authenticate("admin", "wrong").await;
    assert!(matches!(result, Err(CloudError::AuthFailure(_))));

    client.authenticate("admin", "password").await?;
    assert_eq!(client.username(), Some("admin"));
    client.disconnect().await?;

    let worker = accept.await??;
    let summary = timeout(Duration::from_secs(5), worker).await???;
    assert_eq!(summary.username, "admin");
    assert!(summary.files.is_empty());

    Ok(())
}

/// Different identification lines end the connection on both sides.
#[tokio::test]
async fn test_version_mismatch() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let uploads = tempfile::tempdir()?;
    let (server, addr) = start_server(uploads.path()).await?;
    let accept = tokio::spawn(async move { server.accept_one().await });

    let config = ClientConfig::builder()
        .with_version("KimCloud_Protocol_v2")
        .build()?;
    let result = timeout(
        Duration::from_secs(5),
        FileClient::connect_with_config(&addr, config),
    )
    .await?;
    match result {
        Err(CloudError::ProtocolViolation(msg)) => assert!(msg.contains("Version mismatch")),
        other => panic!("Expected ProtocolViolation, got {:?}", other.map(|_| ())),
    }

    let worker = accept.await??;
    let outcome = timeout(Duration::from_secs(5), worker).await??;
    assert!(outcome.is_err());

    Ok(())
}

/// No common cipher means no session.
#[tokio::test]
async fn test_negotiation_failure() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let uploads = tempfile::tempdir()?;
    let (server, addr) = start_server(uploads.path()).await?;
    let accept = tokio::spawn(async move { server.accept_one().await });

    let algorithms = AlgorithmLists {
        encryption_client_to_server: vec!["aes256-ctr".to_string()],
        ..AlgorithmLists::default()
    };
    let config = ClientConfig::builder().with_algorithms(algorithms).build()?;

    let result = timeout(
        Duration::from_secs(5),
        FileClient::connect_with_config(&addr, config),
    )
    .await?;
    assert!(matches!(result, Err(CloudError::NegotiationFailure(_))));

    let worker = accept.await??;
    let outcome = timeout(Duration::from_secs(5), worker).await??;
    assert!(matches!(outcome, Err(CloudError::NegotiationFailure(_))));

    Ok(())
}

/// Several files over one session, including an empty and a missing one.
#[tokio::test]
async fn test_upload_all_mixed() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let uploads = tempfile::tempdir()?;
    let source_dir = tempfile::tempdir()?;
    let (server, addr) = start_server(uploads.path()).await?;
    let accept = tokio::spawn(async move { server.accept_one().await });

    let small = source_dir.path().join("small.txt");
    let empty = source_dir.path().join("empty.txt");
    let missing = source_dir.path().join("missing.txt");
    let exact = source_dir.path().join("exact.bin");
    tokio::fs::write(&small, b"hello kimcloud").await?;
    tokio::fs::write(&empty, b"").await?;
    tokio::fs::write(&exact, pattern(8192 * 2)).await?;

    let mut client = timeout(Duration::from_secs(5), FileClient::connect(&addr)).await??;
    client.authenticate("hosung", "kim").await?;

    let paths = vec![small, empty, missing, exact];
    let results = timeout(Duration::from_secs(5), client.upload_all(&paths)).await??;
    assert_eq!(results.len(), 4);

    let small_report = results[0].as_ref().map_err(|e| e.to_string())?;
    assert_eq!(small_report.bytes_sent, 14);
    assert_eq!(small_report.chunks, 1);

    let empty_report = results[1].as_ref().map_err(|e| e.to_string())?;
    assert_eq!(empty_report.bytes_sent, 0);
    assert_eq!(empty_report.chunks, 0);

    assert!(matches!(results[2], Err(CloudError::FileIo(_))));

    let exact_report = results[3].as_ref().map_err(|e| e.to_string())?;
    assert_eq!(exact_report.chunks, 2);

    client.disconnect().await?;

    let worker = accept.await??;
    let summary = timeout(Duration::from_secs(5), worker).await???;
    assert_eq!(summary.files.len(), 3);

    assert_eq!(
        tokio::fs::read(uploads.path().join("hosung_small.txt")).await?,
        b"hello kimcloud"
    );
    assert!(tokio::fs::read(uploads.path().join("hosung_empty.txt")).await?.is_empty());
    assert_eq!(
        tokio::fs::read(uploads.path().join("hosung_exact.bin")).await?,
        pattern(8192 * 2)
    );
    assert!(!uploads.path().join("hosung_missing.txt").exists());

    Ok(())
}

/// A destination that cannot be created is reported with FILE_ERROR and the
/// session carries on.
#[tokio::test]
async fn test_destination_error_keeps_session() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let uploads = tempfile::tempdir()?;
    let source_dir = tempfile::tempdir()?;
    let (server, addr) = start_server(uploads.path()).await?;
    let accept = tokio::spawn(async move { server.accept_one().await });

    // A directory already occupies the destination path
    tokio::fs::create_dir(uploads.path().join("hosung_blocked.txt")).await?;

    let blocked = source_dir.path().join("blocked.txt");
    let fine = source_dir.path().join("fine.txt");
    tokio::fs::write(&blocked, b"never stored").await?;
    tokio::fs::write(&fine, b"stored").await?;

    let mut client = timeout(Duration::from_secs(5), FileClient::connect(&addr)).await??;
    client.authenticate("hosung", "kim").await?;

    let result = client.upload(&blocked).await;
    assert!(matches!(result, Err(CloudError::FileIo(_))));
    assert_ne!(client.state(), State::Closed);

    let report = client.upload(&fine).await?;
    assert_eq!(report.bytes_sent, 6);
    client.disconnect().await?;

    let worker = accept.await??;
    let summary = timeout(Duration::from_secs(5), worker).await???;
    assert_eq!(summary.files.len(), 1);
    assert_eq!(tokio::fs::read(uploads.path().join("hosung_fine.txt")).await?, b"stored");

    Ok(())
}

/// Two clients served at the same time by independent workers.
#[tokio::test]
async fn test_concurrent_clients() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let uploads = tempfile::tempdir()?;
    let source_dir = tempfile::tempdir()?;
    let (server, addr) = start_server(uploads.path()).await?;

    let accept = tokio::spawn(async move {
        let first = server.accept_one().await?;
        let second = server.accept_one().await?;
        Ok::<_, CloudError>((first, second))
    });

    let file_a = source_dir.path().join("a.bin");
    let file_b = source_dir.path().join("b.bin");
    tokio::fs::write(&file_a, pattern(30_000)).await?;
    tokio::fs::write(&file_b, pattern(12_345)).await?;

    let upload = |user: &'static str, password: &'static str, path: std::path::PathBuf, addr: String| async move {
        let mut client = FileClient::connect(&addr).await?;
        client.authenticate(user, password).await?;
        let report = client.upload(&path).await?;
        client.disconnect().await?;
        Ok::<_, CloudError>(report)
    };

    let (a, b) = timeout(
        Duration::from_secs(10),
        async {
            tokio::join!(
                upload("hosung", "kim", file_a, addr.clone()),
                upload("admin", "password", file_b, addr.clone()),
            )
        },
    )
    .await?;
    assert_eq!(a?.bytes_sent, 30_000);
    assert_eq!(b?.bytes_sent, 12_345);

    let (first, second) = accept.await??;
    timeout(Duration::from_secs(5), first).await???;
    timeout(Duration::from_secs(5), second).await???;

    assert_eq!(
        tokio::fs::read(uploads.path().join("hosung_a.bin")).await?,
        pattern(30_000)
    );
    assert_eq!(
        tokio::fs::read(uploads.path().join("admin_b.bin")).await?,
        pattern(12_345)
    );

    Ok(())
}

/// One flipped bit in an encrypted frame closes the connection.
#[tokio::test]
async fn test_tampered_frame_closes_connection() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let uploads = tempfile::tempdir()?;
    let source_dir = tempfile::tempdir()?;

    let (client_io, proxy_client) = tokio::io::duplex(1 << 20);
    let (proxy_server, server_io) = tokio::io::duplex(1 << 20);

    let context = Arc::new(ServerContext {
        credentials: CredentialStore::with_defaults(),
        upload_dir: uploads.path().to_path_buf(),
        transport: TransportConfig::default(),
    });
    let worker = tokio::spawn(serve_connection(
        TransportSession::new(server_io, Role::Responder, TransportConfig::default()),
        context,
    ));

    // Forwards both directions; flips the last byte of the first client
    // write seen after `tamper` is set.
    let tamper = Arc::new(AtomicBool::new(false));
    let (mut from_client, mut to_client) = tokio::io::split(proxy_client);
    let (mut from_server, mut to_server) = tokio::io::split(proxy_server);

    let flag = Arc::clone(&tamper);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1 << 20];
        let mut tampered = false;
        loop {
            let n = match from_client.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if !tampered && flag.load(Ordering::SeqCst) {
                buf[n - 1] ^= 0x01;
                tampered = true;
            }
            if to_server.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = to_server.shutdown().await;
    });
    tokio::spawn(async move {
        let _ = tokio::io::copy(&mut from_server, &mut to_client).await;
        let _ = to_client.shutdown().await;
    });

    let mut client = timeout(
        Duration::from_secs(5),
        FileClient::handshake_over(client_io, "proxy", ClientConfig::default()),
    )
    .await??;
    client.authenticate("hosung", "kim").await?;

    let source = source_dir.path().join("victim.txt");
    tokio::fs::write(&source, b"integrity matters").await?;

    tamper.store(true, Ordering::SeqCst);
    let result = timeout(Duration::from_secs(5), client.upload(&source)).await?;
    assert!(result.is_err());
    assert_eq!(client.state(), State::Closed);

    let outcome = timeout(Duration::from_secs(5), worker).await??;
    assert!(matches!(outcome, Err(CloudError::MacMismatch { .. })));
    assert!(!uploads.path().join("hosung_victim.txt").exists());

    Ok(())
}

/// Uploading before logging in is refused locally.
#[tokio::test]
async fn test_upload_requires_authentication() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let uploads = tempfile::tempdir()?;
    let (server, addr) = start_server(uploads.path()).await?;
    let accept = tokio::spawn(async move { server.accept_one().await });

    let mut client = timeout(Duration::from_secs(5), FileClient::connect(&addr)).await??;
    let result = client.upload("Cargo.toml").await;
    assert!(matches!(result, Err(CloudError::ProtocolViolation(_))));
    assert_eq!(client.state(), State::CipherReady);

    client.disconnect().await?;
    let worker = accept.await??;
    let outcome = timeout(Duration::from_secs(5), worker).await??;
    assert!(outcome.is_err());

    Ok(())
}

type Worker = JoinHandle<CloudResult<SessionSummary>>;

/// Authenticated client session wired to a server worker over an in-memory pipe.
async fn authenticated_pipe(
    upload_dir: &Path,
) -> Result<(TransportSession<DuplexStream>, Worker), Box<dyn std::error::Error>> {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let context = Arc::new(ServerContext {
        credentials: CredentialStore::with_defaults(),
        upload_dir: upload_dir.to_path_buf(),
        transport: TransportConfig::default(),
    });
    let worker = tokio::spawn(serve_connection(
        TransportSession::new(server_io, Role::Responder, TransportConfig::default()),
        context,
    ));

    let mut session = TransportSession::new(client_io, Role::Initiator, TransportConfig::default());
    timeout(Duration::from_secs(5), session.handshake(&mut OsRng)).await??;
    auth::authenticate(&mut session, "hosung", "kim").await?;
    Ok((session, worker))
}

async fn start_upload(
    session: &mut TransportSession<DuplexStream>,
    start: &FileStart,
) -> Result<(), Box<dyn std::error::Error>> {
    session.send_frame(FrameType::FileStart, &start.to_bytes()).await?;
    let echo = session.recv_frame().await?;
    assert_eq!(echo.frame_type, FrameType::FileStart);
    assert_eq!(echo.payload, start.to_bytes());
    Ok(())
}

async fn send_chunk(
    session: &mut TransportSession<DuplexStream>,
    chunk_number: u32,
    data: &[u8],
) -> CloudResult<()> {
    let chunk = FileData {
        chunk_number,
        data: data.to_vec(),
    };
    session.send_frame(FrameType::FileData, &chunk.to_bytes()).await?;
    let ack = session.recv_frame().await?;
    assert_eq!(ack.frame_type, FrameType::FileData);
    assert!(ack.payload.is_empty());
    Ok(())
}

/// Chunks sent out of order and twice are stored once, in order.
#[tokio::test]
async fn test_out_of_order_and_duplicate_chunks() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let uploads = tempfile::tempdir()?;
    let (mut session, worker) = authenticated_pipe(uploads.path()).await?;

    let content = pattern(16);
    let start = FileStart {
        filename: "shuffled.bin".to_string(),
        file_size: 16,
        chunk_size: 4,
    };
    start_upload(&mut session, &start).await?;

    for index in [2u32, 0, 1, 1, 3] {
        let offset = index as usize * 4;
        send_chunk(&mut session, index, &content[offset..offset + 4]).await?;
    }

    let done = session.recv_frame().await?;
    assert_eq!(done.frame_type, FrameType::FileEnd);
    assert!(done.payload.is_empty());

    session.send_frame(FrameType::Disconnect, &[]).await?;
    let summary = timeout(Duration::from_secs(5), worker).await???;
    assert_eq!(summary.files.len(), 1);
    assert_eq!(summary.files[0].bytes_written, 16);
    assert_eq!(summary.files[0].chunks, 4);
    assert!(summary.files[0].is_complete());

    let stored = tokio::fs::read(uploads.path().join("hosung_shuffled.bin")).await?;
    assert_eq!(stored, content);

    Ok(())
}

/// FILE_END with a chunk still held back ends that transfer only.
#[tokio::test]
async fn test_early_file_end_keeps_session() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let uploads = tempfile::tempdir()?;
    let source_dir = tempfile::tempdir()?;
    let (mut session, worker) = authenticated_pipe(uploads.path()).await?;

    let content = pattern(16);
    let start = FileStart {
        filename: "partial.bin".to_string(),
        file_size: 16,
        chunk_size: 4,
    };
    start_upload(&mut session, &start).await?;

    send_chunk(&mut session, 0, &content[0..4]).await?;
    // Held back: chunk 1 never arrives
    send_chunk(&mut session, 2, &content[8..12]).await?;

    session.send_frame(FrameType::FileEnd, &[]).await?;
    let done = session.recv_frame().await?;
    assert_eq!(done.frame_type, FrameType::FileEnd);
    assert!(done.payload.is_empty());
    assert_ne!(session.state(), State::Closed);

    let follow_up = source_dir.path().join("after.txt");
    tokio::fs::write(&follow_up, b"still connected").await?;
    let report = timeout(Duration::from_secs(5), send_file(&mut session, &follow_up, 4)).await??;
    assert_eq!(report.bytes_sent, 15);
    assert_eq!(report.chunks, 4);

    session.send_frame(FrameType::Disconnect, &[]).await?;
    let summary = timeout(Duration::from_secs(5), worker).await???;
    assert_eq!(summary.files.len(), 2);
    assert_eq!(summary.files[0].bytes_written, 4);
    assert!(!summary.files[0].is_complete());
    assert!(summary.files[1].is_complete());

    assert_eq!(
        tokio::fs::read(uploads.path().join("hosung_partial.bin")).await?,
        &content[0..4]
    );
    assert_eq!(
        tokio::fs::read(uploads.path().join("hosung_after.txt")).await?,
        b"still connected"
    );

    Ok(())
}

/// A last chunk longer than the bytes left in the file is refused.
#[tokio::test]
async fn test_overlong_last_chunk_closes_connection() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let uploads = tempfile::tempdir()?;
    let (mut session, worker) = authenticated_pipe(uploads.path()).await?;

    let start = FileStart {
        filename: "overflow.bin".to_string(),
        file_size: 10,
        chunk_size: 4,
    };
    start_upload(&mut session, &start).await?;

    send_chunk(&mut session, 0, &[1; 4]).await?;
    send_chunk(&mut session, 1, &[2; 4]).await?;
    let result = send_chunk(&mut session, 2, &[3; 4]).await;
    assert!(result.is_err());
    assert_eq!(session.state(), State::Closed);

    let outcome = timeout(Duration::from_secs(5), worker).await??;
    assert!(matches!(outcome, Err(CloudError::ProtocolViolation(_))));

    Ok(())
}

/// Invalid group parameters are a configuration error, not a panic.
#[tokio::test]
async fn test_handshake_over_rejects_bad_dh_params() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let (client_io, _server_io) = tokio::io::duplex(4096);
    let config = ClientConfig {
        dh_params: DhParams {
            modulus: 2,
            generator: 2,
        },
        ..ClientConfig::default()
    };

    let result = timeout(
        Duration::from_secs(5),
        FileClient::handshake_over(client_io, "pipe", config),
    )
    .await?;
    assert!(matches!(result, Err(CloudError::Config(_))));

    Ok(())
}
