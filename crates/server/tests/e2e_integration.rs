//! End-to-end integration tests for FsGate.
//!
//! These tests run a real listener on a loopback port and drive it with
//! [`FsClient`]:
//! - Greeting and two-phase login
//! - Phase gating and path confinement
//! - File operations and transfers
//! - Connection limits and graceful shutdown

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use protocol::{Delimiter, ErrorCode};
use server::config::Config;
use server::credentials::MemoryCredentialStore;
use server::files::{FileLimits, FileOperations};
use server::net::{ClientError, ConnectionLimits, ConnectionListener, FsClient, GREETING};
use server::sandbox::{PathSandbox, ServerRoot};
use server::session::LoginRegistry;
use server::CommandDispatcher;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running server bound to a loopback port.
struct TestServer {
    addr: SocketAddr,
    root: PathBuf,
    delimiter: Delimiter,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn connect(&self) -> FsClient {
        FsClient::connect(self.addr, self.delimiter).await.unwrap()
    }

    async fn login(&self, username: &str, password: &str) -> FsClient {
        let mut client = self.connect().await;
        client.login(username, password).await.unwrap();
        client
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("listener did not stop in time")
            .unwrap();
    }
}

/// Start a server with test users `alice` and `bob`.
async fn start_server(configure: impl FnOnce(&mut Config)) -> TestServer {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".to_string();
    config.server.root_dir = temp_dir.path().join("root");
    configure(&mut config);
    config.validate().unwrap();

    let store =
        MemoryCredentialStore::with_users([("alice", "secret"), ("bob", "hunter2")]).unwrap();
    let root = ServerRoot::new(&config.server.root_dir).unwrap();
    let root_path = root.path().to_path_buf();
    let files = FileOperations::new(PathSandbox::new(root), FileLimits::from(&config))
        .with_serialized_mutations(config.file.serialize_mutations);
    let dispatcher = Arc::new(CommandDispatcher::new(
        Arc::new(store),
        LoginRegistry::new(config.auth.allow_concurrent_logins),
        files,
        config.protocol.delimiter,
    ));

    let listener = ConnectionListener::bind(
        config.server.bind_addr.as_str(),
        ConnectionLimits::from(&config),
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(listener.serve(dispatcher, shutdown.clone()));

    TestServer {
        addr,
        root: root_path,
        delimiter: config.protocol.delimiter,
        shutdown,
        handle,
        _temp_dir: temp_dir,
    }
}

fn rejected_code<T: std::fmt::Debug>(result: Result<T, ClientError>) -> ErrorCode {
    match result {
        Err(ClientError::Rejected(response)) => response.code.unwrap(),
        other => panic!("expected a rejected request, got {:?}", other),
    }
}

// =============================================================================
// Session Tests
// =============================================================================

#[tokio::test]
async fn test_greeting_on_connect() {
    let server = start_server(|_| {}).await;

    let client = server.connect().await;
    assert!(client.greeting().is_ok());
    assert_eq!(client.greeting().message, GREETING);

    server.stop().await;
}

#[tokio::test]
async fn test_login_flow() {
    let server = start_server(|_| {}).await;
    let mut client = server.connect().await;

    let response = client.send_line("USER alice").await.unwrap();
    assert!(response.is_ok());
    let response = client.send_line("PASS secret").await.unwrap();
    assert!(response.is_ok());
    assert_eq!(response.message, "Welcome alice");

    let response = client.pwd().await.unwrap();
    assert_eq!(response.message, "working directory is /");

    server.stop().await;
}

#[tokio::test]
async fn test_wrong_password_then_retry() {
    let server = start_server(|_| {}).await;
    let mut client = server.connect().await;

    let err = client.login("alice", "nope").await;
    assert_eq!(rejected_code(err), ErrorCode::Auth);

    // Back to square one: the password alone is not accepted.
    let response = client.send_line("PASS secret").await.unwrap();
    assert_eq!(response.code, Some(ErrorCode::Auth));

    client.login("alice", "secret").await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_user() {
    let server = start_server(|_| {}).await;
    let mut client = server.connect().await;

    let response = client.send_line("USER mallory").await.unwrap();
    assert_eq!(response.code, Some(ErrorCode::Auth));
    assert_eq!(response.message, "User not found");

    server.stop().await;
}

#[tokio::test]
async fn test_file_commands_require_authentication() {
    let server = start_server(|_| {}).await;
    let mut client = server.connect().await;

    assert_eq!(rejected_code(client.view(".").await), ErrorCode::Auth);
    assert_eq!(rejected_code(client.pwd().await), ErrorCode::Auth);

    // Half-way through login is still unauthenticated.
    client.send_line("USER alice").await.unwrap();
    assert_eq!(rejected_code(client.copy("a", "b").await), ErrorCode::Auth);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_verb_keeps_connection_open() {
    let server = start_server(|_| {}).await;
    let mut client = server.login("alice", "secret").await;

    let response = client.send_line("FROBNICATE x").await.unwrap();
    assert_eq!(response.code, Some(ErrorCode::Protocol));
    assert!(response.message.contains("valid verbs"));

    let response = client.send_line("COPY onlyone").await.unwrap();
    assert_eq!(response.code, Some(ErrorCode::Protocol));
    assert!(response.message.contains("usage"));

    assert!(client.pwd().await.is_ok());
    server.stop().await;
}

#[tokio::test]
async fn test_overlong_line_is_rejected() {
    let server = start_server(|config| config.protocol.max_line_length = 64).await;
    let mut client = server.login("alice", "secret").await;

    let response = client
        .send_line(&format!("VIEW {}", "a".repeat(200)))
        .await
        .unwrap();
    assert_eq!(response.code, Some(ErrorCode::Protocol));

    assert!(client.pwd().await.is_ok());
    server.stop().await;
}

#[tokio::test]
async fn test_terminate_closes_connection() {
    let server = start_server(|_| {}).await;
    let client = server.login("alice", "secret").await;

    let response = client.terminate().await.unwrap();
    assert_eq!(response.message, "Goodbye");

    server.stop().await;
}

#[tokio::test]
async fn test_duplicate_login_refused() {
    let server = start_server(|_| {}).await;
    let first = server.login("alice", "secret").await;

    let mut second = server.connect().await;
    let err = second.login("alice", "secret").await;
    assert_eq!(rejected_code(err), ErrorCode::Auth);

    // Other users are unaffected.
    let mut bob = server.connect().await;
    bob.login("bob", "hunter2").await.unwrap();

    // Once the first session ends the name is free again.
    first.terminate().await.unwrap();
    second.login("alice", "secret").await.unwrap();

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_logins_when_allowed() {
    let server = start_server(|config| config.auth.allow_concurrent_logins = true).await;

    let _first = server.login("alice", "secret").await;
    let _second = server.login("alice", "secret").await;

    server.stop().await;
}

// =============================================================================
// Confinement Tests
// =============================================================================

#[tokio::test]
async fn test_escape_is_refused() {
    let server = start_server(|_| {}).await;
    let mut client = server.login("alice", "secret").await;

    let err = client.view("../..").await;
    match err {
        Err(ClientError::Rejected(response)) => {
            assert_eq!(response.code, Some(ErrorCode::Escape));
            let root = server.root.to_string_lossy().to_string();
            assert!(!response.message.contains(&root));
        }
        other => panic!("expected escape rejection, got {:?}", other),
    }

    assert_eq!(
        rejected_code(client.set_dir("../outside").await),
        ErrorCode::Escape
    );
    assert_eq!(
        rejected_code(client.copy("a.txt", "../../b.txt").await),
        ErrorCode::Escape
    );
    assert!(!server.root.join("../outside").exists());

    // The session is still usable and still at the root.
    let response = client.pwd().await.unwrap();
    assert_eq!(response.message, "working directory is /");

    server.stop().await;
}

#[tokio::test]
async fn test_set_dir_and_relative_paths() {
    let server = start_server(|_| {}).await;
    let mut client = server.login("alice", "secret").await;

    let response = client.set_dir("projects/demo").await.unwrap();
    assert_eq!(response.message, "working directory is /projects/demo");
    assert!(server.root.join("projects/demo").is_dir());

    client.upload("notes.txt", b"hello").await.unwrap();
    assert_eq!(
        fs::read(server.root.join("projects/demo/notes.txt")).unwrap(),
        b"hello"
    );

    // A leading slash is relative to the server root.
    client.set_dir("/").await.unwrap();
    let response = client.view("/projects/demo/notes.txt").await.unwrap();
    assert_eq!(response.body, vec!["hello".to_string()]);

    server.stop().await;
}

// =============================================================================
// File Operation Tests
// =============================================================================

#[tokio::test]
async fn test_copy_rename_move_and_view() {
    let server = start_server(|_| {}).await;
    fs::write(server.root.join("a.txt"), "line one\nline two\n").unwrap();
    let mut client = server.login("alice", "secret").await;

    let response = client.copy("a.txt", "backup/a.txt").await.unwrap();
    assert_eq!(response.message, "copied /a.txt to /backup/a.txt (18 bytes)");

    client.rename("backup/a.txt", "b.txt").await.unwrap();
    assert!(server.root.join("backup/b.txt").exists());
    assert!(!server.root.join("backup/a.txt").exists());

    client.move_file("backup/b.txt", "archive/b.txt").await.unwrap();
    assert!(server.root.join("archive/b.txt").exists());
    assert!(!server.root.join("backup/b.txt").exists());

    let response = client.view("archive/b.txt").await.unwrap();
    assert_eq!(response.body, vec!["line one", "line two"]);

    let response = client.view(".").await.unwrap();
    assert_eq!(response.message, "listing of / (3 entries)");
    assert!(response.body.contains(&"[FILE] a.txt 18 bytes".to_string()));
    assert!(response.body.contains(&"[DIR] archive".to_string()));

    server.stop().await;
}

#[tokio::test]
async fn test_missing_source_and_directory_source() {
    let server = start_server(|_| {}).await;
    fs::create_dir(server.root.join("dir")).unwrap();
    let mut client = server.login("alice", "secret").await;

    assert_eq!(
        rejected_code(client.copy("nope.txt", "x.txt").await),
        ErrorCode::NotFound
    );
    assert_eq!(
        rejected_code(client.copy("dir", "x").await),
        ErrorCode::NotAFile
    );
    assert_eq!(rejected_code(client.view("ghost").await), ErrorCode::NotFound);

    server.stop().await;
}

#[tokio::test]
async fn test_view_truncates_long_files() {
    let server = start_server(|config| config.file.view_max_lines = 3).await;
    let content: String = (1..=10).map(|i| format!("{}\n", i)).collect();
    fs::write(server.root.join("long.txt"), content).unwrap();
    let mut client = server.login("alice", "secret").await;

    let response = client.view("long.txt").await.unwrap();
    assert_eq!(response.body, vec!["1", "2", "3"]);
    assert!(response.message.contains("truncated"));

    server.stop().await;
}

#[tokio::test]
async fn test_download_and_upload() {
    let server = start_server(|_| {}).await;
    let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    fs::write(server.root.join("blob.bin"), &data).unwrap();
    let mut client = server.login("alice", "secret").await;

    let downloaded = client.download("blob.bin").await.unwrap();
    assert_eq!(downloaded, data);

    let response = client.upload("copy/blob.bin", &downloaded).await.unwrap();
    assert!(response.message.starts_with("stored /copy/blob.bin 1000 bytes"));
    assert_eq!(fs::read(server.root.join("copy/blob.bin")).unwrap(), data);

    server.stop().await;
}

#[tokio::test]
async fn test_transfer_size_limit() {
    let server = start_server(|config| config.file.max_transfer_size = 16).await;
    fs::write(server.root.join("big.bin"), vec![1u8; 64]).unwrap();
    let mut client = server.login("alice", "secret").await;

    assert_eq!(
        rejected_code(client.download("big.bin").await),
        ErrorCode::Protocol
    );
    assert_eq!(
        rejected_code(client.upload("big2.bin", &[0u8; 64]).await),
        ErrorCode::Protocol
    );
    assert!(!server.root.join("big2.bin").exists());

    server.stop().await;
}

#[tokio::test]
async fn test_pipe_delimiter_allows_spaces() {
    let server = start_server(|config| config.protocol.delimiter = Delimiter::Pipe).await;
    fs::write(server.root.join("my file.txt"), "spaced").unwrap();
    let mut client = server.login("alice", "secret").await;

    client.copy("my file.txt", "my docs/copy of file.txt").await.unwrap();
    assert_eq!(
        fs::read_to_string(server.root.join("my docs/copy of file.txt")).unwrap(),
        "spaced"
    );

    // Legacy spelling of SET-DIR.
    let response = client.send_line("SET FOLDER | my docs").await.unwrap();
    assert_eq!(response.message, "working directory is /my docs");

    server.stop().await;
}

#[tokio::test]
async fn test_serialized_mutations() {
    let server = start_server(|config| config.file.serialize_mutations = true).await;
    fs::write(server.root.join("a.txt"), "x").unwrap();

    let mut tasks = Vec::new();
    for (user, password) in [("alice", "secret"), ("bob", "hunter2")] {
        let mut client = server.login(user, password).await;
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                client
                    .copy("a.txt", &format!("{}-{}.txt", "out", i))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for i in 0..10 {
        assert_eq!(
            fs::read_to_string(server.root.join(format!("out-{}.txt", i))).unwrap(),
            "x"
        );
    }
    server.stop().await;
}

// =============================================================================
// Listener Tests
// =============================================================================

#[tokio::test]
async fn test_busy_server_refuses_extra_connections() {
    let server = start_server(|config| config.server.max_connections = 1).await;
    let first = server.connect().await;

    match FsClient::connect(server.addr, server.delimiter).await {
        Err(ClientError::Rejected(response)) => {
            assert_eq!(response.code, Some(ErrorCode::Io));
            assert_eq!(response.message, "server busy");
        }
        Err(e) => panic!("expected busy rejection, got {:?}", e),
        Ok(_) => panic!("expected busy rejection, got a connection"),
    }

    first.terminate().await.unwrap();

    // The slot frees once the first worker has finished.
    let mut accepted = None;
    for _ in 0..50 {
        match FsClient::connect(server.addr, server.delimiter).await {
            Ok(client) => {
                accepted = Some(client);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    assert!(accepted.is_some());

    server.stop().await;
}

#[tokio::test]
async fn test_graceful_shutdown_closes_idle_connections() {
    let server = start_server(|_| {}).await;
    let mut client = server.login("alice", "secret").await;
    let addr = server.addr;

    server.stop().await;

    assert!(client.pwd().await.is_err());
    assert!(FsClient::connect_with_timeout(addr, Delimiter::Whitespace, Duration::from_secs(1))
        .await
        .is_err());
}

#[tokio::test]
async fn test_many_concurrent_sessions() {
    let server = start_server(|config| config.auth.allow_concurrent_logins = true).await;
    fs::write(server.root.join("shared.txt"), "shared").unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let mut client = server.login("alice", "secret").await;
        tasks.push(tokio::spawn(async move {
            let dir = format!("worker{}", i);
            client.set_dir(&dir).await.unwrap();
            let response = client.pwd().await.unwrap();
            assert_eq!(response.message, format!("working directory is /{}", dir));
            client.copy("/shared.txt", "mine.txt").await.unwrap();
            client.terminate().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for i in 0..8 {
        assert!(server.root.join(format!("worker{}/mine.txt", i)).exists());
    }
    server.stop().await;
}
