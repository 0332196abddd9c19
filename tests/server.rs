//! End-to-end tests of the request pipeline over a real UNIX socket.
//!
//! These run the full acceptor/worker/router/codec path. No directory
//! server is involved: the scenarios either finish before any LDAP
//! contact (validnames rejections, disabled enumeration, PAM session
//! bookkeeping) or exercise the unavailable-directory behavior against
//! an unreachable URI with the soft reconnect policy.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use ldapnsd::proto::{Action, ProtoStream, PROTO_VERSION, RESULT_BEGIN, RESULT_END};
use ldapnsd::result::NsdError;
use ldapnsd::{server, Config};

struct TestServer {
    socket_path: std::path::PathBuf,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start(extra_config: &str) -> TestServer {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("socket");
        let text = format!(
            "uri ldap://127.0.0.1:1/\nbase dc=example,dc=com\n\
             bind_policy soft\nbind_timelimit 1\nthreads 2\n\
             socket {}\n{}",
            socket_path.display(),
            extra_config
        );
        let cfg = Arc::new(Config::parse(&text).expect("config"));
        let listener = server::bind_socket(&cfg).expect("socket");
        let shutdown = CancellationToken::new();
        tokio::spawn(server::run(cfg, listener, None, shutdown.clone()));
        TestServer {
            socket_path,
            shutdown,
            _dir: dir,
        }
    }

    async fn connect(&self) -> ProtoStream<UnixStream> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect");
        ProtoStream::new(stream)
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }
}

async fn send_header(client: &mut ProtoStream<UnixStream>, action: Action) {
    client.write_i32(PROTO_VERSION).await.expect("version");
    client.write_i32(action.code()).await.expect("action");
}

async fn read_response_header(client: &mut ProtoStream<UnixStream>, action: Action) {
    assert_eq!(client.read_i32().await.expect("version"), PROTO_VERSION);
    assert_eq!(client.read_i32().await.expect("action"), action.code());
}

#[tokio::test]
async fn invalid_name_yields_empty_result() {
    let srv = TestServer::start("").await;
    let mut client = srv.connect().await;
    send_header(&mut client, Action::PasswdByName).await;
    client.write_string("in*valid").await.expect("name");
    client.flush().await.expect("flush");
    read_response_header(&mut client, Action::PasswdByName).await;
    assert_eq!(client.read_i32().await.expect("end"), RESULT_END);
    srv.stop();
}

#[tokio::test]
async fn disabled_enumeration_is_empty_success() {
    let srv = TestServer::start("nss_disable_enumeration on\n").await;
    let mut client = srv.connect().await;
    send_header(&mut client, Action::PasswdAll).await;
    client.flush().await.expect("flush");
    read_response_header(&mut client, Action::PasswdAll).await;
    assert_eq!(client.read_i32().await.expect("end"), RESULT_END);
    srv.stop();
}

#[tokio::test]
async fn version_mismatch_drops_connection() {
    let srv = TestServer::start("").await;
    let mut client = srv.connect().await;
    client.write_i32(99).await.expect("version");
    client
        .write_i32(Action::PasswdByName.code())
        .await
        .expect("action");
    client.flush().await.expect("flush");
    // no response data at all; the connection just closes
    client.start_request();
    assert!(matches!(client.read_i32().await, Err(NsdError::Disconnect)));
    srv.stop();
}

#[tokio::test]
async fn unknown_action_drops_connection() {
    let srv = TestServer::start("").await;
    let mut client = srv.connect().await;
    client.write_i32(PROTO_VERSION).await.expect("version");
    client.write_i32(0x7f7f_7f7f).await.expect("action");
    client.flush().await.expect("flush");
    client.start_request();
    assert!(matches!(client.read_i32().await, Err(NsdError::Disconnect)));
    srv.stop();
}

#[tokio::test]
async fn pam_session_open_returns_session_id() {
    let srv = TestServer::start("").await;
    let mut client = srv.connect().await;
    send_header(&mut client, Action::PamSessOpen).await;
    for field in ["alice", "sshd", "", "", "tty1"] {
        client.write_string(field).await.expect("field");
    }
    client.flush().await.expect("flush");
    read_response_header(&mut client, Action::PamSessOpen).await;
    assert_eq!(client.read_i32().await.expect("begin"), RESULT_BEGIN);
    let sessionid = client.read_string(64).await.expect("sessionid");
    assert_eq!(sessionid.len(), 24);
    assert!(sessionid.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_eq!(client.read_i32().await.expect("end"), RESULT_END);
    srv.stop();
}

#[tokio::test]
async fn pam_session_close_acknowledges() {
    let srv = TestServer::start("").await;
    let mut client = srv.connect().await;
    send_header(&mut client, Action::PamSessClose).await;
    for field in ["alice", "sshd", "", "", "tty1", "c3fBZoitGHMrrigPHNkesnXm"] {
        client.write_string(field).await.expect("field");
    }
    client.flush().await.expect("flush");
    read_response_header(&mut client, Action::PamSessClose).await;
    assert_eq!(client.read_i32().await.expect("begin"), RESULT_BEGIN);
    assert_eq!(client.read_i32().await.expect("end"), RESULT_END);
    srv.stop();
}

#[tokio::test]
async fn unavailable_directory_aborts_without_end_marker() {
    let srv = TestServer::start("").await;
    let mut client = srv.connect().await;
    send_header(&mut client, Action::PasswdByName).await;
    client.write_string("alice").await.expect("name");
    client.flush().await.expect("flush");
    // the header is echoed before the directory is contacted; with no
    // reachable server the stream then breaks off with no END marker
    read_response_header(&mut client, Action::PasswdByName).await;
    client.start_request();
    assert!(matches!(client.read_i32().await, Err(NsdError::Disconnect)));
    srv.stop();
}

#[tokio::test]
async fn config_get_returns_prohibit_message() {
    let srv =
        TestServer::start("pam_password_prohibit_message \"use the portal\"\n").await;
    let mut client = srv.connect().await;
    send_header(&mut client, Action::ConfigGet).await;
    client
        .write_i32(ldapnsd::proto::config_option::PAM_PASSWORD_PROHIBIT_MESSAGE)
        .await
        .expect("option");
    client.flush().await.expect("flush");
    read_response_header(&mut client, Action::ConfigGet).await;
    assert_eq!(client.read_i32().await.expect("begin"), RESULT_BEGIN);
    assert_eq!(
        client.read_string(1024).await.expect("message"),
        "use the portal"
    );
    assert_eq!(client.read_i32().await.expect("end"), RESULT_END);
    srv.stop();
}

#[tokio::test]
async fn workers_serve_connections_sequentially() {
    let srv = TestServer::start("").await;
    // more connections than workers; each carries one request
    for _ in 0..5 {
        let mut client = srv.connect().await;
        send_header(&mut client, Action::PamSessOpen).await;
        for field in ["bob", "login", "", "", ""] {
            client.write_string(field).await.expect("field");
        }
        client.flush().await.expect("flush");
        read_response_header(&mut client, Action::PamSessOpen).await;
        assert_eq!(client.read_i32().await.expect("begin"), RESULT_BEGIN);
        let _ = client.read_string(64).await.expect("sessionid");
        assert_eq!(client.read_i32().await.expect("end"), RESULT_END);
    }
    srv.stop();
}

#[tokio::test]
async fn shutdown_is_prompt() {
    let srv = TestServer::start("").await;
    let started = std::time::Instant::now();
    srv.stop();
    // workers should wind down well inside the grace period
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
}
