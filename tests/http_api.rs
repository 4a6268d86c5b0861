//! REST routes and control socket of a server bound to an ephemeral port.

use livescribe::config::Config;
use livescribe::ipc::{Command, Response, send_command};
use livescribe::server::{AppState, run_with_listener};
use livescribe::worker::{WorkerLauncher, WorkerSettings};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

struct TestServer {
    state: Arc<AppState>,
    address: SocketAddr,
    socket: PathBuf,
    task: JoinHandle<livescribe::Result<()>>,
    _dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.models.dir = Some(dir.path().join("models"));
        config.worker.poll_interval_ms = 50;
        let launcher = WorkerLauncher::new(
            env!("CARGO_BIN_EXE_livescribe"),
            WorkerSettings::from_config(&config),
        );
        let state = Arc::new(AppState::from_config(config, launcher));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let socket = dir.path().join("ctl.sock");
        let task = tokio::spawn(run_with_listener(
            Arc::clone(&state),
            listener,
            Some(socket.clone()),
        ));
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Self {
            state,
            address,
            socket,
            task,
            _dir: dir,
        }
    }

    async fn request(&self, method: &str, path: &str, body: Option<&str>) -> (u16, Value) {
        let mut stream = TcpStream::connect(self.address).await.unwrap();
        let body = body.unwrap_or("");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = String::new();
        tokio::time::timeout(Duration::from_secs(15), stream.read_to_string(&mut raw))
            .await
            .unwrap()
            .unwrap();
        let status = raw
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap();
        let (_, payload) = raw.split_once("\r\n\r\n").unwrap();
        (status, serde_json::from_str(payload).unwrap_or(Value::Null))
    }

    async fn shutdown(self) {
        self.state.request_shutdown();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!self.socket.exists());
    }
}

#[tokio::test]
async fn test_health_reports_idle_server() {
    let server = TestServer::start().await;
    let (status, body) = server.request("GET", "/health", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["model"], Value::Null);
    assert_eq!(body["sessions"], 0);
    server.shutdown().await;
}

#[tokio::test]
async fn test_models_list_marks_loopback_installed() {
    let server = TestServer::start().await;
    let (status, body) = server.request("GET", "/api/v1/models", None).await;
    assert_eq!(status, 200);
    let models = body["models"].as_array().unwrap();
    let loopback = models
        .iter()
        .find(|m| m["id"] == "loopback-streaming")
        .unwrap();
    assert_eq!(loopback["is_available"], true);
    assert_eq!(loopback["compiled"], true);
    assert_eq!(loopback["is_active"], false);
    assert_eq!(loopback["workflow"], "streaming");
    server.shutdown().await;
}

#[tokio::test]
async fn test_switch_unknown_model_is_bad_request() {
    let server = TestServer::start().await;
    let (status, body) = server
        .request(
            "POST",
            "/api/v1/models/switch",
            Some(r#"{"model_id":"nope"}"#),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "unknown_model");
    server.shutdown().await;
}

#[tokio::test]
async fn test_switch_then_status() {
    let server = TestServer::start().await;
    let (status, body) = server
        .request(
            "POST",
            "/api/v1/models/switch",
            Some(r#"{"model_id":"loopback-buffered"}"#),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["current_model"], "loopback-buffered");

    let (_, status_body) = server.request("GET", "/api/v1/models/status", None).await;
    assert_eq!(status_body["model"], "loopback-buffered");
    assert_eq!(status_body["state"], "running");
    assert_eq!(status_body["workflow"], "buffered");
    assert_eq!(status_body["loaded"], true);

    let pid = server.state.supervisor.status().pid.unwrap();
    server.shutdown().await;
    // SAFETY: signal 0 only checks for existence.
    assert_ne!(unsafe { libc::kill(pid as libc::pid_t, 0) }, 0);
}

#[tokio::test]
async fn test_session_routes() {
    let server = TestServer::start().await;
    let (status, body) = server.request("GET", "/api/v1/sessions/missing", None).await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "session_not_found");

    let session = server.state.sessions.create("loopback-streaming", 1).unwrap();
    let path = format!("/api/v1/sessions/{}", session.id);
    let (status, body) = server.request("GET", &path, None).await;
    assert_eq!(status, 200);
    assert_eq!(body["id"], session.id.as_str());
    assert_eq!(body["is_valid"], true);
    assert!(body["remaining_secs"].as_i64().unwrap() > 3500);

    let extend = format!("{path}/extend");
    let (status, body) = server.request("POST", &extend, Some(r#"{"hours":0}"#)).await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "invalid_ttl");

    let (status, body) = server
        .request("POST", &extend, Some(r#"{"hours":10000000000}"#))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "invalid_ttl");

    let (status, _) = server.request("POST", &extend, Some(r#"{"hours":48}"#)).await;
    assert_eq!(status, 200);
    let remaining = server.state.sessions.get_remaining_time(&session.id).unwrap();
    assert!(remaining.num_hours() >= 47);
    server.shutdown().await;
}

#[tokio::test]
async fn test_control_socket_commands() {
    let server = TestServer::start().await;
    server.state.sessions.create("loopback-streaming", 1).unwrap();

    match send_command(&server.socket, &Command::Status).await.unwrap() {
        Response::Status {
            sessions,
            active_sessions,
            ..
        } => {
            assert_eq!(sessions, 1);
            assert_eq!(active_sessions, 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    let switched = send_command(
        &server.socket,
        &Command::SwitchModel {
            model: "loopback-streaming".to_string(),
            keep_sessions: true,
        },
    )
    .await
    .unwrap();
    assert_eq!(
        switched,
        Response::Switched {
            previous: None,
            current: "loopback-streaming".to_string(),
            changed: true,
        }
    );

    let response = send_command(&server.socket, &Command::Shutdown).await.unwrap();
    assert_eq!(response, Response::Ok);
    tokio::time::timeout(Duration::from_secs(10), server.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        server.state.supervisor.status().state,
        livescribe::worker::WorkerState::Stopped
    );
}
