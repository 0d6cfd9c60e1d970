// End-to-end tests for the bridge.
//
// Each test boots a real bridge on a free loopback port. Agents are either a
// real tether-agentd (HTTP surface and relay client) or a bare WebSocket that
// plays the relay side of one.

use futures_util::SinkExt;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tether_agentd::app::relay::RelaySettings;
use tether_agentd::identity::AgentIdentity;
use tether_bridge::adapters::credentials::InMemoryCredentialStore;
use tether_bridge::Settings;
use tether_proto::USER_HEADER;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "bridge-e2e-secret-0123456789";

type FakeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Bridge {
    port: u16,
    base: String,
    client: reqwest::Client,
    handle: JoinHandle<()>,
}

impl Bridge {
    async fn start(configure: impl FnOnce(&mut Settings)) -> Self {
        let port = find_free_port().await;
        let mut settings = Settings {
            listen: ([127, 0, 0, 1], port).into(),
            status_ttl: Duration::from_secs(1),
            probe_interval: Duration::from_millis(200),
            ..Settings::default()
        };
        configure(&mut settings);
        let credentials = Arc::new(InMemoryCredentialStore::new().with("alice", SECRET));

        let handle = tokio::spawn(async move {
            tether_bridge::run(settings, credentials).await.unwrap();
        });
        wait_for_port(port).await;

        Self {
            port,
            base: format!("http://127.0.0.1:{port}"),
            client: reqwest::Client::new(),
            handle,
        }
    }

    fn relay_url(&self) -> String {
        format!("ws://127.0.0.1:{}/relay", self.port)
    }

    async fn operate(&self, operation: Value) -> (StatusCode, Value) {
        let response = self
            .client
            .post(format!("{}/users/alice/operations", self.base))
            .json(&operation)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn status(&self) -> Value {
        self.client
            .get(format!("{}/users/alice/status", self.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn wait_for_status(&self, wanted: &str) -> Value {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let body = self.status().await;
            if body["status"] == wanted {
                return body;
            }
            if Instant::now() > deadline {
                panic!("status never became {wanted}; last seen {body}");
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}

struct Agent {
    _home: TempDir,
    root: PathBuf,
    base: String,
    client: reqwest::Client,
    handle: JoinHandle<()>,
}

impl Agent {
    async fn start(relay_url: Option<String>) -> Self {
        let home = TempDir::new().unwrap();
        let root = std::fs::canonicalize(home.path()).unwrap();
        let port = find_free_port().await;
        let identity = AgentIdentity::new("alice", SECRET, &root, port).unwrap();
        let mut settings = tether_agentd::Settings::new(identity);
        settings.relay = relay_url.map(|url| {
            let mut relay = RelaySettings::new(url);
            relay.reconnect_min = Duration::from_millis(50);
            relay.reconnect_max = Duration::from_millis(200);
            relay
        });

        let handle = tokio::spawn(async move {
            tether_agentd::run(settings).await.unwrap();
        });
        wait_for_port(port).await;

        Self {
            _home: home,
            root,
            base: format!("http://127.0.0.1:{port}"),
            client: reqwest::Client::new(),
            handle,
        }
    }

    fn port(&self) -> u16 {
        self.base
            .rsplit(':')
            .next()
            .and_then(|port| port.parse().ok())
            .unwrap()
    }

    async fn post(&self, path: &str, body: Value) -> StatusCode {
        self.client
            .post(format!("{}{path}", self.base))
            .bearer_auth(SECRET)
            .json(&body)
            .send()
            .await
            .unwrap()
            .status()
    }

    async fn approve(&self, mode: &str, dirs: &[&Path], ops: &[&str]) {
        let status = self
            .post(
                "/plan/approve",
                json!({ "mode": mode, "allowedDirectories": dirs, "allowedOperations": ops }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn audit_origins(&self) -> Vec<(String, String)> {
        let body: Value = self
            .client
            .get(format!("{}/logs", self.base))
            .bearer_auth(SECRET)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| {
                (
                    entry["operation"].as_str().unwrap().to_string(),
                    entry["origin"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }
}

/// Connects to the bridge as `alice` and announces `http_port`.
async fn fake_relay(bridge: &Bridge, secret: &str, http_port: Option<u16>) -> FakeSocket {
    let mut request = bridge.relay_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert(AUTHORIZATION, format!("Bearer {secret}").parse().unwrap());
    request
        .headers_mut()
        .insert(USER_HEADER, "alice".parse().unwrap());
    let (mut socket, _) = connect_async(request).await.unwrap();
    let announcement = json!({
        "type": "agent-metadata",
        "homeDirectory": "/home/alice",
        "platform": "linux",
        "httpPort": http_port,
    });
    socket
        .send(Message::Text(announcement.to_string()))
        .await
        .unwrap();
    socket
}

#[tokio::test]
async fn e2e_relay_loss_keeps_direct_http_working() {
    let bridge = Bridge::start(|_| {}).await;
    let agent = Agent::start(None).await;
    std::fs::write(agent.root.join("notes.txt"), "hello").unwrap();

    let mut socket = fake_relay(&bridge, SECRET, Some(agent.port())).await;
    let status = bridge.wait_for_status("full").await;
    assert_eq!(status["relay"], "open");
    assert_eq!(status["lastProbe"]["healthy"], true);

    let (code, body) = bridge
        .operate(json!({ "operation": "fs.list", "path": agent.root }))
        .await;
    assert_eq!(code, StatusCode::OK, "{body}");
    assert_eq!(body["transport"], "http");
    assert_eq!(body["data"]["entries"][0]["name"], "notes.txt");

    socket.close(None).await.unwrap();
    let status = bridge.wait_for_status("http-only").await;
    assert_eq!(status["relay"], "closed");

    let (code, body) = bridge
        .operate(json!({ "operation": "fs.read", "path": agent.root.join("notes.txt") }))
        .await;
    assert_eq!(code, StatusCode::OK, "{body}");
    assert_eq!(body["transport"], "http");
    assert_eq!(body["data"]["content"], "hello");
    assert!(agent
        .audit_origins()
        .await
        .iter()
        .all(|(_, origin)| origin == "http"));

    agent.handle.abort();
    bridge.handle.abort();
}

#[tokio::test]
async fn e2e_operations_travel_over_the_relay() {
    // Agents listen on 127.0.0.1 only, so the direct path is unreachable.
    let bridge = Bridge::start(|settings| {
        settings.agent_host = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));
    })
    .await;
    let agent = Agent::start(Some(bridge.relay_url())).await;
    bridge.wait_for_status("relay-only").await;

    let (code, body) = bridge
        .operate(json!({ "operation": "fs.read", "path": "/etc/passwd" }))
        .await;
    assert_eq!(code, StatusCode::FORBIDDEN, "{body}");
    assert_eq!(body["code"], "permission-denied");
    assert_eq!(body["reason"], "safe-mode-readonly");

    let project = agent.root.join("project");
    std::fs::create_dir_all(&project).unwrap();
    agent.approve("balanced", &[&project], &["read", "write"]).await;

    let (code, body) = bridge
        .operate(json!({
            "operation": "fs.write",
            "path": project.join("notes.txt"),
            "content": "via relay"
        }))
        .await;
    assert_eq!(code, StatusCode::OK, "{body}");
    assert_eq!(body["transport"], "relay");
    assert_eq!(
        std::fs::read_to_string(project.join("notes.txt")).unwrap(),
        "via relay"
    );

    let origins = agent.audit_origins().await;
    assert!(origins.contains(&("fs.read".to_string(), "relay".to_string())));
    assert!(origins.contains(&("fs.write".to_string(), "relay".to_string())));

    agent.handle.abort();
    bridge.handle.abort();
}

#[tokio::test]
async fn e2e_silent_agent_times_out() {
    let bridge = Bridge::start(|settings| {
        settings.router.relay_timeout = Duration::from_millis(300);
    })
    .await;
    let _socket = fake_relay(&bridge, SECRET, None).await;
    bridge.wait_for_status("relay-only").await;

    let started = Instant::now();
    let (code, body) = bridge
        .operate(json!({ "operation": "fs.list", "path": "/home/alice" }))
        .await;
    assert_eq!(code, StatusCode::GATEWAY_TIMEOUT, "{body}");
    assert_eq!(body["code"], "timeout");
    assert!(started.elapsed() < Duration::from_secs(3));

    bridge.handle.abort();
}

#[tokio::test]
async fn e2e_wrong_secret_cannot_attach() {
    let bridge = Bridge::start(|_| {}).await;
    let mut request = bridge.relay_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert(AUTHORIZATION, "Bearer not-the-secret".parse().unwrap());
    request
        .headers_mut()
        .insert(USER_HEADER, "alice".parse().unwrap());
    assert!(connect_async(request).await.is_err());

    assert_eq!(bridge.status().await["status"], "none");
    let (code, body) = bridge
        .operate(json!({ "operation": "fs.list", "path": "/home/alice" }))
        .await;
    assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "agent-unavailable");

    bridge.handle.abort();
}

#[tokio::test]
async fn e2e_killed_agent_drops_out_of_full() {
    let bridge = Bridge::start(|_| {}).await;
    let agent = Agent::start(Some(bridge.relay_url())).await;
    bridge.wait_for_status("full").await;

    assert_eq!(agent.post("/kill", json!({})).await, StatusCode::OK);
    tokio::time::timeout(Duration::from_secs(5), agent.handle)
        .await
        .expect("agent exits after kill")
        .unwrap();

    bridge.wait_for_status("none").await;
    let (code, body) = bridge
        .operate(json!({ "operation": "fs.list", "path": "/home/alice" }))
        .await;
    assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE, "{body}");

    bridge.handle.abort();
}

async fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_port(port: u16) {
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("port {port} did not open");
}
