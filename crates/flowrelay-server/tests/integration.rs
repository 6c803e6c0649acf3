//! End-to-end tests against a real server with HTTP and WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use flowrelay_core::FlowDocument;
use flowrelay_server::server::{start_with, AppState};
use flowrelay_server::{ServerConfig, ServerHandle};
use flowrelay_store::{FlowValidator, ValidationIssue, ValidationReport};

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

fn test_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        ..Default::default()
    }
}

async fn boot(config: ServerConfig) -> ServerHandle {
    start_with(AppState::new(config)).await.unwrap()
}

fn http_url(handle: &ServerHandle, path: &str) -> String {
    format!("http://{}{}", handle.local_addr(), path)
}

async fn connect(handle: &ServerHandle) -> WsStream {
    let url = format!("ws://{}/ws", handle.local_addr());
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

/// Registration happens after the upgrade response, so poll for it.
async fn wait_for_connections(handle: &ServerHandle, n: usize) {
    timeout(TIMEOUT, async {
        while handle.hub().count() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {n} connections, have {}", handle.hub().count()));
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(ws: &mut WsStream, wait: Duration) -> Option<Value> {
    timeout(wait, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(text.as_str()).unwrap());
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Whether the server closed this socket within `TIMEOUT`.
async fn closed_by_server(ws: &mut WsStream) -> Option<u16> {
    timeout(TIMEOUT, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(frame)) => {
                    return Some(frame.map(|f| u16::from(f.code)).unwrap_or(1005));
                }
                Err(_) => return Some(1006),
                Ok(_) => continue,
            }
        }
        Some(1006)
    })
    .await
    .ok()
    .flatten()
}

// ── HTTP: flow store ──

#[tokio::test]
async fn save_then_load_current() {
    let handle = boot(test_config()).await;
    let client = reqwest::Client::new();

    let flow = json!({"nodes": [{"id": "1"}], "edges": []});
    let resp = client
        .post(http_url(&handle, "/api/flow"))
        .json(&flow)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"message": "Flow saved successfully"}));

    let loaded: Value = client
        .get(http_url(&handle, "/api/flow/current"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(loaded, flow);

    handle.shutdown().await;
}

#[tokio::test]
async fn last_save_wins() {
    let handle = boot(test_config()).await;
    let client = reqwest::Client::new();

    for i in 0..3 {
        client
            .post(http_url(&handle, "/api/flow"))
            .json(&json!({"nodes": [{"id": i.to_string()}], "edges": []}))
            .send()
            .await
            .unwrap();
    }

    let loaded: Value = reqwest::get(http_url(&handle, "/api/flow/current"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(loaded, json!({"nodes": [{"id": "2"}], "edges": []}));

    handle.shutdown().await;
}

#[tokio::test]
async fn load_missing_returns_error_body_with_200() {
    let handle = boot(test_config()).await;

    let resp = reqwest::get(http_url(&handle, "/api/flow/missing")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"error": "Flow not found"}));

    handle.shutdown().await;
}

#[tokio::test]
async fn load_missing_is_404_when_strict() {
    let handle = boot(ServerConfig {
        strict_not_found: true,
        ..test_config()
    })
    .await;

    let resp = reqwest::get(http_url(&handle, "/api/flow/missing")).await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"error": "Flow not found"}));

    handle.shutdown().await;
}

#[tokio::test]
async fn save_rejects_missing_edges_with_json_error() {
    let handle = boot(test_config()).await;

    let resp = reqwest::Client::new()
        .post(http_url(&handle, "/api/flow"))
        .json(&json!({"nodes": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("edges"));

    // Nothing was stored.
    assert!(handle.store().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn validate_always_returns_no_errors() {
    let handle = boot(test_config()).await;

    let resp = reqwest::Client::new()
        .post(http_url(&handle, "/api/validate"))
        .json(&json!({
            "nodes": [{"id": "a", "type": "decision"}],
            "edges": [{"source": "a", "target": "nowhere"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"errors": []}));

    handle.shutdown().await;
}

struct RequireNodes;

impl FlowValidator for RequireNodes {
    fn validate(&self, flow: &FlowDocument) -> ValidationReport {
        let mut report = ValidationReport::default();
        if flow.nodes.is_empty() {
            report.errors.push(ValidationIssue {
                message: "flow has no nodes".into(),
                node_id: None,
            });
        }
        report
    }
}

#[tokio::test]
async fn custom_validator_is_used() {
    let state = AppState::new(test_config()).with_validator(Arc::new(RequireNodes));
    let handle = start_with(state).await.unwrap();

    let body: Value = reqwest::Client::new()
        .post(http_url(&handle, "/api/validate"))
        .json(&json!({"nodes": [], "edges": []}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"errors": [{"message": "flow has no nodes"}]}));

    handle.shutdown().await;
}

#[tokio::test]
async fn cors_allows_configured_origin() {
    let handle = boot(test_config()).await;

    let resp = reqwest::Client::new()
        .get(http_url(&handle, "/health"))
        .header("Origin", "http://localhost")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("http://localhost")
    );

    let resp = reqwest::Client::new()
        .get(http_url(&handle, "/health"))
        .header("Origin", "http://evil.test")
        .send()
        .await
        .unwrap();
    assert!(resp.headers().get("access-control-allow-origin").is_none());

    handle.shutdown().await;
}

// ── WebSocket: broadcast hub ──

#[tokio::test]
async fn ping_gets_pong_only_on_sender() {
    let handle = boot(test_config()).await;
    let mut a = connect(&handle).await;
    let mut b = connect(&handle).await;
    wait_for_connections(&handle, 2).await;

    send_json(&mut a, json!({"type": "ping"})).await;

    assert_eq!(next_json(&mut a, TIMEOUT).await, Some(json!({"type": "pong"})));
    assert_eq!(next_json(&mut a, QUIET).await, None);
    assert_eq!(next_json(&mut b, QUIET).await, None);

    handle.shutdown().await;
}

#[tokio::test]
async fn flow_update_reaches_all_clients_including_sender() {
    let handle = boot(test_config()).await;
    let mut a = connect(&handle).await;
    let mut b = connect(&handle).await;
    let mut c = connect(&handle).await;
    wait_for_connections(&handle, 3).await;

    let update = json!({"type": "flowUpdate", "nodes": [], "edges": []});
    send_json(&mut a, update.clone()).await;

    for ws in [&mut a, &mut b, &mut c] {
        assert_eq!(next_json(ws, TIMEOUT).await, Some(update.clone()));
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn flow_update_payload_is_relayed_verbatim() {
    let handle = boot(test_config()).await;
    let mut a = connect(&handle).await;
    let mut b = connect(&handle).await;
    wait_for_connections(&handle, 2).await;

    let raw = concat!(
        r#"{"type":"flowUpdate","#,
        r#""data":{"nodes":[{"id":"1","position":{"x":1.5,"y":-2}}],"edges":[]},"#,
        r#""z":1,"a":2}"#,
    );
    a.send(Message::text(raw.to_string())).await.unwrap();

    let relayed = timeout(TIMEOUT, async {
        loop {
            match b.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_owned(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(relayed, raw);

    handle.shutdown().await;
}

#[tokio::test]
async fn flow_update_excludes_sender_when_configured() {
    let handle = boot(ServerConfig {
        echo_to_sender: false,
        ..test_config()
    })
    .await;
    let mut a = connect(&handle).await;
    let mut b = connect(&handle).await;
    wait_for_connections(&handle, 2).await;

    let update = json!({"type": "flowUpdate", "data": {"nodes": [], "edges": []}});
    send_json(&mut a, update.clone()).await;

    assert_eq!(next_json(&mut b, TIMEOUT).await, Some(update));
    assert_eq!(next_json(&mut a, QUIET).await, None);

    handle.shutdown().await;
}

#[tokio::test]
async fn unknown_type_is_ignored() {
    let handle = boot(test_config()).await;
    let mut a = connect(&handle).await;
    let mut b = connect(&handle).await;
    wait_for_connections(&handle, 2).await;

    send_json(&mut a, json!({"type": "cursor", "x": 10})).await;
    assert_eq!(next_json(&mut b, QUIET).await, None);

    // The sender is still connected and served.
    send_json(&mut a, json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut a, TIMEOUT).await, Some(json!({"type": "pong"})));
    assert_eq!(handle.hub().count(), 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn malformed_frame_closes_only_that_connection() {
    let handle = boot(test_config()).await;
    let mut bad = connect(&handle).await;
    let mut good = connect(&handle).await;
    wait_for_connections(&handle, 2).await;

    bad.send(Message::text("this is not json".to_string())).await.unwrap();
    assert_eq!(closed_by_server(&mut bad).await, Some(1007));
    wait_for_connections(&handle, 1).await;

    send_json(&mut good, json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut good, TIMEOUT).await, Some(json!({"type": "pong"})));

    handle.shutdown().await;
}

#[tokio::test]
async fn frame_without_type_closes_connection() {
    let handle = boot(test_config()).await;
    let mut ws = connect(&handle).await;
    wait_for_connections(&handle, 1).await;

    send_json(&mut ws, json!({"nodes": [], "edges": []})).await;
    assert_eq!(closed_by_server(&mut ws).await, Some(1007));
    wait_for_connections(&handle, 0).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn client_close_deregisters() {
    let handle = boot(test_config()).await;
    let mut a = connect(&handle).await;
    let mut b = connect(&handle).await;
    wait_for_connections(&handle, 2).await;

    a.close(None).await.unwrap();
    wait_for_connections(&handle, 1).await;

    // Broadcasts keep flowing to the remaining client.
    let update = json!({"type": "flowUpdate", "nodes": [{"id": "x"}], "edges": []});
    send_json(&mut b, update.clone()).await;
    assert_eq!(next_json(&mut b, TIMEOUT).await, Some(update));

    handle.shutdown().await;
}

#[tokio::test]
async fn messages_from_one_client_arrive_in_order() {
    let handle = boot(test_config()).await;
    let mut a = connect(&handle).await;
    let mut b = connect(&handle).await;
    wait_for_connections(&handle, 2).await;

    for seq in 0..20 {
        send_json(&mut a, json!({"type": "flowUpdate", "seq": seq})).await;
    }

    for seq in 0..20 {
        let msg = next_json(&mut b, TIMEOUT).await.unwrap();
        assert_eq!(msg["seq"], seq);
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn health_reports_connections_and_flows() {
    let handle = boot(test_config()).await;
    let _a = connect(&handle).await;
    wait_for_connections(&handle, 1).await;

    reqwest::Client::new()
        .post(http_url(&handle, "/api/flow"))
        .json(&json!({"nodes": [], "edges": []}))
        .send()
        .await
        .unwrap();

    let body: Value = reqwest::get(http_url(&handle, "/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["connections"], 1);
    assert_eq!(body["flows"], 1);
    assert_eq!(body["current_flow"], true);
    assert!(body["last_saved_at"].is_string());

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let handle = boot(test_config()).await;
    let mut ws = connect(&handle).await;
    wait_for_connections(&handle, 1).await;

    let hub = Arc::clone(handle.hub());
    handle.shutdown().await;

    assert_eq!(closed_by_server(&mut ws).await, Some(1001));
    assert_eq!(hub.count(), 0);
}

#[tokio::test]
async fn silent_client_is_closed_on_heartbeat_timeout() {
    let handle = boot(ServerConfig {
        heartbeat_interval_secs: 1,
        heartbeat_timeout_secs: 1,
        ..test_config()
    })
    .await;
    let mut silent = connect(&handle).await;
    wait_for_connections(&handle, 1).await;

    // Not polling the socket means tungstenite never answers the server's pings.
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(closed_by_server(&mut silent).await, Some(1008));
    wait_for_connections(&handle, 0).await;

    handle.shutdown().await;
}
