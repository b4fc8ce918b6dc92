//! Integration tests for the hub transports.
//!
//! These tests start the real WebSocket and TCP listeners on ephemeral ports,
//! connect ordinary clients, and check what comes back over the wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;

use signalk_hub_core::HubConfig;
use signalk_hub_server::{pipeline, tcp, ws, Hub, IngestHandle};

const SELF_ID: &str = "urn:mrn:signalk:uuid:test-vessel";
const SELF_CONTEXT: &str = "vessels.urn:mrn:signalk:uuid:test-vessel";

struct TestServer {
    ws_addr: SocketAddr,
    tcp_addr: SocketAddr,
    hub: Arc<Hub>,
    ingest: IngestHandle,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    fn stop(self) {
        self.hub.shutdown();
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Bind a listener on an available port.
async fn bind_available_port() -> (TcpListener, SocketAddr) {
    // Bind to port 0 to get an available port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Start a hub with both transports and the ingestion worker.
async fn start_test_server() -> TestServer {
    let config = HubConfig {
        name: "test-server".to_string(),
        version: "1.7.0".to_string(),
        self_id: SELF_ID.to_string(),
        default_period_ms: 100,
        min_period_ms: 50,
        ..HubConfig::default()
    };
    let hub = Hub::new(config).unwrap();
    let (ingest, worker) = pipeline::spawn(hub.clone(), 64);

    let (ws_listener, ws_addr) = bind_available_port().await;
    let (tcp_listener, tcp_addr) = bind_available_port().await;

    let ws_task = {
        let hub = hub.clone();
        let ingest = ingest.clone();
        tokio::spawn(async move {
            let _ = ws::serve(ws_listener, hub, ingest).await;
        })
    };
    let tcp_task = {
        let hub = hub.clone();
        let ingest = ingest.clone();
        tokio::spawn(async move {
            let _ = tcp::serve(tcp_listener, hub, ingest).await;
        })
    };

    TestServer {
        ws_addr,
        tcp_addr,
        hub,
        ingest,
        handles: vec![worker, ws_task, tcp_task],
    }
}

/// Connect a WebSocket client to the given address.
async fn connect_client(addr: SocketAddr) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
    let url = format!("ws://{}/signalk/v1/stream", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("Failed to connect");
    ws_stream
}

/// Connect a WebSocket client with query parameters.
async fn connect_client_with_params(
    addr: SocketAddr,
    params: &str,
) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
    let url = format!("ws://{}/signalk/v1/stream?{}", addr, params);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("Failed to connect");
    ws_stream
}

/// Wait for a text message with timeout.
async fn recv_text_within(
    ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    wait: Duration,
) -> Result<String, &'static str> {
    match timeout(wait, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Ok(text),
        Ok(Some(Ok(_))) => Err("Unexpected message type"),
        Ok(Some(Err(_))) => Err("WebSocket error"),
        Ok(None) => Err("Connection closed"),
        Err(_) => Err("Timeout"),
    }
}

async fn recv_text(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> Result<String, &'static str> {
    recv_text_within(ws, Duration::from_secs(5)).await
}

async fn recv_json(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> Value {
    let text = recv_text(ws).await.expect("Should receive a message");
    serde_json::from_str(&text).expect("Valid JSON")
}

async fn send_json(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

fn speed_delta(context: &str, speed: f64) -> Value {
    json!({
        "context": context,
        "updates": [{
            "source": {"label": "gps", "type": "NMEA0183", "talker": "GP", "sentence": "RMC"},
            "timestamp": "2024-01-17T10:30:00.000Z",
            "values": [{"path": "navigation.speedOverGround", "value": speed}]
        }]
    })
}

fn first_value(delta: &Value) -> &Value {
    &delta["updates"][0]["values"][0]
}

#[tokio::test]
async fn test_hello_message_on_connect() {
    let server = start_test_server().await;

    let mut ws = connect_client(server.ws_addr).await;

    // First message should be Hello
    let hello = recv_json(&mut ws).await;
    assert_eq!(hello["name"], "test-server");
    assert_eq!(hello["version"], "1.7.0");
    assert_eq!(hello["self"], SELF_CONTEXT);
    assert!(hello["roles"].is_array());
    assert!(hello["timestamp"].is_string());

    ws.close(None).await.ok();
    server.stop();
}

#[tokio::test]
async fn test_default_subscription_is_self() {
    let server = start_test_server().await;

    let mut ws = connect_client(server.ws_addr).await;
    let _ = recv_text(&mut ws).await.expect("Should receive Hello");

    server
        .ingest
        .submit(None, speed_delta("vessels.self", 3.85).to_string())
        .await
        .unwrap();

    let delta = recv_json(&mut ws).await;
    assert_eq!(delta["context"], SELF_CONTEXT);
    assert_eq!(first_value(&delta)["path"], "navigation.speedOverGround");
    assert_eq!(first_value(&delta)["value"], 3.85);
    assert_eq!(delta["updates"][0]["$source"], "gps-0183-GP-RMC");

    ws.close(None).await.ok();
    server.stop();
}

#[tokio::test]
async fn test_self_subscription_ignores_other_vessels() {
    let server = start_test_server().await;

    let mut ws = connect_client(server.ws_addr).await;
    let _ = recv_text(&mut ws).await.expect("Should receive Hello");

    server
        .ingest
        .submit(None, speed_delta("vessels.urn:mrn:imo:mmsi:230099999", 7.0).to_string())
        .await
        .unwrap();

    let result = recv_text_within(&mut ws, Duration::from_millis(500)).await;
    assert_eq!(result, Err("Timeout"));

    ws.close(None).await.ok();
    server.stop();
}

#[tokio::test]
async fn test_subscribe_all_sees_every_vessel() {
    let server = start_test_server().await;

    let mut ws = connect_client_with_params(server.ws_addr, "subscribe=all").await;
    let _ = recv_text(&mut ws).await.expect("Should receive Hello");

    server
        .ingest
        .submit(None, speed_delta("vessels.urn:mrn:imo:mmsi:230099999", 7.0).to_string())
        .await
        .unwrap();

    let delta = recv_json(&mut ws).await;
    assert_eq!(delta["context"], "vessels.urn:mrn:imo:mmsi:230099999");
    assert_eq!(first_value(&delta)["value"], 7.0);

    ws.close(None).await.ok();
    server.stop();
}

#[tokio::test]
async fn test_subscribe_and_publish_over_websocket() {
    let server = start_test_server().await;

    let mut ws = connect_client_with_params(server.ws_addr, "subscribe=none").await;
    let _ = recv_text(&mut ws).await.expect("Should receive Hello");

    send_json(
        &mut ws,
        json!({
            "context": "vessels.self",
            "subscribe": [{"path": "navigation.*", "period": 100}]
        }),
    )
    .await;
    send_json(&mut ws, speed_delta("vessels.self", 4.2)).await;

    let delta = recv_json(&mut ws).await;
    assert_eq!(delta["context"], SELF_CONTEXT);
    assert_eq!(first_value(&delta)["path"], "navigation.speedOverGround");
    assert_eq!(first_value(&delta)["value"], 4.2);

    let subs = server.hub.subscriptions().await;
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].period, Duration::from_millis(100));

    ws.close(None).await.ok();
    server.stop();
}

#[tokio::test]
async fn test_full_format_subscription() {
    let server = start_test_server().await;

    let mut ws = connect_client_with_params(server.ws_addr, "subscribe=none").await;
    let _ = recv_text(&mut ws).await.expect("Should receive Hello");

    send_json(&mut ws, speed_delta("vessels.self", 5.5)).await;
    send_json(
        &mut ws,
        json!({
            "context": "vessels.self",
            "subscribe": [{"path": "navigation.speedOverGround", "period": 100, "format": "full"}]
        }),
    )
    .await;

    let doc = recv_json(&mut ws).await;
    let leaf = &doc["vessels"][SELF_ID]["navigation"]["speedOverGround"];
    assert_eq!(leaf["value"], 5.5);
    assert_eq!(leaf["source"], "gps-0183-GP-RMC");

    // full format repeats the document on every tick
    let again = recv_json(&mut ws).await;
    assert_eq!(again, doc);

    ws.close(None).await.ok();
    server.stop();
}

#[tokio::test]
async fn test_get_reply() {
    let server = start_test_server().await;

    let mut ws = connect_client_with_params(server.ws_addr, "subscribe=none").await;
    let _ = recv_text(&mut ws).await.expect("Should receive Hello");

    send_json(
        &mut ws,
        json!({"vessels": {"self": {"navigation": {"headingTrue": {"value": 1.2}}}}}),
    )
    .await;
    send_json(
        &mut ws,
        json!({"context": "vessels.self", "get": ["navigation.headingTrue"]}),
    )
    .await;

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["vessels"][SELF_ID]["navigation"]["headingTrue"]["value"], 1.2);

    ws.close(None).await.ok();
    server.stop();
}

#[tokio::test]
async fn test_list_reply() {
    let server = start_test_server().await;

    let mut ws = connect_client_with_params(server.ws_addr, "subscribe=none").await;
    let _ = recv_text(&mut ws).await.expect("Should receive Hello");

    send_json(&mut ws, speed_delta("vessels.self", 4.2)).await;
    send_json(&mut ws, json!({"context": "vessels.self", "list": ["navigation.*"]})).await;

    let reply = recv_json(&mut ws).await;
    assert_eq!(
        reply["pathlist"],
        json!([format!("{}.navigation.speedOverGround", SELF_CONTEXT)])
    );

    ws.close(None).await.ok();
    server.stop();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = start_test_server().await;

    let mut ws = connect_client(server.ws_addr).await;
    let _ = recv_text(&mut ws).await.expect("Should receive Hello");

    server
        .ingest
        .submit(None, speed_delta("vessels.self", 1.0).to_string())
        .await
        .unwrap();
    let _ = recv_text(&mut ws).await.expect("Should receive first delta");

    send_json(
        &mut ws,
        json!({"context": "vessels.self", "unsubscribe": [{"path": "*"}]}),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.hub.subscriptions().await.is_empty());

    server
        .ingest
        .submit(None, speed_delta("vessels.self", 2.0).to_string())
        .await
        .unwrap();

    let result = recv_text_within(&mut ws, Duration::from_millis(500)).await;
    assert_eq!(result, Err("Timeout"));

    ws.close(None).await.ok();
    server.stop();
}

#[tokio::test]
async fn test_disconnect_removes_subscriptions() {
    let server = start_test_server().await;

    let mut ws = connect_client(server.ws_addr).await;
    let _ = recv_text(&mut ws).await.expect("Should receive Hello");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.hub.subscriptions().await.len(), 1);

    ws.close(None).await.ok();
    drop(ws);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(server.hub.subscriptions().await.is_empty());
    assert!(server.hub.router().is_empty());
    assert!(server.hub.sessions().is_empty());

    server.stop();
}

#[tokio::test]
async fn test_tcp_subscribe_and_publish() {
    let server = start_test_server().await;

    let stream = TcpStream::connect(server.tcp_addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let subscribe = json!({
        "context": "vessels.self",
        "subscribe": [{"path": "navigation.speedOverGround", "period": 100}]
    });
    write_half
        .write_all(format!("{}\r\n", subscribe).as_bytes())
        .await
        .unwrap();
    write_half
        .write_all(format!("{}\n", speed_delta("vessels.self", 6.1)).as_bytes())
        .await
        .unwrap();

    let mut line = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("Timeout")
        .unwrap();

    assert!(line.ends_with("\r\n"));
    let delta: Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(delta["context"], SELF_CONTEXT);
    assert_eq!(first_value(&delta)["value"], 6.1);

    server.stop();
}
