//! End-to-end integration tests: real WebSocket clients against a running
//! server: framing, routing, the RPC bridge, broadcast, limits and shutdown.

use std::sync::Arc;
use std::time::Duration;

use cmdwire_protocol::{CMD_RPC, decode, encode};
use cmdwire_server::{AcceptPolicy, RateLimitConfig, Server, ServerConfig, ServerError};
use cmdwire_transport::TransportConfig;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CMD_ECHO: u32 = 0x0001;
const CMD_BROADCAST: u32 = 0x0002;

fn test_config() -> ServerConfig {
    ServerConfig {
        transport: TransportConfig {
            port: 0,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Register the echo and broadcast commands plus an `add` RPC method.
fn install_handlers(server: &Server) {
    server
        .register_handler(CMD_ECHO, |session, payload| async move {
            let _ = session.send(CMD_ECHO, &payload).await;
        })
        .unwrap();

    let registry = server.registry();
    server
        .register_handler(CMD_BROADCAST, move |_session, payload| {
            let registry = registry.clone();
            async move {
                let _ = registry.broadcast(CMD_BROADCAST, &payload).await;
            }
        })
        .unwrap();

    server.register_rpc_handler("add", |params: cmdwire_protocol::Params| async move {
        let a = params.get("a").and_then(Value::as_i64).ok_or("missing a")?;
        let b = params.get("b").and_then(Value::as_i64).ok_or("missing b")?;
        cmdwire_protocol::HandlerResult::Ok(json!(a + b))
    });
}

async fn start_server(config: ServerConfig) -> Server {
    let server = Server::new(config);
    install_handlers(&server);
    server.start().await.unwrap();
    server
}

async fn connect(server: &Server) -> Client {
    let addr = server.local_addr().unwrap();
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.expect("Failed to connect");
    ws
}

async fn send_frame(ws: &mut Client, command_id: u32, payload: &[u8]) {
    ws.send(Message::Binary(encode(command_id, payload).unwrap())).await.unwrap();
}

/// Next binary frame, skipping control messages.
async fn recv_frame(ws: &mut Client) -> (u32, Vec<u8>) {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("Timeout waiting for frame")
            .expect("Stream ended")
            .expect("WebSocket error");
        match msg {
            Message::Binary(data) => {
                let (cmd, payload) = decode(&data).unwrap();
                return (cmd, payload.to_vec());
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected binary frame, got {other:?}"),
        }
    }
}

/// Wait for the server's close frame and return (code, reason).
async fn recv_close(ws: &mut Client) -> (u16, String) {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("Timeout waiting for close")
            .expect("Stream ended before close frame")
            .expect("WebSocket error");
        if let Message::Close(Some(frame)) = msg {
            return (u16::from(frame.code), frame.reason.as_str().to_string());
        }
    }
}

async fn rpc(ws: &mut Client, request: Value) -> Value {
    send_frame(ws, CMD_RPC, request.to_string().as_bytes()).await;
    let (cmd, body) = recv_frame(ws).await;
    assert_eq!(cmd, CMD_RPC);
    serde_json::from_slice(&body).unwrap()
}

async fn wait_for_sessions(server: &Server, count: usize) {
    timeout(Duration::from_secs(5), async {
        while server.session_count() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session count not reached");
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn echo_command_round_trip() {
    let server = start_server(test_config()).await;
    let mut ws = connect(&server).await;

    send_frame(&mut ws, CMD_ECHO, b"ping").await;
    assert_eq!(recv_frame(&mut ws).await, (CMD_ECHO, b"ping".to_vec()));

    server.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn empty_payload_is_valid() {
    let server = start_server(test_config()).await;
    let mut ws = connect(&server).await;

    send_frame(&mut ws, CMD_ECHO, b"").await;
    assert_eq!(recv_frame(&mut ws).await, (CMD_ECHO, Vec::new()));

    server.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn unknown_command_is_dropped_without_reply() {
    let server = start_server(test_config()).await;
    let mut ws = connect(&server).await;

    send_frame(&mut ws, 0x0042, b"nobody home").await;
    send_frame(&mut ws, CMD_ECHO, b"after").await;
    // The only reply is the echo; the unknown command produced nothing
    assert_eq!(recv_frame(&mut ws).await, (CMD_ECHO, b"after".to_vec()));
    assert_eq!(server.router().unhandled_count(), 1);

    server.stop(Duration::from_secs(5)).await.unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON-RPC bridge
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rpc_add_over_websocket() {
    let server = start_server(test_config()).await;
    let mut ws = connect(&server).await;

    let resp = rpc(
        &mut ws,
        json!({"jsonrpc": "2.0", "method": "add", "params": {"a": 2, "b": 3}, "id": 1}),
    )
    .await;
    assert_eq!(resp, json!({"jsonrpc": "2.0", "result": 5, "id": 1}));

    server.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn rpc_unknown_method() {
    let server = start_server(test_config()).await;
    let mut ws = connect(&server).await;

    let resp = rpc(&mut ws, json!({"jsonrpc": "2.0", "method": "nope", "id": 2})).await;
    assert_eq!(resp["error"]["code"], -32601);
    assert_eq!(resp["id"], 2);

    server.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn rpc_malformed_json_returns_parse_error() {
    let server = start_server(test_config()).await;
    let mut ws = connect(&server).await;

    send_frame(&mut ws, CMD_RPC, b"{definitely not json").await;
    let (cmd, body) = recv_frame(&mut ws).await;
    assert_eq!(cmd, CMD_RPC);
    let resp: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(resp["error"]["code"], -32700);
    assert!(resp["id"].is_null());

    // The session survives a bad RPC payload
    send_frame(&mut ws, CMD_ECHO, b"still here").await;
    assert_eq!(recv_frame(&mut ws).await, (CMD_ECHO, b"still here".to_vec()));

    server.stop(Duration::from_secs(5)).await.unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Broadcast
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn broadcast_reaches_all_clients() {
    let server = start_server(test_config()).await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect(&server).await);
    }
    wait_for_sessions(&server, 3).await;

    send_frame(&mut clients[0], CMD_BROADCAST, b"hello everyone").await;
    for ws in &mut clients {
        assert_eq!(recv_frame(ws).await, (CMD_BROADCAST, b"hello everyone".to_vec()));
    }

    server.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn broadcast_skips_departed_client() {
    let server = start_server(test_config()).await;
    let mut a = connect(&server).await;
    let mut b = connect(&server).await;
    let c = connect(&server).await;
    wait_for_sessions(&server, 3).await;

    drop(c);
    wait_for_sessions(&server, 2).await;

    let delivered = server.broadcast_command(CMD_BROADCAST, b"two left").await.unwrap();
    assert_eq!(delivered, 2);
    assert_eq!(recv_frame(&mut a).await, (CMD_BROADCAST, b"two left".to_vec()));
    assert_eq!(recv_frame(&mut b).await, (CMD_BROADCAST, b"two left".to_vec()));

    server.stop(Duration::from_secs(5)).await.unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Protocol enforcement
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn short_frame_closes_with_protocol_error() {
    let server = start_server(test_config()).await;
    let mut ws = connect(&server).await;

    ws.send(Message::Binary(vec![0x00, 0x01, 0x02].into())).await.unwrap();
    let (code, reason) = recv_close(&mut ws).await;
    assert_eq!(code, 1002);
    assert_eq!(reason, "Invalid message format");

    wait_for_sessions(&server, 0).await;
    server.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn flood_closes_with_policy_violation() {
    let voluntary = Arc::new(Mutex::new(None));
    let config = ServerConfig {
        rate_limit: RateLimitConfig::new(1.0, 3),
        ..test_config()
    };
    let server = {
        let voluntary = voluntary.clone();
        Server::builder(config)
            .on_disconnect(move |_session, v| *voluntary.lock() = Some(v))
            .build()
    };
    server.start().await.unwrap();
    let mut ws = connect(&server).await;

    // Three frames fit the burst; the fourth trips the limiter
    for _ in 0..4 {
        send_frame(&mut ws, 0x0042, b"").await;
    }
    let (code, reason) = recv_close(&mut ws).await;
    assert_eq!(code, 1008);
    assert_eq!(reason, "Rate limit exceeded");

    wait_for_sessions(&server, 0).await;
    assert_eq!(*voluntary.lock(), Some(false));
    server.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn client_close_is_voluntary() {
    let voluntary = Arc::new(Mutex::new(None));
    let server = {
        let voluntary = voluntary.clone();
        Server::builder(test_config())
            .on_disconnect(move |_session, v| *voluntary.lock() = Some(v))
            .build()
    };
    server.start().await.unwrap();
    let mut ws = connect(&server).await;
    wait_for_sessions(&server, 1).await;

    ws.close(None).await.unwrap();
    wait_for_sessions(&server, 0).await;
    assert_eq!(*voluntary.lock(), Some(true));

    server.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn origin_policy_refuses_upgrade() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let server = Server::builder(test_config())
        .accept_policy(AcceptPolicy::allow_origins(["https://app.example"]))
        .build();
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", "https://evil.example".parse().unwrap());
    assert!(connect_async(request).await.is_err());

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", "https://app.example".parse().unwrap());
    assert!(connect_async(request).await.is_ok());

    server.stop(Duration::from_secs(5)).await.unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn start_twice_returns_already_running() {
    let server = start_server(test_config()).await;
    assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));
    server.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn port_in_use_rolls_back_to_stopped() {
    let first = start_server(test_config()).await;
    let mut config = test_config();
    config.transport.port = first.local_addr().unwrap().port();

    let second = Server::new(config);
    assert!(second.start().await.is_err());
    assert!(!second.is_running());

    // A failed start can be retried once the port is free
    first.stop(Duration::from_secs(5)).await.unwrap();
    second.start().await.unwrap();
    second.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn stop_sends_going_away_to_clients() {
    let server = start_server(test_config()).await;
    let mut a = connect(&server).await;
    let mut b = connect(&server).await;
    wait_for_sessions(&server, 2).await;

    server.stop(Duration::from_secs(5)).await.unwrap();
    for ws in [&mut a, &mut b] {
        let (code, reason) = recv_close(ws).await;
        assert_eq!(code, u16::from(CloseCode::Away));
        assert_eq!(reason, "Server shutting down");
    }
    wait_for_sessions(&server, 0).await;
    assert!(!server.is_running());
}

#[tokio::test]
async fn health_endpoint_reports_connections() {
    let server = start_server(test_config()).await;
    let _ws = connect(&server).await;
    wait_for_sessions(&server, 1).await;

    let url = format!("http://{}/health", server.local_addr().unwrap());
    let resp = reqwest::get(&url).await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);

    server.stop(Duration::from_secs(5)).await.unwrap();
}
