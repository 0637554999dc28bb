//! Messaging client integration tests
//!
//! Drives UplinkClient against an in-process tungstenite accept loop so the
//! full path is exercised: handshake, queue flush, inbound dispatch,
//! reconnection, and teardown.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message, WebSocketStream};

use uplink::{ClientConfig, PurchaseReport, ServerMessage, UplinkClient};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

const RESPONSE_FRAME: &str =
    r#"{"type":"response","timestamp":1700000000,"data":{"state":"levelup","message":"Nice clicking"}}"#;

fn test_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        url: format!("ws://{addr}/ws"),
        // Short backoff so reconnect scenarios finish quickly
        reconnect_base: Duration::from_millis(50),
        reconnect_cap: Duration::from_millis(400),
    }
}

async fn bind() -> (TcpListener, SocketAddr) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(RECV_TIMEOUT, listener.accept())
        .await
        .expect("timed out waiting for connection")
        .expect("accept");
    accept_async(stream).await.expect("websocket handshake")
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
    loop {
        match timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
        {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text).expect("client frames are JSON")
            }
            Some(Ok(_)) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

// =============================================================================
// Outbound queue
// =============================================================================

#[tokio::test]
async fn queued_sends_flush_in_fifo_order() {
    let (listener, addr) = bind().await;
    let client = UplinkClient::new(test_config(addr)).expect("client config");

    // No server-side handshake yet, so both messages queue client-side
    client.send_user_action(1, 10);
    client.send_user_action(2, 20);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut ws = accept_ws(&listener).await;

    let first = next_text(&mut ws).await;
    let second = next_text(&mut ws).await;
    assert_eq!(first["stage"], 1);
    assert_eq!(first["clicks"], 10);
    assert_eq!(second["stage"], 2);
    assert_eq!(second["clicks"], 20);
}

#[tokio::test]
async fn open_connection_transmits_immediately() {
    let (listener, addr) = bind().await;
    let client = UplinkClient::new(test_config(addr)).expect("client config");

    // First subscriber triggers the connection attempt
    let _subscription = client.subscribe(|_| {});
    let mut ws = accept_ws(&listener).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.send_user_action(10, 5);

    let frame = next_text(&mut ws).await;
    assert_eq!(frame["type"], "user_action");
    assert_eq!(frame["stage"], 10);
    assert_eq!(frame["clicks"], 5);
}

#[tokio::test]
async fn purchase_event_carries_translated_item_id() {
    let (listener, addr) = bind().await;
    let client = UplinkClient::new(test_config(addr)).expect("client config");

    client.send_purchase(
        PurchaseReport::new("factory")
            .with_item_name("Factory")
            .with_price_paid(350.0)
            .with_stage(2),
    );

    let mut ws = accept_ws(&listener).await;
    let frame = next_text(&mut ws).await;
    assert_eq!(frame["type"], "purchase");
    assert_eq!(frame["item_id"], 1);
    assert_eq!(frame["original_item_id"], "factory");
    assert_eq!(frame["item_name"], "Factory");
    assert!(frame["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn reconnect_preserves_queued_messages() {
    let (listener, addr) = bind().await;
    let client = UplinkClient::new(test_config(addr)).expect("client config");

    client.connect();
    let ws = accept_ws(&listener).await;

    // Server drops the connection; the client schedules a reconnect
    drop(ws);
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.send_user_action(7, 7);

    let mut ws = accept_ws(&listener).await;
    let frame = next_text(&mut ws).await;
    assert_eq!(frame["stage"], 7);
    assert_eq!(frame["clicks"], 7);
}

// =============================================================================
// Inbound dispatch
// =============================================================================

#[tokio::test]
async fn malformed_frame_is_dropped_without_disconnect() {
    let (listener, addr) = bind().await;
    let client = UplinkClient::new(test_config(addr)).expect("client config");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = client.subscribe(move |message| {
        let seen = match message {
            ServerMessage::Response(frame) => {
                format!("response:{}", frame.message().unwrap_or(""))
            }
            ServerMessage::Unrecognized(_) => "unrecognized".to_string(),
        };
        let _ = tx.send(seen);
    });

    let mut ws = accept_ws(&listener).await;
    ws.send(Message::Text("{this is not json".into()))
        .await
        .expect("send malformed");
    ws.send(Message::Text(RESPONSE_FRAME.into()))
        .await
        .expect("send response");

    // Only the well-formed frame reaches the listener
    let seen = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(seen, "response:Nice clicking");

    // The connection survived: a send still goes through
    client.send_user_action(3, 1);
    let frame = next_text(&mut ws).await;
    assert_eq!(frame["stage"], 3);
}

#[tokio::test]
async fn panicking_listener_does_not_block_delivery() {
    let (listener, addr) = bind().await;
    let client = UplinkClient::new(test_config(addr)).expect("client config");

    // Registered first, so it runs first and panics on every frame
    let _faulty = client.subscribe(|_| panic!("listener bug"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = client.subscribe(move |message| {
        if let ServerMessage::Response(frame) = message {
            let _ = tx.send(frame.state().map(str::to_string));
        }
    });

    let mut ws = accept_ws(&listener).await;
    ws.send(Message::Text(RESPONSE_FRAME.into()))
        .await
        .expect("send response");

    let state = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(state.as_deref(), Some("levelup"));
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (listener, addr) = bind().await;
    let client = UplinkClient::new(test_config(addr)).expect("client config");

    let (tx_first, mut rx_first) = mpsc::unbounded_channel();
    let mut first = client.subscribe(move |_| {
        let _ = tx_first.send(());
    });
    let (tx_second, mut rx_second) = mpsc::unbounded_channel();
    let _second = client.subscribe(move |_| {
        let _ = tx_second.send(());
    });

    let mut ws = accept_ws(&listener).await;

    first.unsubscribe();
    first.unsubscribe(); // idempotent no-op
    tokio::time::sleep(Duration::from_millis(50)).await;

    ws.send(Message::Text(RESPONSE_FRAME.into()))
        .await
        .expect("send response");

    timeout(RECV_TIMEOUT, rx_second.recv())
        .await
        .expect("second listener still delivered")
        .unwrap();
    assert!(rx_first.try_recv().is_err(), "removed listener was invoked");
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn disconnect_then_connect_yields_one_new_connection() {
    let (listener, addr) = bind().await;
    let client = UplinkClient::new(test_config(addr)).expect("client config");

    client.connect();
    let mut ws = accept_ws(&listener).await;

    client.disconnect();
    match timeout(RECV_TIMEOUT, ws.next()).await.expect("close event") {
        Some(Ok(Message::Close(_))) | None => {}
        other => panic!("expected close, got {other:?}"),
    }

    client.connect();
    let _ws = accept_ws(&listener).await;

    // No duplicate handle shows up afterwards
    let extra = timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(extra.is_err(), "unexpected second connection");
}

#[tokio::test]
async fn failed_attempts_escalate_one_step_at_a_time() {
    let (listener, addr) = bind().await;
    let config = ClientConfig {
        url: format!("ws://{addr}/ws"),
        reconnect_base: Duration::from_millis(100),
        reconnect_cap: Duration::from_millis(800),
    };
    let client = UplinkClient::new(config).expect("client config");

    client.connect();

    // Accept raw TCP and drop it so every handshake fails at a visible
    // instant; the gaps between attempts are the scheduled delays
    let mut attempts = Vec::new();
    for _ in 0..3 {
        let (stream, _) = timeout(RECV_TIMEOUT, listener.accept())
            .await
            .expect("timed out waiting for attempt")
            .expect("accept");
        drop(stream);
        attempts.push(tokio::time::Instant::now());
    }

    let first_gap = attempts[1] - attempts[0];
    let second_gap = attempts[2] - attempts[1];
    assert!(
        first_gap >= Duration::from_millis(90) && first_gap <= Duration::from_millis(180),
        "first retry should wait ~base, waited {first_gap:?}"
    );
    assert!(
        second_gap >= Duration::from_millis(180) && second_gap <= Duration::from_millis(360),
        "second retry should wait ~2x base, waited {second_gap:?}"
    );
}

#[tokio::test]
async fn attempt_counter_resets_after_successful_open() {
    let (listener, addr) = bind().await;
    drop(listener);
    let client = UplinkClient::new(test_config(addr)).expect("client config");

    // Nothing is listening: three failed attempts escalate the backoff
    // through the 50/100/200 ms timers
    client.connect();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let listener = TcpListener::bind(addr).await.expect("rebind");
    let ws = accept_ws(&listener).await;

    // A failure after a successful open restarts from the base delay; a
    // stale counter would wait 400 ms here and miss the window
    drop(ws);
    let reconnect = timeout(Duration::from_millis(250), listener.accept()).await;
    assert!(
        reconnect.is_ok(),
        "reconnect after a successful open should use the base delay"
    );
}

#[tokio::test]
async fn rejects_non_websocket_endpoint() {
    let result = UplinkClient::new(ClientConfig::new("http://localhost:8080/ws"));
    assert!(result.is_err(), "http scheme should be rejected up front");
}

#[tokio::test]
async fn disconnect_cancels_pending_reconnect() {
    let (listener, addr) = bind().await;
    let client = UplinkClient::new(test_config(addr)).expect("client config");

    client.connect();
    let ws = accept_ws(&listener).await;

    // Dropping the server side makes the client schedule a reconnect
    drop(ws);
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.disconnect();

    let extra = timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(extra.is_err(), "reconnect should be cancelled by disconnect");
}
