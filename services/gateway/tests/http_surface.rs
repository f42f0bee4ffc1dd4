//! End-to-end tests against the gateway's real HTTP/WebSocket surface.
//!
//! These exercise only paths that don't require reaching a live exchange:
//! malformed/invalid subscribe requests and the health surface fail or
//! succeed before any upstream connection is ever attempted.

use candle_protocol::{Exchange, SubscribeFrame};
use futures_util::{SinkExt, StreamExt};
use gateway_core::config::GatewayConfig;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;

async fn spawn_gateway(mut config: GatewayConfig, ws_port: u16, health_port: u16) {
    config.ws_host = "127.0.0.1".to_owned();
    config.ws_port = ws_port;
    config.health_check_port = health_port;
    let state = gateway_core::build(config);
    tokio::spawn(gateway_core::lifecycle::run(state));

    for _ in 0..50 {
        if tokio::net::TcpStream::connect(("127.0.0.1", ws_port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("gateway never came up on port {ws_port}");
}

#[tokio::test]
async fn health_and_ready_report_healthy_with_no_sessions() {
    spawn_gateway(GatewayConfig::default(), 18765, 18766).await;

    let client = reqwest::Client::new();
    let health = client.get("http://127.0.0.1:18766/health").send().await.unwrap();
    assert!(health.status().is_success());

    let ready = client.get("http://127.0.0.1:18766/ready").send().await.unwrap();
    assert!(ready.status().is_success());
    let body: serde_json::Value = ready.json().await.unwrap();
    assert_eq!(body["status"], "ready");

    let metrics = client.get("http://127.0.0.1:18766/metrics").send().await.unwrap();
    assert!(metrics.status().is_success());
    let text = metrics.text().await.unwrap();
    assert!(text.contains("quotes_processed_total"));
}

#[tokio::test]
async fn invalid_contract_type_is_rejected_over_websocket() {
    spawn_gateway(GatewayConfig::default(), 18767, 18768).await;

    let (mut ws, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:18767/").await.unwrap();
    let frame = SubscribeFrame {
        exchange: Exchange::Binance,
        contract_type: "not-a-real-contract-type".to_owned(),
        symbols: vec!["BTCUSDT".to_owned()],
        limit: 0,
    };
    ws.send(Message::Text(serde_json::to_string(&frame).unwrap().into())).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = reply else { panic!("expected a text frame") };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["code"], "INVALID_SYMBOL");

    // No symbol was accepted, so the gateway closes the connection.
    let next = ws.next().await;
    assert!(matches!(next, Some(Ok(Message::Close(_))) | None));
}

#[tokio::test]
async fn pool_busy_rejects_when_connection_limit_is_exhausted() {
    let mut config = GatewayConfig::default();
    config.max_conn_per_exchange = Some(0);
    spawn_gateway(config, 18769, 18770).await;

    let (mut ws, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:18769/").await.unwrap();
    let frame = SubscribeFrame {
        exchange: Exchange::Binance,
        contract_type: "spot".to_owned(),
        symbols: vec!["BTCUSDT".to_owned()],
        limit: 0,
    };
    ws.send(Message::Text(serde_json::to_string(&frame).unwrap().into())).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = reply else { panic!("expected a text frame") };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["code"], "CONNECTION_POOL_BUSY");
}
