//! Drives `UpstreamSession` against a scripted mock upstream instead of a
//! real exchange, covering the state-machine paths that the HTTP surface
//! tests in `services/gateway` can't reach without a network connection.

use candle_protocol::Exchange;
use chrono::Utc;
use circuit_breaker::BreakerConfig;
use dedup::DedupConfig;
use gateway_core::metrics::GatewayMetrics;
use gateway_core::session::{SessionTimeouts, UpstreamSession};
use queue::QueueConfig;
use std::sync::Arc;
use std::time::Duration;
use test_support::test_connector::BackfillOutcome;
use test_support::{MockUpstreamServer, TestConnector};
use tokio::sync::watch;

fn short_timeouts() -> SessionTimeouts {
    SessionTimeouts {
        inactivity_timeout: Duration::from_millis(150),
        reconnect_delay: Duration::from_millis(20),
        ws_ping_interval: Duration::from_secs(30),
        ws_ping_timeout: Duration::from_millis(200),
    }
}

fn test_candle(symbol: &str, is_closed: bool) -> candle_protocol::Candle {
    candle_protocol::Candle::new(Exchange::Binance, "test", symbol, Utc::now(), 1.0, 2.0, 0.5, 1.5, 10.0, 3, is_closed).unwrap()
}

#[tokio::test]
async fn streams_a_quote_from_upstream_to_the_drain_queue() {
    let server = MockUpstreamServer::start().await;
    let connector = Arc::new(TestConnector::new(Exchange::Binance, server.url()));
    let metrics = Arc::new(GatewayMetrics::new());
    let rest_pool = Arc::new(rest_pool::RestPool::new(rest_pool::RestPoolConfig::default()));

    let (session, _events) = UpstreamSession::new(
        Exchange::Binance,
        "test",
        0,
        connector.clone(),
        rest_pool,
        metrics,
        QueueConfig::default(),
        DedupConfig::default(),
        BreakerConfig::default(),
        short_timeouts(),
        10,
    );
    session.add_symbol("BTCUSDT".to_owned());

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&session).run(shutdown_rx));

    let upstream = server.accept().await;
    let subscribe_payload = upstream.recv_text().await.unwrap();
    assert!(subscribe_payload.starts_with("SUBSCRIBE"));

    let candle = test_candle("BTCUSDT", true);
    upstream.send_text(TestConnector::frame_for(&candle));

    let received = session.queue.drain_one().await.expect("queue should yield the forwarded candle");
    assert_eq!(received.symbol, "BTCUSDT");
    assert!(received.is_closed);
    assert_eq!(session.total_quotes(), 1);
}

#[tokio::test]
async fn duplicate_closed_candles_are_filtered() {
    let server = MockUpstreamServer::start().await;
    let connector = Arc::new(TestConnector::new(Exchange::Binance, server.url()));
    let metrics = Arc::new(GatewayMetrics::new());
    let rest_pool = Arc::new(rest_pool::RestPool::new(rest_pool::RestPoolConfig::default()));

    let (session, _events) = UpstreamSession::new(
        Exchange::Binance,
        "test",
        0,
        connector,
        rest_pool,
        metrics,
        QueueConfig::default(),
        DedupConfig::default(),
        BreakerConfig::default(),
        short_timeouts(),
        10,
    );
    session.add_symbol("ETHUSDT".to_owned());

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&session).run(shutdown_rx));

    let upstream = server.accept().await;
    upstream.recv_text().await.unwrap();

    let candle = test_candle("ETHUSDT", true);
    let frame = TestConnector::frame_for(&candle);
    upstream.send_text(frame.clone());
    upstream.send_text(frame);

    let first = session.queue.drain_one().await.expect("first candle should pass through");
    assert_eq!(first.symbol, "ETHUSDT");

    // The duplicate never reaches the queue. A fresh, distinct candle
    // proves the session is still alive and processing, without the test
    // needing to race a `None`/timeout on an empty queue.
    let followup = test_candle("ETHUSDT", false);
    upstream.send_text(TestConnector::frame_for(&followup));
    let second = session.queue.drain_one().await.expect("open candle should still pass through");
    assert!(!second.is_closed);
}

#[tokio::test]
async fn inactivity_triggers_backfill_and_resumes_streaming() {
    let server = MockUpstreamServer::start().await;
    let connector = Arc::new(TestConnector::new(Exchange::Binance, server.url()));
    let backfill_candle = test_candle("BTCUSDT", true);
    connector.set_backfill_result(BackfillOutcome::Candle(backfill_candle.clone()));

    let metrics = Arc::new(GatewayMetrics::new());
    let rest_pool = Arc::new(rest_pool::RestPool::new(rest_pool::RestPoolConfig::default()));

    let (session, _events) = UpstreamSession::new(
        Exchange::Binance,
        "test",
        0,
        connector,
        rest_pool,
        metrics,
        QueueConfig::default(),
        DedupConfig::default(),
        BreakerConfig::default(),
        short_timeouts(),
        10,
    );
    session.add_symbol("BTCUSDT".to_owned());

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&session).run(shutdown_rx));

    let upstream = server.accept().await;
    upstream.recv_text().await.unwrap();

    // No frames are sent; the inactivity timeout (150ms) should fire and
    // pull a candle in via REST backfill instead.
    let candle = tokio::time::timeout(Duration::from_secs(2), session.queue.drain_one())
        .await
        .expect("backfill candle should arrive before the test timeout")
        .expect("queue should yield the backfilled candle");
    assert_eq!(candle.symbol, "BTCUSDT");

    // The session keeps streaming afterwards: a live frame still gets
    // through.
    upstream.send_text(TestConnector::frame_for(&test_candle("BTCUSDT", false)));
    let live = session.queue.drain_one().await.expect("session should resume streaming after backfill");
    assert!(!live.is_closed);
}

#[tokio::test]
async fn backfill_failure_is_reported_but_does_not_kill_the_session() {
    let server = MockUpstreamServer::start().await;
    let connector = Arc::new(TestConnector::new(Exchange::Binance, server.url()));
    connector.set_backfill_result(BackfillOutcome::Error(rest_pool::RestError::Status(503)));

    let metrics = Arc::new(GatewayMetrics::new());
    let rest_pool = Arc::new(rest_pool::RestPool::new(rest_pool::RestPoolConfig::default()));

    let (session, mut events) = UpstreamSession::new(
        Exchange::Binance,
        "test",
        0,
        connector,
        rest_pool,
        metrics,
        QueueConfig::default(),
        DedupConfig::default(),
        BreakerConfig::default(),
        short_timeouts(),
        10,
    );
    session.add_symbol("BTCUSDT".to_owned());

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&session).run(shutdown_rx));

    let upstream = server.accept().await;
    upstream.recv_text().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.expect("an error event should be emitted").unwrap();
    let gateway_core::session::SessionEvent::Error { symbols, frame } = event;
    assert_eq!(symbols, vec!["BTCUSDT".to_owned()]);
    assert_eq!(frame.code, candle_protocol::error_codes::REST_BACKFILL_FAILED);

    // The session survives the failed backfill and keeps streaming.
    upstream.send_text(TestConnector::frame_for(&test_candle("BTCUSDT", true)));
    let live = session.queue.drain_one().await.expect("session should still be streaming after a failed backfill");
    assert_eq!(live.symbol, "BTCUSDT");
}

#[tokio::test]
async fn reconnects_after_the_upstream_closes_the_connection() {
    let server = MockUpstreamServer::start().await;
    let connector = Arc::new(TestConnector::new(Exchange::Binance, server.url()));
    let metrics = Arc::new(GatewayMetrics::new());
    let rest_pool = Arc::new(rest_pool::RestPool::new(rest_pool::RestPoolConfig::default()));

    let (session, _events) = UpstreamSession::new(
        Exchange::Binance,
        "test",
        0,
        connector,
        rest_pool,
        metrics,
        QueueConfig::default(),
        DedupConfig::default(),
        BreakerConfig::default(),
        short_timeouts(),
        10,
    );
    session.add_symbol("BTCUSDT".to_owned());

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&session).run(shutdown_rx));

    let first = server.accept().await;
    first.recv_text().await.unwrap();
    first.close();

    // The session should reconnect on its own and complete a second
    // handshake against the same mock server.
    let second = tokio::time::timeout(Duration::from_secs(2), server.accept()).await.expect("session should reconnect");
    let payload = second.recv_text().await.unwrap();
    assert!(payload.starts_with("SUBSCRIBE"));
}
