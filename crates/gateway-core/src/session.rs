//! Upstream session state machine (spec §4.5).
//!
//! One `UpstreamSession` owns one WebSocket to one exchange, hosting a
//! bounded set of symbols. State transitions follow:
//!
//! ```text
//! INIT → CONNECTING → SUBSCRIBING → STREAMING ⇄ IDLE → BACKFILL → STREAMING
//!                                        ↓                   ↓
//!                                    FAILED ← ─ ─ ─ ─ ─ ─ ─ ─┘
//!                                        ↓
//!                                    CLOSED
//! ```
//!
//! The session owns its WebSocket, circuit breaker, REST client handle,
//! queue, and deduplicator (spec §3.2). It does not own the fan-out table
//! — candles are handed to the queue, and a separate drain task (owned by
//! the session manager) pulls from it and forwards to subscribers.

use crate::metrics::GatewayMetrics;
use crate::normaliser;
use candle_protocol::{error_codes, Candle, Exchange, ErrorFrame};
use circuit_breaker::{BreakerConfig, CircuitBreaker};
use connectors::ExchangeConnector;
use dedup::{DedupConfig, Deduplicator, Outcome};
use futures_util::{SinkExt, StreamExt};
use queue::{DualPipelineQueue, QueueConfig};
use rest_pool::RestPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connecting,
    Subscribing,
    Streaming,
    Idle,
    Backfill,
    Failed,
    Closed,
}

/// Event emitted to the session manager for fan-out to affected
/// subscribers. Candles flow through the queue instead; this channel
/// only ever carries errors, which are not subject to backpressure
/// policy in the same way.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Error { symbols: Vec<String>, frame: ErrorFrame },
}

pub struct SessionTimeouts {
    pub inactivity_timeout: Duration,
    pub reconnect_delay: Duration,
    pub ws_ping_interval: Duration,
    pub ws_ping_timeout: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        SessionTimeouts {
            inactivity_timeout: Duration::from_secs_f64(3.0),
            reconnect_delay: Duration::from_secs_f64(1.0),
            ws_ping_interval: Duration::from_secs(20),
            ws_ping_timeout: Duration::from_secs(20),
        }
    }
}

pub struct UpstreamSession {
    pub exchange: Exchange,
    pub contract_type: String,
    pub connection_index: usize,
    connector: Arc<dyn ExchangeConnector>,
    rest_pool: Arc<RestPool>,
    pub queue: Arc<DualPipelineQueue>,
    dedup: Deduplicator,
    breaker: CircuitBreaker,
    metrics: Arc<GatewayMetrics>,
    timeouts: SessionTimeouts,
    max_symbols: usize,
    symbols: Mutex<Vec<String>>,
    state: Mutex<SessionState>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    total_quotes: AtomicU64,
    total_errors: AtomicU64,
    last_message_at: Mutex<Instant>,
    restart_requested: std::sync::atomic::AtomicBool,
}

impl UpstreamSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Exchange,
        contract_type: impl Into<String>,
        connection_index: usize,
        connector: Arc<dyn ExchangeConnector>,
        rest_pool: Arc<RestPool>,
        metrics: Arc<GatewayMetrics>,
        queue_cfg: QueueConfig,
        dedup_cfg: DedupConfig,
        breaker_cfg: BreakerConfig,
        timeouts: SessionTimeouts,
        max_symbols: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(UpstreamSession {
            exchange,
            contract_type: contract_type.into(),
            connection_index,
            connector,
            rest_pool,
            queue: Arc::new(DualPipelineQueue::new(queue_cfg)),
            dedup: Deduplicator::new(dedup_cfg),
            breaker: CircuitBreaker::new(breaker_cfg),
            metrics,
            timeouts,
            max_symbols,
            symbols: Mutex::new(Vec::new()),
            state: Mutex::new(SessionState::Init),
            events_tx,
            total_quotes: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            last_message_at: Mutex::new(Instant::now()),
            restart_requested: std::sync::atomic::AtomicBool::new(false),
        });
        (session, events_rx)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state mutex poisoned")
    }

    fn set_state(&self, s: SessionState) {
        *self.state.lock().expect("session state mutex poisoned") = s;
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.lock().expect("session symbols mutex poisoned").len()
    }

    pub fn has_capacity(&self) -> bool {
        self.symbol_count() < self.max_symbols
    }

    pub fn symbols(&self) -> Vec<String> {
        self.symbols.lock().expect("session symbols mutex poisoned").clone()
    }

    /// Add a symbol to the session's preserved set. Returns `true` if the
    /// symbol was newly added.
    pub fn add_symbol(&self, symbol: String) -> bool {
        let mut symbols = self.symbols.lock().expect("session symbols mutex poisoned");
        if symbols.iter().any(|s| s == &symbol) {
            false
        } else {
            symbols.push(symbol);
            true
        }
    }

    pub fn remove_symbol(&self, symbol: &str) -> bool {
        let mut symbols = self.symbols.lock().expect("session symbols mutex poisoned");
        let before = symbols.len();
        symbols.retain(|s| s != symbol);
        symbols.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.symbol_count() == 0
    }

    pub fn total_quotes(&self) -> u64 {
        self.total_quotes.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub fn last_message_age(&self) -> Duration {
        self.last_message_at.lock().expect("last_message_at mutex poisoned").elapsed()
    }

    pub fn breaker_snapshot(&self) -> circuit_breaker::Snapshot {
        self.breaker.snapshot()
    }

    pub fn supports_incremental_subscribe(&self) -> bool {
        self.connector.supports_incremental_subscribe()
    }

    /// Force the session back through CONNECTING/SUBSCRIBING on its next
    /// select iteration, to pick up a newly attached symbol on a
    /// connector that cannot subscribe incrementally while STREAMING.
    pub fn request_restart(&self) {
        self.restart_requested.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn take_restart_request(&self) -> bool {
        self.restart_requested.swap(false, std::sync::atomic::Ordering::SeqCst)
    }

    /// Drive the session's state machine until it reaches CLOSED, either
    /// because the symbol set went empty or `shutdown` was signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                self.set_state(SessionState::Closed);
                return;
            }
            if self.is_empty() && self.state() != SessionState::Init {
                self.set_state(SessionState::Closed);
                return;
            }

            match self.state() {
                SessionState::Init => self.set_state(SessionState::Connecting),
                SessionState::Closed => return,
                SessionState::Connecting => {
                    let allowed = self.breaker.allow();
                    self.sync_breaker_gauge();
                    if !allowed {
                        tokio::select! {
                            _ = tokio::time::sleep(self.timeouts.reconnect_delay) => {},
                            _ = shutdown.changed() => continue,
                        }
                        continue;
                    }
                    match self.connect().await {
                        Ok(ws) => {
                            self.metrics.reconnections_total.with_label_values(&[self.exchange.as_str()]).inc();
                            self.metrics.active_connections.with_label_values(&[self.exchange.as_str(), &self.contract_type]).inc();
                            self.set_state(SessionState::Subscribing);
                            if let Some(err) = self.subscribe_and_stream(ws, &mut shutdown).await {
                                self.record_error_event(err);
                            }
                            self.metrics.active_connections.with_label_values(&[self.exchange.as_str(), &self.contract_type]).dec();
                        }
                        Err(e) => {
                            self.breaker.record_failure();
                            self.sync_breaker_gauge();
                            self.metrics.connection_errors_total.with_label_values(&[self.exchange.as_str(), "connect"]).inc();
                            tracing::warn!(exchange = %self.exchange, error = %e, "upstream connect failed");
                            self.record_error_event((vec![], error_codes::WS_CONNECT_FAILED, e.to_string()));
                            self.set_state(SessionState::Failed);
                        }
                    }
                }
                SessionState::Failed => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.timeouts.reconnect_delay) => {},
                        _ = shutdown.changed() => continue,
                    }
                    self.set_state(SessionState::Connecting);
                }
                // Subscribing/Streaming/Idle/Backfill are all driven inside
                // `subscribe_and_stream`; reaching them here means that
                // call returned without transitioning, which only happens
                // on shutdown.
                SessionState::Subscribing | SessionState::Streaming | SessionState::Idle | SessionState::Backfill => {
                    self.set_state(SessionState::Connecting);
                }
            }
        }
    }

    async fn connect(&self) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
        let symbols = self.symbols();
        let req = self
            .connector
            .subscribe_request(&self.contract_type, &symbols)
            .map_err(|e| tokio_tungstenite::tungstenite::Error::Url(tokio_tungstenite::tungstenite::error::UrlError::UnableToConnect(e.to_string())))?;
        let (mut ws, _resp) = tokio_tungstenite::connect_async(&req.url).await?;
        for payload in req.payloads {
            ws.send(Message::Text(payload.into())).await?;
        }
        Ok(ws)
    }

    /// Runs SUBSCRIBING → STREAMING ⇄ IDLE → BACKFILL until the
    /// connection drops, fails, or shutdown fires. Returns `Some(error)`
    /// when the session should be reported as FAILED, `None` on a clean
    /// exit (shutdown, or symbol set drained).
    async fn subscribe_and_stream(
        self: &Arc<Self>,
        mut ws: WsStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<(Vec<String>, &'static str, String)> {
        // SUBSCRIBING: wait for the first frame as an implicit ack.
        let first = tokio::select! {
            msg = tokio::time::timeout(self.timeouts.ws_ping_timeout, ws.next()) => msg,
            _ = shutdown.changed() => return None,
        };
        let first = match first {
            Ok(Some(Ok(msg))) => msg,
            _ => {
                self.breaker.record_failure();
                self.sync_breaker_gauge();
                return Some((self.symbols(), error_codes::WS_SUBSCRIBE_REJECTED, "no ack within ws_ping_timeout".to_owned()));
            }
        };
        self.breaker.record_success();
        self.sync_breaker_gauge();
        self.set_state(SessionState::Streaming);
        self.touch();
        self.handle_message(first).await;

        let mut ping_interval = tokio::time::interval(self.timeouts.ws_ping_interval);
        ping_interval.tick().await; // first tick fires immediately

        loop {
            if *shutdown.borrow() {
                let _ = ws.close(None).await;
                return None;
            }
            if self.is_empty() {
                let _ = ws.close(None).await;
                return None;
            }
            if self.take_restart_request() {
                let _ = ws.close(None).await;
                self.set_state(SessionState::Connecting);
                return None;
            }

            let inactivity_deadline = tokio::time::sleep(self.timeouts.inactivity_timeout);
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    let _ = ws.close(None).await;
                    return None;
                }
                _ = ping_interval.tick() => {
                    if ws.send(Message::Ping(Vec::new().into())).await.is_err() {
                        self.breaker.record_failure();
                        self.sync_breaker_gauge();
                        return Some((self.symbols(), error_codes::WS_CONNECT_FAILED, "ping send failed".to_owned()));
                    }
                }
                msg = ws.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            self.touch();
                            self.handle_message(msg).await;
                        }
                        Some(Err(e)) => {
                            self.breaker.record_failure();
                            self.sync_breaker_gauge();
                            return Some((self.symbols(), error_codes::WS_CONNECT_FAILED, e.to_string()));
                        }
                        None => {
                            self.breaker.record_failure();
                            self.sync_breaker_gauge();
                            return Some((self.symbols(), error_codes::WS_CONNECT_FAILED, "upstream closed the connection".to_owned()));
                        }
                    }
                }
                () = inactivity_deadline => {
                    self.set_state(SessionState::Idle);
                    // Backfill failures are reported per-symbol via the
                    // error event channel; streaming resumes regardless so
                    // a single symbol's REST failure doesn't stall the rest.
                    self.run_backfill().await;
                    self.set_state(SessionState::Streaming);
                }
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, msg: Message) {
        let text = match msg {
            Message::Text(t) => t,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => return,
            Message::Close(_) => return,
        };
        let candles = normaliser::normalise_frame(self.connector.as_ref(), &self.contract_type, text.as_str(), &self.metrics);
        for candle in candles {
            self.offer_candle(candle).await;
        }
    }

    async fn offer_candle(self: &Arc<Self>, candle: Candle) {
        normaliser::record_processed(&self.metrics, self.exchange, &self.contract_type, &candle);
        self.total_quotes.fetch_add(1, Ordering::Relaxed);

        if candle.is_closed {
            let key = candle.key();
            if self.dedup.check_and_insert(key, candle.open_time_ms()) == Outcome::Duplicate {
                self.metrics.duplicates_filtered_total.with_label_values(&[self.exchange.as_str()]).inc();
                return;
            }
        }

        if !self.queue.offer(candle).await {
            self.metrics.queue_blocking_events_total.with_label_values(&[self.exchange.as_str()]).inc();
        }
    }

    async fn run_backfill(self: &Arc<Self>) -> bool {
        self.set_state(SessionState::Backfill);
        let symbols = self.symbols();

        // Backfills run concurrently across symbols so one idle session
        // doesn't spend `symbols * REST_TIMEOUT` recovering; the REST pool's
        // own per-host connection cap bounds how much actually runs at once.
        let results = futures_util::future::join_all(symbols.into_iter().map(|symbol| async move {
            let outcome = self.connector.rest_backfill(&self.rest_pool, &self.contract_type, &symbol).await;
            (symbol, outcome)
        }))
        .await;

        let mut all_ok = true;
        for (symbol, outcome) in results {
            match outcome {
                Ok(candle) => {
                    self.metrics.rest_backfills_total.with_label_values(&[self.exchange.as_str(), "success"]).inc();
                    self.offer_candle(candle).await;
                }
                Err(e) => {
                    all_ok = false;
                    self.metrics.rest_backfills_total.with_label_values(&[self.exchange.as_str(), "failure"]).inc();
                    self.total_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(exchange = %self.exchange, %symbol, error = %e, "REST backfill failed");
                    self.record_error_event((vec![symbol], error_codes::REST_BACKFILL_FAILED, e.to_string()));
                }
            }
        }
        all_ok
    }

    fn touch(&self) {
        *self.last_message_at.lock().expect("last_message_at mutex poisoned") = Instant::now();
    }

    fn sync_breaker_gauge(&self) {
        let value = match self.breaker.snapshot().state {
            circuit_breaker::State::Closed => 0.0,
            circuit_breaker::State::Open => 1.0,
            circuit_breaker::State::HalfOpen => 2.0,
        };
        self.metrics.circuit_breaker_state.with_label_values(&[self.exchange.as_str(), &self.contract_type]).set(value);
    }

    fn record_error_event(&self, (symbols, code, message): (Vec<String>, &'static str, String)) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        let mut frame = ErrorFrame::new(code, message).with_exchange(self.exchange).with_contract_type(self.contract_type.clone());
        if !symbols.is_empty() {
            frame = frame.with_symbols(symbols.clone());
        }
        let _ = self.events_tx.send(SessionEvent::Error { symbols, frame });
    }
}
