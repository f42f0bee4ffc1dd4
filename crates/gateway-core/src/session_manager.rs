//! Session manager (spec §4.7): owns the exchange/contract_type -> session
//! table and the subscription-key -> subscriber fan-out table behind one
//! mutex each, and wires subscribe/unsubscribe/forward between them.
//!
//! Connection lifetime is the unsubscribe mechanism: closing the
//! downstream WebSocket is the only way a subscriber stops receiving a
//! key, there is no mid-session unsubscribe frame (Open Question,
//! resolved against the original implementation's connection-scoped
//! subscription model).

use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;
use crate::session::{SessionEvent, SessionTimeouts, UpstreamSession};
use crate::subscriber::Subscriber;
use candle_protocol::{error_codes, Candle, Exchange, SubscriptionKey};
use connectors::{connector_for, ExchangeConnector};
use rest_pool::RestPool;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Outcome of a subscribe request for one `(exchange, contract_type)` pair.
pub struct SubscribeOutcome {
    pub subscribed: Vec<String>,
    pub rejected: Vec<(String, &'static str, String)>,
}

struct SessionKey {
    exchange: Exchange,
    contract_type: String,
}

impl SessionKey {
    fn tuple(&self) -> (Exchange, String) {
        (self.exchange, self.contract_type.clone())
    }
}

pub struct SessionManager {
    config: GatewayConfig,
    metrics: Arc<GatewayMetrics>,
    rest_pool: Arc<RestPool>,
    shutdown_tx: watch::Sender<bool>,
    sessions: Mutex<HashMap<(Exchange, String), Vec<Arc<UpstreamSession>>>>,
    subscribers: Mutex<HashMap<SubscriptionKey, HashSet<uuid::Uuid>>>,
    registry: Mutex<HashMap<uuid::Uuid, Arc<Subscriber>>>,
}

impl SessionManager {
    pub fn new(config: GatewayConfig, metrics: Arc<GatewayMetrics>) -> Arc<Self> {
        let rest_pool = Arc::new(RestPool::new(config.rest_pool));
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(SessionManager {
            config,
            metrics,
            rest_pool,
            shutdown_tx,
            sessions: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// Validate `symbols` for `(exchange, contract_type)`, find-or-create
    /// sessions under `MAX_SYMBOL_PER_WS`/`MAX_CONN_PER_EXCHANGE`, and
    /// register `subscriber` against every accepted key.
    pub fn subscribe(self: &Arc<Self>, subscriber: &Arc<Subscriber>, exchange: Exchange, contract_type: &str, symbols: &[String]) -> SubscribeOutcome {
        let connector = connector_for(exchange);
        let mut outcome = SubscribeOutcome { subscribed: Vec::new(), rejected: Vec::new() };

        if !connector.contract_types().contains(&contract_type) {
            for symbol in symbols {
                outcome
                    .rejected
                    .push((symbol.clone(), error_codes::INVALID_SYMBOL, format!("contract_type '{contract_type}' is not supported by {exchange}")));
            }
            return outcome;
        }

        for symbol in symbols {
            if symbol.trim().is_empty() {
                outcome.rejected.push((symbol.clone(), error_codes::INVALID_SYMBOL, "symbol must not be empty".to_owned()));
                continue;
            }

            match self.attach_symbol(&connector, exchange, contract_type, symbol) {
                Ok(()) => {
                    let key = SubscriptionKey::new(exchange, contract_type, symbol.clone());
                    self.subscribers.lock().expect("subscribers mutex poisoned").entry(key).or_default().insert(subscriber.id);
                    self.registry.lock().expect("registry mutex poisoned").insert(subscriber.id, Arc::clone(subscriber));
                    outcome.subscribed.push(symbol.clone());
                }
                Err((code, msg)) => outcome.rejected.push((symbol.clone(), code, msg)),
            }
        }

        outcome
    }

    /// Drop every key this subscriber held. Called once, when its
    /// downstream connection closes.
    pub fn unsubscribe_all(&self, subscriber_id: uuid::Uuid) {
        self.registry.lock().expect("registry mutex poisoned").remove(&subscriber_id);
        let mut subscribers = self.subscribers.lock().expect("subscribers mutex poisoned");
        subscribers.retain(|_, ids| {
            ids.remove(&subscriber_id);
            !ids.is_empty()
        });
    }

    /// Forward a candle to every subscriber registered for its key.
    pub fn forward(&self, candle: &Candle) {
        let key = candle.key();
        let ids: Vec<uuid::Uuid> = match self.subscribers.lock().expect("subscribers mutex poisoned").get(&key) {
            Some(set) => set.iter().copied().collect(),
            None => return,
        };
        let registry = self.registry.lock().expect("registry mutex poisoned");
        for id in ids {
            if let Some(sub) = registry.get(&id) {
                sub.send_quote(candle, &self.metrics);
            }
        }
    }

    /// Route a session's error event to every subscriber holding one of
    /// its affected symbols (or every subscriber of the exchange, when
    /// the error isn't symbol-scoped).
    fn route_error(&self, exchange: Exchange, contract_type: &str, event: SessionEvent) {
        let SessionEvent::Error { symbols, frame } = event;
        let registry = self.registry.lock().expect("registry mutex poisoned");
        let subscribers = self.subscribers.lock().expect("subscribers mutex poisoned");

        let mut targets: HashSet<uuid::Uuid> = HashSet::new();
        if symbols.is_empty() {
            for (key, ids) in subscribers.iter() {
                if key.exchange == exchange && key.contract_type == contract_type {
                    targets.extend(ids.iter().copied());
                }
            }
        } else {
            for symbol in &symbols {
                let key = SubscriptionKey::new(exchange, contract_type, symbol.clone());
                if let Some(ids) = subscribers.get(&key) {
                    targets.extend(ids.iter().copied());
                }
            }
        }

        for id in targets {
            if let Some(sub) = registry.get(&id) {
                sub.send_error(frame.clone(), &self.metrics);
            }
        }
    }

    fn attach_symbol(
        self: &Arc<Self>,
        connector: &Arc<dyn ExchangeConnector>,
        exchange: Exchange,
        contract_type: &str,
        symbol: &str,
    ) -> Result<(), (&'static str, String)> {
        let key = SessionKey { exchange, contract_type: contract_type.to_owned() };
        let mut sessions = self.sessions.lock().expect("sessions mutex poisoned");
        let bucket = sessions.entry(key.tuple()).or_default();

        if bucket.iter().any(|s| s.symbols().iter().any(|s2| s2 == symbol)) {
            return Ok(());
        }

        if let Some(session) = bucket.iter().find(|s| s.has_capacity()) {
            session.add_symbol(symbol.to_owned());
            // A running session always restarts through SUBSCRIBING to
            // pick up a newly attached symbol. Exchanges that support an
            // incremental subscribe message are cheaper to extend in
            // place, but reusing the restart path for every exchange
            // keeps this one code path instead of two.
            session.request_restart();
            tracing::debug!(%exchange, contract_type, symbol, "attached to existing session");
            return Ok(());
        }

        if let Some(max_conn) = self.config.max_conn_per_exchange {
            if bucket.len() >= max_conn {
                return Err((error_codes::CONNECTION_POOL_BUSY, format!("{exchange} has reached its connection limit ({max_conn})")));
            }
        }

        let (session, events_rx) = UpstreamSession::new(
            exchange,
            contract_type.to_owned(),
            bucket.len(),
            Arc::clone(connector),
            Arc::clone(&self.rest_pool),
            Arc::clone(&self.metrics),
            self.config.queue,
            self.config.dedup,
            self.config.breaker,
            SessionTimeouts {
                inactivity_timeout: self.config.inactivity_timeout,
                reconnect_delay: self.config.reconnect_delay,
                ws_ping_interval: self.config.ws_ping_interval,
                ws_ping_timeout: self.config.ws_ping_timeout,
            },
            self.config.max_symbol_per_ws,
        );
        session.add_symbol(symbol.to_owned());
        bucket.push(Arc::clone(&session));
        drop(sessions);

        self.spawn_session(session, events_rx);
        Ok(())
    }

    fn spawn_session(self: &Arc<Self>, session: Arc<UpstreamSession>, mut events_rx: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) {
        let run_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(Arc::clone(&session).run(run_shutdown));

        let manager = Arc::clone(self);
        let drain_session = Arc::clone(&session);
        let mut drain_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    entry = drain_session.queue.drain_one_timed() => {
                        match entry {
                            Some((candle, age)) => {
                                manager.forward(&candle);
                                manager.metrics.quote_latency_seconds.observe(age.as_secs_f64());
                            }
                            None => break,
                        }
                    }
                    _ = drain_shutdown.changed() => {
                        if *drain_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let manager = Arc::clone(self);
        let exchange = session.exchange;
        let contract_type = session.contract_type.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                manager.route_error(exchange, &contract_type, event);
            }
        });
    }

    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn session_snapshot(&self) -> Vec<(Exchange, String, usize, circuit_breaker::State)> {
        self.sessions
            .lock()
            .expect("sessions mutex poisoned")
            .iter()
            .flat_map(|((exchange, contract_type), sessions)| {
                sessions
                    .iter()
                    .map(|s| (*exchange, contract_type.clone(), s.symbol_count(), s.breaker_snapshot().state))
            })
            .collect()
    }

    pub fn update_queue_gauges(&self) {
        for ((exchange, contract_type), sessions) in self.sessions.lock().expect("sessions mutex poisoned").iter() {
            let closed: usize = sessions.iter().map(|s| s.queue.depth_closed()).sum();
            let open: usize = sessions.iter().map(|s| s.queue.depth_open()).sum();
            self.metrics.queue_depth_closed.with_label_values(&[exchange.as_str(), contract_type]).set(closed as f64);
            self.metrics.queue_depth_open.with_label_values(&[exchange.as_str(), contract_type]).set(open as f64);
        }
    }

    pub fn is_healthy(&self) -> bool {
        let sessions = self.sessions.lock().expect("sessions mutex poisoned");
        if sessions.is_empty() {
            return true;
        }
        let threshold = self.config.inactivity_timeout * 2;
        sessions.values().flatten().all(|s| {
            let state = s.breaker_snapshot().state;
            let breaker_ok = matches!(state, circuit_breaker::State::Closed | circuit_breaker::State::HalfOpen);
            breaker_ok && s.last_message_age() < threshold
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use candle_protocol::Candle;
    use chrono::Utc;

    fn manager() -> Arc<SessionManager> {
        SessionManager::new(GatewayConfig::default(), Arc::new(GatewayMetrics::new()))
    }

    fn subscriber(exchange: Exchange, contract_type: &str) -> Arc<Subscriber> {
        Arc::new(Subscriber::new(exchange, contract_type.to_owned(), 0, 16, OverflowPolicy::DropOldest))
    }

    #[test]
    fn rejects_unsupported_contract_type_without_creating_a_session() {
        let manager = manager();
        let sub = subscriber(Exchange::Binance, "not-real");
        let outcome = manager.subscribe(&sub, Exchange::Binance, "not-real", &["BTCUSDT".to_owned()]);
        assert!(outcome.subscribed.is_empty());
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].1, error_codes::INVALID_SYMBOL);
        assert!(manager.sessions.lock().unwrap().is_empty());
    }

    #[test]
    fn rejects_empty_symbol_without_creating_a_session() {
        let manager = manager();
        let sub = subscriber(Exchange::Binance, "spot");
        let outcome = manager.subscribe(&sub, Exchange::Binance, "spot", &["  ".to_owned()]);
        assert!(outcome.subscribed.is_empty());
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].1, error_codes::INVALID_SYMBOL);
        assert!(manager.sessions.lock().unwrap().is_empty());
    }

    #[test]
    fn rejects_when_connection_pool_is_exhausted() {
        let mut config = GatewayConfig::default();
        config.max_conn_per_exchange = Some(0);
        let manager = SessionManager::new(config, Arc::new(GatewayMetrics::new()));
        let sub = subscriber(Exchange::Binance, "spot");
        let outcome = manager.subscribe(&sub, Exchange::Binance, "spot", &["BTCUSDT".to_owned()]);
        assert!(outcome.subscribed.is_empty());
        assert_eq!(outcome.rejected[0].1, error_codes::CONNECTION_POOL_BUSY);
        assert!(manager.sessions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forward_reaches_only_subscribers_registered_for_the_candle_key() {
        let manager = manager();
        let matching = subscriber(Exchange::Binance, "spot");
        let other = subscriber(Exchange::Binance, "spot");
        let key = SubscriptionKey::new(Exchange::Binance, "spot", "BTCUSDT");
        manager.subscribers.lock().unwrap().entry(key).or_default().insert(matching.id);
        manager.registry.lock().unwrap().insert(matching.id, Arc::clone(&matching));
        manager.registry.lock().unwrap().insert(other.id, Arc::clone(&other));

        let candle = Candle::new(Exchange::Binance, "spot", "BTCUSDT", Utc::now(), 1.0, 2.0, 0.5, 1.5, 10.0, 1, true).unwrap();
        manager.forward(&candle);

        let frame = matching.next_frame().await;
        assert!(matches!(frame, Some(crate::subscriber::OutboundFrame::Quote(_))));

        // `other` was registered but never subscribed to this key, so its
        // buffer should have stayed empty the whole time.
        other.close();
        assert!(other.next_frame().await.is_none());
    }

    #[test]
    fn unsubscribe_all_removes_every_key_the_subscriber_held() {
        let manager = manager();
        let sub = subscriber(Exchange::Okx, "spot");
        let key_a = SubscriptionKey::new(Exchange::Okx, "spot", "BTC-USDT");
        let key_b = SubscriptionKey::new(Exchange::Okx, "spot", "ETH-USDT");
        {
            let mut subs = manager.subscribers.lock().unwrap();
            subs.entry(key_a.clone()).or_default().insert(sub.id);
            subs.entry(key_b.clone()).or_default().insert(sub.id);
        }
        manager.registry.lock().unwrap().insert(sub.id, Arc::clone(&sub));

        manager.unsubscribe_all(sub.id);

        assert!(manager.registry.lock().unwrap().get(&sub.id).is_none());
        assert!(manager.subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn is_healthy_with_no_sessions_is_true() {
        let manager = manager();
        assert!(manager.is_healthy());
    }
}
