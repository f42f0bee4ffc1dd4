// test_connector: a scriptable `ExchangeConnector` for exercising the
// session state machine against `MockUpstreamServer` instead of a real
// exchange. Its wire format is its own flat JSON object, distinct from any
// of the five real connectors.

use async_trait::async_trait;
use candle_protocol::{Candle, Exchange};
use chrono::{TimeZone, Utc};
use connectors::{ConnectorError, ExchangeConnector, ParseError, SubscribeRequest};
use rest_pool::{RestError, RestPool};
use serde::Deserialize;
use std::sync::Mutex;

pub const TEST_CONTRACT_TYPES: &[&str] = &["test"];

/// What [`TestConnector::rest_backfill`] returns. Set with
/// [`TestConnector::set_backfill_result`] before a test triggers a
/// backfill; the default is a timeout, so tests that don't care about
/// backfill still observe well-defined behaviour.
pub enum BackfillOutcome {
    Candle(Candle),
    Error(RestError),
}

#[derive(Deserialize)]
struct WireCandle {
    symbol: String,
    open_time_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    trade_num: u64,
    is_closed: bool,
}

pub struct TestConnector {
    exchange: Exchange,
    url: String,
    incremental: bool,
    backfill: Mutex<Option<BackfillOutcome>>,
}

impl TestConnector {
    pub fn new(exchange: Exchange, server_url: impl Into<String>) -> Self {
        TestConnector { exchange, url: server_url.into(), incremental: false, backfill: Mutex::new(None) }
    }

    pub fn with_incremental_subscribe(mut self, supported: bool) -> Self {
        self.incremental = supported;
        self
    }

    /// Queue the result of the next `rest_backfill` call.
    pub fn set_backfill_result(&self, outcome: BackfillOutcome) {
        *self.backfill.lock().expect("backfill mutex poisoned") = Some(outcome);
    }

    /// Serialize a candle the way this connector's `parse_frame` expects
    /// to read it back, for use with `MockUpstreamConnection::send_text`.
    pub fn frame_for(candle: &Candle) -> String {
        serde_json::json!({
            "symbol": candle.symbol,
            "open_time_ms": candle.open_time_ms(),
            "open": candle.open,
            "high": candle.high,
            "low": candle.low,
            "close": candle.close,
            "volume": candle.volume,
            "trade_num": candle.trade_num,
            "is_closed": candle.is_closed,
        })
        .to_string()
    }
}

#[async_trait]
impl ExchangeConnector for TestConnector {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    fn contract_types(&self) -> &'static [&'static str] {
        TEST_CONTRACT_TYPES
    }

    fn supports_incremental_subscribe(&self) -> bool {
        self.incremental
    }

    fn subscribe_request(&self, contract_type: &str, symbols: &[String]) -> Result<SubscribeRequest, ConnectorError> {
        if !TEST_CONTRACT_TYPES.contains(&contract_type) {
            return Err(ConnectorError::UnsupportedContractType(contract_type.to_owned()));
        }
        Ok(SubscribeRequest { url: self.url.clone(), payloads: vec![format!("SUBSCRIBE {}", symbols.join(","))] })
    }

    fn incremental_subscribe_payload(&self, _contract_type: &str, symbols: &[String]) -> Vec<String> {
        vec![format!("SUBSCRIBE {}", symbols.join(","))]
    }

    fn parse_frame(&self, contract_type: &str, raw: &str) -> Result<Vec<Candle>, ParseError> {
        if raw.starts_with("SUBSCRIBE") || raw.starts_with("ACK") {
            return Err(ParseError::NotACandle);
        }
        let wire: WireCandle = serde_json::from_str(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;
        let open_time = Utc.timestamp_millis_opt(wire.open_time_ms).single().ok_or(ParseError::MissingTimestamps)?;
        let candle = Candle::new(
            self.exchange,
            contract_type,
            wire.symbol,
            open_time,
            wire.open,
            wire.high,
            wire.low,
            wire.close,
            wire.volume,
            wire.trade_num,
            wire.is_closed,
        )
        .map_err(|e| ParseError::InvalidCandle(e.to_string()))?;
        Ok(vec![candle])
    }

    async fn rest_backfill(&self, _pool: &RestPool, contract_type: &str, symbol: &str) -> Result<Candle, RestError> {
        match self.backfill.lock().expect("backfill mutex poisoned").take() {
            Some(BackfillOutcome::Candle(candle)) => Ok(candle),
            Some(BackfillOutcome::Error(err)) => Err(err),
            None => {
                let _ = (contract_type, symbol);
                Err(RestError::Timeout)
            }
        }
    }
}
