// connectors: per-exchange WebSocket/REST mapping (spec §4.6, §6.3, §9).
//
// `ExchangeConnector` is the duck-typed `{subscribe_payload, parse_frame,
// rest_backfill}` interface from the design notes, made concrete as a
// trait object so the session manager can hold `Arc<dyn ExchangeConnector>`
// without knowing which of the five exchanges it is talking to.
//
// Every `parse_frame` implementation is a pure function: raw bytes in,
// zero or more canonical `Candle`s out, or a `ParseError`. Parse errors
// are never surfaced to subscribers (spec §4.6) — the caller logs and
// increments a counter.

mod exchanges;

use async_trait::async_trait;
use candle_protocol::{Candle, Exchange};
use rest_pool::RestPool;
use std::sync::Arc;
use thiserror::Error;

pub use exchanges::binance::BinanceConnector;
pub use exchanges::bybit::BybitConnector;
pub use exchanges::gateio::GateioConnector;
pub use exchanges::hyperliquid::HyperliquidConnector;
pub use exchanges::okx::OkxConnector;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("contract_type '{0}' is not supported by this exchange")]
    UnsupportedContractType(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed JSON frame: {0}")]
    Malformed(String),
    #[error("frame did not contain a candle payload (e.g. a subscription ack)")]
    NotACandle,
    #[error("candle schema violated: {0}")]
    InvalidCandle(String),
    #[error("frame missing both open-time and close-time fields")]
    MissingTimestamps,
}

/// What a connector needs to build the subscribe request for a session.
pub struct SubscribeRequest {
    /// The URL to open the WebSocket against.
    pub url: String,
    /// Text frames to send immediately after connecting, in order. Empty
    /// when the exchange bakes the subscription into the URL itself (e.g.
    /// Binance combined streams).
    pub payloads: Vec<String>,
}

/// Per-exchange mapping of WebSocket/REST wire formats to the canonical
/// candle schema. One implementation per exchange in `Exchange::ALL`.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    fn exchange(&self) -> Exchange;

    fn contract_types(&self) -> &'static [&'static str];

    /// Whether additional symbols can be added to an already-streaming
    /// session via an incremental subscribe message, or whether the
    /// session must be restarted through SUBSCRIBING (spec §4.7).
    fn supports_incremental_subscribe(&self) -> bool;

    fn subscribe_request(&self, contract_type: &str, symbols: &[String]) -> Result<SubscribeRequest, ConnectorError>;

    /// Build the incremental subscribe message(s) for a session already in
    /// STREAMING. Only called when `supports_incremental_subscribe` is true.
    fn incremental_subscribe_payload(&self, contract_type: &str, symbols: &[String]) -> Vec<String>;

    /// Parse one raw WebSocket text frame into zero or more candles. A
    /// single frame yields more than one candle for exchanges that batch
    /// updates (OKX, Bybit).
    fn parse_frame(&self, contract_type: &str, raw: &str) -> Result<Vec<Candle>, ParseError>;

    async fn rest_backfill(
        &self,
        pool: &RestPool,
        contract_type: &str,
        symbol: &str,
    ) -> Result<Candle, rest_pool::RestError>;
}

/// Construct the five concrete connectors.
pub fn all_connectors() -> Vec<Arc<dyn ExchangeConnector>> {
    vec![
        Arc::new(BinanceConnector),
        Arc::new(OkxConnector),
        Arc::new(BybitConnector),
        Arc::new(GateioConnector),
        Arc::new(HyperliquidConnector),
    ]
}

pub fn connector_for(exchange: Exchange) -> Arc<dyn ExchangeConnector> {
    match exchange {
        Exchange::Binance => Arc::new(BinanceConnector),
        Exchange::Okx => Arc::new(OkxConnector),
        Exchange::Bybit => Arc::new(BybitConnector),
        Exchange::Gateio => Arc::new(GateioConnector),
        Exchange::Hyperliquid => Arc::new(HyperliquidConnector),
    }
}

pub(crate) fn parse_f64(v: Option<&serde_json::Value>, field: &'static str) -> Result<f64, ParseError> {
    let v = v.ok_or_else(|| ParseError::Malformed(format!("missing field '{field}'")))?;
    let parsed = match v {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| ParseError::Malformed(format!("field '{field}' is not numeric: {s}")))?,
        serde_json::Value::Number(n) => {
            n.as_f64().ok_or_else(|| ParseError::Malformed(format!("field '{field}' is not a valid number")))?
        }
        other => return Err(ParseError::Malformed(format!("field '{field}' has unexpected type: {other}"))),
    };
    Ok(parsed)
}
