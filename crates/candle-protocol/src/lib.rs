// candle-protocol: Canonical candle schema and downstream wire protocol types.
//
// `Candle` is the normalised record every exchange connector produces and
// every downstream subscriber receives. The WS wire types mirror the JSON
// frames exchanged with downstream subscribers (spec §6.1) using plain
// field-level serde, not a tagged enum — each frame kind is a distinct Rust
// type and the `type` discriminator is written by hand in `ServerFrame`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// One of the five supported upstream exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    Binance,
    Okx,
    Bybit,
    Gateio,
    Hyperliquid,
}

impl Exchange {
    pub const ALL: [Exchange; 5] = [
        Exchange::Binance,
        Exchange::Okx,
        Exchange::Bybit,
        Exchange::Gateio,
        Exchange::Hyperliquid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Okx => "okx",
            Exchange::Bybit => "bybit",
            Exchange::Gateio => "gateio",
            Exchange::Hyperliquid => "hyperliquid",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Exchange {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binance" => Ok(Exchange::Binance),
            "okx" => Ok(Exchange::Okx),
            "bybit" => Ok(Exchange::Bybit),
            "gateio" => Ok(Exchange::Gateio),
            "hyperliquid" => Ok(Exchange::Hyperliquid),
            _ => Err(()),
        }
    }
}

// ---------------------------------------------------------------------------
// SubscriptionKey
// ---------------------------------------------------------------------------

/// Unique identity of a single upstream feed within the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub exchange: Exchange,
    pub contract_type: String,
    pub symbol: String,
}

impl SubscriptionKey {
    pub fn new(exchange: Exchange, contract_type: impl Into<String>, symbol: impl Into<String>) -> Self {
        SubscriptionKey {
            exchange,
            contract_type: contract_type.into(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.exchange, self.contract_type, self.symbol)
    }
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// Canonical, immutable 1-minute OHLCV bar.
///
/// Invariants enforced by [`Candle::new`]: `low <= open, close, high`,
/// `open_time` truncated to a whole UTC minute, all numeric fields finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: Exchange,
    pub contract_type: String,
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_num: u64,
    pub is_closed: bool,
}

/// Error returned by [`Candle::new`] when a raw frame violates the canonical
/// schema's invariants. Callers (the normaliser) log-and-drop on this error;
/// it is never surfaced to subscribers (spec §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandleError {
    NonFinite(&'static str),
    LowAboveOther { field: &'static str, low: String, other: String },
    NegativeVolume,
}

impl fmt::Display for CandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandleError::NonFinite(field) => write!(f, "field '{field}' is not finite"),
            CandleError::LowAboveOther { field, low, other } => {
                write!(f, "low ({low}) > {field} ({other})")
            }
            CandleError::NegativeVolume => write!(f, "volume is negative"),
        }
    }
}

impl std::error::Error for CandleError {}

impl Candle {
    /// Build a canonical candle, truncating `open_time` to its minute
    /// boundary and validating the OHLC/volume invariants.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Exchange,
        contract_type: impl Into<String>,
        symbol: impl Into<String>,
        open_time: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        trade_num: u64,
        is_closed: bool,
    ) -> Result<Self, CandleError> {
        for (name, v) in [("open", open), ("high", high), ("low", low), ("close", close), ("volume", volume)] {
            if !v.is_finite() {
                return Err(CandleError::NonFinite(name));
            }
        }
        if volume < 0.0 {
            return Err(CandleError::NegativeVolume);
        }
        if low > open {
            return Err(CandleError::LowAboveOther { field: "open", low: low.to_string(), other: open.to_string() });
        }
        if low > high {
            return Err(CandleError::LowAboveOther { field: "high", low: low.to_string(), other: high.to_string() });
        }
        if low > close {
            return Err(CandleError::LowAboveOther { field: "close", low: low.to_string(), other: close.to_string() });
        }

        let aligned = truncate_to_minute(open_time);

        Ok(Candle {
            exchange,
            contract_type: contract_type.into(),
            symbol: symbol.into(),
            open_time: aligned,
            open,
            high,
            low,
            close,
            volume,
            trade_num,
            is_closed,
        })
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.exchange, self.contract_type.clone(), self.symbol.clone())
    }

    /// Milliseconds since the Unix epoch for `open_time` — used as the
    /// deduplicator's time component.
    pub fn open_time_ms(&self) -> i64 {
        self.open_time.timestamp_millis()
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp() - (t.timestamp() % 60);
    Utc.timestamp_opt(secs, 0).single().unwrap_or(t)
}

// ---------------------------------------------------------------------------
// Downstream wire protocol (spec §6.1)
// ---------------------------------------------------------------------------

/// Client -> server subscribe frame. Exactly one is read per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeFrame {
    pub exchange: Exchange,
    pub contract_type: String,
    pub symbols: Vec<String>,
    #[serde(default)]
    pub limit: u64,
}

/// Server -> client confirmation frame.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribedFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub exchange: Exchange,
    pub contract_type: String,
    pub symbols: Vec<String>,
    pub limit: u64,
}

impl SubscribedFrame {
    pub fn new(exchange: Exchange, contract_type: String, symbols: Vec<String>, limit: u64) -> Self {
        SubscribedFrame { kind: "subscribed", exchange, contract_type, symbols, limit }
    }
}

/// Server -> client quote frame, one per forwarded candle.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub current_time: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub exchange: Exchange,
    pub symbol: String,
    pub contract_type: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_num: u64,
    pub is_closed_candle: bool,
}

impl QuoteFrame {
    pub fn from_candle(candle: &Candle, current_time: DateTime<Utc>) -> Self {
        QuoteFrame {
            kind: "quote",
            current_time,
            timestamp: candle.open_time,
            exchange: candle.exchange,
            symbol: candle.symbol.clone(),
            contract_type: candle.contract_type.clone(),
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            trade_num: candle.trade_num,
            is_closed_candle: candle.is_closed,
        }
    }
}

/// Server -> client error frame.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<Exchange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_message: Option<String>,
}

impl ErrorFrame {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        ErrorFrame {
            kind: "error",
            code,
            message: message.into(),
            exchange: None,
            contract_type: None,
            symbols: None,
            exchange_message: None,
        }
    }

    pub fn with_exchange(mut self, exchange: Exchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn with_contract_type(mut self, contract_type: impl Into<String>) -> Self {
        self.contract_type = Some(contract_type.into());
        self
    }

    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        self.symbols = Some(symbols);
        self
    }

    pub fn with_exchange_message(mut self, msg: impl Into<String>) -> Self {
        self.exchange_message = Some(msg.into());
        self
    }
}

/// Frozen v1 error codes (spec §7). The code string is the stable contract.
pub mod error_codes {
    pub const INVALID_SYMBOL: &str = "INVALID_SYMBOL";
    pub const CONNECTION_POOL_BUSY: &str = "CONNECTION_POOL_BUSY";
    pub const WS_CONNECT_FAILED: &str = "WS_CONNECT_FAILED";
    pub const WS_SUBSCRIBE_REJECTED: &str = "WS_SUBSCRIBE_REJECTED";
    pub const WS_STREAM_TIMEOUT: &str = "WS_STREAM_TIMEOUT";
    pub const REST_BACKFILL_FAILED: &str = "REST_BACKFILL_FAILED";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const INTERNAL_QUEUE_BACKPRESSURE: &str = "INTERNAL_QUEUE_BACKPRESSURE";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_new_truncates_open_time_to_minute() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 12, 30, 45).unwrap();
        let c = Candle::new(Exchange::Binance, "spot", "BTCUSDT", t, 1.0, 2.0, 0.5, 1.5, 10.0, 3, true).unwrap();
        assert_eq!(c.open_time, Utc.with_ymd_and_hms(2026, 1, 1, 12, 30, 0).unwrap());
    }

    #[test]
    fn candle_new_rejects_low_above_high() {
        let t = Utc::now();
        let err = Candle::new(Exchange::Okx, "spot", "BTC-USDT", t, 1.0, 0.5, 2.0, 1.0, 1.0, 0, false).unwrap_err();
        assert!(matches!(err, CandleError::LowAboveOther { field: "high", .. }));
    }

    #[test]
    fn candle_new_rejects_non_finite() {
        let t = Utc::now();
        let err = Candle::new(Exchange::Bybit, "linear", "BTCUSDT", t, f64::NAN, 1.0, 0.0, 1.0, 1.0, 0, false).unwrap_err();
        assert!(matches!(err, CandleError::NonFinite("open")));
    }

    #[test]
    fn exchange_round_trips_through_json() {
        let e = Exchange::Hyperliquid;
        let s = serde_json::to_string(&e).unwrap();
        assert_eq!(s, "\"hyperliquid\"");
        let back: Exchange = serde_json::from_str(&s).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn subscribe_frame_parses_spec_example() {
        let json = r#"{"exchange":"binance","contract_type":"spot","symbols":["BTCUSDT"],"limit":0}"#;
        let frame: SubscribeFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.exchange, Exchange::Binance);
        assert_eq!(frame.symbols, vec!["BTCUSDT".to_owned()]);
        assert_eq!(frame.limit, 0);
    }
}
