use crate::{parse_f64, ConnectorError, ExchangeConnector, ParseError, SubscribeRequest};
use async_trait::async_trait;
use candle_protocol::{Candle, Exchange};
use chrono::{TimeZone, Utc};
use rest_pool::{RestError, RestPool};
use serde_json::Value;

/// Hyperliquid `candle` subscription (`coin` + `interval`), REST backfill
/// via POST `candleSnapshot` (spec §6.3).
///
/// Unlike the other four exchanges, Hyperliquid requires one subscribe
/// message per coin rather than a single batched request, and does not
/// support adding coins to an already-open subscription set — the session
/// manager restarts the session through SUBSCRIBING instead (spec §4.7).
pub struct HyperliquidConnector;

const CONTRACT_TYPES: &[&str] = &["perp"];
const WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
const BAR_MS: i64 = 60_000;

#[async_trait]
impl ExchangeConnector for HyperliquidConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Hyperliquid
    }

    fn contract_types(&self) -> &'static [&'static str] {
        CONTRACT_TYPES
    }

    fn supports_incremental_subscribe(&self) -> bool {
        false
    }

    fn subscribe_request(&self, contract_type: &str, symbols: &[String]) -> Result<SubscribeRequest, ConnectorError> {
        if !CONTRACT_TYPES.contains(&contract_type) {
            return Err(ConnectorError::UnsupportedContractType(contract_type.to_owned()));
        }
        Ok(SubscribeRequest { url: WS_URL.to_owned(), payloads: subscribe_messages(symbols) })
    }

    fn incremental_subscribe_payload(&self, _contract_type: &str, _symbols: &[String]) -> Vec<String> {
        Vec::new()
    }

    fn parse_frame(&self, contract_type: &str, raw: &str) -> Result<Vec<Candle>, ParseError> {
        let v: Value = serde_json::from_str(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;
        if v.get("channel").and_then(Value::as_str) != Some("candle") {
            return Err(ParseError::NotACandle);
        }
        let data = v.get("data").ok_or(ParseError::NotACandle)?;

        let symbol = data.get("s").and_then(Value::as_str).ok_or(ParseError::NotACandle)?.to_owned();
        let open_ms = data.get("t").and_then(Value::as_i64);
        let close_ms = data.get("T").and_then(Value::as_i64);

        let (open_ms, is_closed) = match (open_ms, close_ms) {
            (_, Some(close_ms)) => (open_ms.unwrap_or(close_ms - BAR_MS), now_ms() >= close_ms),
            (Some(open_ms), None) => (open_ms, now_ms() >= open_ms + BAR_MS),
            (None, None) => return Err(ParseError::MissingTimestamps),
        };

        let open_time = Utc.timestamp_millis_opt(open_ms).single().ok_or(ParseError::MissingTimestamps)?;
        let open = parse_f64(data.get("o"), "o")?;
        let high = parse_f64(data.get("h"), "h")?;
        let low = parse_f64(data.get("l"), "l")?;
        let close = parse_f64(data.get("c"), "c")?;
        let volume = parse_f64(data.get("v"), "v")?;
        let trade_num = data.get("n").and_then(Value::as_u64).unwrap_or(0);

        let candle = Candle::new(Exchange::Hyperliquid, contract_type, symbol, open_time, open, high, low, close, volume, trade_num, is_closed)
            .map_err(|e| ParseError::InvalidCandle(e.to_string()))?;
        Ok(vec![candle])
    }

    async fn rest_backfill(&self, pool: &RestPool, contract_type: &str, symbol: &str) -> Result<Candle, RestError> {
        let now = now_ms();
        let body = serde_json::json!({
            "type": "candleSnapshot",
            "req": {"coin": symbol, "interval": "1m", "startTime": now - BAR_MS * 2, "endTime": now},
        });
        let resp = pool
            .client_for(Exchange::Hyperliquid)
            .post("https://api.hyperliquid.xyz/info")
            .json(&body)
            .send()
            .await
            .map_err(RestError::Transport)?;
        if !resp.status().is_success() {
            return Err(RestError::Status(resp.status().as_u16()));
        }
        let rows: Vec<Value> = resp.json().await.map_err(RestError::Transport)?;
        let row = rows.last().ok_or(RestError::Status(204))?;

        let open_ms = row.get("t").and_then(Value::as_i64).ok_or(RestError::Status(502))?;
        let open_time = Utc.timestamp_millis_opt(open_ms).single().ok_or(RestError::Status(502))?;
        let get = |field: &str| row.get(field).and_then(Value::as_str).unwrap_or("0").parse::<f64>().unwrap_or(0.0);
        let trade_num = row.get("n").and_then(Value::as_u64).unwrap_or(0);

        Candle::new(Exchange::Hyperliquid, contract_type, symbol, open_time, get("o"), get("h"), get("l"), get("c"), get("v"), trade_num, true)
            .map_err(|_| RestError::Status(502))
    }
}

fn subscribe_messages(symbols: &[String]) -> Vec<String> {
    symbols
        .iter()
        .map(|coin| {
            serde_json::json!({
                "method": "subscribe",
                "subscription": {"type": "candle", "coin": coin, "interval": "1m"},
            })
            .to_string()
        })
        .collect()
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_close_time_when_present() {
        let past_close = now_ms() - 1_000;
        let raw = format!(
            r#"{{"channel":"candle","data":{{"t":{},"T":{past_close},"s":"BTC","i":"1m","o":"1","c":"2","h":"3","l":"0.5","v":"10","n":4}}}}"#,
            past_close - BAR_MS
        );
        let candles = HyperliquidConnector.parse_frame("perp", &raw).unwrap();
        assert!(candles[0].is_closed);
    }

    #[test]
    fn derives_close_boundary_when_close_time_missing() {
        let old_open = now_ms() - BAR_MS - 5_000;
        let raw = format!(r#"{{"channel":"candle","data":{{"t":{old_open},"s":"BTC","i":"1m","o":"1","c":"2","h":"3","l":"0.5","v":"10","n":4}}}}"#);
        let candles = HyperliquidConnector.parse_frame("perp", &raw).unwrap();
        assert!(candles[0].is_closed);
    }

    #[test]
    fn drops_frame_missing_both_timestamps() {
        let raw = r#"{"channel":"candle","data":{"s":"BTC","i":"1m","o":"1","c":"2","h":"3","l":"0.5","v":"10","n":4}}"#;
        let err = HyperliquidConnector.parse_frame("perp", raw).unwrap_err();
        assert_eq!(err, ParseError::MissingTimestamps);
    }
}
