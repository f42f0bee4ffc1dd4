use crate::{parse_f64, ConnectorError, ExchangeConnector, ParseError, SubscribeRequest};
use async_trait::async_trait;
use candle_protocol::{Candle, Exchange};
use chrono::{TimeZone, Utc};
use rest_pool::{RestError, RestPool};
use serde_json::Value;

/// OKX single `business` WebSocket, `candle1m` channel (spec §6.3).
pub struct OkxConnector;

const CONTRACT_TYPES: &[&str] = &["spot", "swap"];
const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/business";

#[async_trait]
impl ExchangeConnector for OkxConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    fn contract_types(&self) -> &'static [&'static str] {
        CONTRACT_TYPES
    }

    fn supports_incremental_subscribe(&self) -> bool {
        true
    }

    fn subscribe_request(&self, contract_type: &str, symbols: &[String]) -> Result<SubscribeRequest, ConnectorError> {
        if !CONTRACT_TYPES.contains(&contract_type) {
            return Err(ConnectorError::UnsupportedContractType(contract_type.to_owned()));
        }
        Ok(SubscribeRequest { url: WS_URL.to_owned(), payloads: self.incremental_subscribe_payload(contract_type, symbols) })
    }

    fn incremental_subscribe_payload(&self, _contract_type: &str, symbols: &[String]) -> Vec<String> {
        let args: Vec<Value> = symbols
            .iter()
            .map(|s| serde_json::json!({"channel": "candle1m", "instId": s}))
            .collect();
        vec![serde_json::json!({"op": "subscribe", "args": args}).to_string()]
    }

    fn parse_frame(&self, contract_type: &str, raw: &str) -> Result<Vec<Candle>, ParseError> {
        let v: Value = serde_json::from_str(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;
        let arg = v.get("arg").ok_or(ParseError::NotACandle)?;
        if arg.get("channel").and_then(Value::as_str) != Some("candle1m") {
            return Err(ParseError::NotACandle);
        }
        let symbol = arg.get("instId").and_then(Value::as_str).ok_or(ParseError::NotACandle)?.to_owned();
        let rows = v.get("data").and_then(Value::as_array).ok_or(ParseError::NotACandle)?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let row = row.as_array().ok_or_else(|| ParseError::Malformed("candle row is not an array".into()))?;
            let open_ms: i64 = row.first().and_then(Value::as_str).and_then(|s| s.parse().ok()).ok_or(ParseError::MissingTimestamps)?;
            let open_time = Utc.timestamp_millis_opt(open_ms).single().ok_or(ParseError::MissingTimestamps)?;
            let open = parse_f64(row.get(1), "o")?;
            let high = parse_f64(row.get(2), "h")?;
            let low = parse_f64(row.get(3), "l")?;
            let close = parse_f64(row.get(4), "c")?;
            let volume = parse_f64(row.get(5), "v")?;
            let is_closed = row.get(8).and_then(Value::as_str).map(|s| s == "1").unwrap_or(false);

            let candle = Candle::new(Exchange::Okx, contract_type, symbol.clone(), open_time, open, high, low, close, volume, 0, is_closed)
                .map_err(|e| ParseError::InvalidCandle(e.to_string()))?;
            candles.push(candle);
        }
        Ok(candles)
    }

    async fn rest_backfill(&self, pool: &RestPool, contract_type: &str, symbol: &str) -> Result<Candle, RestError> {
        let inst_type = if contract_type == "swap" { "SWAP" } else { "SPOT" };
        let url = format!("https://www.okx.com/api/v5/market/candles?instId={symbol}&bar=1m&limit=1");
        let _ = inst_type;
        let body = pool.get_json(Exchange::Okx, &url).await?;
        let rows = body.get("data").and_then(Value::as_array).filter(|a| !a.is_empty()).ok_or(RestError::Status(204))?;
        let row = rows.first().expect("non-empty checked above").as_array().ok_or(RestError::Status(502))?;

        let open_ms: i64 = row.first().and_then(Value::as_str).and_then(|s| s.parse().ok()).ok_or(RestError::Status(502))?;
        let open_time = Utc.timestamp_millis_opt(open_ms).single().ok_or(RestError::Status(502))?;
        let get = |i: usize| row.get(i).and_then(Value::as_str).unwrap_or("0").parse::<f64>().unwrap_or(0.0);

        Candle::new(Exchange::Okx, contract_type, symbol, open_time, get(1), get(2), get(3), get(4), get(5), 0, true)
            .map_err(|_| RestError::Status(502))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_candle1m_array_payload() {
        let raw = r#"{"arg":{"channel":"candle1m","instId":"BTC-USDT"},"data":[["1597026383085","3.721","3.743","3.677","3.708","8422410","8422410","0","1"]]}"#;
        let candles = OkxConnector.parse_frame("spot", raw).unwrap();
        assert_eq!(candles.len(), 1);
        assert!(candles[0].is_closed);
        assert_eq!(candles[0].symbol, "BTC-USDT");
    }

    #[test]
    fn unconfirmed_candle_is_open() {
        let raw = r#"{"arg":{"channel":"candle1m","instId":"BTC-USDT"},"data":[["1597026383085","3.721","3.743","3.677","3.708","8422410","8422410","0","0"]]}"#;
        let candles = OkxConnector.parse_frame("spot", raw).unwrap();
        assert!(!candles[0].is_closed);
    }
}
