use crate::{parse_f64, ConnectorError, ExchangeConnector, ParseError, SubscribeRequest};
use async_trait::async_trait;
use candle_protocol::{Candle, Exchange};
use chrono::{TimeZone, Utc};
use rest_pool::{RestError, RestPool};
use serde_json::Value;

/// Binance spot/usdm/coinm via combined kline streams (spec §6.3).
pub struct BinanceConnector;

const CONTRACT_TYPES: &[&str] = &["spot", "usdm", "coinm"];

fn ws_host(contract_type: &str) -> Result<&'static str, ConnectorError> {
    match contract_type {
        "spot" => Ok("wss://stream.binance.com:9443"),
        "usdm" => Ok("wss://fstream.binance.com"),
        "coinm" => Ok("wss://dstream.binance.com"),
        other => Err(ConnectorError::UnsupportedContractType(other.to_owned())),
    }
}

fn rest_host(contract_type: &str) -> Result<&'static str, ConnectorError> {
    match contract_type {
        "spot" => Ok("https://api.binance.com/api/v3/klines"),
        "usdm" => Ok("https://fapi.binance.com/fapi/v1/klines"),
        "coinm" => Ok("https://dapi.binance.com/dapi/v1/klines"),
        other => Err(ConnectorError::UnsupportedContractType(other.to_owned())),
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn contract_types(&self) -> &'static [&'static str] {
        CONTRACT_TYPES
    }

    fn supports_incremental_subscribe(&self) -> bool {
        true
    }

    fn subscribe_request(&self, contract_type: &str, symbols: &[String]) -> Result<SubscribeRequest, ConnectorError> {
        let host = ws_host(contract_type)?;
        let streams = symbols.iter().map(|s| format!("{}@kline_1m", s.to_lowercase())).collect::<Vec<_>>().join("/");
        Ok(SubscribeRequest { url: format!("{host}/stream?streams={streams}"), payloads: Vec::new() })
    }

    fn incremental_subscribe_payload(&self, _contract_type: &str, symbols: &[String]) -> Vec<String> {
        let params: Vec<String> = symbols.iter().map(|s| format!("{}@kline_1m", s.to_lowercase())).collect();
        vec![serde_json::json!({"method": "SUBSCRIBE", "params": params, "id": 1}).to_string()]
    }

    fn parse_frame(&self, contract_type: &str, raw: &str) -> Result<Vec<Candle>, ParseError> {
        let v: Value = serde_json::from_str(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;
        let k = v.get("data").and_then(|d| d.get("k")).ok_or(ParseError::NotACandle)?;

        let symbol = k.get("s").and_then(Value::as_str).ok_or(ParseError::NotACandle)?.to_owned();
        let open_ms = k.get("t").and_then(Value::as_i64).ok_or(ParseError::MissingTimestamps)?;
        let open_time = Utc.timestamp_millis_opt(open_ms).single().ok_or(ParseError::MissingTimestamps)?;
        let is_closed = k.get("x").and_then(Value::as_bool).unwrap_or(false);
        let trade_num = k.get("n").and_then(Value::as_u64).unwrap_or(0);

        let open = parse_f64(k.get("o"), "o")?;
        let high = parse_f64(k.get("h"), "h")?;
        let low = parse_f64(k.get("l"), "l")?;
        let close = parse_f64(k.get("c"), "c")?;
        let volume = parse_f64(k.get("v"), "v")?;

        let candle = Candle::new(Exchange::Binance, contract_type, symbol, open_time, open, high, low, close, volume, trade_num, is_closed)
            .map_err(|e| ParseError::InvalidCandle(e.to_string()))?;
        Ok(vec![candle])
    }

    async fn rest_backfill(&self, pool: &RestPool, contract_type: &str, symbol: &str) -> Result<Candle, RestError> {
        let base = rest_host(contract_type).map_err(|_| RestError::Status(400))?;
        let url = format!("{base}?symbol={symbol}&interval=1m&limit=1");
        let body = pool.get_json(Exchange::Binance, &url).await?;
        let rows = body.as_array().filter(|a| !a.is_empty()).ok_or(RestError::Status(204))?;
        let row = rows.last().expect("non-empty checked above").as_array().ok_or(RestError::Status(502))?;

        let open_ms = row.first().and_then(Value::as_i64).ok_or(RestError::Status(502))?;
        let open_time = Utc.timestamp_millis_opt(open_ms).single().ok_or(RestError::Status(502))?;
        let get_str = |i: usize| row.get(i).and_then(Value::as_str).unwrap_or("0");
        let open: f64 = get_str(1).parse().unwrap_or(0.0);
        let high: f64 = get_str(2).parse().unwrap_or(0.0);
        let low: f64 = get_str(3).parse().unwrap_or(0.0);
        let close: f64 = get_str(4).parse().unwrap_or(0.0);
        let volume: f64 = get_str(5).parse().unwrap_or(0.0);
        let trade_num = row.get(8).and_then(Value::as_u64).unwrap_or(0);

        Candle::new(Exchange::Binance, contract_type, symbol, open_time, open, high, low, close, volume, trade_num, true)
            .map_err(|_| RestError::Status(502))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_stream_kline_frame() {
        let raw = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":1700000000000,"T":1700000059999,"s":"BTCUSDT","i":"1m","o":"100.0","c":"101.0","h":"102.0","l":"99.0","v":"10.5","n":5,"x":true}}}"#;
        let candles = BinanceConnector.parse_frame("spot", raw).unwrap();
        assert_eq!(candles.len(), 1);
        assert!(candles[0].is_closed);
        assert_eq!(candles[0].trade_num, 5);
    }

    #[test]
    fn subscribe_request_bakes_symbols_into_combined_stream_url() {
        let req = BinanceConnector.subscribe_request("spot", &["BTCUSDT".to_owned(), "ETHUSDT".to_owned()]).unwrap();
        assert!(req.url.contains("btcusdt@kline_1m/ethusdt@kline_1m"));
        assert!(req.payloads.is_empty());
    }
}
