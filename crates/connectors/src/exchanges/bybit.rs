use crate::{parse_f64, ConnectorError, ExchangeConnector, ParseError, SubscribeRequest};
use async_trait::async_trait;
use candle_protocol::{Candle, Exchange};
use chrono::{TimeZone, Utc};
use rest_pool::{RestError, RestPool};
use serde_json::Value;

/// Bybit v5 `kline.1.<SYMBOL>` topic (spec §6.3).
pub struct BybitConnector;

const CONTRACT_TYPES: &[&str] = &["spot", "linear", "inverse"];

fn category(contract_type: &str) -> Result<&'static str, ConnectorError> {
    match contract_type {
        "spot" => Ok("spot"),
        "linear" => Ok("linear"),
        "inverse" => Ok("inverse"),
        other => Err(ConnectorError::UnsupportedContractType(other.to_owned())),
    }
}

#[async_trait]
impl ExchangeConnector for BybitConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    fn contract_types(&self) -> &'static [&'static str] {
        CONTRACT_TYPES
    }

    fn supports_incremental_subscribe(&self) -> bool {
        true
    }

    fn subscribe_request(&self, contract_type: &str, symbols: &[String]) -> Result<SubscribeRequest, ConnectorError> {
        let category = category(contract_type)?;
        let url = format!("wss://stream.bybit.com/v5/public/{category}");
        Ok(SubscribeRequest { url, payloads: self.incremental_subscribe_payload(contract_type, symbols) })
    }

    fn incremental_subscribe_payload(&self, _contract_type: &str, symbols: &[String]) -> Vec<String> {
        let args: Vec<String> = symbols.iter().map(|s| format!("kline.1.{s}")).collect();
        vec![serde_json::json!({"op": "subscribe", "args": args}).to_string()]
    }

    fn parse_frame(&self, contract_type: &str, raw: &str) -> Result<Vec<Candle>, ParseError> {
        let v: Value = serde_json::from_str(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;
        let topic = v.get("topic").and_then(Value::as_str).ok_or(ParseError::NotACandle)?;
        let symbol = topic.rsplit('.').next().ok_or(ParseError::NotACandle)?.to_owned();
        let rows = v.get("data").and_then(Value::as_array).ok_or(ParseError::NotACandle)?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let open_ms = row.get("start").and_then(Value::as_i64).ok_or(ParseError::MissingTimestamps)?;
            let open_time = Utc.timestamp_millis_opt(open_ms).single().ok_or(ParseError::MissingTimestamps)?;
            let open = parse_f64(row.get("open"), "open")?;
            let high = parse_f64(row.get("high"), "high")?;
            let low = parse_f64(row.get("low"), "low")?;
            let close = parse_f64(row.get("close"), "close")?;
            let volume = parse_f64(row.get("volume"), "volume")?;
            let is_closed = row.get("confirm").and_then(Value::as_bool).unwrap_or(false);

            let candle = Candle::new(Exchange::Bybit, contract_type, symbol.clone(), open_time, open, high, low, close, volume, 0, is_closed)
                .map_err(|e| ParseError::InvalidCandle(e.to_string()))?;
            candles.push(candle);
        }
        Ok(candles)
    }

    async fn rest_backfill(&self, pool: &RestPool, contract_type: &str, symbol: &str) -> Result<Candle, RestError> {
        let category = category(contract_type).map_err(|_| RestError::Status(400))?;
        let url = format!("https://api.bybit.com/v5/market/kline?category={category}&symbol={symbol}&interval=1&limit=1");
        let body = pool.get_json(Exchange::Bybit, &url).await?;
        let rows = body
            .get("result")
            .and_then(|r| r.get("list"))
            .and_then(Value::as_array)
            .filter(|a| !a.is_empty())
            .ok_or(RestError::Status(204))?;
        let row = rows.first().expect("non-empty checked above").as_array().ok_or(RestError::Status(502))?;

        let open_ms: i64 = row.first().and_then(Value::as_str).and_then(|s| s.parse().ok()).ok_or(RestError::Status(502))?;
        let open_time = Utc.timestamp_millis_opt(open_ms).single().ok_or(RestError::Status(502))?;
        let get = |i: usize| row.get(i).and_then(Value::as_str).unwrap_or("0").parse::<f64>().unwrap_or(0.0);

        Candle::new(Exchange::Bybit, contract_type, symbol, open_time, get(1), get(2), get(3), get(4), get(5), 0, true)
            .map_err(|_| RestError::Status(502))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_confirmed_kline_topic() {
        let raw = r#"{"topic":"kline.1.BTCUSDT","ts":1,"type":"snapshot","data":[{"start":1700000000000,"end":1700000059999,"interval":"1","open":"100","close":"101","high":"102","low":"99","volume":"5","turnover":"500","confirm":true,"timestamp":1700000059999}]}"#;
        let candles = BybitConnector.parse_frame("linear", raw).unwrap();
        assert_eq!(candles.len(), 1);
        assert!(candles[0].is_closed);
        assert_eq!(candles[0].symbol, "BTCUSDT");
    }
}
