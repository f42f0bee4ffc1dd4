use crate::{parse_f64, ConnectorError, ExchangeConnector, ParseError, SubscribeRequest};
use async_trait::async_trait;
use candle_protocol::{Candle, Exchange};
use chrono::{TimeZone, Utc};
use rest_pool::{RestError, RestPool};
use serde_json::Value;

/// Gate.io `{spot|futures}.candlesticks` channel, per-settle WS hosts for
/// coin-margined contracts (spec §6.3).
///
/// Gate.io's kline push carries no explicit closed/open flag; every
/// streamed candle is treated as open, and closed bars reach subscribers
/// only through the inactivity-triggered REST backfill path (spec §4.5).
pub struct GateioConnector;

const CONTRACT_TYPES: &[&str] = &["spot", "futures_usdt", "futures_btc"];

fn ws_url(contract_type: &str) -> Result<&'static str, ConnectorError> {
    match contract_type {
        "spot" => Ok("wss://api.gateio.ws/ws/v4/"),
        "futures_usdt" => Ok("wss://fx-ws.gateio.ws/v4/ws/usdt"),
        "futures_btc" => Ok("wss://fx-ws.gateio.ws/v4/ws/btc"),
        other => Err(ConnectorError::UnsupportedContractType(other.to_owned())),
    }
}

fn channel(contract_type: &str) -> &'static str {
    if contract_type == "spot" {
        "spot.candlesticks"
    } else {
        "futures.candlesticks"
    }
}

#[async_trait]
impl ExchangeConnector for GateioConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Gateio
    }

    fn contract_types(&self) -> &'static [&'static str] {
        CONTRACT_TYPES
    }

    fn supports_incremental_subscribe(&self) -> bool {
        true
    }

    fn subscribe_request(&self, contract_type: &str, symbols: &[String]) -> Result<SubscribeRequest, ConnectorError> {
        let url = ws_url(contract_type)?.to_owned();
        Ok(SubscribeRequest { url, payloads: self.incremental_subscribe_payload(contract_type, symbols) })
    }

    fn incremental_subscribe_payload(&self, contract_type: &str, symbols: &[String]) -> Vec<String> {
        let channel = channel(contract_type);
        let mut payload = vec![Value::String("1m".to_owned())];
        payload.extend(symbols.iter().cloned().map(Value::String));
        vec![serde_json::json!({
            "time": Utc::now().timestamp(),
            "channel": channel,
            "event": "subscribe",
            "payload": payload,
        })
        .to_string()]
    }

    fn parse_frame(&self, contract_type: &str, raw: &str) -> Result<Vec<Candle>, ParseError> {
        let v: Value = serde_json::from_str(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;
        if v.get("event").and_then(Value::as_str) != Some("update") {
            return Err(ParseError::NotACandle);
        }
        let result = v.get("result").ok_or(ParseError::NotACandle)?;
        let rows: Vec<&Value> = match result {
            Value::Array(a) => a.iter().collect(),
            Value::Object(_) => vec![result],
            _ => return Err(ParseError::NotACandle),
        };

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let name = row.get("n").and_then(Value::as_str).ok_or(ParseError::NotACandle)?;
            let symbol = name.strip_prefix("1m_").unwrap_or(name).to_owned();
            let open_secs: i64 = row.get("t").and_then(Value::as_str).and_then(|s| s.parse().ok()).ok_or(ParseError::MissingTimestamps)?;
            let open_time = Utc.timestamp_opt(open_secs, 0).single().ok_or(ParseError::MissingTimestamps)?;

            let open = parse_f64(row.get("o"), "o")?;
            let high = parse_f64(row.get("h"), "h")?;
            let low = parse_f64(row.get("l"), "l")?;
            let close = parse_f64(row.get("c"), "c")?;
            let volume = parse_f64(row.get("v"), "v")?;

            let candle = Candle::new(Exchange::Gateio, contract_type, symbol, open_time, open, high, low, close, volume, 0, false)
                .map_err(|e| ParseError::InvalidCandle(e.to_string()))?;
            candles.push(candle);
        }
        Ok(candles)
    }

    async fn rest_backfill(&self, pool: &RestPool, contract_type: &str, symbol: &str) -> Result<Candle, RestError> {
        if contract_type == "spot" {
            let url = format!("https://api.gateio.ws/api/v4/spot/candlesticks?currency_pair={symbol}&interval=1m&limit=1");
            let body = pool.get_json(Exchange::Gateio, &url).await?;
            let rows = body.as_array().filter(|a| !a.is_empty()).ok_or(RestError::Status(204))?;
            let row = rows.first().expect("non-empty checked above").as_array().ok_or(RestError::Status(502))?;
            let open_secs: i64 = row.first().and_then(Value::as_str).and_then(|s| s.parse().ok()).ok_or(RestError::Status(502))?;
            let open_time = Utc.timestamp_opt(open_secs, 0).single().ok_or(RestError::Status(502))?;
            let get = |i: usize| row.get(i).and_then(Value::as_str).unwrap_or("0").parse::<f64>().unwrap_or(0.0);
            // Spot ordering: [t, volume, close, high, low, open].
            return Candle::new(Exchange::Gateio, contract_type, symbol, open_time, get(5), get(3), get(4), get(2), get(1), 0, true)
                .map_err(|_| RestError::Status(502));
        }

        let settle = if contract_type == "futures_btc" { "btc" } else { "usdt" };
        let url = format!("https://api.gateio.ws/api/v4/futures/{settle}/candlesticks?contract={symbol}&interval=1m&limit=1");
        let body = pool.get_json(Exchange::Gateio, &url).await?;
        let rows = body.as_array().filter(|a| !a.is_empty()).ok_or(RestError::Status(204))?;
        let row = rows.first().expect("non-empty checked above");
        let open_secs = row.get("t").and_then(Value::as_i64).ok_or(RestError::Status(502))?;
        let open_time = Utc.timestamp_opt(open_secs, 0).single().ok_or(RestError::Status(502))?;
        let get = |field: &str| row.get(field).and_then(Value::as_str).unwrap_or("0").parse::<f64>().unwrap_or(0.0);

        Candle::new(Exchange::Gateio, contract_type, symbol, open_time, get("o"), get("h"), get("l"), get("c"), get("v"), 0, true)
            .map_err(|_| RestError::Status(502))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_spot_candlestick_update() {
        let raw = r#"{"time":1,"channel":"spot.candlesticks","event":"update","result":{"t":"1606292100","v":"2362.32035","c":"19128.1","h":"19128.1","l":"19128.1","o":"19128.1","n":"1m_BTC_USDT","w":"0.0001","a":"0.0001"}}"#;
        let candles = GateioConnector.parse_frame("spot", raw).unwrap();
        assert_eq!(candles.len(), 1);
        assert!(!candles[0].is_closed);
    }
}
