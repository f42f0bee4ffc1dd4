// rest-pool: per-exchange HTTP/2 connection pool for REST backfill (spec §4.4).
//
// One `reqwest::Client` is built per exchange at startup so that each
// upstream gets its own connection pool and cannot starve the others.
// Exchange-specific URL construction and response parsing live in the
// `connectors` crate; this crate only owns pooling, timeouts, and the
// generic HTTP error classification shared by every connector.

use candle_protocol::Exchange;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy)]
pub struct RestPoolConfig {
    pub connections_per_host: usize,
    pub rest_timeout: Duration,
}

impl Default for RestPoolConfig {
    fn default() -> Self {
        RestPoolConfig {
            connections_per_host: 4,
            rest_timeout: Duration::from_secs_f64(5.0),
        }
    }
}

#[derive(Debug, Error)]
pub enum RestError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("response body was not valid JSON: {0}")]
    InvalidJson(serde_json::Error),
}

/// Holds one pooled HTTP/2 client per exchange.
pub struct RestPool {
    clients: HashMap<Exchange, reqwest::Client>,
}

impl RestPool {
    pub fn new(cfg: RestPoolConfig) -> Self {
        let clients = Exchange::ALL
            .into_iter()
            .map(|exchange| {
                let client = reqwest::Client::builder()
                    .timeout(cfg.rest_timeout)
                    .pool_max_idle_per_host(cfg.connections_per_host)
                    .build()
                    .unwrap_or_else(|e| panic!("failed to build REST client for {exchange}: {e}"));
                (exchange, client)
            })
            .collect();
        RestPool { clients }
    }

    pub fn client_for(&self, exchange: Exchange) -> &reqwest::Client {
        self.clients
            .get(&exchange)
            .unwrap_or_else(|| panic!("no REST client provisioned for {exchange}"))
    }

    /// Issue a GET request against `url` using the pool belonging to
    /// `exchange` and parse the body as JSON, classifying common upstream
    /// failure modes.
    pub async fn get_json(&self, exchange: Exchange, url: &str) -> Result<serde_json::Value, RestError> {
        let resp = match self.client_for(exchange).get(url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(RestError::Timeout),
            Err(e) => return Err(RestError::Transport(e)),
        };

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(RestError::RateLimited);
        }
        if !status.is_success() {
            return Err(RestError::Status(status.as_u16()));
        }

        let bytes = resp.bytes().await.map_err(RestError::Transport)?;
        serde_json::from_slice(&bytes).map_err(RestError::InvalidJson)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisions_a_client_per_exchange() {
        let pool = RestPool::new(RestPoolConfig::default());
        for exchange in Exchange::ALL {
            let _ = pool.client_for(exchange);
        }
    }
}
