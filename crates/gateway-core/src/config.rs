//! Gateway configuration loading.
//!
//! Environment variables are the sole config source (spec §6.4); every
//! recognised option is prefixed `CONNECTOR_`. All fields have defaults,
//! so an unconfigured process still starts.

use circuit_breaker::BreakerConfig;
use dedup::DedupConfig;
use queue::QueueConfig;
use rest_pool::RestPoolConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ws_host: String,
    pub ws_port: u16,
    pub health_check_port: u16,
    pub health_check_enabled: bool,
    pub inactivity_timeout: Duration,
    pub reconnect_delay: Duration,
    pub ws_ping_interval: Duration,
    pub ws_ping_timeout: Duration,
    pub max_symbol_per_ws: usize,
    pub max_conn_per_exchange: Option<usize>,
    pub breaker: BreakerConfig,
    pub queue: QueueConfig,
    pub dedup: DedupConfig,
    pub rest_pool: RestPoolConfig,
    pub subscriber_buffer_max: usize,
    pub overflow_policy: OverflowPolicy,
    pub drain_timeout: Duration,
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    Close,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            ws_host: "0.0.0.0".to_owned(),
            ws_port: 8765,
            health_check_port: 8766,
            health_check_enabled: true,
            inactivity_timeout: Duration::from_secs_f64(3.0),
            reconnect_delay: Duration::from_secs_f64(1.0),
            ws_ping_interval: Duration::from_secs(20),
            ws_ping_timeout: Duration::from_secs(20),
            max_symbol_per_ws: 50,
            max_conn_per_exchange: None,
            breaker: BreakerConfig::default(),
            queue: QueueConfig::default(),
            dedup: DedupConfig::default(),
            rest_pool: RestPoolConfig::default(),
            subscriber_buffer_max: 1_000,
            overflow_policy: OverflowPolicy::DropOldest,
            drain_timeout: Duration::from_secs(10),
            log_level: "INFO".to_owned(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Parse(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(s) => write!(f, "failed to parse environment variable: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load configuration from the process environment. Never reads files;
/// every field not present in the environment falls back to its default.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from(|key| std::env::var(key).ok())
}

/// Testable entry point: config loading parameterised by a variable lookup
/// function so tests don't need to mutate the real process environment.
pub fn load_config_from(lookup: impl Fn(&str) -> Option<String>) -> Result<GatewayConfig, ConfigError> {
    let mut cfg = GatewayConfig::default();

    if let Some(v) = lookup("CONNECTOR_WS_HOST") {
        cfg.ws_host = v;
    }
    if let Some(v) = parse_opt::<u16>(&lookup, "CONNECTOR_WS_PORT")? {
        cfg.ws_port = v;
    }
    if let Some(v) = parse_opt::<u16>(&lookup, "CONNECTOR_WSS_HEALTH_CHECK_PORT")? {
        cfg.health_check_port = v;
    }
    if let Some(v) = parse_opt::<bool>(&lookup, "CONNECTOR_WSS_HEALTH_CHECK_ENABLED")? {
        cfg.health_check_enabled = v;
    }
    if let Some(v) = parse_secs(&lookup, "CONNECTOR_INACTIVITY_TIMEOUT")? {
        cfg.inactivity_timeout = v;
    }
    if let Some(v) = parse_secs(&lookup, "CONNECTOR_RECONNECT_DELAY")? {
        cfg.reconnect_delay = v;
    }
    if let Some(v) = parse_secs(&lookup, "CONNECTOR_REST_TIMEOUT")? {
        cfg.rest_pool.rest_timeout = v;
    }
    if let Some(v) = parse_secs(&lookup, "CONNECTOR_WS_PING_INTERVAL")? {
        cfg.ws_ping_interval = v;
    }
    if let Some(v) = parse_secs(&lookup, "CONNECTOR_WS_PING_TIMEOUT")? {
        cfg.ws_ping_timeout = v;
    }
    if let Some(v) = parse_opt::<usize>(&lookup, "CONNECTOR_MAX_SYMBOL_PER_WS")? {
        cfg.max_symbol_per_ws = v;
    }
    if let Some(v) = parse_opt::<usize>(&lookup, "CONNECTOR_MAX_CONN_PER_EXCHANGE")? {
        cfg.max_conn_per_exchange = Some(v);
    }
    if let Some(v) = parse_opt::<u32>(&lookup, "CONNECTOR_CIRCUIT_BREAKER_FAILURE_THRESHOLD")? {
        cfg.breaker.failure_threshold = v;
    }
    if let Some(v) = parse_secs(&lookup, "CONNECTOR_CIRCUIT_BREAKER_RECOVERY_TIMEOUT")? {
        cfg.breaker.base_backoff = v;
    }
    if let Some(v) = parse_opt::<u32>(&lookup, "CONNECTOR_CIRCUIT_BREAKER_HALF_OPEN_CALLS")? {
        cfg.breaker.half_open_calls = v;
    }
    if let Some(v) = parse_opt::<usize>(&lookup, "CONNECTOR_CLOSED_QUEUE_MAXSIZE")? {
        cfg.queue.closed_capacity = v;
    }
    if let Some(v) = parse_opt::<usize>(&lookup, "CONNECTOR_OPEN_QUEUE_MAXSIZE")? {
        cfg.queue.open_capacity = v;
    }
    if let Some(v) = parse_secs(&lookup, "CONNECTOR_DEDUPLICATION_WINDOW_SECONDS")? {
        cfg.dedup.window = v;
    }
    if let Some(v) = parse_opt::<usize>(&lookup, "CONNECTOR_DEDUPLICATION_MAX_ENTRIES")? {
        cfg.dedup.max_entries = v;
    }
    if let Some(v) = parse_opt::<usize>(&lookup, "CONNECTOR_REST_POOL_CONNECTIONS")? {
        cfg.rest_pool.connections_per_host = v;
    }
    if let Some(v) = parse_opt::<usize>(&lookup, "CONNECTOR_REST_POOL_MAXSIZE")? {
        // MAXSIZE bounds concurrent in-flight backfills; modelled as the
        // same per-host pool size knob as CONNECTIONS in this port.
        cfg.rest_pool.connections_per_host = cfg.rest_pool.connections_per_host.max(v);
    }
    if let Some(v) = parse_opt::<usize>(&lookup, "CONNECTOR_SUBSCRIBER_BUFFER_MAX")? {
        cfg.subscriber_buffer_max = v;
    }
    if let Some(v) = lookup("CONNECTOR_OVERFLOW_POLICY") {
        cfg.overflow_policy = match v.as_str() {
            "drop_oldest" => OverflowPolicy::DropOldest,
            "close" => OverflowPolicy::Close,
            other => return Err(ConfigError::InvalidValue(format!("CONNECTOR_OVERFLOW_POLICY must be 'drop_oldest' or 'close', got '{other}'"))),
        };
    }
    if let Some(v) = parse_secs(&lookup, "CONNECTOR_DRAIN_TIMEOUT")? {
        cfg.drain_timeout = v;
    }
    if let Some(v) = lookup("CONNECTOR_LOG_LEVEL") {
        cfg.log_level = v;
    }

    Ok(cfg)
}

fn parse_opt<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| ConfigError::Parse(format!("{key}='{raw}'"))),
        None => Ok(None),
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>, ConfigError> {
    match parse_opt::<f64>(lookup, key)? {
        Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
        Some(secs) => Err(ConfigError::InvalidValue(format!("{key}={secs} must be a non-negative number"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let cfg = load_config_from(env(&[])).unwrap();
        assert_eq!(cfg.ws_port, 8765);
        assert_eq!(cfg.max_symbol_per_ws, 50);
    }

    #[test]
    fn overrides_apply_when_present() {
        let cfg = load_config_from(env(&[("CONNECTOR_WS_PORT", "9000"), ("CONNECTOR_MAX_SYMBOL_PER_WS", "10")])).unwrap();
        assert_eq!(cfg.ws_port, 9000);
        assert_eq!(cfg.max_symbol_per_ws, 10);
    }

    #[test]
    fn rejects_unparseable_values() {
        let err = load_config_from(env(&[("CONNECTOR_WS_PORT", "not-a-port")])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_unknown_overflow_policy() {
        let err = load_config_from(env(&[("CONNECTOR_OVERFLOW_POLICY", "bogus")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }
}
