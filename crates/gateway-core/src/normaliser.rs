//! Normaliser (spec §4.6): wraps a connector's pure `parse_frame` with the
//! logging-and-counting required of a production call site. Parse errors
//! never propagate to subscribers — they are fate-isolated to the frame
//! that caused them, since a single shared session carries many symbols.

use crate::metrics::GatewayMetrics;
use candle_protocol::{Candle, Exchange};
use connectors::ExchangeConnector;

pub fn normalise_frame(
    connector: &dyn ExchangeConnector,
    contract_type: &str,
    raw: &str,
    metrics: &GatewayMetrics,
) -> Vec<Candle> {
    match connector.parse_frame(contract_type, raw) {
        Ok(candles) => candles,
        Err(err) => {
            let exchange = connector.exchange();
            tracing::debug!(%exchange, contract_type, error = %err, "dropping frame: parse error");
            metrics.parse_errors_total.with_label_values(&[exchange.as_str()]).inc();
            Vec::new()
        }
    }
}

pub fn record_processed(metrics: &GatewayMetrics, exchange: Exchange, contract_type: &str, candle: &Candle) {
    metrics
        .quotes_processed_total
        .with_label_values(&[exchange.as_str(), contract_type, if candle.is_closed { "true" } else { "false" }])
        .inc();
}
