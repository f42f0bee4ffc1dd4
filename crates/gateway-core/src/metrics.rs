//! Metrics + health surface (spec §4.9).
//!
//! A single process-wide `prometheus::Registry` is the one sanctioned
//! singleton in this codebase (spec §9: "an implementation must not use
//! process-wide singletons except for the stateless metrics registry");
//! every other piece of shared state is constructed once and explicitly
//! injected into the session manager at startup.

use prometheus::{CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

pub struct GatewayMetrics {
    registry: Registry,
    pub quotes_processed_total: CounterVec,
    pub connection_errors_total: CounterVec,
    pub reconnections_total: CounterVec,
    pub rest_backfills_total: CounterVec,
    pub queue_blocking_events_total: CounterVec,
    pub duplicates_filtered_total: CounterVec,
    pub parse_errors_total: CounterVec,
    pub subscriber_backpressure_total: CounterVec,
    pub active_connections: GaugeVec,
    pub queue_depth_closed: GaugeVec,
    pub queue_depth_open: GaugeVec,
    pub circuit_breaker_state: GaugeVec,
    pub quote_latency_seconds: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let quotes_processed_total = CounterVec::new(
            Opts::new("quotes_processed_total", "Candles processed, closed and open"),
            &["exchange", "contract_type", "is_closed"],
        )
        .expect("valid metric");
        let connection_errors_total =
            CounterVec::new(Opts::new("connection_errors_total", "Upstream connection errors"), &["exchange", "kind"]).expect("valid metric");
        let reconnections_total =
            CounterVec::new(Opts::new("reconnections_total", "Upstream reconnect attempts"), &["exchange"]).expect("valid metric");
        let rest_backfills_total =
            CounterVec::new(Opts::new("rest_backfills_total", "REST backfill calls"), &["exchange", "outcome"]).expect("valid metric");
        let queue_blocking_events_total =
            CounterVec::new(Opts::new("queue_blocking_events_total", "Producer blocked on a full closed queue"), &["exchange"]).expect("valid metric");
        let duplicates_filtered_total =
            CounterVec::new(Opts::new("duplicates_filtered_total", "Candles suppressed by the deduplicator"), &["exchange"]).expect("valid metric");
        let parse_errors_total =
            CounterVec::new(Opts::new("parse_errors_total", "Frames dropped for failing to parse"), &["exchange"]).expect("valid metric");
        let subscriber_backpressure_total = CounterVec::new(
            Opts::new("subscriber_backpressure_total", "Subscriber outbound buffer overflow events"),
            &["policy"],
        )
        .expect("valid metric");
        let active_connections =
            GaugeVec::new(Opts::new("active_connections", "Live upstream WebSocket sessions"), &["exchange", "contract_type"]).expect("valid metric");
        let queue_depth_closed =
            GaugeVec::new(Opts::new("queue_depth_closed", "Closed-pipeline queue depth"), &["exchange", "contract_type"]).expect("valid metric");
        let queue_depth_open =
            GaugeVec::new(Opts::new("queue_depth_open", "Open-pipeline queue depth"), &["exchange", "contract_type"]).expect("valid metric");
        let circuit_breaker_state = GaugeVec::new(
            Opts::new("circuit_breaker_state", "0=closed 1=open 2=half_open"),
            &["exchange", "contract_type"],
        )
        .expect("valid metric");
        let quote_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "quote_latency_seconds",
            "Seconds from frame receipt to enqueue-on-last-subscriber",
        ))
        .expect("valid metric");

        for c in [&quotes_processed_total, &connection_errors_total, &reconnections_total, &rest_backfills_total, &queue_blocking_events_total, &duplicates_filtered_total, &parse_errors_total, &subscriber_backpressure_total] {
            registry.register(Box::new(c.clone())).expect("metric registration");
        }
        for g in [&active_connections, &queue_depth_closed, &queue_depth_open, &circuit_breaker_state] {
            registry.register(Box::new(g.clone())).expect("metric registration");
        }
        registry.register(Box::new(quote_latency_seconds.clone())).expect("metric registration");

        GatewayMetrics {
            registry,
            quotes_processed_total,
            connection_errors_total,
            reconnections_total,
            rest_backfills_total,
            queue_blocking_events_total,
            duplicates_filtered_total,
            parse_errors_total,
            subscriber_backpressure_total,
            active_connections,
            queue_depth_closed,
            queue_depth_open,
            circuit_breaker_state,
            quote_latency_seconds,
        }
    }

    /// Render the registry in Prometheus text exposition format (spec §6.2).
    pub fn encode(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf).expect("prometheus encoding never fails for well-formed metrics");
        String::from_utf8(buf).expect("prometheus text encoder emits valid UTF-8")
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_families() {
        let m = GatewayMetrics::new();
        m.quotes_processed_total.with_label_values(&["binance", "spot", "true"]).inc();
        let text = m.encode();
        assert!(text.contains("quotes_processed_total"));
    }
}
