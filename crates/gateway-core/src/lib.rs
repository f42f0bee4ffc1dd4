//! Market-data aggregation gateway: normalises candle streams from five
//! exchanges and fans them out to WebSocket subscribers (spec §1-§9).

pub mod config;
pub mod errors;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod normaliser;
pub mod session;
pub mod session_manager;
pub mod subscriber;

pub use config::{load_config, load_config_from, GatewayConfig};
pub use errors::GatewayError;
pub use http::AppState;
pub use metrics::GatewayMetrics;
pub use session_manager::SessionManager;

use std::sync::Arc;

/// Build the wired-together application state from a loaded config. Does
/// not bind any sockets; call [`lifecycle::run`] with the result to serve.
pub fn build(config: GatewayConfig) -> AppState {
    let metrics = Arc::new(GatewayMetrics::new());
    let session_manager = SessionManager::new(config.clone(), Arc::clone(&metrics));
    AppState { session_manager, metrics, config: Arc::new(config) }
}
