use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Market-data aggregation gateway.
///
/// All configuration normally comes from `CONNECTOR_*` environment
/// variables (see the README); these flags exist for quick overrides at
/// the command line without exporting an env var.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Override CONNECTOR_WS_PORT.
    #[arg(long)]
    ws_port: Option<u16>,

    /// Override CONNECTOR_WSS_HEALTH_CHECK_PORT.
    #[arg(long)]
    health_check_port: Option<u16>,

    /// Override CONNECTOR_LOG_LEVEL.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match gateway_core::load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(gateway_core::GatewayError::Config(e).exit_code());
        }
    };

    if let Some(ws_port) = args.ws_port {
        config.ws_port = ws_port;
    }
    if let Some(health_check_port) = args.health_check_port {
        config.health_check_port = health_check_port;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }

    // RUST_LOG wins when set; CONNECTOR_LOG_LEVEL (or --log-level) is the
    // fallback default.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(ws_port = config.ws_port, health_check_port = config.health_check_port, "starting gateway");

    let state = gateway_core::build(config);
    if let Err(e) = gateway_core::lifecycle::run(state).await {
        error!(error = %e, "gateway exited with an error");
        std::process::exit(e.exit_code());
    }
}
