//! Top-level error glue for the gateway binary's bring-up path.
//!
//! Fatal bring-up errors terminate the process with a non-zero exit code
//! before accepting any subscriber (spec §6.5, §7).

use crate::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {address}: {source}")]
    Bind { address: String, #[source] source: std::io::Error },
}

impl GatewayError {
    /// Process exit code per spec §6.5.
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::Config(_) => 1,
            GatewayError::Bind { .. } => 2,
        }
    }
}
