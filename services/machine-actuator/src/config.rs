//! Configuration for the machine actuator binary.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Actuator binary configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON manifest with the cluster and its machines.
    pub manifest_path: PathBuf,

    /// Number of reconciliation passes to run.
    pub passes: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let manifest_path = std::env::var("CAPX_MANIFEST")
            .unwrap_or_else(|_| "machines.json".to_string())
            .into();

        let passes = match std::env::var("CAPX_PASSES") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid CAPX_PASSES value {raw:?}"))?,
            Err(_) => 2,
        };

        let log_level = std::env::var("CAPX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            manifest_path,
            passes,
            log_level,
        })
    }
}
