//! Top-level runtime configuration: one struct per concern, each with a
//! `Default` impl so a deployment only has to override what it cares about.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::executor::ExecutorConfig;
use crate::pool::ScalingThresholds;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub heartbeat_interval: Duration,
    pub tracing_enabled: bool,
    pub json_logs: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            tracing_enabled: true,
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestrationConfig {
    pub executor: ExecutorConfig,
    pub scaling: ScalingThresholds,
    pub monitoring: MonitoringConfig,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            scaling: ScalingThresholds::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

/// Installs the `tracing` subscriber used throughout this crate. Reads
/// `RUST_LOG` via `EnvFilter`.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
