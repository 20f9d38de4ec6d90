//! Service configuration

use anyhow::{Context, Result};
use driver_lib::kernel::SimulatedKernelConfig;
use driver_lib::{DriverConfig, TemplateRegistration};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Service configuration, read from `WORKLOAD_DRIVER_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// API server port for health, metrics and workload control
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Simulated length of one tick in seconds
    #[serde(default = "default_tick_duration")]
    pub tick_duration_secs: u64,

    /// Real time per simulated time
    #[serde(default = "default_timescale_adjustment_factor")]
    pub timescale_adjustment_factor: f64,

    /// Fraction of sessions sampled when a registration does not say
    #[serde(default = "default_sessions_sample_percentage")]
    pub sessions_sample_percentage: f64,

    /// Interval between statistics snapshots in seconds
    #[serde(default = "default_push_interval")]
    pub push_interval_secs: u64,

    /// Latency of session creation in the simulated kernel
    #[serde(default = "default_simulated_create_latency")]
    pub simulated_create_latency_ms: u64,

    /// Maximum concurrent sessions in the simulated kernel
    #[serde(default)]
    pub simulated_capacity: Option<usize>,

    /// Template workload registered at startup
    #[serde(default)]
    pub template_path: Option<String>,
}

fn default_api_port() -> u16 {
    8080
}

fn default_tick_duration() -> u64 {
    60
}

fn default_timescale_adjustment_factor() -> f64 {
    1.0
}

fn default_sessions_sample_percentage() -> f64 {
    1.0
}

fn default_push_interval() -> u64 {
    5
}

fn default_simulated_create_latency() -> u64 {
    50
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            tick_duration_secs: default_tick_duration(),
            timescale_adjustment_factor: default_timescale_adjustment_factor(),
            sessions_sample_percentage: default_sessions_sample_percentage(),
            push_interval_secs: default_push_interval(),
            simulated_create_latency_ms: default_simulated_create_latency(),
            simulated_capacity: None,
            template_path: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("WORKLOAD_DRIVER"))
            .build()
            .context("failed to read configuration from the environment")?;

        config
            .try_deserialize()
            .context("invalid WORKLOAD_DRIVER_* configuration")
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            tick_duration: chrono::Duration::seconds(self.tick_duration_secs.max(1) as i64),
            timescale_adjustment_factor: self.timescale_adjustment_factor,
            ..Default::default()
        }
    }

    pub fn simulated_kernel_config(&self) -> SimulatedKernelConfig {
        SimulatedKernelConfig {
            create_latency: Duration::from_millis(self.simulated_create_latency_ms),
            capacity: self.simulated_capacity,
        }
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs.max(1))
    }
}

/// Read a template registration from a JSON file
pub fn load_template(path: impl AsRef<Path>) -> Result<TemplateRegistration> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read template {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse template {}", path.display()))
}
