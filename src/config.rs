use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::coordination::{DEFAULT_CREATE_OR_SET_LIMIT, DEFAULT_DIRTY_ROOT};
use crate::convergence::DEFAULT_BUILD_TIMEOUT_SECONDS;
use crate::events::DEFAULT_MAX_EVENT_LENGTH;

/// Base name of the optional configuration file
pub const CONFIG_FILE_STEM: &str = "autoscale-converge";
/// Prefix of environment overrides, e.g. `AUTOSCALE_CONVERGE__WORKER__ID`
pub const ENV_PREFIX: &str = "AUTOSCALE_CONVERGE";

/// Main configuration structure for the convergence worker
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConvergeConfig {
    /// Coordination store layout and retry bounds
    pub coordination: CoordinationConfig,
    /// Planner settings
    pub convergence: ConvergenceConfig,
    /// Identity of this worker process
    pub worker: WorkerConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CoordinationConfig {
    /// Parent of the per-group lock nodes
    pub lock_root: String,
    /// Parent of the per-group dirty flags
    pub dirty_root: String,
    /// Interval between rank checks while waiting for a lock
    pub poll_interval_ms: u64,
    /// Bound on create-or-set restarts
    pub create_or_set_retry_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConvergenceConfig {
    /// Servers building this long are replaced
    pub build_timeout_seconds: i64,
    /// Network whose address is registered on load balancers
    pub address_network: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Written into lock nodes; defaults to the host name
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Serialized size above which events are split
    pub max_event_length: usize,
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            coordination: CoordinationConfig {
                lock_root: "/locks/convergence".to_string(),
                dirty_root: DEFAULT_DIRTY_ROOT.to_string(),
                poll_interval_ms: 100,
                create_or_set_retry_limit: DEFAULT_CREATE_OR_SET_LIMIT,
            },
            convergence: ConvergenceConfig {
                build_timeout_seconds: DEFAULT_BUILD_TIMEOUT_SECONDS,
                address_network: "private".to_string(),
            },
            worker: WorkerConfig {
                id: default_worker_id(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                max_event_length: DEFAULT_MAX_EVENT_LENGTH,
            },
        }
    }
}

fn default_worker_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "worker".to_string())
}

impl CoordinationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ConvergenceConfig {
    pub fn build_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.build_timeout_seconds)
    }
}

impl ConvergeConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (autoscale-converge.toml)
    /// 3. Environment variables (prefixed with AUTOSCALE_CONVERGE__)
    pub fn load() -> Result<Self> {
        let file = Path::new(CONFIG_FILE_STEM).with_extension("toml");
        Self::load_from(file.exists().then_some(file.as_path()))
    }

    /// Same layering as `load`, with an explicit file
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&ConvergeConfig::default())?);

        if let Some(file) = file {
            builder = builder.add_source(File::from(file));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<ConvergeConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = ConvergeConfig::load_env_file();
        ConvergeConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static ConvergeConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}
