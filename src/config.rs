//! Configuration management for throttlegate.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{ConfigError, Result};
use crate::gate::GateOptions;
use crate::throttle::{PolicyConfig, PolicyTable};

/// Prefix for environment overrides, e.g. `THROTTLEGATE__STORE__TIMEOUT_MS=500`.
pub const ENV_PREFIX: &str = "THROTTLEGATE";

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleSettings {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreSettings,

    /// Default options for gates
    #[serde(default)]
    pub gate: GateOptions,

    /// Inline policy table
    #[serde(default)]
    pub policies: PolicyConfig,

    /// Path to a separate policy file
    #[serde(default)]
    pub policies_path: Option<String>,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Bound on each store call in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_store_timeout_ms() -> u64 {
    250
}

impl ThrottleSettings {
    /// Load settings from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let settings: ThrottleSettings = serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(settings)
    }

    /// Load settings from an optional YAML file layered with environment
    /// overrides under [`ENV_PREFIX`].
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Yaml));
        }

        let mut settings: ThrottleSettings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        // Keys are case-folded by the layered loader; action names are not.
        if let Some(path) = path {
            settings.policies = Self::from_file(path)?.policies;
        }

        info!(
            path = ?path,
            store_timeout_ms = settings.store.timeout_ms,
            on_store_error = ?settings.gate.on_store_error,
            "Configuration loaded"
        );
        Ok(settings)
    }

    /// Bound on each counter store call.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    /// Build the policy table: from `policies_path`, the inline `policies`,
    /// or the built-in defaults when neither is configured.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        match (&self.policies_path, self.policies.is_empty()) {
            (Some(_), false) => Err(ConfigError::Parse(
                "policies and policies_path are mutually exclusive".to_string(),
            )),
            (Some(path), true) => PolicyTable::from_file(path),
            (None, false) => PolicyTable::from_config(self.policies.clone()),
            (None, true) => {
                info!("No throttle policies configured, using built-in defaults");
                Ok(PolicyTable::defaults())
            }
        }
    }
}
