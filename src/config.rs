//! Configuration for service-link

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::descriptor::ConnectionDescriptor;
use crate::error::{LinkError, Result};

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// How long a caller waits for a channel before the bind attempt is
    /// abandoned, in milliseconds. A remote that keeps crashing may be
    /// respawned with an OS-level backoff well above 10 seconds.
    #[serde(default = "default_bind_timeout_ms")]
    pub bind_timeout_ms: u64,

    /// Target service, when the connection is built from a config file
    #[serde(default)]
    pub descriptor: Option<ConnectionDescriptor>,
}

fn default_bind_timeout_ms() -> u64 {
    60_000
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bind_timeout_ms: default_bind_timeout_ms(),
            descriptor: None,
        }
    }
}

impl LinkConfig {
    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| LinkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| LinkError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_timeout_ms == 0 {
            return Err(LinkError::Config("bind_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn with_bind_timeout(mut self, timeout: Duration) -> Self {
        self.bind_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}
