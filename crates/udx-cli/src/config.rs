//! Configuration system for the UDX CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use udx_core::UdxConfig;

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Engine tunables
    #[serde(default)]
    pub udx: UdxConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address `udx listen` binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Address `udx connect` binds to
    #[serde(default = "default_connect_bind")]
    pub connect_bind: String,
    /// Stream id the listener answers to
    #[serde(default = "default_listen_id")]
    pub listen_id: u32,
    /// Stream id the connecting side answers to
    #[serde(default = "default_connect_id")]
    pub connect_id: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Command-line values that override the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Default TTL
    pub ttl: Option<u32>,
    /// Upper bound for path MTU probing
    pub mtu_max: Option<u16>,
    /// Log level
    pub log_level: Option<String>,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:40000".to_string()
}

fn default_connect_bind() -> String {
    "0.0.0.0:0".to_string()
}

fn default_listen_id() -> u32 {
    1
}

fn default_connect_id() -> u32 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_bind: default_connect_bind(),
            listen_id: default_listen_id(),
            connect_id: default_connect_id(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("udx/config.toml")
    }

    /// Load `path` if given, else the default path if it exists, else defaults.
    ///
    /// An explicit path that does not exist is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or parsing the config fails.
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Apply command-line overrides on top of the loaded values
    pub fn merge(&mut self, overrides: &Overrides) {
        if let Some(ttl) = overrides.ttl {
            self.udx.ttl = ttl;
        }
        if let Some(mtu_max) = overrides.mtu_max {
            self.udx.mtu_max = mtu_max;
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level.clone_from(level);
        }
    }

    /// Render the effective configuration
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.listen_addr.parse()?)
    }

    /// Parse the connect-side bind address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_connect_bind(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.connect_bind.parse()?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;
        self.parse_connect_bind()?;

        if self.network.listen_id == self.network.connect_id {
            anyhow::bail!(
                "listen_id and connect_id must differ (both {})",
                self.network.listen_id
            );
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.udx.validate()?;
        Ok(())
    }
}
