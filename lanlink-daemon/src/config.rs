//! Daemon Configuration
//!
//! TOML configuration for the LAN Link daemon, stored under the user's
//! config directory. A missing file is replaced with defaults and written
//! back, which also pins the generated device id for future sessions.

use anyhow::{Context, Result};
use lanlink_protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device identity
    pub device: DeviceConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Storage paths
    pub paths: PathConfig,
}

/// Device identity announced to peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name
    pub name: String,

    /// Stable device id; generated and saved on first start
    pub device_id: String,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP port for the connection server and for dialing peers
    #[serde(default = "default_port")]
    pub port: u16,

    /// Subnets to sweep during discovery, in `a.b.c.d/len` notation
    #[serde(default)]
    pub subnets: Vec<String>,

    /// Discovery probe fan-out width
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Discovery probe timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Transfer chunk size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u64,

    /// Accept inbound remote-command channels. Leave off unless you trust
    /// every host on the listed subnets.
    #[serde(default)]
    pub enable_remote_exec: bool,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Destination for received files
    pub inbox_dir: PathBuf,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_connections() -> usize {
    20
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_buffer_size() -> u64 {
    1024
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            subnets: Vec::new(),
            max_connections: default_max_connections(),
            timeout_ms: default_timeout_ms(),
            buffer_size: default_buffer_size(),
            enable_remote_exec: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("lanlink");

        let inbox_dir = dirs::download_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lanlink");

        Self {
            device: DeviceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                device_id: Uuid::new_v4().to_string(),
            },
            network: NetworkConfig::default(),
            paths: PathConfig {
                config_dir,
                inbox_dir,
            },
        }
    }
}

impl Config {
    /// Load configuration from file, creating the default if not found
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("lanlink");

        let config_path = config_dir.join("config.toml");

        if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;

        let config_path = self.paths.config_dir.join("config.toml");
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&config_path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.inbox_dir)
            .context("Failed to create inbox directory")?;
        Ok(())
    }

    /// Build the protocol-core settings from this daemon configuration
    pub fn core_config(&self) -> lanlink_protocol::Config {
        lanlink_protocol::Config {
            device_id: self.device.device_id.clone(),
            device_name: self.device.name.clone(),
            os: std::env::consts::OS.to_string(),
            inbox_dir: self.paths.inbox_dir.clone(),
            port: self.network.port,
            max_connections: self.network.max_connections,
            timeout_ms: self.network.timeout_ms,
            buffer_size: self.network.buffer_size,
            subnets: self.network.subnets.clone(),
            enable_remote_exec: self.network.enable_remote_exec,
        }
    }
}
