//! Configuration Module
//!
//! YAML-backed configuration for the registry and the storage peer daemon.
//! Every field has a serde default so a partial (or empty) config file is
//! valid; `validate()` catches the combinations that cannot work.

use crate::storage_target::CloudProvider;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Capacity unit used on the wire: decimal megabytes.
pub const MEGABYTE: u64 = 1_000_000;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// Cloud bucket targets, each backed by a local directory standing in for a
/// provider SDK client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudTargetsConfig {
    /// Providers enabled at startup (more can be toggled from the console)
    #[serde(default)]
    pub enabled: Vec<CloudProvider>,
    /// Backing directory for the AWS bucket target
    #[serde(default)]
    pub aws_dir: Option<PathBuf>,
    /// Backing directory for the Google bucket target
    #[serde(default)]
    pub google_dir: Option<PathBuf>,
}

/// Configuration for the registry node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Address the peer control listener binds to
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Directory holding persisted registry state
    #[serde(default = "default_registry_data_dir")]
    pub data_dir: PathBuf,
    /// Directory retrieved files are written to unless overridden per command
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    /// How often the health monitor scans for stale peers
    #[serde(with = "humantime_serde", default = "default_monitor_period")]
    pub monitor_period: Duration,
    /// Age past which a peer's last heartbeat marks it stale
    #[serde(with = "humantime_serde", default = "default_staleness_threshold")]
    pub staleness_threshold: Duration,
    /// How often the recovery sweep retries zombie deletes and drains fallback chunks
    #[serde(with = "humantime_serde", default = "default_zombie_sweep_interval")]
    pub zombie_sweep_interval: Duration,
    /// Upper bound on a single chunk transfer
    #[serde(with = "humantime_serde", default = "default_transfer_timeout")]
    pub transfer_timeout: Duration,
    /// Cloud bucket targets
    #[serde(default)]
    pub cloud: CloudTargetsConfig,
}

fn default_listen_address() -> String {
    "0.0.0.0:7400".to_string()
}

fn default_registry_data_dir() -> PathBuf {
    PathBuf::from("data/registry")
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_monitor_period() -> Duration {
    Duration::from_secs(5)
}

fn default_staleness_threshold() -> Duration {
    Duration::from_secs(15)
}

fn default_zombie_sweep_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_transfer_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            data_dir: default_registry_data_dir(),
            downloads_dir: default_downloads_dir(),
            monitor_period: default_monitor_period(),
            staleness_threshold: default_staleness_threshold(),
            zombie_sweep_interval: default_zombie_sweep_interval(),
            transfer_timeout: default_transfer_timeout(),
            cloud: CloudTargetsConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_address
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                reason: format!("listen_address '{}': {}", self.listen_address, e),
            })?;

        if self.monitor_period.is_zero() {
            return Err(ConfigError::Invalid {
                reason: "monitor_period must be greater than 0".to_string(),
            });
        }

        if self.staleness_threshold <= self.monitor_period {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "staleness_threshold ({:?}) must be greater than monitor_period ({:?})",
                    self.staleness_threshold, self.monitor_period
                ),
            });
        }

        if self.zombie_sweep_interval.is_zero() {
            return Err(ConfigError::Invalid {
                reason: "zombie_sweep_interval must be greater than 0".to_string(),
            });
        }

        if self.transfer_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                reason: "transfer_timeout must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Durable approved peer id set
    pub fn approved_peers_path(&self) -> PathBuf {
        self.data_dir.join("approved_peers.json")
    }

    /// Persisted file/chunk/target mapping
    pub fn mapping_path(&self) -> PathBuf {
        self.data_dir.join("mapping.json")
    }

    /// Local store for fragments with no reachable target
    pub fn fallback_dir(&self) -> PathBuf {
        self.data_dir.join("fallback")
    }

    /// Backing directory for a cloud bucket target
    pub fn cloud_dir(&self, provider: CloudProvider) -> PathBuf {
        let configured = match provider {
            CloudProvider::Aws => self.cloud.aws_dir.clone(),
            CloudProvider::Google => self.cloud.google_dir.clone(),
        };
        configured.unwrap_or_else(|| self.data_dir.join("cloud").join(provider.to_string()))
    }
}

/// Configuration for a storage peer daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerNodeConfig {
    /// Registry control address to dial
    #[serde(default = "default_registry_address")]
    pub registry_address: String,
    /// Root directory for peer state; each instance keeps its own subtree
    #[serde(default = "default_peer_data_dir")]
    pub data_dir: PathBuf,
    /// Instance number, for running several peers on one host
    #[serde(default)]
    pub instance: u32,
    /// Hostname advertised to the registry; `$HOSTNAME` when unset
    #[serde(default)]
    pub hostname: Option<String>,
    /// Storage capacity advertised to the registry (MB)
    #[serde(default = "default_capacity_mb")]
    pub capacity_mb: u64,
    /// Interval between heartbeats once connected
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    /// Delay between registry connection attempts while unapproved or disconnected
    #[serde(with = "humantime_serde", default = "default_reconnect_interval")]
    pub reconnect_interval: Duration,
    /// Address the chunk transfer listener binds to (port 0 picks an ephemeral port)
    #[serde(default = "default_transfer_listen_address")]
    pub transfer_listen_address: String,
}

fn default_registry_address() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_peer_data_dir() -> PathBuf {
    PathBuf::from("data/peer")
}

fn default_capacity_mb() -> u64 {
    1024
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_transfer_listen_address() -> String {
    "0.0.0.0:0".to_string()
}

impl Default for PeerNodeConfig {
    fn default() -> Self {
        Self {
            registry_address: default_registry_address(),
            data_dir: default_peer_data_dir(),
            instance: 0,
            hostname: None,
            capacity_mb: default_capacity_mb(),
            heartbeat_interval: default_heartbeat_interval(),
            reconnect_interval: default_reconnect_interval(),
            transfer_listen_address: default_transfer_listen_address(),
        }
    }
}

impl PeerNodeConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry_address
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                reason: format!("registry_address '{}': {}", self.registry_address, e),
            })?;

        self.transfer_listen_address
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                reason: format!(
                    "transfer_listen_address '{}': {}",
                    self.transfer_listen_address, e
                ),
            })?;

        if self.capacity_mb == 0 {
            return Err(ConfigError::Invalid {
                reason: "capacity_mb must be greater than 0".to_string(),
            });
        }

        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                reason: "heartbeat_interval must be greater than 0".to_string(),
            });
        }

        if self.reconnect_interval.is_zero() {
            return Err(ConfigError::Invalid {
                reason: "reconnect_interval must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Per-instance state directory
    pub fn instance_dir(&self) -> PathBuf {
        self.data_dir.join(format!("instance-{}", self.instance))
    }

    /// Directory chunk files are stored in
    pub fn storage_dir(&self) -> PathBuf {
        self.instance_dir().join("chunks")
    }

    /// Saved registry-issued identity
    pub fn identity_path(&self) -> PathBuf {
        self.instance_dir().join("identity.json")
    }

    /// Advertised capacity in bytes
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_mb * MEGABYTE
    }

    /// Hostname to advertise: configured value, else `$HOSTNAME`, else "localhost"
    pub fn effective_hostname(&self) -> String {
        if let Some(name) = &self.hostname {
            if !name.is_empty() {
                return name.clone();
            }
        }
        match std::env::var("HOSTNAME") {
            Ok(name) if !name.is_empty() => name,
            _ => "localhost".to_string(),
        }
    }
}
