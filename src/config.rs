// Configuration schema for the traffic manager.
// Numan Thabit 2025

use std::{
    env, fs,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use thiserror::Error;

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Startup configuration for a [`TrafficManager`](crate::tm::TrafficManager).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TmConfig {
    /// Number of egress ports served by the switch.
    pub egress_ports: u32,
    /// Payload capacity of each per-port pool queue.
    pub pool_capacity_per_port: usize,
    /// Dequeue worker shards; zero means one shard per egress port.
    pub nb_workers: usize,
    /// Reconfiguration listener settings.
    pub config_server: ServerConfig,
    /// When set, every node dumps per-packet CSV logs.
    pub debug_dump: bool,
    /// Directory the CSV dumps are written to.
    pub dump_dir: PathBuf,
}

impl Default for TmConfig {
    fn default() -> Self {
        Self {
            egress_ports: 4,
            pool_capacity_per_port: 1024,
            nb_workers: 0,
            config_server: ServerConfig::default(),
            debug_dump: false,
            dump_dir: PathBuf::from("."),
        }
    }
}

impl TmConfig {
    /// Loads configuration from `NUMITM_CONFIG` if set, otherwise returns
    /// defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var("NUMITM_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_missing) => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Effective number of dequeue worker shards.
    pub fn workers(&self) -> usize {
        if self.nb_workers == 0 {
            self.egress_ports as usize
        } else {
            self.nb_workers
        }
    }

    /// Validates the configuration, returning an error when constraints are
    /// violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.egress_ports == 0 {
            return Err(ConfigError::Validation(
                "egress_ports must be non-zero".into(),
            ));
        }
        if self.pool_capacity_per_port == 0 {
            return Err(ConfigError::Validation(
                "pool_capacity_per_port must be non-zero".into(),
            ));
        }
        if self.workers() > self.egress_ports as usize {
            return Err(ConfigError::Validation(
                "nb_workers must not exceed egress_ports".into(),
            ));
        }
        self.config_server.validate()?;
        Ok(())
    }
}

impl FromStr for TmConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Reconfiguration listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Whether the TCP listener is started at all.
    pub enabled: bool,
    /// Address the listener binds to.
    pub bind_addr: String,
    /// Listener port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "0.0.0.0".into(),
            port: 41200,
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.bind_addr.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "config_server.bind_addr '{}' is not an IP address",
                self.bind_addr
            )));
        }
        Ok(())
    }
}
