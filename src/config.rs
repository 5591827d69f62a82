//! Server configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::identity::KeyAlgorithm;
use crate::paths;

/// Default idle limit handed to the transport: 20 minutes
const DEFAULT_INACTIVITY_SECS: u64 = 20 * 60;

/// Server configuration
///
/// Loaded from a TOML file; every field is optional there.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SSH listen address
    pub listen_addr: SocketAddr,
    /// Path to server host key
    pub host_key_path: PathBuf,
    /// Algorithm used when a host key has to be generated
    pub host_key_algorithm: KeyAlgorithm,
    /// Drop connections that have not authenticated within this many seconds
    pub handshake_timeout_secs: Option<u64>,
    /// Drop connections idle for this many seconds
    pub inactivity_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 2222)),
            host_key_path: PathBuf::from(paths::DEFAULT_HOST_KEY),
            host_key_algorithm: KeyAlgorithm::default(),
            handshake_timeout_secs: None,
            inactivity_timeout_secs: Some(DEFAULT_INACTIVITY_SECS),
        }
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults if it is missing
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("config not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse config from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `LINESHELL_*` environment overrides on top of file values
    pub fn apply_env(mut self) -> Result<Self> {
        if let Some(addr) = paths::listen_override() {
            self.listen_addr = addr
                .parse()
                .with_context(|| format!("invalid LINESHELL_LISTEN address: {}", addr))?;
        }
        if let Some(path) = paths::host_key_override() {
            self.host_key_path = path;
        }
        Ok(self)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        self.inactivity_timeout_secs.map(Duration::from_secs)
    }
}
