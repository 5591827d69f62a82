//! Path and environment resolution for lineshell
//!
//! Everything lives relative to the working directory unless overridden.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `LINESHELL_CONFIG` | Config file path | `lineshell.toml` |
//! | `LINESHELL_HOST_KEY` | Host key path | `.host_key` |
//! | `LINESHELL_LISTEN` | Listen address | `0.0.0.0:2222` |

use std::path::PathBuf;

use tracing::info;

use crate::config::Config;

/// Default host key file, hidden in the working directory
pub const DEFAULT_HOST_KEY: &str = ".host_key";

/// Default config file name
pub const DEFAULT_CONFIG: &str = "lineshell.toml";

/// Get the config file path
///
/// Priority: `LINESHELL_CONFIG` env var > `lineshell.toml`
pub fn config_path() -> PathBuf {
    std::env::var("LINESHELL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG))
}

/// Host key path from `LINESHELL_HOST_KEY`, if set
pub fn host_key_override() -> Option<PathBuf> {
    std::env::var_os("LINESHELL_HOST_KEY")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Listen address from `LINESHELL_LISTEN`, if set (unparsed)
pub fn listen_override() -> Option<String> {
    std::env::var("LINESHELL_LISTEN")
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Log resolved paths for discoverability
pub fn log_paths(config: &Config) {
    info!("📂 config file: {}", config_path().display());
    info!("📂 host key: {}", config.host_key_path.display());
}
