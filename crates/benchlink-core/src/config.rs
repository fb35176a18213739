//! Persistent configuration for benchlink.
//!
//! Stores controller tuning in `~/.benchlink/config.json`. Every field has a
//! default, so a missing file, a partial file, or an unparseable file all
//! yield a usable configuration.
//!
//! # Example
//!
//! ```no_run
//! use benchlink_core::config::ControllerConfig;
//!
//! let config = ControllerConfig::load();
//! println!("read timeout: {:?}", config.read_timeout());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_RATE_MS;

const CONFIG_FILENAME: &str = "config.json";

/// Returns the benchlink directory path (`~/.benchlink/`).
///
/// Falls back to the system temp directory when no home directory can be
/// determined. Creates the directory if it doesn't exist.
pub fn benchlink_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".benchlink");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Returns the path of the configuration file.
pub fn config_path() -> PathBuf {
    benchlink_dir().join(CONFIG_FILENAME)
}

/// Controller tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Bounded wait of each receive-loop read, in milliseconds.
    pub read_timeout_ms: u64,
    /// Bound on resolving, binding and connecting the socket, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Size of the datagram read buffer.
    pub recv_buffer_size: usize,
    /// `RATE` sent with the start command, in milliseconds.
    pub sample_rate_ms: u32,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 1000,
            connect_timeout_ms: 5000,
            recv_buffer_size: 1024,
            sample_rate_ms: DEFAULT_RATE_MS,
            event_capacity: 256,
        }
    }
}

impl ControllerConfig {
    /// Load config from `~/.benchlink/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        std::fs::read_to_string(config_path())
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.benchlink/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path(), json)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
