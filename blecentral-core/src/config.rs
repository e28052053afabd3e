//! Coordinator configuration, stored as JSON in BLECENTRAL_HOME

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use blecentral_proto::{UuidError, uuid_from_str};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no home directory, set BLECENTRAL_HOME")]
    NoHome,
    #[error("config io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Uuid(#[from] UuidError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// How long to wait after a link loss before resolving outstanding
    /// commands, absorbing duplicate or late radio callbacks
    pub disconnect_settle_ms: u64,
    /// Which local adapter to use when more than one is present
    pub adapter_index: usize,
    /// Capacity of the coordinator's command channel
    pub command_buffer: usize,
    /// Service filter used when a scan is started without one
    pub default_scan_services: Vec<String>,
    /// Most recent advertisements remembered for connect catalogues; the
    /// oldest is evicted beyond this
    pub advertisement_cache: usize,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            disconnect_settle_ms: 4000,
            adapter_index: 0,
            command_buffer: 32,
            default_scan_services: Vec::new(),
            advertisement_cache: 256,
        }
    }
}

impl CentralConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.disconnect_settle_ms)
    }

    pub fn scan_services(&self) -> Result<Vec<Uuid>, ConfigError> {
        self.default_scan_services
            .iter()
            .map(|s| uuid_from_str(s).map_err(ConfigError::from))
            .collect()
    }

    /// Read `path`, or write the defaults there if it does not exist yet
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let io_err = |source| ConfigError::Io { path: path.to_path_buf(), source };

        if path.exists() {
            let data = std::fs::read_to_string(path).map_err(io_err)?;
            let config = serde_json::from_str(&data)
                .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
            log::debug!("loaded config from {}", path.display());
            return Ok(config);
        }

        let config = Self::default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let data = serde_json::to_string_pretty(&config)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        std::fs::write(path, data).map_err(io_err)?;
        log::info!("wrote default config to {}", path.display());
        Ok(config)
    }
}

/// BLECENTRAL_HOME, or `~/.blecentral`
pub fn blecentral_home() -> Result<PathBuf, ConfigError> {
    match std::env::var("BLECENTRAL_HOME") {
        Ok(home) => Ok(PathBuf::from(home)),
        Err(_) => dirs::home_dir()
            .map(|h| h.join(".blecentral"))
            .ok_or(ConfigError::NoHome),
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(blecentral_home()?.join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("blecentral-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn writes_defaults_then_reads_them_back() {
        let dir = scratch("defaults");
        let path = dir.join(CONFIG_FILE);

        let created = CentralConfig::load_or_create(&path).unwrap();
        assert_eq!(created, CentralConfig::default());
        assert!(path.exists());
        assert_eq!(created.settle_delay(), Duration::from_secs(4));

        std::fs::write(&path, r#"{"disconnect_settle_ms": 250, "default_scan_services": ["180d"]}"#)
            .unwrap();
        let loaded = CentralConfig::load_or_create(&path).unwrap();
        assert_eq!(loaded.disconnect_settle_ms, 250);
        assert_eq!(loaded.command_buffer, 32);
        assert_eq!(loaded.advertisement_cache, 256);
        assert_eq!(loaded.scan_services().unwrap(), vec![blecentral_proto::uuids::from_u16(0x180d)]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = scratch("malformed");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(CentralConfig::load_or_create(&path), Err(ConfigError::Parse { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
