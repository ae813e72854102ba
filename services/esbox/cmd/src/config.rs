//! Configuration handling for the ESBox API engine.
//!
//! Settings come from the `services.esbox` section of a shared YAML file and
//! can be overridden by environment variables. A missing or unreadable file
//! falls back to defaults.

use anyhow::{Context, Result};
use esbox_session::{EngineConfig, Role};
use esbox_storage::StorageConfig;
use esbox_wire::{Identity, ProtocolVersion, DEFAULT_CELL_COUNT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsboxConfig {
    /// Fallback protocol version, e.g. "1.0"
    pub default_version: String,
    /// Versions to accept; empty accepts every registered version
    pub supported_versions: Vec<String>,
    /// HAN address of the device
    pub han_address: String,
    /// Link key paired with the HAN address
    pub link_key: String,
    /// Device firmware version reported in device wrappers
    pub device_version: Option<String>,
    /// Cells per GetData
    pub default_cell_count: u32,
    /// Cap on messages in one device wrapper (0 = unlimited)
    pub max_messages_per_wrapper: usize,
    /// Cells retained in the stream database
    pub fifo_capacity: usize,
    /// Root directory served to filesystem requests
    pub files_root: PathBuf,
}

impl Default for EsboxConfig {
    fn default() -> Self {
        let storage = StorageConfig::default();
        Self {
            default_version: ProtocolVersion::BASELINE.to_string(),
            supported_versions: Vec::new(),
            han_address: "001BC502B0000000".to_string(),
            link_key: String::new(),
            device_version: None,
            default_cell_count: DEFAULT_CELL_COUNT,
            max_messages_per_wrapper: 0,
            fifo_capacity: storage.fifo_capacity,
            files_root: storage.files_root,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    esbox: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

impl EsboxConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();
        let path = config_path.as_ref();

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    if let Some(service) = root.services.and_then(|s| s.esbox) {
                        config.apply_service_config(service);
                    }
                    info!("Loaded configuration from {:?}", path);
                }
                Err(e) => warn!("Failed to parse config file {:?} ({}), using defaults", path, e),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_environment_overrides();

        info!(
            "Final esbox configuration: default_version={}, han_address={}, cells={}, files_root={:?}",
            config.default_version, config.han_address, config.default_cell_count, config.files_root
        );
        Ok(config)
    }

    fn apply_service_config(&mut self, service: ServiceConfig) {
        let Some(values) = service.config else {
            return;
        };
        for (key, value) in values {
            match key.as_str() {
                "services.esbox.default_version" => self.default_version = value,
                "services.esbox.supported_versions" => {
                    self.supported_versions = value
                        .split(',')
                        .map(|v| v.trim().to_string())
                        .filter(|v| !v.is_empty())
                        .collect();
                }
                "services.esbox.han_address" => self.han_address = value,
                "services.esbox.link_key" => self.link_key = value,
                "services.esbox.device_version" => self.device_version = Some(value),
                "services.esbox.default_cell_count" => {
                    if let Ok(count) = value.parse() {
                        self.default_cell_count = count;
                    }
                }
                "services.esbox.max_messages_per_wrapper" => {
                    if let Ok(cap) = value.parse() {
                        self.max_messages_per_wrapper = cap;
                    }
                }
                "services.esbox.fifo_capacity" => {
                    if let Ok(capacity) = value.parse() {
                        self.fifo_capacity = capacity;
                    }
                }
                "services.esbox.files_root" => self.files_root = PathBuf::from(value),
                _ => {}
            }
        }
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(version) = std::env::var("ESBOX_DEFAULT_VERSION") {
            info!("Default version overridden by environment: {}", version);
            self.default_version = version;
        }
        if let Ok(address) = std::env::var("ESBOX_HAN_ADDRESS") {
            info!("HAN address overridden by environment: {}", address);
            self.han_address = address;
        }
        if let Ok(key) = std::env::var("ESBOX_LINK_KEY") {
            self.link_key = key;
        }
        if let Ok(root) = std::env::var("ESBOX_FILES_ROOT") {
            info!("Files root overridden by environment: {}", root);
            self.files_root = PathBuf::from(root);
        }
    }

    /// Engine settings for one side of a link
    pub fn engine_config(&self, role: Role) -> Result<EngineConfig> {
        let default_version: ProtocolVersion = self
            .default_version
            .parse()
            .with_context(|| format!("invalid default_version {:?}", self.default_version))?;
        let supported_versions = self
            .supported_versions
            .iter()
            .map(|v| v.parse().with_context(|| format!("invalid supported version {:?}", v)))
            .collect::<Result<Vec<ProtocolVersion>>>()?;

        let mut engine = match role {
            Role::Device => EngineConfig::device(Identity {
                address: self.han_address.clone(),
                link_key: self.link_key.clone(),
            }),
            Role::Server => EngineConfig::server(),
        };
        engine.default_version = default_version;
        engine.supported_versions = supported_versions;
        engine.default_cell_count = self.default_cell_count;
        if role == Role::Device {
            engine.device_version = self.device_version.clone();
            engine.max_messages_per_wrapper = (self.max_messages_per_wrapper > 0).then_some(self.max_messages_per_wrapper);
        }
        Ok(engine)
    }

    /// Storage settings
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            fifo_capacity: self.fifo_capacity,
            files_root: self.files_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = EsboxConfig::default();
        assert_eq!(config.default_version, "1.0");
        assert_eq!(config.default_cell_count, 10);
        assert!(config.supported_versions.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  esbox:
    enabled: true
    config:
      services.esbox.default_version: "1.1"
      services.esbox.supported_versions: "1.0, 1.1"
      services.esbox.device_version: "4.2.0"
      services.esbox.default_cell_count: "25"
      services.esbox.max_messages_per_wrapper: "8"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = EsboxConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.default_version, "1.1");
        assert_eq!(config.supported_versions, vec!["1.0", "1.1"]);
        assert_eq!(config.default_cell_count, 25);

        let engine = config.engine_config(Role::Device).unwrap();
        assert_eq!(engine.default_version, ProtocolVersion::V1_1);
        assert_eq!(engine.supported_versions.len(), 2);
        assert_eq!(engine.device_version.as_deref(), Some("4.2.0"));
        assert_eq!(engine.max_messages_per_wrapper, Some(8));
        assert!(engine.identity.is_some());

        let server = config.engine_config(Role::Server).unwrap();
        assert_eq!(server.identity, None);
        assert_eq!(server.max_messages_per_wrapper, None);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = EsboxConfig::load_from_file("/nonexistent/esbox.yaml").unwrap();
        assert_eq!(config.default_cell_count, DEFAULT_CELL_COUNT);
    }

    #[test]
    fn test_invalid_version_is_rejected() {
        let config = EsboxConfig {
            default_version: "one".to_string(),
            ..EsboxConfig::default()
        };
        assert!(config.engine_config(Role::Server).is_err());
    }
}
