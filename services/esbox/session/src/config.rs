//! Session engine configuration.

use esbox_wire::{Identity, ProtocolVersion, DEFAULT_CELL_COUNT};

/// Which end of the link this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The field gateway; answers requests, sends any number of messages per wrapper
    Device,
    /// The collection server; sends at most one message per wrapper
    Server,
}

/// Per-session engine settings, injected at construction
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This end of the link
    pub role: Role,
    /// Version used when the peer declares one we do not support
    pub default_version: ProtocolVersion,
    /// Versions to accept; empty means everything the registry knows
    pub supported_versions: Vec<ProtocolVersion>,
    /// Device identity sent with device wrappers
    pub identity: Option<Identity>,
    /// Device firmware version sent with device wrappers
    pub device_version: Option<String>,
    /// Cells requested by [`Session::request_telemetry`](crate::Session::request_telemetry)
    pub default_cell_count: u32,
    /// Cap on messages per device wrapper; `None` sends the whole queue
    pub max_messages_per_wrapper: Option<usize>,
}

impl EngineConfig {
    /// Defaults for a device-role session
    pub fn device(identity: Identity) -> Self {
        Self {
            role: Role::Device,
            identity: Some(identity),
            ..Self::default()
        }
    }

    /// Defaults for a server-role session
    pub fn server() -> Self {
        Self::default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            role: Role::Server,
            default_version: ProtocolVersion::BASELINE,
            supported_versions: Vec::new(),
            identity: None,
            device_version: None,
            default_cell_count: DEFAULT_CELL_COUNT,
            max_messages_per_wrapper: None,
        }
    }
}
