//! Interfaces to the device-side business logic.
//!
//! The session owns no device behaviour. Network management, attribute
//! access, load control and housekeeping requests are handed to a
//! [`DeviceManager`]; telemetry and file requests go to the storage crate's
//! [`StreamDatabase`] and [`Filesystem`].

use esbox_storage::{Filesystem, StreamDatabase};
use esbox_wire::{MessageBody, Opaque, OperationOutcome};
use std::sync::Arc;

/// What a device operation produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// Accepted; nothing to report
    Accepted,
    /// Result code and description, for operations answered with a result message
    Completed(OperationOutcome),
    /// Report contents, for requests answered with a Send* report
    Report(Opaque),
}

/// Device and network management collaborator
pub trait DeviceManager: Send + Sync {
    /// Carry out a server request addressed to the device
    fn apply_device_operation(&self, request: &MessageBody) -> OperationResult;
}

/// Accepts everything and reports nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDeviceManager;

impl DeviceManager for NullDeviceManager {
    fn apply_device_operation(&self, request: &MessageBody) -> OperationResult {
        match request {
            MessageBody::ExecuteDeviceManagementOperation(op) => OperationResult::Completed(OperationOutcome {
                result: 0,
                operation: Some(op.kind.code()),
                details: Some("Ok".to_string()),
                error: None,
            }),
            _ => OperationResult::Accepted,
        }
    }
}

/// Handles a device-role session calls into
#[derive(Clone)]
pub struct Collaborators {
    /// Telemetry source
    pub streams: Option<Arc<dyn StreamDatabase>>,
    /// File access
    pub files: Option<Arc<dyn Filesystem>>,
    /// Device operations
    pub devices: Arc<dyn DeviceManager>,
}

impl Collaborators {
    /// No storage and a [`NullDeviceManager`]; enough for a server-role session
    pub fn none() -> Self {
        Self {
            streams: None,
            files: None,
            devices: Arc::new(NullDeviceManager),
        }
    }

    /// Attach a telemetry source
    pub fn with_streams(mut self, streams: Arc<dyn StreamDatabase>) -> Self {
        self.streams = Some(streams);
        self
    }

    /// Attach file access
    pub fn with_files(mut self, files: Arc<dyn Filesystem>) -> Self {
        self.files = Some(files);
        self
    }

    /// Replace the device manager
    pub fn with_devices(mut self, devices: Arc<dyn DeviceManager>) -> Self {
        self.devices = devices;
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::none()
    }
}
