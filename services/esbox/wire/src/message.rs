//! Message catalog.
//!
//! Every operation of the API is one [`MessageBody`] variant. An operation may
//! have several wire ids (a `1.0-1.0` one and a `1.1+` one); [`MessageId`]
//! names each wire id together with the versions it is valid in, and
//! [`Message::for_version`] picks the right one.
//!
//! Bodies whose contents the protocol leaves unspecified (option maps, status
//! reports, device lists and the like) are carried as [`Opaque`] mappings and
//! round-trip unchanged.

use crate::cells::{cells_from_json, cells_to_json, DeltaFlags, EncodedCell};
use crate::error::{ParseError, ValidationError};
use crate::fields::{as_object, FieldReader, FieldWriter};
use crate::registry::{Field, ProtocolVersion, VersionRegistry, VersionSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Pass-through message fields, keyed exactly as on the wire
pub type Opaque = Map<String, Value>;

/// Number of stream-database FIFOs (`0..=3`)
pub const FIFO_COUNT: u8 = 4;

/// Default number of cells requested by GetData
pub const DEFAULT_CELL_COUNT: u32 = 10;

/// A (manufacturer id, cluster id) namespace pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cluster {
    /// Manufacturer code, 0 for standard clusters
    pub manufacturer: u16,
    /// Cluster id
    pub id: u16,
}

impl Cluster {
    /// Saturn South ESBox cluster
    pub const SS_ESB: Cluster = Cluster::new(4278, 0);
    /// Saturn South load-control cluster
    pub const SS_LC: Cluster = Cluster::new(4278, 64784);
    /// Standard On/Off cluster
    pub const ON_OFF: Cluster = Cluster::new(0, 6);

    /// Create a cluster pair
    pub const fn new(manufacturer: u16, id: u16) -> Self {
        Self { manufacturer, id }
    }

    pub(crate) fn to_json(self, schema: &VersionSchema) -> Result<Value, ValidationError> {
        let mut w = FieldWriter::new(schema);
        w.put(Field::ClusterId, self.id)?
            .put(Field::ClusterManufacturer, self.manufacturer)?;
        Ok(Value::Object(w.finish()))
    }

    pub(crate) fn from_json(schema: &VersionSchema, map: &Map<String, Value>) -> Result<Self, ParseError> {
        let r = FieldReader::new(schema, map);
        Ok(Self {
            manufacturer: r.require_int(Field::ClusterManufacturer)?,
            id: r.require_int(Field::ClusterId)?,
        })
    }
}

/// Versions a message id is valid in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRange {
    /// Exactly this version (`1.0-1.0`)
    Only(ProtocolVersion),
    /// This version and every later one (`1.0+`, `1.1+`)
    Since(ProtocolVersion),
}

impl VersionRange {
    /// Whether `version` falls in the range
    pub fn contains(&self, version: ProtocolVersion) -> bool {
        match *self {
            VersionRange::Only(v) => version == v,
            VersionRange::Since(v) => version >= v,
        }
    }
}

/// Admission policy of the outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueMode {
    /// Always append; duplicates are delivered independently
    Normal,
    /// At most one pending entry per identity key; newer replaces older
    Single,
}

/// Protocol operation, independent of version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Operation {
    NoFurtherMessages,
    NotAuthenticated,
    CloseConnection,
    GetSupportedVersions,
    SendSupportedVersions,
    GetErrors,
    SendErrors,
    GetOptions,
    SetOptions,
    SendOptions,
    Restart,
    SendUpdateToken,
    GetUpdateStatus,
    SendUpdateStatus,
    GetStatus,
    SendStatus,
    ExecuteTerminalCommand,
    GetTerminalOutput,
    SendTerminalOutput,
    GetDir,
    SendDir,
    GetFile,
    SendFile,
    ExecuteFilesystemOperation,
    SendFilesystemOperationResult,
    GetDeviceList,
    SendDeviceList,
    RequestDeviceToLeave,
    LocateDevice,
    PermitJoining,
    ExecuteDeviceManagementOperation,
    SendDeviceManagementResult,
    GetAvailableData,
    GetData,
    SendData,
    GetLatestReadings,
    SendLatestReadings,
    GetWaveform,
    BroadcastDispatch,
    DispatchReport,
    UflsReport,
    SwitchState,
    ReadAttributes,
    WriteAttributes,
}

impl Operation {
    /// Cluster the operation is sent under unless the caller overrides it
    pub fn default_cluster(self) -> Cluster {
        match self {
            Operation::GetWaveform
            | Operation::BroadcastDispatch
            | Operation::DispatchReport
            | Operation::UflsReport => Cluster::SS_LC,
            Operation::SwitchState => Cluster::ON_OFF,
            _ => Cluster::SS_ESB,
        }
    }
}

/// A wire message id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum MessageId {
    ReadAttributes,
    ReadAttributesV11,
    WriteAttributes,
    WriteAttributesV11,
    NoFurtherMessages,
    NoFurtherMessagesV11,
    NotAuthenticated,
    NotAuthenticatedV11,
    CloseConnection,
    CloseConnectionV11,
    GetSupportedVersionsV11,
    SendSupportedVersionsV11,
    GetErrors,
    SendErrors,
    SendErrorsV11,
    GetESBoxOptions,
    GetESBoxOptionsV11,
    SetESBoxOptions,
    SetESBoxOptionsV11,
    SendESBoxOptions,
    SendESBoxOptionsV11,
    RestartESBox,
    SendUpdateToken,
    GetUpdateStatusV11,
    SendUpdateStatusV11,
    GetStatusV11,
    SendStatusV11,
    ExecuteTerminalCommandV11,
    GetTerminalOutputV11,
    SendTerminalOutputV11,
    GetDirV11,
    SendDirV11,
    GetFileV11,
    SendFileV11,
    ExecuteFilesystemOperationV11,
    SendFilesystemOperationResultV11,
    GetDeviceList,
    GetDeviceListV11,
    SendDeviceList,
    SendDeviceListV11,
    RequestDeviceToLeave,
    LocateDevice,
    PermitJoining,
    ExecuteDeviceManagementOperationV11,
    SendDeviceManagementResultV11,
    GetAvailableData,
    GetData,
    GetDataV11,
    SendData,
    SendDataV11,
    GetLatestReadings,
    SendLatestReadings,
    GetWaveform,
    BroadcastDispatch,
    DispatchReport,
    UflsReport,
    SwitchState,
}

struct Descriptor {
    wire: &'static str,
    operation: Operation,
    versions: VersionRange,
}

const fn only_1_0(wire: &'static str, operation: Operation) -> Descriptor {
    Descriptor {
        wire,
        operation,
        versions: VersionRange::Only(ProtocolVersion::V1_0),
    }
}

const fn since_1_0(wire: &'static str, operation: Operation) -> Descriptor {
    Descriptor {
        wire,
        operation,
        versions: VersionRange::Since(ProtocolVersion::V1_0),
    }
}

const fn since_1_1(wire: &'static str, operation: Operation) -> Descriptor {
    Descriptor {
        wire,
        operation,
        versions: VersionRange::Since(ProtocolVersion::V1_1),
    }
}

impl MessageId {
    /// Every id, in lookup order; the first id valid for a version wins
    pub const ALL: &'static [MessageId] = &[
        MessageId::ReadAttributes,
        MessageId::ReadAttributesV11,
        MessageId::WriteAttributes,
        MessageId::WriteAttributesV11,
        MessageId::NoFurtherMessages,
        MessageId::NoFurtherMessagesV11,
        MessageId::NotAuthenticated,
        MessageId::NotAuthenticatedV11,
        MessageId::CloseConnection,
        MessageId::CloseConnectionV11,
        MessageId::GetSupportedVersionsV11,
        MessageId::SendSupportedVersionsV11,
        MessageId::GetErrors,
        MessageId::SendErrors,
        MessageId::SendErrorsV11,
        MessageId::GetESBoxOptions,
        MessageId::GetESBoxOptionsV11,
        MessageId::SetESBoxOptions,
        MessageId::SetESBoxOptionsV11,
        MessageId::SendESBoxOptions,
        MessageId::SendESBoxOptionsV11,
        MessageId::RestartESBox,
        MessageId::SendUpdateToken,
        MessageId::GetUpdateStatusV11,
        MessageId::SendUpdateStatusV11,
        MessageId::GetStatusV11,
        MessageId::SendStatusV11,
        MessageId::ExecuteTerminalCommandV11,
        MessageId::GetTerminalOutputV11,
        MessageId::SendTerminalOutputV11,
        MessageId::GetDirV11,
        MessageId::SendDirV11,
        MessageId::GetFileV11,
        MessageId::SendFileV11,
        MessageId::ExecuteFilesystemOperationV11,
        MessageId::SendFilesystemOperationResultV11,
        MessageId::GetDeviceList,
        MessageId::GetDeviceListV11,
        MessageId::SendDeviceList,
        MessageId::SendDeviceListV11,
        MessageId::RequestDeviceToLeave,
        MessageId::LocateDevice,
        MessageId::PermitJoining,
        MessageId::ExecuteDeviceManagementOperationV11,
        MessageId::SendDeviceManagementResultV11,
        MessageId::GetAvailableData,
        MessageId::GetData,
        MessageId::GetDataV11,
        // 1.1 devices still send the shared SendData id; SendData_1_1 is accepted inbound.
        MessageId::SendData,
        MessageId::SendDataV11,
        MessageId::GetLatestReadings,
        MessageId::SendLatestReadings,
        MessageId::GetWaveform,
        MessageId::BroadcastDispatch,
        MessageId::DispatchReport,
        MessageId::UflsReport,
        MessageId::SwitchState,
    ];

    fn descriptor(self) -> Descriptor {
        use Operation as Op;
        match self {
            MessageId::ReadAttributes => only_1_0("ReadAttributes", Op::ReadAttributes),
            MessageId::ReadAttributesV11 => since_1_1("ReadAttributes_1_1", Op::ReadAttributes),
            MessageId::WriteAttributes => only_1_0("WriteAttributes", Op::WriteAttributes),
            MessageId::WriteAttributesV11 => since_1_1("WriteAttributes_1_1", Op::WriteAttributes),
            MessageId::NoFurtherMessages => only_1_0("NoFurtherMessages", Op::NoFurtherMessages),
            MessageId::NoFurtherMessagesV11 => since_1_1("NoFurtherMessages_1_1", Op::NoFurtherMessages),
            MessageId::NotAuthenticated => only_1_0("NotAuthenticated", Op::NotAuthenticated),
            MessageId::NotAuthenticatedV11 => since_1_1("NotAuthenticated_1_1", Op::NotAuthenticated),
            MessageId::CloseConnection => only_1_0("CloseConnection", Op::CloseConnection),
            MessageId::CloseConnectionV11 => since_1_1("CloseConnection_1_1", Op::CloseConnection),
            MessageId::GetSupportedVersionsV11 => {
                since_1_1("GetSupportedVersions_1_1", Op::GetSupportedVersions)
            }
            MessageId::SendSupportedVersionsV11 => {
                since_1_1("SendSupportedVersions_1_1", Op::SendSupportedVersions)
            }
            MessageId::GetErrors => since_1_0("GetErrors", Op::GetErrors),
            MessageId::SendErrors => only_1_0("SendErrors", Op::SendErrors),
            MessageId::SendErrorsV11 => since_1_1("SendErrors_1_1", Op::SendErrors),
            MessageId::GetESBoxOptions => only_1_0("GetESBoxOptions", Op::GetOptions),
            MessageId::GetESBoxOptionsV11 => since_1_1("GetESBoxOptions_1_1", Op::GetOptions),
            MessageId::SetESBoxOptions => only_1_0("SetESBoxOptions", Op::SetOptions),
            MessageId::SetESBoxOptionsV11 => since_1_1("SetESBoxOptions_1_1", Op::SetOptions),
            MessageId::SendESBoxOptions => only_1_0("SendESBoxOptions", Op::SendOptions),
            MessageId::SendESBoxOptionsV11 => since_1_1("SendESBoxOptions_1_1", Op::SendOptions),
            MessageId::RestartESBox => since_1_0("RestartESBox", Op::Restart),
            MessageId::SendUpdateToken => since_1_0("SendUpdateToken", Op::SendUpdateToken),
            MessageId::GetUpdateStatusV11 => since_1_1("GetUpdateStatus_1_1", Op::GetUpdateStatus),
            MessageId::SendUpdateStatusV11 => since_1_1("SendUpdateStatus_1_1", Op::SendUpdateStatus),
            MessageId::GetStatusV11 => since_1_1("GetStatus_1_1", Op::GetStatus),
            MessageId::SendStatusV11 => since_1_1("SendStatus_1_1", Op::SendStatus),
            MessageId::ExecuteTerminalCommandV11 => {
                since_1_1("ExecuteTerminalCommand_1_1", Op::ExecuteTerminalCommand)
            }
            MessageId::GetTerminalOutputV11 => since_1_1("GetTerminalOutput_1_1", Op::GetTerminalOutput),
            MessageId::SendTerminalOutputV11 => {
                since_1_1("SendTerminalOutput_1_1", Op::SendTerminalOutput)
            }
            MessageId::GetDirV11 => since_1_1("GetDir_1_1", Op::GetDir),
            MessageId::SendDirV11 => since_1_1("SendDir_1_1", Op::SendDir),
            MessageId::GetFileV11 => since_1_1("GetFile_1_1", Op::GetFile),
            MessageId::SendFileV11 => since_1_1("SendFile_1_1", Op::SendFile),
            MessageId::ExecuteFilesystemOperationV11 => {
                since_1_1("ExecuteFilesystemOperation_1_1", Op::ExecuteFilesystemOperation)
            }
            MessageId::SendFilesystemOperationResultV11 => since_1_1(
                "SendFilesystemOperationResult_1_1",
                Op::SendFilesystemOperationResult,
            ),
            MessageId::GetDeviceList => only_1_0("GetDeviceList", Op::GetDeviceList),
            MessageId::GetDeviceListV11 => since_1_1("GetDeviceList_1_1", Op::GetDeviceList),
            MessageId::SendDeviceList => only_1_0("SendDeviceList", Op::SendDeviceList),
            MessageId::SendDeviceListV11 => since_1_1("SendDeviceList_1_1", Op::SendDeviceList),
            MessageId::RequestDeviceToLeave => only_1_0("RequestDeviceToLeave", Op::RequestDeviceToLeave),
            MessageId::LocateDevice => only_1_0("LocateDevice", Op::LocateDevice),
            MessageId::PermitJoining => only_1_0("PermitJoining", Op::PermitJoining),
            MessageId::ExecuteDeviceManagementOperationV11 => since_1_1(
                "ExecuteDeviceManagementOperation_1_1",
                Op::ExecuteDeviceManagementOperation,
            ),
            MessageId::SendDeviceManagementResultV11 => {
                since_1_1("SendDeviceManagementResult_1_1", Op::SendDeviceManagementResult)
            }
            MessageId::GetAvailableData => since_1_0("GetAvailableData", Op::GetAvailableData),
            MessageId::GetData => only_1_0("GetData", Op::GetData),
            MessageId::GetDataV11 => since_1_1("GetData_1_1", Op::GetData),
            MessageId::SendData => since_1_0("SendData", Op::SendData),
            MessageId::SendDataV11 => since_1_1("SendData_1_1", Op::SendData),
            MessageId::GetLatestReadings => only_1_0("GetLatestReadings", Op::GetLatestReadings),
            MessageId::SendLatestReadings => only_1_0("SendLatestReadings", Op::SendLatestReadings),
            MessageId::GetWaveform => since_1_0("GetWaveform", Op::GetWaveform),
            MessageId::BroadcastDispatch => since_1_0("BroadcastDispatch", Op::BroadcastDispatch),
            MessageId::DispatchReport => since_1_0("DispatchReport", Op::DispatchReport),
            MessageId::UflsReport => since_1_0("UFLSReport", Op::UflsReport),
            MessageId::SwitchState => since_1_0("SwitchState", Op::SwitchState),
        }
    }

    /// Wire string of the id
    pub fn as_str(self) -> &'static str {
        self.descriptor().wire
    }

    /// Operation the id performs
    pub fn operation(self) -> Operation {
        self.descriptor().operation
    }

    /// Versions the id is valid in
    pub fn versions(self) -> VersionRange {
        self.descriptor().versions
    }

    /// Queue admission mode for device-originated messages
    pub fn default_queue_mode(self) -> QueueMode {
        match self.operation() {
            Operation::DispatchReport | Operation::UflsReport => QueueMode::Normal,
            _ => QueueMode::Single,
        }
    }

    /// Look up an id by its wire string
    pub fn from_wire(wire: &str) -> Option<MessageId> {
        Self::ALL.iter().copied().find(|id| id.as_str() == wire)
    }

    /// Id to emit for an operation in a given version
    pub fn for_operation(operation: Operation, version: ProtocolVersion) -> Option<MessageId> {
        Self::ALL
            .iter()
            .copied()
            .find(|id| id.operation() == operation && id.versions().contains(version))
    }
}

/// Where GetData reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataSource {
    /// Stream database FIFO
    #[default]
    Sdb,
    /// Latest-readings buffer (1.1+)
    LatestReadings,
}

impl DataSource {
    fn as_str(self) -> &'static str {
        match self {
            DataSource::Sdb => "Sdb",
            DataSource::LatestReadings => "LatestReadings_1_1",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "Sdb" => Some(DataSource::Sdb),
            "LatestReadings_1_1" => Some(DataSource::LatestReadings),
            _ => None,
        }
    }
}

/// GetData parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRequest {
    /// Data source
    pub source: DataSource,
    /// Maximum number of cells to return
    pub max_cells: u32,
    /// FIFO index, `0..FIFO_COUNT`
    pub fifo: u8,
    /// Delta suppression switches
    pub flags: DeltaFlags,
}

impl Default for DataRequest {
    fn default() -> Self {
        Self {
            source: DataSource::Sdb,
            max_cells: DEFAULT_CELL_COUNT,
            fifo: 0,
            flags: DeltaFlags::all(),
        }
    }
}

/// SendData payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataResponse {
    /// Delta-encoded cells read from a stream-database FIFO
    Sdb {
        /// FIFO the cells came from
        fifo: u8,
        /// Cells in sequence order
        cells: Vec<EncodedCell>,
    },
    /// Latest-readings payload, passed through unchanged
    LatestReadings(Value),
}

/// Which update information GetUpdateStatus asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateStatusQuery {
    /// Currently running downloads and OTA updates
    pub current: Option<bool>,
    /// Registered OTA images
    pub ota_registered: Option<bool>,
    /// Pending ESBox updates
    pub all_pending: Option<bool>,
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// File size in bytes
    pub size: Option<u64>,
    /// Whether the entry is a directory
    pub is_directory: bool,
}

/// SendDir payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirListing {
    /// Listed path
    pub path: String,
    /// Entries, empty on error
    pub entries: Vec<DirEntry>,
    /// Error name, if listing failed
    pub error: Option<String>,
    /// Filesystem result code, if listing failed
    pub code: Option<i64>,
}

/// SendFile payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileTransfer {
    /// Requested path
    pub path: String,
    /// File description
    pub details: Option<DirEntry>,
    /// File contents, base64 on the wire
    pub contents: Option<Vec<u8>>,
    /// Error name, if reading failed
    pub error: Option<String>,
    /// Filesystem result code, if reading failed
    pub code: Option<i64>,
}

/// ExecuteFilesystemOperation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilesystemOperation {
    /// Create a directory
    MakeDir {
        /// Directory path
        path: String,
        /// Create missing parents
        make_parents: bool,
    },
    /// Remove a file or directory
    Remove {
        /// Path to remove
        path: String,
        /// Remove directory contents
        recursive: bool,
        /// Ignore a missing path
        force: bool,
    },
    /// Create an empty file
    MakeFile {
        /// File path
        path: String,
        /// Truncate an existing file
        overwrite: bool,
        /// Create missing parents
        make_parents: bool,
    },
    /// Write bytes to a file
    WriteFile {
        /// File path
        path: String,
        /// Append instead of overwrite
        append: bool,
        /// Data, base64 on the wire
        data: Vec<u8>,
    },
    /// Fetch a file from a remote location (not implemented by devices)
    WriteFileFromRemote,
}

impl FilesystemOperation {
    /// Wire code of MakeDir
    pub const MAKE_DIR: i64 = 0;
    /// Wire code of Remove
    pub const REMOVE: i64 = 1;
    /// Wire code of MakeFile
    pub const MAKE_FILE: i64 = 2;
    /// Wire code of WriteFile
    pub const WRITE_FILE: i64 = 3;
    /// Wire code of WriteFileFromRemote
    pub const WRITE_FILE_FROM_REMOTE: i64 = 4;

    /// Wire code of this operation
    pub fn code(&self) -> i64 {
        match self {
            FilesystemOperation::MakeDir { .. } => Self::MAKE_DIR,
            FilesystemOperation::Remove { .. } => Self::REMOVE,
            FilesystemOperation::MakeFile { .. } => Self::MAKE_FILE,
            FilesystemOperation::WriteFile { .. } => Self::WRITE_FILE,
            FilesystemOperation::WriteFileFromRemote => Self::WRITE_FILE_FROM_REMOTE,
        }
    }
}

/// Result of a filesystem or device-management operation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OperationOutcome {
    /// Result code, 0 on success; meaning is operation specific
    pub result: i64,
    /// Code of the operation performed
    pub operation: Option<i64>,
    /// Human-readable details
    pub details: Option<String>,
    /// Error description
    pub error: Option<String>,
}

/// Device-management operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum DeviceOperationKind {
    ScanDeviceList,
    RebuildDeviceList,
    PermitJoining,
    ClearOtaUpdateRegistry,
    ClearDeviceRegistry,
    FactoryReset,
    LocateEndDevice,
    LeaveEndDevice,
    RebootEndDevice,
    RefreshEndDevice,
    LqiTestEndDevice,
    OverrideReportInterval,
}

impl DeviceOperationKind {
    const ALL: [DeviceOperationKind; 12] = [
        DeviceOperationKind::ScanDeviceList,
        DeviceOperationKind::RebuildDeviceList,
        DeviceOperationKind::PermitJoining,
        DeviceOperationKind::ClearOtaUpdateRegistry,
        DeviceOperationKind::ClearDeviceRegistry,
        DeviceOperationKind::FactoryReset,
        DeviceOperationKind::LocateEndDevice,
        DeviceOperationKind::LeaveEndDevice,
        DeviceOperationKind::RebootEndDevice,
        DeviceOperationKind::RefreshEndDevice,
        DeviceOperationKind::LqiTestEndDevice,
        DeviceOperationKind::OverrideReportInterval,
    ];

    /// Wire code
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Kind for a wire code
    pub fn from_code(code: i64) -> Option<Self> {
        usize::try_from(code).ok().and_then(|i| Self::ALL.get(i).copied())
    }
}

/// Operation-specific parameters; each kind uses a subset
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceOperationParams {
    /// Target end device
    pub device: Option<String>,
    /// Duration in seconds
    pub duration: Option<i64>,
    /// Sampling interval in seconds
    pub interval: Option<i64>,
    /// Joining mode
    pub mode: Option<i64>,
    /// Enable switch
    pub enable: Option<bool>,
    /// Lower bound (e.g. reporting interval)
    pub minimum: Option<i64>,
    /// Upper bound (e.g. reporting interval)
    pub maximum: Option<i64>,
}

/// ExecuteDeviceManagementOperation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOperation {
    /// What to do
    pub kind: DeviceOperationKind,
    /// Parameters
    pub params: DeviceOperationParams,
}

/// One attribute to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeWrite {
    /// Attribute id
    pub attribute_id: u16,
    /// New value, typed by the attribute
    pub value: Value,
}

/// Message contents, one variant per operation
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum MessageBody {
    NoFurtherMessages,
    NotAuthenticated,
    CloseConnection,
    GetSupportedVersions,
    SendSupportedVersions { versions: Vec<ProtocolVersion> },
    GetErrors,
    SendErrors(Opaque),
    GetOptions,
    SetOptions { options: Value },
    SendOptions(Opaque),
    Restart,
    SendUpdateToken { token: String },
    GetUpdateStatus(UpdateStatusQuery),
    SendUpdateStatus(Opaque),
    GetStatus,
    SendStatus(Opaque),
    ExecuteTerminalCommand { command: Vec<u8>, raw: Option<String> },
    GetTerminalOutput { uid: Option<i64> },
    SendTerminalOutput(Opaque),
    GetDir { path: String },
    SendDir(DirListing),
    GetFile { path: String },
    SendFile(FileTransfer),
    ExecuteFilesystemOperation(FilesystemOperation),
    SendFilesystemOperationResult(OperationOutcome),
    GetDeviceList { detailed: Option<bool> },
    SendDeviceList(Opaque),
    RequestDeviceToLeave { device: String },
    LocateDevice { device: String },
    PermitJoining { duration: Option<i64> },
    ExecuteDeviceManagementOperation(DeviceOperation),
    SendDeviceManagementResult(OperationOutcome),
    GetAvailableData,
    GetData(DataRequest),
    SendData(DataResponse),
    GetLatestReadings,
    SendLatestReadings(Opaque),
    GetWaveform(Opaque),
    BroadcastDispatch { devices: Vec<String>, endpoint: u8, revert: Option<i64> },
    DispatchReport { device: String },
    UflsReport { device: String, frequency_of_disconnect: Option<i64> },
    SwitchState { device: String, endpoint: u8, action: Value },
    ReadAttributes { device: String, endpoint: u8, attributes: Vec<u16> },
    WriteAttributes { device: String, endpoint: u8, attributes: Vec<AttributeWrite> },
}

impl MessageBody {
    /// Operation this body performs
    pub fn operation(&self) -> Operation {
        use MessageBody as B;
        use Operation as Op;
        match self {
            B::NoFurtherMessages => Op::NoFurtherMessages,
            B::NotAuthenticated => Op::NotAuthenticated,
            B::CloseConnection => Op::CloseConnection,
            B::GetSupportedVersions => Op::GetSupportedVersions,
            B::SendSupportedVersions { .. } => Op::SendSupportedVersions,
            B::GetErrors => Op::GetErrors,
            B::SendErrors(_) => Op::SendErrors,
            B::GetOptions => Op::GetOptions,
            B::SetOptions { .. } => Op::SetOptions,
            B::SendOptions(_) => Op::SendOptions,
            B::Restart => Op::Restart,
            B::SendUpdateToken { .. } => Op::SendUpdateToken,
            B::GetUpdateStatus(_) => Op::GetUpdateStatus,
            B::SendUpdateStatus(_) => Op::SendUpdateStatus,
            B::GetStatus => Op::GetStatus,
            B::SendStatus(_) => Op::SendStatus,
            B::ExecuteTerminalCommand { .. } => Op::ExecuteTerminalCommand,
            B::GetTerminalOutput { .. } => Op::GetTerminalOutput,
            B::SendTerminalOutput(_) => Op::SendTerminalOutput,
            B::GetDir { .. } => Op::GetDir,
            B::SendDir(_) => Op::SendDir,
            B::GetFile { .. } => Op::GetFile,
            B::SendFile(_) => Op::SendFile,
            B::ExecuteFilesystemOperation(_) => Op::ExecuteFilesystemOperation,
            B::SendFilesystemOperationResult(_) => Op::SendFilesystemOperationResult,
            B::GetDeviceList { .. } => Op::GetDeviceList,
            B::SendDeviceList(_) => Op::SendDeviceList,
            B::RequestDeviceToLeave { .. } => Op::RequestDeviceToLeave,
            B::LocateDevice { .. } => Op::LocateDevice,
            B::PermitJoining { .. } => Op::PermitJoining,
            B::ExecuteDeviceManagementOperation(_) => Op::ExecuteDeviceManagementOperation,
            B::SendDeviceManagementResult(_) => Op::SendDeviceManagementResult,
            B::GetAvailableData => Op::GetAvailableData,
            B::GetData(_) => Op::GetData,
            B::SendData(_) => Op::SendData,
            B::GetLatestReadings => Op::GetLatestReadings,
            B::SendLatestReadings(_) => Op::SendLatestReadings,
            B::GetWaveform(_) => Op::GetWaveform,
            B::BroadcastDispatch { .. } => Op::BroadcastDispatch,
            B::DispatchReport { .. } => Op::DispatchReport,
            B::UflsReport { .. } => Op::UflsReport,
            B::SwitchState { .. } => Op::SwitchState,
            B::ReadAttributes { .. } => Op::ReadAttributes,
            B::WriteAttributes { .. } => Op::WriteAttributes,
        }
    }

    /// Write body fields. `legacy` is the baseline schema, used by the
    /// load-control and On/Off messages that kept their 1.0 keys.
    fn write(
        &self,
        w: &mut FieldWriter<'_>,
        schema: &VersionSchema,
        legacy: &VersionSchema,
    ) -> Result<(), ValidationError> {
        use MessageBody as B;
        match self {
            B::NoFurtherMessages
            | B::NotAuthenticated
            | B::CloseConnection
            | B::GetSupportedVersions
            | B::GetErrors
            | B::GetOptions
            | B::Restart
            | B::GetStatus
            | B::GetAvailableData
            | B::GetLatestReadings => {}
            B::SendSupportedVersions { versions } => {
                let list: Vec<Value> = versions.iter().map(|v| Value::from(v.to_string())).collect();
                w.put(Field::ProtocolVersions, list)?;
            }
            B::SendErrors(opaque)
            | B::SendOptions(opaque)
            | B::SendUpdateStatus(opaque)
            | B::SendStatus(opaque)
            | B::SendTerminalOutput(opaque)
            | B::SendDeviceList(opaque)
            | B::SendLatestReadings(opaque)
            | B::GetWaveform(opaque) => {
                w.extend(opaque);
            }
            B::SetOptions { options } => {
                w.put(Field::Options, options.clone())?;
            }
            B::SendUpdateToken { token } => {
                w.put(Field::Token, token.as_str())?;
            }
            B::GetUpdateStatus(query) => {
                w.put_opt(Field::UpdateCurrent, query.current)?
                    .put_opt(Field::UpdateOtaRegistered, query.ota_registered)?
                    .put_opt(Field::UpdateAllPending, query.all_pending)?;
            }
            B::ExecuteTerminalCommand { command, raw } => {
                w.put_bytes(Field::TermCommand, command)?
                    .put_opt(Field::TermCommandRaw, raw.as_deref())?;
            }
            B::GetTerminalOutput { uid } => {
                w.put_opt(Field::TermUid, *uid)?;
            }
            B::GetDir { path } | B::GetFile { path } => {
                w.put(Field::Path, path.as_str())?;
            }
            B::SendDir(listing) => {
                let mut dir = FieldWriter::new(schema);
                dir.put(Field::Path, listing.path.as_str())?;
                if listing.error.is_none() {
                    let entries = listing
                        .entries
                        .iter()
                        .map(|e| dir_entry_to_json(e, schema))
                        .collect::<Result<Vec<_>, _>>()?;
                    dir.put(Field::List, entries)?;
                }
                dir.put_opt(Field::Error, listing.error.as_deref())?
                    .put_opt(Field::Code, listing.code)?;
                w.put(Field::Dir, Value::Object(dir.finish()))?;
            }
            B::SendFile(file) => {
                let mut f = FieldWriter::new(schema);
                f.put(Field::Path, file.path.as_str())?;
                if let Some(details) = &file.details {
                    f.put(Field::Details, dir_entry_to_json(details, schema)?)?;
                }
                if let Some(contents) = &file.contents {
                    f.put_bytes(Field::Contents, contents)?;
                }
                f.put_opt(Field::Error, file.error.as_deref())?
                    .put_opt(Field::Code, file.code)?;
                w.put(Field::File, Value::Object(f.finish()))?;
            }
            B::ExecuteFilesystemOperation(op) => {
                w.put(Field::Operation, op.code())?;
                match op {
                    FilesystemOperation::MakeDir { path, make_parents } => {
                        w.put(Field::Path, path.as_str())?
                            .put(Field::MakeParents, *make_parents)?;
                    }
                    FilesystemOperation::Remove {
                        path,
                        recursive,
                        force,
                    } => {
                        w.put(Field::Path, path.as_str())?
                            .put(Field::Recursive, *recursive)?
                            .put(Field::Force, *force)?;
                    }
                    FilesystemOperation::MakeFile {
                        path,
                        overwrite,
                        make_parents,
                    } => {
                        w.put(Field::Path, path.as_str())?
                            .put(Field::Overwrite, *overwrite)?
                            .put(Field::MakeParents, *make_parents)?;
                    }
                    FilesystemOperation::WriteFile { path, append, data } => {
                        w.put(Field::Path, path.as_str())?
                            .put(Field::Append, *append)?
                            .put_bytes(Field::Data, data)?;
                    }
                    FilesystemOperation::WriteFileFromRemote => {}
                }
            }
            B::SendFilesystemOperationResult(outcome) | B::SendDeviceManagementResult(outcome) => {
                w.put(Field::Result, outcome.result)?
                    .put_opt(Field::Operation, outcome.operation)?
                    .put_opt(Field::Details, outcome.details.as_deref())?
                    .put_opt(Field::Error, outcome.error.as_deref())?;
            }
            B::GetDeviceList { detailed } => {
                w.put_opt(Field::Detailed, *detailed)?;
            }
            B::RequestDeviceToLeave { device } | B::LocateDevice { device } => {
                w.put(Field::Device, device.as_str())?;
            }
            B::PermitJoining { duration } => {
                w.put_opt(Field::Duration, *duration)?;
            }
            B::ExecuteDeviceManagementOperation(op) => {
                let p = &op.params;
                w.put(Field::Operation, op.kind.code())?
                    .put_opt(Field::Device, p.device.as_deref())?
                    .put_opt(Field::Duration, p.duration)?
                    .put_opt(Field::Interval, p.interval)?
                    .put_opt(Field::Mode, p.mode)?
                    .put_opt(Field::Enable, p.enable)?
                    .put_opt(Field::MinimumValue, p.minimum)?
                    .put_opt(Field::MaximumValue, p.maximum)?;
            }
            B::GetData(request) => {
                if request.source == DataSource::LatestReadings
                    && !schema.capabilities().latest_readings_source
                {
                    return Err(ValidationError::MissingCapability {
                        capability: "latest-readings source",
                        version: schema.version(),
                    });
                }
                w.put(Field::Source, request.source.as_str())?;
                if request.source == DataSource::Sdb {
                    let flag = |f: DeltaFlags| i64::from(request.flags.contains(f));
                    w.put(Field::NCells, request.max_cells)?
                        .put(Field::Fifo, request.fifo)?
                        .put(Field::DelIeee, flag(DeltaFlags::DEVICE))?
                        .put(Field::DelEp, flag(DeltaFlags::ENDPOINT))?
                        .put(Field::DelClu, flag(DeltaFlags::CLUSTER))?
                        .put(Field::DelTime, flag(DeltaFlags::TIME))?;
                }
            }
            B::SendData(DataResponse::Sdb { fifo, cells }) => {
                let mut data = FieldWriter::new(schema);
                data.put(Field::Fifo, *fifo)?
                    .put(Field::Cells, cells_to_json(cells, schema)?)?;
                w.put(Field::Source, DataSource::Sdb.as_str())?
                    .put(Field::Data, Value::Object(data.finish()))?;
            }
            B::SendData(DataResponse::LatestReadings(payload)) => {
                if !schema.capabilities().latest_readings_source {
                    return Err(ValidationError::MissingCapability {
                        capability: "latest-readings source",
                        version: schema.version(),
                    });
                }
                w.put(Field::Source, DataSource::LatestReadings.as_str())?
                    .put(Field::Data, payload.clone())?;
            }
            B::BroadcastDispatch {
                devices,
                endpoint,
                revert,
            } => {
                let mut l = FieldWriter::new(legacy);
                l.put(Field::Devices, devices.clone())?
                    .put(Field::Endpoint, *endpoint)?
                    .put_opt(Field::Revert, *revert)?;
                w.extend(&l.finish());
            }
            B::SwitchState {
                device,
                endpoint,
                action,
            } => {
                let mut l = FieldWriter::new(legacy);
                l.put(Field::Device, device.as_str())?
                    .put(Field::Endpoint, *endpoint)?
                    .put(Field::Action, action.clone())?;
                w.extend(&l.finish());
            }
            B::DispatchReport { device } => {
                w.put(Field::Device, device.as_str())?;
            }
            B::UflsReport {
                device,
                frequency_of_disconnect,
            } => {
                w.put(Field::Device, device.as_str())?
                    .put_opt(Field::FrequencyOfDisconnect, *frequency_of_disconnect)?;
            }
            B::ReadAttributes {
                device,
                endpoint,
                attributes,
            } => {
                w.put(Field::Device, device.as_str())?
                    .put(Field::Endpoint, *endpoint)?
                    .put(Field::Attributes, attributes.clone())?;
            }
            B::WriteAttributes {
                device,
                endpoint,
                attributes,
            } => {
                let mut list = Vec::with_capacity(attributes.len());
                for attr in attributes {
                    let mut a = FieldWriter::new(schema);
                    a.put(Field::AttributeId, attr.attribute_id)?
                        .put(Field::Value, attr.value.clone())?;
                    list.push(Value::Object(a.finish()));
                }
                w.put(Field::Device, device.as_str())?
                    .put(Field::Endpoint, *endpoint)?
                    .put(Field::Attributes, list)?;
            }
        }
        Ok(())
    }

    /// Read the body of a message whose id is already known
    fn read(
        id: MessageId,
        map: &Map<String, Value>,
        schema: &VersionSchema,
        legacy: &VersionSchema,
    ) -> Result<Self, ParseError> {
        use MessageBody as B;
        use Operation as Op;
        let r = FieldReader::new(schema, map);
        let opaque = || {
            let header: Vec<&str> = [Field::MsgId, Field::Cluster]
                .iter()
                .filter_map(|f| schema.key(*f).ok())
                .collect();
            map.iter()
                .filter(|(k, _)| !header.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Opaque>()
        };

        let body = match id.operation() {
            Op::NoFurtherMessages => B::NoFurtherMessages,
            Op::NotAuthenticated => B::NotAuthenticated,
            Op::CloseConnection => B::CloseConnection,
            Op::GetSupportedVersions => B::GetSupportedVersions,
            Op::SendSupportedVersions => {
                let mut versions = Vec::new();
                for v in r.require_array(Field::ProtocolVersions)? {
                    let parsed = v
                        .as_str()
                        .and_then(|s| s.parse::<ProtocolVersion>().ok())
                        .ok_or_else(|| ParseError::InvalidField {
                            key: r.key(Field::ProtocolVersions),
                            reason: format!("invalid version {}", v),
                        })?;
                    versions.push(parsed);
                }
                B::SendSupportedVersions { versions }
            }
            Op::GetErrors => B::GetErrors,
            Op::SendErrors => B::SendErrors(opaque()),
            Op::GetOptions => B::GetOptions,
            Op::SetOptions => B::SetOptions {
                options: r
                    .raw(Field::Options)
                    .cloned()
                    .ok_or(ParseError::MissingField(r.key(Field::Options)))?,
            },
            Op::SendOptions => B::SendOptions(opaque()),
            Op::Restart => B::Restart,
            Op::SendUpdateToken => B::SendUpdateToken {
                token: r.require_string(Field::Token)?,
            },
            Op::GetUpdateStatus => B::GetUpdateStatus(UpdateStatusQuery {
                current: r.flag(Field::UpdateCurrent)?,
                ota_registered: r.flag(Field::UpdateOtaRegistered)?,
                all_pending: r.flag(Field::UpdateAllPending)?,
            }),
            Op::SendUpdateStatus => B::SendUpdateStatus(opaque()),
            Op::GetStatus => B::GetStatus,
            Op::SendStatus => B::SendStatus(opaque()),
            Op::ExecuteTerminalCommand => B::ExecuteTerminalCommand {
                command: r
                    .bytes(Field::TermCommand)?
                    .ok_or(ParseError::MissingField(r.key(Field::TermCommand)))?,
                raw: r.string(Field::TermCommandRaw)?,
            },
            Op::GetTerminalOutput => B::GetTerminalOutput {
                uid: r.i64(Field::TermUid)?,
            },
            Op::SendTerminalOutput => B::SendTerminalOutput(opaque()),
            Op::GetDir => B::GetDir {
                path: r.require_string(Field::Path)?,
            },
            Op::SendDir => {
                let dir = FieldReader::new(schema, r.require_object(Field::Dir)?);
                let mut entries = Vec::new();
                for entry in dir.array(Field::List)?.into_iter().flatten() {
                    entries.push(dir_entry_from_json(entry, schema)?);
                }
                B::SendDir(DirListing {
                    path: dir.require_string(Field::Path)?,
                    entries,
                    error: dir.string(Field::Error)?,
                    code: dir.i64(Field::Code)?,
                })
            }
            Op::GetFile => B::GetFile {
                path: r.require_string(Field::Path)?,
            },
            Op::SendFile => {
                let file = FieldReader::new(schema, r.require_object(Field::File)?);
                B::SendFile(FileTransfer {
                    path: file.require_string(Field::Path)?,
                    details: file
                        .raw(Field::Details)
                        .map(|d| dir_entry_from_json(d, schema))
                        .transpose()?,
                    contents: file.bytes(Field::Contents)?,
                    error: file.string(Field::Error)?,
                    code: file.i64(Field::Code)?,
                })
            }
            Op::ExecuteFilesystemOperation => {
                let code = r.require_i64(Field::Operation)?;
                let flag = |f| r.flag(f).map(|v| v.unwrap_or(false));
                let op = match code {
                    FilesystemOperation::MAKE_DIR => FilesystemOperation::MakeDir {
                        path: r.require_string(Field::Path)?,
                        make_parents: flag(Field::MakeParents)?,
                    },
                    FilesystemOperation::REMOVE => FilesystemOperation::Remove {
                        path: r.require_string(Field::Path)?,
                        recursive: flag(Field::Recursive)?,
                        force: flag(Field::Force)?,
                    },
                    FilesystemOperation::MAKE_FILE => FilesystemOperation::MakeFile {
                        path: r.require_string(Field::Path)?,
                        overwrite: flag(Field::Overwrite)?,
                        make_parents: flag(Field::MakeParents)?,
                    },
                    FilesystemOperation::WRITE_FILE => FilesystemOperation::WriteFile {
                        path: r.require_string(Field::Path)?,
                        append: flag(Field::Append)?,
                        data: r.bytes(Field::Data)?.unwrap_or_default(),
                    },
                    FilesystemOperation::WRITE_FILE_FROM_REMOTE => FilesystemOperation::WriteFileFromRemote,
                    other => {
                        return Err(ParseError::InvalidField {
                            key: r.key(Field::Operation),
                            reason: format!("unknown filesystem operation {}", other),
                        })
                    }
                };
                B::ExecuteFilesystemOperation(op)
            }
            Op::SendFilesystemOperationResult => B::SendFilesystemOperationResult(read_outcome(&r)?),
            Op::GetDeviceList => B::GetDeviceList {
                detailed: r.flag(Field::Detailed)?,
            },
            Op::SendDeviceList => B::SendDeviceList(opaque()),
            Op::RequestDeviceToLeave => B::RequestDeviceToLeave {
                device: r.require_string(Field::Device)?,
            },
            Op::LocateDevice => B::LocateDevice {
                device: r.require_string(Field::Device)?,
            },
            Op::PermitJoining => B::PermitJoining {
                duration: r.i64(Field::Duration)?,
            },
            Op::ExecuteDeviceManagementOperation => {
                let code = r.require_i64(Field::Operation)?;
                let kind = DeviceOperationKind::from_code(code).ok_or_else(|| ParseError::InvalidField {
                    key: r.key(Field::Operation),
                    reason: format!("unknown device operation {}", code),
                })?;
                B::ExecuteDeviceManagementOperation(DeviceOperation {
                    kind,
                    params: DeviceOperationParams {
                        device: r.string(Field::Device)?,
                        duration: r.i64(Field::Duration)?,
                        interval: r.i64(Field::Interval)?,
                        mode: r.i64(Field::Mode)?,
                        enable: r.flag(Field::Enable)?,
                        minimum: r.i64(Field::MinimumValue)?,
                        maximum: r.i64(Field::MaximumValue)?,
                    },
                })
            }
            Op::SendDeviceManagementResult => B::SendDeviceManagementResult(read_outcome(&r)?),
            Op::GetAvailableData => B::GetAvailableData,
            Op::GetData => B::GetData(read_data_request(&r, schema)?),
            Op::SendData => B::SendData(read_data_response(&r, schema)?),
            Op::GetLatestReadings => B::GetLatestReadings,
            Op::SendLatestReadings => B::SendLatestReadings(opaque()),
            Op::GetWaveform => B::GetWaveform(opaque()),
            Op::BroadcastDispatch => {
                let l = FieldReader::new(legacy, map);
                let mut devices = Vec::new();
                for d in l.require_array(Field::Devices)? {
                    let device = d.as_str().ok_or_else(|| ParseError::InvalidField {
                        key: l.key(Field::Devices),
                        reason: "expected list of addresses".to_string(),
                    })?;
                    devices.push(device.to_string());
                }
                B::BroadcastDispatch {
                    devices,
                    endpoint: l.require_int(Field::Endpoint)?,
                    revert: l.i64(Field::Revert)?,
                }
            }
            Op::SwitchState => {
                let l = FieldReader::new(legacy, map);
                B::SwitchState {
                    device: l.require_string(Field::Device)?,
                    endpoint: l.require_int(Field::Endpoint)?,
                    action: l
                        .raw(Field::Action)
                        .cloned()
                        .ok_or(ParseError::MissingField(l.key(Field::Action)))?,
                }
            }
            Op::DispatchReport => B::DispatchReport {
                device: r.require_string(Field::Device)?,
            },
            Op::UflsReport => B::UflsReport {
                device: r.require_string(Field::Device)?,
                frequency_of_disconnect: r.i64(Field::FrequencyOfDisconnect)?,
            },
            Op::ReadAttributes => {
                let mut attributes = Vec::new();
                for a in r.require_array(Field::Attributes)? {
                    let id = a
                        .as_u64()
                        .and_then(|v| u16::try_from(v).ok())
                        .ok_or_else(|| ParseError::InvalidField {
                            key: r.key(Field::Attributes),
                            reason: "expected attribute id".to_string(),
                        })?;
                    attributes.push(id);
                }
                B::ReadAttributes {
                    device: r.require_string(Field::Device)?,
                    endpoint: r.require_int(Field::Endpoint)?,
                    attributes,
                }
            }
            Op::WriteAttributes => {
                let mut attributes = Vec::new();
                for a in r.require_array(Field::Attributes)? {
                    let entry = FieldReader::new(schema, as_object(a, "attribute")?);
                    attributes.push(AttributeWrite {
                        attribute_id: entry.require_int(Field::AttributeId)?,
                        value: entry
                            .raw(Field::Value)
                            .cloned()
                            .ok_or(ParseError::MissingField(entry.key(Field::Value)))?,
                    });
                }
                B::WriteAttributes {
                    device: r.require_string(Field::Device)?,
                    endpoint: r.require_int(Field::Endpoint)?,
                    attributes,
                }
            }
        };
        Ok(body)
    }
}

fn dir_entry_to_json(entry: &DirEntry, schema: &VersionSchema) -> Result<Value, ValidationError> {
    let mut w = FieldWriter::new(schema);
    w.put(Field::Name, entry.name.as_str())?
        .put_opt(Field::Size, entry.size)?;
    // Only present when set.
    if entry.is_directory {
        w.put(Field::IsDirectory, 1)?;
    }
    Ok(Value::Object(w.finish()))
}

fn dir_entry_from_json(value: &Value, schema: &VersionSchema) -> Result<DirEntry, ParseError> {
    let r = FieldReader::new(schema, as_object(value, "entry")?);
    Ok(DirEntry {
        name: r.require_string(Field::Name)?,
        size: r.u64(Field::Size)?,
        is_directory: r.flag(Field::IsDirectory)?.unwrap_or(false),
    })
}

fn read_outcome(r: &FieldReader<'_>) -> Result<OperationOutcome, ParseError> {
    Ok(OperationOutcome {
        result: r.require_i64(Field::Result)?,
        operation: r.i64(Field::Operation)?,
        details: r.string(Field::Details)?,
        error: r.string(Field::Error)?,
    })
}

fn read_source(r: &FieldReader<'_>, schema: &VersionSchema) -> Result<DataSource, ParseError> {
    let source = match r.string(Field::Source)? {
        None => DataSource::Sdb,
        Some(s) => DataSource::from_wire(&s).ok_or_else(|| ParseError::InvalidField {
            key: r.key(Field::Source),
            reason: format!("unknown data source {:?}", s),
        })?,
    };
    if source == DataSource::LatestReadings && !schema.capabilities().latest_readings_source {
        return Err(ParseError::InvalidField {
            key: r.key(Field::Source),
            reason: format!("latest readings source requires protocol 1.1, got {}", schema.version()),
        });
    }
    Ok(source)
}

fn read_data_request(r: &FieldReader<'_>, schema: &VersionSchema) -> Result<DataRequest, ParseError> {
    let source = read_source(r, schema)?;
    let fifo = r.int::<u8>(Field::Fifo)?.unwrap_or(0);
    if fifo >= FIFO_COUNT {
        return Err(ParseError::InvalidField {
            key: r.key(Field::Fifo),
            reason: format!("fifo {} out of range 0-{}", fifo, FIFO_COUNT - 1),
        });
    }

    let mut flags = DeltaFlags::empty();
    for (field, flag) in [
        (Field::DelIeee, DeltaFlags::DEVICE),
        (Field::DelEp, DeltaFlags::ENDPOINT),
        (Field::DelClu, DeltaFlags::CLUSTER),
        (Field::DelTime, DeltaFlags::TIME),
    ] {
        flags.set(flag, r.flag(field)?.unwrap_or(true));
    }

    Ok(DataRequest {
        source,
        max_cells: r.int::<u32>(Field::NCells)?.unwrap_or(DEFAULT_CELL_COUNT),
        fifo,
        flags,
    })
}

fn read_data_response(r: &FieldReader<'_>, schema: &VersionSchema) -> Result<DataResponse, ParseError> {
    match read_source(r, schema)? {
        DataSource::Sdb => {
            let data = FieldReader::new(schema, r.require_object(Field::Data)?);
            let cells = match data.array(Field::Cells)? {
                Some(values) => cells_from_json(values, schema)?,
                None => Vec::new(),
            };
            Ok(DataResponse::Sdb {
                fifo: data.int::<u8>(Field::Fifo)?.unwrap_or(0),
                cells,
            })
        }
        DataSource::LatestReadings => Ok(DataResponse::LatestReadings(
            r.raw(Field::Data).cloned().unwrap_or(Value::Array(Vec::new())),
        )),
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Wire id
    pub id: MessageId,
    /// Cluster the message is addressed to
    pub cluster: Cluster,
    /// Contents
    pub body: MessageBody,
}

impl Message {
    /// Build a message for `version`, choosing the id valid in that version
    /// and the operation's default cluster
    pub fn for_version(version: ProtocolVersion, body: MessageBody) -> Result<Self, ValidationError> {
        let operation = body.operation();
        let id = MessageId::for_operation(operation, version)
            .ok_or(ValidationError::MessageNotInVersion { operation, version })?;
        Ok(Self {
            id,
            cluster: operation.default_cluster(),
            body,
        })
    }

    /// Override the cluster (attribute messages address arbitrary clusters)
    pub fn with_cluster(mut self, cluster: Cluster) -> Self {
        self.cluster = cluster;
        self
    }

    /// Operation performed
    pub fn operation(&self) -> Operation {
        self.body.operation()
    }

    /// Serialize for `version`
    pub fn to_json(&self, registry: &VersionRegistry, version: ProtocolVersion) -> Result<Value, ValidationError> {
        if !self.id.versions().contains(version) || self.id.operation() != self.body.operation() {
            return Err(ValidationError::MessageNotInVersion {
                operation: self.body.operation(),
                version,
            });
        }
        let schema = registry.schema(version)?;
        let legacy = registry.baseline()?;

        let mut w = FieldWriter::new(schema);
        w.put(Field::MsgId, self.id.as_str())?
            .put(Field::Cluster, self.cluster.to_json(schema)?)?;
        self.body.write(&mut w, schema, legacy)?;
        Ok(Value::Object(w.finish()))
    }

    /// Parse a message written with `schema`
    pub fn from_json(registry: &VersionRegistry, schema: &VersionSchema, value: &Value) -> Result<Self, ParseError> {
        let map = as_object(value, "message")?;
        let r = FieldReader::new(schema, map);

        let wire = r.require_string(Field::MsgId)?;
        let id = MessageId::from_wire(&wire).ok_or(ParseError::UnknownMessage(wire))?;
        if !id.versions().contains(schema.version()) {
            return Err(ParseError::MessageNotInVersion {
                id: id.as_str(),
                version: schema.version(),
            });
        }

        let cluster = match r.object(Field::Cluster)? {
            Some(m) => Cluster::from_json(schema, m)?,
            None => id.operation().default_cluster(),
        };
        let legacy = registry
            .baseline()
            .map_err(|_| ParseError::UnsupportedVersion)?;
        let body = MessageBody::read(id, map, schema, legacy)?;

        Ok(Self { id, cluster, body })
    }
}
