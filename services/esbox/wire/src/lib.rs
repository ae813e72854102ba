//! Wire model for the ESBox API.
//!
//! The ESBox API is a JSON request/response protocol between a field gateway
//! (the device) and a collection server. This crate holds everything that is
//! pure data transformation:
//!
//! - **Version registry**: per-version field keys and capabilities
//! - **Message catalog**: one typed body per operation, with version-gated ids
//! - **Wrapper codec**: the top-level envelope and its cardinality rules
//! - **Cell codec**: delta compression of telemetry cells
//!
//! ## Wire Format
//!
//! ```text
//! wrapper  = { ProtocolVersion, [ESBoxVersion], [Auth], [Time], Messages: [message] }
//! message  = { MsgID, Cluster: {ClusterID, ClusterManufacturer}, ...body fields }
//! SendData = { ..., Source, Data: { Fifo, Cells: [cell] } }
//! cell     = { [device], [endpoint], [cluster], [Time | DeltaTime], attributes }
//! ```
//!
//! Key strings carry a `_1_1` suffix in version 1.1; the registry resolves
//! them so callers only deal with [`Field`] values.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cells;
pub mod error;
mod fields;
pub mod message;
pub mod registry;
pub mod wrapper;

// Re-export main types
pub use cells::{
    cells_from_json, cells_to_json, decode_cells, encode_cells, AttributeData, AttributeValue,
    CellDecoder, CellEncoder, CellTime, CodecError, CodecState, DeltaFlags, EncodedCell,
    TelemetryCell,
};
pub use error::{InvalidVersion, ParseError, ValidationError};
pub use message::{
    AttributeWrite, Cluster, DataRequest, DataResponse, DataSource, DeviceOperation,
    DeviceOperationKind, DeviceOperationParams, DirEntry, DirListing, FileTransfer,
    FilesystemOperation, Message, MessageBody, MessageId, Opaque, Operation, OperationOutcome,
    QueueMode, UpdateStatusQuery, VersionRange, DEFAULT_CELL_COUNT, FIFO_COUNT,
};
pub use registry::{Capabilities, Field, ProtocolVersion, VersionRegistry, VersionSchema};
pub use wrapper::{Direction, Identity, Wrapper, WrapperCodec};
