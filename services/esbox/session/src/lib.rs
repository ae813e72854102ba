//! Per-connection ESBox API engine.
//!
//! A [`Session`] drives one link between a field gateway and a collection
//! server: it negotiates the protocol version, queues outbound messages,
//! answers requests on the device side and decodes telemetry on the server
//! side. It is transport-agnostic; bytes in, bytes out.
//!
//! ```text
//! server                               device
//!   | -- [GetSupportedVersions] v1.1 --> |
//!   | <-- [SendSupportedVersions] ------ |   established v1.1
//!   | -- [GetData fifo=0] -------------> |
//!   | <-- [SendData cells...] ---------- |
//!   | -- [NoFurtherMessages] ----------> |
//!   | <-- [NoFurtherMessages] ---------- |   exchange complete
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collaborators;
pub mod config;
pub mod error;
pub mod negotiation;
pub mod queue;
pub mod session;

pub use collaborators::{Collaborators, DeviceManager, NullDeviceManager, OperationResult};
pub use config::{EngineConfig, Role};
pub use error::{ProtocolError, SessionError};
pub use negotiation::{NegotiationState, Negotiator};
pub use queue::{OutboundQueue, QueuedEntry};
pub use session::{CloseReason, Session, SessionEvent, SessionStats};
