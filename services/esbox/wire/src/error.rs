//! Wire protocol error types.
//!
//! Inbound problems are [`ParseError`]s: the offending wrapper is dropped and
//! the session carries on. Outbound problems are [`ValidationError`]s and
//! always indicate a caller bug; they are never corrected silently.

use crate::message::Operation;
use crate::registry::{Field, ProtocolVersion};
use thiserror::Error;

/// Errors raised while decoding an inbound wrapper or message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The top-level payload is not a well-formed JSON mapping
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// No recognizable protocol version key or value
    #[error("unsupported or missing protocol version")]
    UnsupportedVersion,

    /// Message id is not part of the catalog
    #[error("unknown message id {0:?}")]
    UnknownMessage(String),

    /// Message id exists but is not valid in the wrapper's version
    #[error("message {id} is not valid in protocol {version}")]
    MessageNotInVersion {
        /// Wire id of the message
        id: &'static str,
        /// Version the wrapper was decoded with
        version: ProtocolVersion,
    },

    /// A server-to-device wrapper carried more than one message
    #[error("wrapper carries {0} messages, at most one allowed")]
    TooManyMessages(usize),

    /// A required field is absent
    #[error("missing field {0}")]
    MissingField(&'static str),

    /// A field is present but has the wrong shape or an out-of-range value
    #[error("invalid field {key}: {reason}")]
    InvalidField {
        /// Wire key of the field
        key: &'static str,
        /// What was wrong with it
        reason: String,
    },
}

/// Errors raised while building an outbound wrapper or message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A server-to-device wrapper may carry at most one message
    #[error("wrapper to device carries {0} messages, at most one allowed")]
    TooManyMessages(usize),

    /// The version has no wire key for this field
    #[error("field {field:?} does not exist in protocol {version}")]
    UnknownField {
        /// Canonical field
        field: Field,
        /// Version being encoded
        version: ProtocolVersion,
    },

    /// The version is not in the registry
    #[error("protocol {0} is not registered")]
    UnknownVersion(ProtocolVersion),

    /// The operation has no message id valid in this version
    #[error("operation {operation:?} has no message id in protocol {version}")]
    MessageNotInVersion {
        /// Operation being encoded
        operation: Operation,
        /// Version being encoded
        version: ProtocolVersion,
    },

    /// The body needs a capability this version lacks
    #[error("{capability} is not available in protocol {version}")]
    MissingCapability {
        /// Capability name
        capability: &'static str,
        /// Version being encoded
        version: ProtocolVersion,
    },

    /// Identity or timestamp supplied for a server-to-device wrapper
    #[error("identity and timestamp are only sent by the device")]
    UnexpectedIdentity,

    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
}

/// A version string that is not of the form `major.minor`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid protocol version {0:?}")]
pub struct InvalidVersion(pub String);
