//! Session error types.

use esbox_storage::StorageError;
use esbox_wire::{CodecError, ParseError, ValidationError};
use thiserror::Error;

/// Misuse of the negotiation state machine; fatal to the session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Wrapper encoding requested before a version was chosen
    #[error("protocol version not negotiated")]
    NotNegotiated,

    /// The session is closed; nothing transitions out of Closed
    #[error("session is closed")]
    Closed,

    /// A negotiation step was invoked from a state that does not allow it
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        /// Step attempted
        action: &'static str,
        /// State name
        state: &'static str,
    },
}

/// Any error surfaced by a session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Negotiation misuse
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Inbound wrapper was dropped
    #[error("dropped inbound wrapper: {0}")]
    Parse(#[from] ParseError),

    /// Outbound wrapper or message is invalid
    #[error("invalid outbound message: {0}")]
    Validation(#[from] ValidationError),

    /// Telemetry exchange aborted
    #[error("telemetry decode failed: {0}")]
    Codec(#[from] CodecError),

    /// Collaborator failure
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}
