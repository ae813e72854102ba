//! Wrapper codec.
//!
//! A wrapper is the top-level JSON envelope of every transmission:
//!
//! ```text
//! {
//!   "ProtocolVersion_1_1": "1.1",
//!   "ESBoxVersion_1_1":    "2.3.0",          device -> server only
//!   "Auth":                [HAN, link key],  device -> server only
//!   "Time_1_1":            1405705444,       device -> server only
//!   "Messages_1_1":        [ {MsgID_1_1, Cluster_1_1, ...}, ... ]
//! }
//! ```
//!
//! A wrapper travelling to the device carries at most one message; a wrapper
//! from the device may carry any number.

use crate::error::{ParseError, ValidationError};
use crate::fields::{FieldReader, FieldWriter};
use crate::message::Message;
use crate::registry::{Field, ProtocolVersion, VersionRegistry};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

/// Which way a wrapper travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// Server to device; at most one message
    ToDevice,
    /// Device to server; any number of messages
    FromDevice,
}

impl Direction {
    /// Most messages a wrapper in this direction may carry
    pub fn message_cap(self) -> Option<usize> {
        match self {
            Direction::ToDevice => Some(1),
            Direction::FromDevice => None,
        }
    }
}

/// Device identity sent in the `Auth` field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// HAN (IEEE) address of the device
    pub address: String,
    /// Zigbee link key issued to the device
    pub link_key: String,
}

/// Top-level envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wrapper {
    /// Version declared by the sender. An inbound wrapper keeps the declared
    /// value even when this side does not support it.
    pub protocol_version: ProtocolVersion,
    /// Device firmware version
    pub device_version: Option<String>,
    /// Device identity
    pub identity: Option<Identity>,
    /// Seconds since the epoch at which the device built the wrapper
    pub timestamp: Option<i64>,
    /// Messages in order
    pub messages: Vec<Message>,
}

impl Wrapper {
    /// A wrapper with no device fields
    pub fn new(protocol_version: ProtocolVersion, messages: Vec<Message>) -> Self {
        Self {
            protocol_version,
            device_version: None,
            identity: None,
            timestamp: None,
            messages,
        }
    }

    /// Attach the device fields
    pub fn with_device(mut self, identity: Identity, device_version: Option<String>, timestamp: i64) -> Self {
        self.identity = Some(identity);
        self.device_version = device_version;
        self.timestamp = Some(timestamp);
        self
    }
}

/// Encodes and decodes wrappers through a shared version registry
#[derive(Debug, Clone)]
pub struct WrapperCodec {
    registry: Arc<VersionRegistry>,
}

impl WrapperCodec {
    /// Create a codec
    pub fn new(registry: Arc<VersionRegistry>) -> Self {
        Self { registry }
    }

    /// Registry used for field lookups
    pub fn registry(&self) -> &Arc<VersionRegistry> {
        &self.registry
    }

    /// Serialize a wrapper using the key table of its protocol version
    pub fn encode_outbound(&self, wrapper: &Wrapper, direction: Direction) -> Result<Bytes, ValidationError> {
        if let Some(cap) = direction.message_cap() {
            if wrapper.messages.len() > cap {
                return Err(ValidationError::TooManyMessages(wrapper.messages.len()));
            }
        }
        if direction == Direction::ToDevice && (wrapper.identity.is_some() || wrapper.timestamp.is_some()) {
            return Err(ValidationError::UnexpectedIdentity);
        }

        let version = wrapper.protocol_version;
        let schema = self.registry.schema(version)?;

        let messages = wrapper
            .messages
            .iter()
            .map(|m| m.to_json(&self.registry, version))
            .collect::<Result<Vec<_>, _>>()?;

        let mut w = FieldWriter::new(schema);
        w.put(Field::ProtocolVersion, version.to_string())?
            .put_opt(Field::DeviceVersion, wrapper.device_version.as_deref())?;
        if let Some(identity) = &wrapper.identity {
            w.put(
                Field::Auth,
                vec![identity.address.as_str(), identity.link_key.as_str()],
            )?;
        }
        w.put_opt(Field::Time, wrapper.timestamp)?
            .put(Field::Messages, messages)?;

        let bytes = serde_json::to_vec(&Value::Object(w.finish()))
            .map_err(|e| ValidationError::Serialize(e.to_string()))?;
        trace!(
            "Encoded {:?} wrapper v{} with {} messages ({} bytes)",
            direction,
            version,
            wrapper.messages.len(),
            bytes.len()
        );
        Ok(Bytes::from(bytes))
    }

    /// Parse an inbound wrapper.
    ///
    /// The key table is chosen by probing each registered version's
    /// protocol-version key; the declared version is kept as-is so the caller
    /// can negotiate on it.
    pub fn decode_inbound(&self, bytes: &[u8], direction: Direction) -> Result<Wrapper, ParseError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ParseError::MalformedEnvelope(e.to_string()))?;
        let map = value
            .as_object()
            .ok_or_else(|| ParseError::MalformedEnvelope("top level is not a mapping".to_string()))?;

        let (schema, declared) = self.registry.detect(map).ok_or(ParseError::UnsupportedVersion)?;
        let protocol_version = declared
            .as_str()
            .and_then(|s| s.parse::<ProtocolVersion>().ok())
            .ok_or(ParseError::UnsupportedVersion)?;

        let r = FieldReader::new(schema, map);
        let raw_messages = r.array(Field::Messages)?.map(Vec::as_slice).unwrap_or_default();
        if let Some(cap) = direction.message_cap() {
            if raw_messages.len() > cap {
                return Err(ParseError::TooManyMessages(raw_messages.len()));
            }
        }

        let identity = match r.array(Field::Auth)? {
            None => None,
            Some(auth) => match auth.as_slice() {
                [Value::String(address), Value::String(link_key)] => Some(Identity {
                    address: address.clone(),
                    link_key: link_key.clone(),
                }),
                _ => {
                    return Err(ParseError::InvalidField {
                        key: r.key(Field::Auth),
                        reason: "expected [address, link key]".to_string(),
                    })
                }
            },
        };

        let messages = raw_messages
            .iter()
            .map(|m| Message::from_json(&self.registry, schema, m))
            .collect::<Result<Vec<_>, _>>()?;

        trace!(
            "Decoded {:?} wrapper v{} (schema {}) with {} messages",
            direction,
            protocol_version,
            schema.version(),
            messages.len()
        );

        Ok(Wrapper {
            protocol_version,
            device_version: r.string(Field::DeviceVersion)?,
            identity,
            timestamp: r.i64(Field::Time)?,
            messages,
        })
    }
}
