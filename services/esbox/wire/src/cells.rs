//! Delta codec for stream-database telemetry cells.
//!
//! A SendData payload carries an ordered list of cells. To save bytes on the
//! uplink, each of four header fields may be suppressed when it is unchanged
//! from the previous cell:
//!
//! | Flag       | Wire switch | Effect when set                                  |
//! |------------|-------------|--------------------------------------------------|
//! | `DEVICE`   | `DelIeee`   | omit the device address if unchanged             |
//! | `ENDPOINT` | `DelEP`     | omit the endpoint if unchanged                   |
//! | `CLUSTER`  | `DelClu`    | omit the cluster if unchanged                    |
//! | `TIME`     | `DelTime`   | send a signed delta instead of absolute time, omit a zero delta |
//!
//! The first cell of a sequence is always sent in full. Decoding replays the
//! same state machine, so cells must be processed strictly in order and a
//! fresh [`CellDecoder`] is needed for every sequence.

use crate::error::{ParseError, ValidationError};
use crate::fields::{as_object, FieldReader, FieldWriter};
use crate::message::Cluster;
use crate::registry::{Field, VersionSchema};
use base64::{engine::general_purpose, Engine as _};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

bitflags! {
    /// Per-field suppression switches for a telemetry exchange
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DeltaFlags: u8 {
        /// Omit unchanged device address
        const DEVICE = 1 << 0;
        /// Omit unchanged endpoint
        const ENDPOINT = 1 << 1;
        /// Omit unchanged cluster
        const CLUSTER = 1 << 2;
        /// Delta-encode time
        const TIME = 1 << 3;
    }
}

impl Default for DeltaFlags {
    /// Every switch defaults to on in GetData
    fn default() -> Self {
        Self::all()
    }
}

/// Delta codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A field was omitted before any value for it had been seen
    #[error("cell omits {0} before a baseline was established")]
    MissingBaseline(&'static str),

    /// A field was omitted although its suppression switch is off
    #[error("cell omits {0} but suppression is disabled")]
    UnexpectedOmission(&'static str),

    /// A delta time arrived although time suppression is off
    #[error("delta time received but time suppression is disabled")]
    UnexpectedDelta,

    /// Applying a delta overflowed the running time
    #[error("delta time overflows running timestamp")]
    TimeOverflow,
}

/// Attribute value as stored in the stream database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeData {
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    Uint(u64),
    /// Text
    String(String),
    /// Raw bytes, base64 on the wire
    Bytes(Vec<u8>),
    /// Marker recorded when the device clock was changed
    TimeChange,
}

impl AttributeData {
    /// Wire type code
    pub const TYPE_INT: i64 = 0;
    /// Wire type code
    pub const TYPE_UINT: i64 = 1;
    /// Wire type code
    pub const TYPE_STRING: i64 = 2;
    /// Wire type code
    pub const TYPE_BYTE: i64 = 3;
    /// Wire type code; decoded as a string
    pub const TYPE_RAW: i64 = 4;
    /// Wire type code
    pub const TYPE_TIMECHANGE: i64 = 5;

    const TIMECHANGE_VALUE: &'static str = "TIMECHANGE";

    fn type_code(&self) -> i64 {
        match self {
            AttributeData::Int(_) => Self::TYPE_INT,
            AttributeData::Uint(_) => Self::TYPE_UINT,
            AttributeData::String(_) => Self::TYPE_STRING,
            AttributeData::Bytes(_) => Self::TYPE_BYTE,
            AttributeData::TimeChange => Self::TYPE_TIMECHANGE,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            AttributeData::Int(v) => Value::from(*v),
            AttributeData::Uint(v) => Value::from(*v),
            AttributeData::String(s) => Value::from(s.as_str()),
            AttributeData::Bytes(b) => Value::from(general_purpose::STANDARD.encode(b)),
            AttributeData::TimeChange => Value::from(Self::TIMECHANGE_VALUE),
        }
    }

    fn from_json(code: i64, value: &Value, key: &'static str) -> Result<Self, ParseError> {
        let invalid = |reason: &str| ParseError::InvalidField {
            key,
            reason: reason.to_string(),
        };
        match code {
            Self::TYPE_INT => value.as_i64().map(AttributeData::Int).ok_or_else(|| invalid("expected integer")),
            Self::TYPE_UINT => value.as_u64().map(AttributeData::Uint).ok_or_else(|| invalid("expected unsigned integer")),
            Self::TYPE_STRING | Self::TYPE_RAW => value
                .as_str()
                .map(|s| AttributeData::String(s.to_string()))
                .ok_or_else(|| invalid("expected string")),
            Self::TYPE_BYTE => {
                let s = value.as_str().ok_or_else(|| invalid("expected base64 string"))?;
                general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map(AttributeData::Bytes)
                    .map_err(|e| invalid(&e.to_string()))
            }
            Self::TYPE_TIMECHANGE => Ok(AttributeData::TimeChange),
            other => Err(invalid(&format!("unknown attribute type {}", other))),
        }
    }
}

/// One attribute reading inside a cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeValue {
    /// Attribute id, namespaced by the cell's cluster
    pub attribute_id: u16,
    /// Typed value
    pub value: AttributeData,
}

/// One logged observation batch, fully resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryCell {
    /// HAN address of the source device
    pub device: String,
    /// Source endpoint
    pub endpoint: u8,
    /// Source cluster
    pub cluster: Cluster,
    /// Absolute time, seconds since epoch
    pub time: i64,
    /// Readings in this cell
    pub attributes: Vec<AttributeValue>,
}

/// Time as carried by an encoded cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellTime {
    /// Absolute seconds since epoch
    Absolute(i64),
    /// Signed offset from the previous cell
    Delta(i64),
}

/// A cell as it appears on the wire, with suppressed fields absent
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncodedCell {
    /// Device address, if emitted
    pub device: Option<String>,
    /// Endpoint, if emitted
    pub endpoint: Option<u8>,
    /// Cluster, if emitted
    pub cluster: Option<Cluster>,
    /// Time, if emitted
    pub time: Option<CellTime>,
    /// Readings
    pub attributes: Vec<AttributeValue>,
}

impl EncodedCell {
    /// Serialize with the key table of `schema`
    pub fn to_json(&self, schema: &VersionSchema) -> Result<Value, ValidationError> {
        let mut w = FieldWriter::new(schema);
        w.put_opt(Field::CellDevice, self.device.clone())?;
        w.put_opt(Field::CellEndpoint, self.endpoint)?;
        if let Some(cluster) = self.cluster {
            if schema.capabilities().nested_cell_cluster {
                w.put(Field::Cluster, cluster.to_json(schema)?)?;
            } else {
                w.put(Field::DataClusterManufacturer, cluster.manufacturer)?;
                w.put(Field::DataClusterId, cluster.id)?;
            }
        }
        match self.time {
            Some(CellTime::Absolute(t)) => {
                w.put(Field::Time, t)?;
            }
            Some(CellTime::Delta(d)) => {
                w.put(Field::DeltaTime, d)?;
            }
            None => {}
        }

        let mut attributes = Vec::with_capacity(self.attributes.len());
        for attr in &self.attributes {
            let mut a = FieldWriter::new(schema);
            a.put(Field::CellAttributeId, attr.attribute_id)?
                .put(Field::CellType, attr.value.type_code())?
                .put(Field::CellValue, attr.value.to_json())?;
            attributes.push(Value::Object(a.finish()));
        }
        w.put(Field::CellAttributes, attributes)?;

        Ok(Value::Object(w.finish()))
    }

    /// Parse with the key table of `schema`
    pub fn from_json(schema: &VersionSchema, value: &Value) -> Result<Self, ParseError> {
        let map = as_object(value, "cell")?;
        let r = FieldReader::new(schema, map);

        let cluster = if schema.capabilities().nested_cell_cluster {
            r.object(Field::Cluster)?
                .map(|m| Cluster::from_json(schema, m))
                .transpose()?
        } else {
            match (
                r.int::<u16>(Field::DataClusterManufacturer)?,
                r.int::<u16>(Field::DataClusterId)?,
            ) {
                (Some(manufacturer), Some(id)) => Some(Cluster::new(manufacturer, id)),
                (None, None) => None,
                _ => {
                    return Err(ParseError::InvalidField {
                        key: r.key(Field::DataClusterId),
                        reason: "cluster manufacturer and id must appear together".to_string(),
                    })
                }
            }
        };

        let time = match (r.i64(Field::Time)?, r.i64(Field::DeltaTime)?) {
            (Some(_), Some(_)) => {
                return Err(ParseError::InvalidField {
                    key: r.key(Field::DeltaTime),
                    reason: "cell carries both absolute and delta time".to_string(),
                })
            }
            (Some(t), None) => Some(CellTime::Absolute(t)),
            (None, Some(d)) => Some(CellTime::Delta(d)),
            (None, None) => None,
        };

        let mut attributes = Vec::new();
        for entry in r.array(Field::CellAttributes)?.into_iter().flatten() {
            let a = FieldReader::new(schema, as_object(entry, "attribute")?);
            let code = a.require_i64(Field::CellType)?;
            let raw = a
                .raw(Field::CellValue)
                .ok_or(ParseError::MissingField(a.key(Field::CellValue)))?;
            attributes.push(AttributeValue {
                attribute_id: a.require_int(Field::CellAttributeId)?,
                value: AttributeData::from_json(code, raw, a.key(Field::CellValue))?,
            });
        }

        Ok(Self {
            device: r.string(Field::CellDevice)?,
            endpoint: r.int(Field::CellEndpoint)?,
            cluster,
            time,
            attributes,
        })
    }
}

/// Last values emitted (or resolved) for each suppressible field
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecState {
    /// Last device address
    pub device: Option<String>,
    /// Last endpoint
    pub endpoint: Option<u8>,
    /// Last cluster
    pub cluster: Option<Cluster>,
    /// Running absolute time
    pub time: Option<i64>,
}

impl CodecState {
    /// Forget everything; the next cell is a baseline
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether no cell has been processed since the last reset
    pub fn is_empty(&self) -> bool {
        self.device.is_none() && self.endpoint.is_none() && self.cluster.is_none() && self.time.is_none()
    }
}

/// Stateful encoder for one cell sequence
#[derive(Debug, Clone, Default)]
pub struct CellEncoder {
    flags: DeltaFlags,
    state: CodecState,
}

impl CellEncoder {
    /// Create an encoder with the given suppression switches
    pub fn new(flags: DeltaFlags) -> Self {
        Self {
            flags,
            state: CodecState::default(),
        }
    }

    /// Suppression switches in use
    pub fn flags(&self) -> DeltaFlags {
        self.flags
    }

    /// Current codec state
    pub fn state(&self) -> &CodecState {
        &self.state
    }

    /// Start a new sequence
    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Encode the next cell of the sequence
    pub fn encode(&mut self, cell: &TelemetryCell) -> EncodedCell {
        let baseline = self.state.is_empty();

        let device = suppress(
            baseline || !self.flags.contains(DeltaFlags::DEVICE),
            &mut self.state.device,
            &cell.device,
        );
        let endpoint = suppress(
            baseline || !self.flags.contains(DeltaFlags::ENDPOINT),
            &mut self.state.endpoint,
            &cell.endpoint,
        );
        let cluster = suppress(
            baseline || !self.flags.contains(DeltaFlags::CLUSTER),
            &mut self.state.cluster,
            &cell.cluster,
        );

        let time = match self.state.time {
            Some(previous) if !baseline && self.flags.contains(DeltaFlags::TIME) => {
                match cell.time.checked_sub(previous) {
                    Some(0) => None,
                    Some(delta) => Some(CellTime::Delta(delta)),
                    None => Some(CellTime::Absolute(cell.time)),
                }
            }
            _ => Some(CellTime::Absolute(cell.time)),
        };
        self.state.time = Some(cell.time);

        EncodedCell {
            device,
            endpoint,
            cluster,
            time,
            attributes: cell.attributes.clone(),
        }
    }
}

/// Emit `value` unless it equals the last emitted one and may be suppressed
fn suppress<T: Clone + PartialEq>(always: bool, last: &mut Option<T>, value: &T) -> Option<T> {
    if !always && last.as_ref() == Some(value) {
        return None;
    }
    *last = Some(value.clone());
    Some(value.clone())
}

/// Stateful decoder for one cell sequence
#[derive(Debug, Clone, Default)]
pub struct CellDecoder {
    flags: DeltaFlags,
    state: CodecState,
}

impl CellDecoder {
    /// Create a decoder expecting the given suppression switches
    pub fn new(flags: DeltaFlags) -> Self {
        Self {
            flags,
            state: CodecState::default(),
        }
    }

    /// Current codec state
    pub fn state(&self) -> &CodecState {
        &self.state
    }

    /// Start a new sequence
    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Decode the next cell of the sequence
    pub fn decode(&mut self, cell: &EncodedCell) -> Result<TelemetryCell, CodecError> {
        let device = restore(
            cell.device.as_ref(),
            &mut self.state.device,
            self.flags.contains(DeltaFlags::DEVICE),
            "device",
        )?;
        let endpoint = restore(
            cell.endpoint.as_ref(),
            &mut self.state.endpoint,
            self.flags.contains(DeltaFlags::ENDPOINT),
            "endpoint",
        )?;
        let cluster = restore(
            cell.cluster.as_ref(),
            &mut self.state.cluster,
            self.flags.contains(DeltaFlags::CLUSTER),
            "cluster",
        )?;

        let time = match cell.time {
            Some(CellTime::Absolute(t)) => t,
            Some(CellTime::Delta(delta)) => {
                if !self.flags.contains(DeltaFlags::TIME) {
                    return Err(CodecError::UnexpectedDelta);
                }
                let previous = self.state.time.ok_or(CodecError::MissingBaseline("time"))?;
                previous.checked_add(delta).ok_or(CodecError::TimeOverflow)?
            }
            None => {
                let previous = self.state.time.ok_or(CodecError::MissingBaseline("time"))?;
                if !self.flags.contains(DeltaFlags::TIME) {
                    return Err(CodecError::UnexpectedOmission("time"));
                }
                previous
            }
        };
        self.state.time = Some(time);

        Ok(TelemetryCell {
            device,
            endpoint,
            cluster,
            time,
            attributes: cell.attributes.clone(),
        })
    }
}

/// Resolve a possibly omitted field from the running state
fn restore<T: Clone>(
    emitted: Option<&T>,
    last: &mut Option<T>,
    suppressible: bool,
    name: &'static str,
) -> Result<T, CodecError> {
    match emitted {
        Some(value) => {
            *last = Some(value.clone());
            Ok(value.clone())
        }
        None => {
            let value = last.clone().ok_or(CodecError::MissingBaseline(name))?;
            if !suppressible {
                return Err(CodecError::UnexpectedOmission(name));
            }
            Ok(value)
        }
    }
}

/// Encode a whole sequence with a fresh encoder
pub fn encode_cells(cells: &[TelemetryCell], flags: DeltaFlags) -> Vec<EncodedCell> {
    let mut encoder = CellEncoder::new(flags);
    cells.iter().map(|cell| encoder.encode(cell)).collect()
}

/// Decode a whole sequence with a fresh decoder
pub fn decode_cells(cells: &[EncodedCell], flags: DeltaFlags) -> Result<Vec<TelemetryCell>, CodecError> {
    let mut decoder = CellDecoder::new(flags);
    cells.iter().map(|cell| decoder.decode(cell)).collect()
}

/// Serialize encoded cells into a wire list
pub fn cells_to_json(cells: &[EncodedCell], schema: &VersionSchema) -> Result<Vec<Value>, ValidationError> {
    cells.iter().map(|cell| cell.to_json(schema)).collect()
}

/// Parse a wire list of cells
pub fn cells_from_json(values: &[Value], schema: &VersionSchema) -> Result<Vec<EncodedCell>, ParseError> {
    values.iter().map(|v| EncodedCell::from_json(schema, v)).collect()
}
