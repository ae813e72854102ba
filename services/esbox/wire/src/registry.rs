//! Protocol version registry.
//!
//! Every wire key the API uses is named once by a canonical [`Field`]. Each
//! registered version maps the fields it knows to their key strings, so call
//! sites never branch on version suffixes. The registry is an immutable value
//! built once and handed to sessions by `Arc`.

use crate::error::{InvalidVersion, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A protocol version of the form `major.minor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtocolVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl ProtocolVersion {
    /// API version 1.0, the baseline every peer understands
    pub const V1_0: ProtocolVersion = ProtocolVersion::new(1, 0);
    /// API version 1.1
    pub const V1_1: ProtocolVersion = ProtocolVersion::new(1, 1);
    /// Version assumed for a peer that does not answer a capability probe
    pub const BASELINE: ProtocolVersion = Self::V1_0;

    /// Create a version
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidVersion(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for ProtocolVersion {
    type Error = InvalidVersion;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProtocolVersion> for String {
    fn from(version: ProtocolVersion) -> Self {
        version.to_string()
    }
}

/// Canonical name of every key used in wrappers, messages and cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Field {
    // Wrapper
    ProtocolVersion,
    DeviceVersion,
    Auth,
    Time,
    Messages,
    // Message header
    MsgId,
    Cluster,
    ClusterId,
    ClusterManufacturer,
    // Generic
    ProtocolVersions,
    Operation,
    Result,
    Details,
    Error,
    Enable,
    // Network
    Device,
    Endpoint,
    Devices,
    Revert,
    Action,
    Detailed,
    Duration,
    Interval,
    Mode,
    MinimumValue,
    MaximumValue,
    FrequencyOfDisconnect,
    // Attributes and data
    Attributes,
    AttributeId,
    Value,
    Data,
    DeltaTime,
    DataClusterManufacturer,
    DataClusterId,
    CellDevice,
    CellEndpoint,
    CellAttributes,
    CellAttributeId,
    CellType,
    CellValue,
    Source,
    Fifo,
    Cells,
    NCells,
    DelIeee,
    DelEp,
    DelClu,
    DelTime,
    // ESBox management
    Token,
    Options,
    UpdateCurrent,
    UpdateOtaRegistered,
    UpdateAllPending,
    TermCommand,
    TermCommandRaw,
    TermUid,
    // Filesystem
    Dir,
    File,
    Path,
    MakeParents,
    Recursive,
    Force,
    Overwrite,
    Append,
    Code,
    Contents,
    List,
    Name,
    Size,
    IsDirectory,
}

/// (field, key in 1.0, key in 1.1)
type FieldKeys = (Field, Option<&'static str>, Option<&'static str>);

const FIELD_KEYS: &[FieldKeys] = &[
    (Field::ProtocolVersion, Some("ProtocolVersion"), Some("ProtocolVersion_1_1")),
    (Field::DeviceVersion, Some("ESBoxVersion"), Some("ESBoxVersion_1_1")),
    (Field::Auth, Some("Auth"), Some("Auth")),
    (Field::Time, Some("Time"), Some("Time_1_1")),
    (Field::Messages, Some("Messages"), Some("Messages_1_1")),
    (Field::MsgId, Some("MsgID"), Some("MsgID_1_1")),
    (Field::Cluster, Some("Cluster"), Some("Cluster_1_1")),
    (Field::ClusterId, Some("ClusterID"), Some("ClusterID_1_1")),
    (Field::ClusterManufacturer, Some("ClusterManufacturer"), Some("ClusterManufacturer_1_1")),
    (Field::ProtocolVersions, None, Some("ProtocolVersions_1_1")),
    (Field::Operation, None, Some("Operation_1_1")),
    (Field::Result, None, Some("Result_1_1")),
    (Field::Details, None, Some("Details_1_1")),
    (Field::Error, None, Some("Error_1_1")),
    (Field::Enable, None, Some("Enable_1_1")),
    (Field::Device, Some("DevIEEE"), Some("HAN_1_1")),
    (Field::Endpoint, Some("EndpointID"), Some("EndpointID_1_1")),
    (Field::Devices, Some("Devices"), Some("Devices")),
    (Field::Revert, Some("Revert"), Some("Revert")),
    (Field::Action, Some("Action"), Some("Action")),
    (Field::Detailed, Some("Detailed"), Some("Detailed_1_1")),
    (Field::Duration, Some("Duration"), Some("Duration_1_1")),
    (Field::Interval, None, Some("Interval_1_1")),
    (Field::Mode, None, Some("Mode_1_1")),
    (Field::MinimumValue, None, Some("MinimumValue_1_1")),
    (Field::MaximumValue, None, Some("MaximumValue_1_1")),
    (Field::FrequencyOfDisconnect, Some("FrequencyOfDisconnect"), Some("FrequencyOfDisconnect_1_1")),
    (Field::Attributes, Some("Attributes"), Some("Attributes_1_1")),
    (Field::AttributeId, Some("AttributeID"), Some("AttributeID_1_1")),
    (Field::Value, Some("Value"), Some("Value_1_1")),
    (Field::Data, Some("Data"), Some("Data_1_1")),
    (Field::DeltaTime, Some("DeltaTime"), Some("DeltaTime_1_1")),
    (Field::DataClusterManufacturer, Some("DataClusterManufacturer"), None),
    (Field::DataClusterId, Some("DataClusterId"), None),
    (Field::CellDevice, Some("sDevIEEE"), Some("HAN_1_1")),
    (Field::CellEndpoint, Some("sEndpointID"), Some("EndpointID_1_1")),
    (Field::CellAttributes, Some("sAttributes"), Some("Attributes_1_1")),
    (Field::CellAttributeId, Some("sAttributeID"), Some("AttributeID_1_1")),
    (Field::CellType, Some("sType"), Some("Type_1_1")),
    (Field::CellValue, Some("sValue"), Some("Value_1_1")),
    (Field::Source, Some("Source"), Some("Source")),
    (Field::Fifo, Some("Fifo"), Some("Fifo")),
    (Field::Cells, Some("Cells"), Some("Cells")),
    (Field::NCells, Some("NCells"), Some("NCells")),
    (Field::DelIeee, Some("DelIeee"), Some("DelIeee")),
    (Field::DelEp, Some("DelEP"), Some("DelEP")),
    (Field::DelClu, Some("DelClu"), Some("DelClu")),
    (Field::DelTime, Some("DelTime"), Some("DelTime")),
    (Field::Token, Some("Token"), Some("Token_1_1")),
    (Field::Options, Some("Options"), Some("Options_1_1")),
    (Field::UpdateCurrent, None, Some("Current_1_1")),
    (Field::UpdateOtaRegistered, None, Some("OTARegistered_1_1")),
    (Field::UpdateAllPending, None, Some("ESBoxAllPending_1_1")),
    (Field::TermCommand, None, Some("TermCommand_1_1")),
    (Field::TermCommandRaw, None, Some("TermCommandRaw_1_1")),
    (Field::TermUid, None, Some("TermUid_1_1")),
    (Field::Dir, None, Some("Dir")),
    (Field::File, None, Some("File_1_1")),
    (Field::Path, None, Some("Path_1_1")),
    (Field::MakeParents, None, Some("MakeParents_1_1")),
    (Field::Recursive, None, Some("Recursive_1_1")),
    (Field::Force, None, Some("Force_1_1")),
    (Field::Overwrite, None, Some("Overwrite_1_1")),
    (Field::Append, None, Some("Append_1_1")),
    (Field::Code, None, Some("Code_1_1")),
    (Field::Contents, None, Some("Contents_1_1")),
    (Field::List, None, Some("List_1_1")),
    (Field::Name, None, Some("Name_1_1")),
    (Field::Size, None, Some("Size_1_1")),
    (Field::IsDirectory, None, Some("IsDirectory_1_1")),
];

fn column(pick: fn(&FieldKeys) -> Option<&'static str>) -> HashMap<Field, &'static str> {
    FIELD_KEYS
        .iter()
        .filter_map(|entry| pick(entry).map(|key| (entry.0, key)))
        .collect()
}

/// Optional protocol features
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// GetSupportedVersions / SendSupportedVersions exist
    pub supported_versions_probe: bool,
    /// Cell cluster is a `{manufacturer, id}` sub-mapping instead of two flat keys
    pub nested_cell_cluster: bool,
    /// GetData may read from the latest-readings buffer
    pub latest_readings_source: bool,
}

/// Field table and capabilities of one protocol version
#[derive(Debug, Clone)]
pub struct VersionSchema {
    version: ProtocolVersion,
    keys: HashMap<Field, &'static str>,
    capabilities: Capabilities,
}

impl VersionSchema {
    /// Build a schema from explicit parts
    pub fn new(
        version: ProtocolVersion,
        keys: HashMap<Field, &'static str>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            version,
            keys,
            capabilities,
        }
    }

    /// Version described by this schema
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Optional features of this version
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Wire key of a field
    pub fn key(&self, field: Field) -> Result<&'static str, ValidationError> {
        self.keys
            .get(&field)
            .copied()
            .ok_or(ValidationError::UnknownField {
                field,
                version: self.version,
            })
    }

    /// Whether the version has a key for this field
    pub fn has(&self, field: Field) -> bool {
        self.keys.contains_key(&field)
    }
}

/// Immutable table of every protocol version this engine can speak
#[derive(Debug, Clone)]
pub struct VersionRegistry {
    // Sorted oldest first.
    schemas: Vec<VersionSchema>,
}

impl VersionRegistry {
    /// Build a registry from schemas, ordering them by version
    pub fn new(mut schemas: Vec<VersionSchema>) -> Self {
        schemas.sort_by_key(|s| s.version);
        schemas.dedup_by_key(|s| s.version);
        Self { schemas }
    }

    /// Registry with API versions 1.0 and 1.1
    pub fn standard() -> Self {
        Self::new(vec![
            VersionSchema::new(ProtocolVersion::V1_0, column(|e| e.1), Capabilities::default()),
            VersionSchema::new(
                ProtocolVersion::V1_1,
                column(|e| e.2),
                Capabilities {
                    supported_versions_probe: true,
                    nested_cell_cluster: true,
                    latest_readings_source: true,
                },
            ),
        ])
    }

    /// All registered versions, oldest first
    pub fn supported(&self) -> Vec<ProtocolVersion> {
        self.schemas.iter().map(|s| s.version).collect()
    }

    /// Whether a version is registered
    pub fn supports(&self, version: ProtocolVersion) -> bool {
        self.schemas.iter().any(|s| s.version == version)
    }

    /// Newest registered version
    pub fn newest(&self) -> ProtocolVersion {
        self.schemas
            .last()
            .map(|s| s.version)
            .unwrap_or(ProtocolVersion::BASELINE)
    }

    /// Schema for a version
    pub fn schema(&self, version: ProtocolVersion) -> Result<&VersionSchema, ValidationError> {
        self.schemas
            .iter()
            .find(|s| s.version == version)
            .ok_or(ValidationError::UnknownVersion(version))
    }

    /// Schema for the baseline version, used by messages that kept their 1.0 keys
    pub fn baseline(&self) -> Result<&VersionSchema, ValidationError> {
        self.schema(ProtocolVersion::BASELINE)
    }

    /// Find the schema an inbound mapping was written with.
    ///
    /// Each version's protocol-version key is probed, newest first; the
    /// matching schema and the raw declared value are returned.
    pub fn detect<'a>(&self, map: &'a Map<String, Value>) -> Option<(&VersionSchema, &'a Value)> {
        self.schemas.iter().rev().find_map(|schema| {
            let key = schema.keys.get(&Field::ProtocolVersion)?;
            map.get(*key).map(|declared| (schema, declared))
        })
    }
}

impl Default for VersionRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_parse_and_display() {
        let v: ProtocolVersion = "1.1".parse().unwrap();
        assert_eq!(v, ProtocolVersion::V1_1);
        assert_eq!(v.to_string(), "1.1");
        assert_eq!("2.0".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::new(2, 0));
        assert!("1".parse::<ProtocolVersion>().is_err());
        assert!("one.zero".parse::<ProtocolVersion>().is_err());
        assert!(ProtocolVersion::V1_0 < ProtocolVersion::V1_1);
    }

    #[test]
    fn test_version_serde_as_string() {
        let v: ProtocolVersion = serde_json::from_value(json!("1.1")).unwrap();
        assert_eq!(v, ProtocolVersion::V1_1);
        assert_eq!(serde_json::to_value(v).unwrap(), json!("1.1"));
    }

    #[test]
    fn test_standard_registry() {
        let registry = VersionRegistry::standard();
        assert_eq!(
            registry.supported(),
            vec![ProtocolVersion::V1_0, ProtocolVersion::V1_1]
        );
        assert_eq!(registry.newest(), ProtocolVersion::V1_1);
        assert!(!registry.supports(ProtocolVersion::new(2, 0)));

        let v10 = registry.schema(ProtocolVersion::V1_0).unwrap();
        let v11 = registry.schema(ProtocolVersion::V1_1).unwrap();
        assert_eq!(v10.key(Field::MsgId).unwrap(), "MsgID");
        assert_eq!(v11.key(Field::MsgId).unwrap(), "MsgID_1_1");
        assert_eq!(v11.key(Field::Fifo).unwrap(), "Fifo");
        assert!(!v10.capabilities().supported_versions_probe);
        assert!(v11.capabilities().nested_cell_cluster);
    }

    #[test]
    fn test_unknown_field_for_version() {
        let registry = VersionRegistry::standard();
        let v10 = registry.schema(ProtocolVersion::V1_0).unwrap();
        assert_eq!(
            v10.key(Field::ProtocolVersions),
            Err(ValidationError::UnknownField {
                field: Field::ProtocolVersions,
                version: ProtocolVersion::V1_0,
            })
        );
        assert!(!registry.schema(ProtocolVersion::V1_1).unwrap().has(Field::DataClusterId));
    }

    #[test]
    fn test_detect_schema() {
        let registry = VersionRegistry::standard();

        let map = json!({"ProtocolVersion_1_1": "2.0", "Messages_1_1": []});
        let (schema, declared) = registry.detect(map.as_object().unwrap()).unwrap();
        assert_eq!(schema.version(), ProtocolVersion::V1_1);
        assert_eq!(declared, &json!("2.0"));

        let map = json!({"ProtocolVersion": "1.0"});
        let (schema, _) = registry.detect(map.as_object().unwrap()).unwrap();
        assert_eq!(schema.version(), ProtocolVersion::V1_0);

        let map = json!({"Messages": []});
        assert!(registry.detect(map.as_object().unwrap()).is_none());
    }
}
