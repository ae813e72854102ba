//! Typed access to JSON mappings through a version schema.

use crate::error::{ParseError, ValidationError};
use crate::registry::{Field, VersionSchema};
use base64::{engine::general_purpose, Engine as _};
use serde_json::{Map, Value};

/// Reads canonical fields out of an inbound mapping
pub(crate) struct FieldReader<'a> {
    schema: &'a VersionSchema,
    map: &'a Map<String, Value>,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(schema: &'a VersionSchema, map: &'a Map<String, Value>) -> Self {
        Self { schema, map }
    }

    /// Wire key used for error reporting
    pub(crate) fn key(&self, field: Field) -> &'static str {
        self.schema.key(field).unwrap_or("<unmapped>")
    }

    /// Raw value, `None` when absent or when the version has no such field
    pub(crate) fn raw(&self, field: Field) -> Option<&'a Value> {
        let key = self.schema.key(field).ok()?;
        self.map.get(key)
    }

    fn invalid(&self, field: Field, reason: &str) -> ParseError {
        ParseError::InvalidField {
            key: self.key(field),
            reason: reason.to_string(),
        }
    }

    fn require<T>(&self, field: Field, value: Option<T>) -> Result<T, ParseError> {
        value.ok_or(ParseError::MissingField(self.key(field)))
    }

    pub(crate) fn string(&self, field: Field) -> Result<Option<String>, ParseError> {
        match self.raw(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.invalid(field, "expected string")),
        }
    }

    pub(crate) fn require_string(&self, field: Field) -> Result<String, ParseError> {
        let value = self.string(field)?;
        self.require(field, value)
    }

    pub(crate) fn i64(&self, field: Field) -> Result<Option<i64>, ParseError> {
        match self.raw(field) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| self.invalid(field, "expected integer")),
        }
    }

    pub(crate) fn require_i64(&self, field: Field) -> Result<i64, ParseError> {
        let value = self.i64(field)?;
        self.require(field, value)
    }

    pub(crate) fn u64(&self, field: Field) -> Result<Option<u64>, ParseError> {
        match self.raw(field) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(field, "expected unsigned integer")),
        }
    }

    /// Integer narrowed to `T`, rejecting values outside its range
    pub(crate) fn int<T: TryFrom<i64>>(&self, field: Field) -> Result<Option<T>, ParseError> {
        match self.i64(field)? {
            None => Ok(None),
            Some(v) => T::try_from(v)
                .map(Some)
                .map_err(|_| self.invalid(field, "integer out of range")),
        }
    }

    pub(crate) fn require_int<T: TryFrom<i64>>(&self, field: Field) -> Result<T, ParseError> {
        let value = self.int(field)?;
        self.require(field, value)
    }

    /// Boolean flag; the API sends both JSON booleans and `0`/`1`
    pub(crate) fn flag(&self, field: Field) -> Result<Option<bool>, ParseError> {
        match self.raw(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(v) => match v.as_i64() {
                Some(0) => Ok(Some(false)),
                Some(1) => Ok(Some(true)),
                _ => Err(self.invalid(field, "expected boolean or 0/1")),
            },
        }
    }

    /// Base64-encoded binary payload
    pub(crate) fn bytes(&self, field: Field) -> Result<Option<Vec<u8>>, ParseError> {
        match self.string(field)? {
            None => Ok(None),
            Some(s) => general_purpose::STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(|e| self.invalid(field, &e.to_string())),
        }
    }

    pub(crate) fn object(&self, field: Field) -> Result<Option<&'a Map<String, Value>>, ParseError> {
        match self.raw(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(m)) => Ok(Some(m)),
            Some(_) => Err(self.invalid(field, "expected mapping")),
        }
    }

    pub(crate) fn require_object(&self, field: Field) -> Result<&'a Map<String, Value>, ParseError> {
        let value = self.object(field)?;
        self.require(field, value)
    }

    pub(crate) fn array(&self, field: Field) -> Result<Option<&'a Vec<Value>>, ParseError> {
        match self.raw(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(a)) => Ok(Some(a)),
            Some(_) => Err(self.invalid(field, "expected list")),
        }
    }

    pub(crate) fn require_array(&self, field: Field) -> Result<&'a Vec<Value>, ParseError> {
        let value = self.array(field)?;
        self.require(field, value)
    }
}

/// Builds an outbound mapping from canonical fields
pub(crate) struct FieldWriter<'a> {
    schema: &'a VersionSchema,
    map: Map<String, Value>,
}

impl<'a> FieldWriter<'a> {
    pub(crate) fn new(schema: &'a VersionSchema) -> Self {
        Self {
            schema,
            map: Map::new(),
        }
    }

    pub(crate) fn put(&mut self, field: Field, value: impl Into<Value>) -> Result<&mut Self, ValidationError> {
        let key = self.schema.key(field)?;
        self.map.insert(key.to_string(), value.into());
        Ok(self)
    }

    pub(crate) fn put_opt<V: Into<Value>>(
        &mut self,
        field: Field,
        value: Option<V>,
    ) -> Result<&mut Self, ValidationError> {
        match value {
            Some(v) => self.put(field, v),
            None => Ok(self),
        }
    }

    pub(crate) fn put_bytes(&mut self, field: Field, data: &[u8]) -> Result<&mut Self, ValidationError> {
        self.put(field, general_purpose::STANDARD.encode(data))
    }

    /// Copy pass-through entries verbatim
    pub(crate) fn extend(&mut self, entries: &Map<String, Value>) -> &mut Self {
        for (k, v) in entries {
            self.map.insert(k.clone(), v.clone());
        }
        self
    }

    pub(crate) fn finish(self) -> Map<String, Value> {
        self.map
    }
}

/// Interpret a value as a mapping
pub(crate) fn as_object<'v>(value: &'v Value, context: &'static str) -> Result<&'v Map<String, Value>, ParseError> {
    value.as_object().ok_or_else(|| ParseError::InvalidField {
        key: context,
        reason: "expected mapping".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ProtocolVersion, VersionRegistry};
    use serde_json::json;

    #[test]
    fn test_reader_types() {
        let registry = VersionRegistry::standard();
        let schema = registry.schema(ProtocolVersion::V1_1).unwrap();
        let value = json!({
            "Path_1_1": "/tmp/x",
            "Size_1_1": 42,
            "Force_1_1": 1,
            "Recursive_1_1": false,
            "Contents_1_1": "aGVsbG8=",
            "Code_1_1": "five"
        });
        let reader = FieldReader::new(schema, value.as_object().unwrap());

        assert_eq!(reader.string(Field::Path).unwrap(), Some("/tmp/x".to_string()));
        assert_eq!(reader.u64(Field::Size).unwrap(), Some(42));
        assert_eq!(reader.flag(Field::Force).unwrap(), Some(true));
        assert_eq!(reader.flag(Field::Recursive).unwrap(), Some(false));
        assert_eq!(reader.flag(Field::Append).unwrap(), None);
        assert_eq!(reader.bytes(Field::Contents).unwrap(), Some(b"hello".to_vec()));
        assert!(matches!(
            reader.i64(Field::Code),
            Err(ParseError::InvalidField { key: "Code_1_1", .. })
        ));
        assert_eq!(
            reader.require_string(Field::Name),
            Err(ParseError::MissingField("Name_1_1"))
        );
        assert!(reader.int::<u8>(Field::Size).is_ok());
    }

    #[test]
    fn test_reader_ignores_fields_missing_from_version() {
        let registry = VersionRegistry::standard();
        let schema = registry.schema(ProtocolVersion::V1_0).unwrap();
        let value = json!({"Path_1_1": "/tmp/x"});
        let reader = FieldReader::new(schema, value.as_object().unwrap());
        assert_eq!(reader.string(Field::Path).unwrap(), None);
    }

    #[test]
    fn test_writer() {
        let registry = VersionRegistry::standard();
        let schema = registry.schema(ProtocolVersion::V1_0).unwrap();
        let mut writer = FieldWriter::new(schema);
        writer.put(Field::Device, "001BC502B0000000").unwrap();
        writer.put_opt::<i64>(Field::Endpoint, None).unwrap();
        assert!(writer.put(Field::Path, "/x").is_err());
        assert_eq!(
            Value::Object(writer.finish()),
            json!({"DevIEEE": "001BC502B0000000"})
        );
    }
}
