//! Property values and their transfer shapes

use crate::error::{RepositoryError, Result};
use crate::name::{Name, Path};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Property type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    String,
    Binary,
    Long,
    Double,
    Boolean,
    Date,
    Name,
    Path,
    Reference,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::String => "String",
            PropertyType::Binary => "Binary",
            PropertyType::Long => "Long",
            PropertyType::Double => "Double",
            PropertyType::Boolean => "Boolean",
            PropertyType::Date => "Date",
            PropertyType::Name => "Name",
            PropertyType::Path => "Path",
            PropertyType::Reference => "Reference",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QValue {
    String(String),
    Binary(Bytes),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Name(Name),
    Path(Path),
    /// Unique id of the referenced node
    Reference(String),
}

impl QValue {
    pub fn property_type(&self) -> PropertyType {
        match self {
            QValue::String(_) => PropertyType::String,
            QValue::Binary(_) => PropertyType::Binary,
            QValue::Long(_) => PropertyType::Long,
            QValue::Double(_) => PropertyType::Double,
            QValue::Boolean(_) => PropertyType::Boolean,
            QValue::Date(_) => PropertyType::Date,
            QValue::Name(_) => PropertyType::Name,
            QValue::Path(_) => PropertyType::Path,
            QValue::Reference(_) => PropertyType::Reference,
        }
    }

    /// String form used on the wire
    pub fn to_wire_string(&self) -> String {
        match self {
            QValue::String(s) | QValue::Reference(s) => s.clone(),
            QValue::Binary(b) => String::from_utf8_lossy(b).into_owned(),
            QValue::Long(v) => v.to_string(),
            QValue::Double(v) => v.to_string(),
            QValue::Boolean(v) => v.to_string(),
            QValue::Date(v) => v.to_rfc3339(),
            QValue::Name(n) => n.to_string(),
            QValue::Path(p) => p.to_string(),
        }
    }

    /// Byte stream form used for binary properties
    pub fn to_stream(&self) -> Bytes {
        match self {
            QValue::Binary(b) => b.clone(),
            other => Bytes::from(other.to_wire_string()),
        }
    }

    /// Convert a wire string into a value of the given type
    pub fn from_wire(raw: &str, property_type: PropertyType) -> Result<Self> {
        let invalid = |e: &dyn fmt::Display| {
            RepositoryError::InvalidPayload(format!(
                "'{}' is not a valid {} value: {}",
                raw, property_type, e
            ))
        };
        Ok(match property_type {
            PropertyType::String => QValue::String(raw.to_string()),
            PropertyType::Binary => QValue::Binary(Bytes::copy_from_slice(raw.as_bytes())),
            PropertyType::Long => QValue::Long(raw.parse().map_err(|e| invalid(&e))?),
            PropertyType::Double => QValue::Double(raw.parse().map_err(|e| invalid(&e))?),
            PropertyType::Boolean => QValue::Boolean(raw.parse().map_err(|e| invalid(&e))?),
            PropertyType::Date => QValue::Date(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| invalid(&e))?
                    .with_timezone(&Utc),
            ),
            PropertyType::Name => QValue::Name(Name::new(raw).map_err(|e| invalid(&e))?),
            PropertyType::Path => QValue::Path(Path::parse(raw).map_err(|e| invalid(&e))?),
            PropertyType::Reference => {
                if raw.is_empty() {
                    return Err(invalid(&"empty reference"));
                }
                QValue::Reference(raw.to_string())
            }
        })
    }
}

impl fmt::Display for QValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QValue::Binary(b) => write!(f, "<{} bytes>", b.len()),
            other => f.write_str(&other.to_wire_string()),
        }
    }
}

/// Shape in which property values are handed to a batch
///
/// Chosen by cardinality and by whether the property type is binary.
#[derive(Debug, Clone, PartialEq)]
pub enum ValuePayload {
    Single(String),
    Multiple(Vec<String>),
    SingleBinary(Bytes),
    MultipleBinary(Vec<Bytes>),
}

impl ValuePayload {
    /// Build the payload for `values`.
    ///
    /// A single-valued property needs exactly one value.
    pub fn from_values(
        values: &[QValue],
        property_type: PropertyType,
        multi_valued: bool,
    ) -> Result<Self> {
        let binary = property_type == PropertyType::Binary;
        if multi_valued {
            return Ok(if binary {
                ValuePayload::MultipleBinary(values.iter().map(QValue::to_stream).collect())
            } else {
                ValuePayload::Multiple(values.iter().map(QValue::to_wire_string).collect())
            });
        }

        match values {
            [value] if binary => Ok(ValuePayload::SingleBinary(value.to_stream())),
            [value] => Ok(ValuePayload::Single(value.to_wire_string())),
            _ => Err(RepositoryError::InvalidPayload(format!(
                "single-valued property requires exactly one value, got {}",
                values.len()
            ))),
        }
    }

    pub fn is_multiple(&self) -> bool {
        matches!(
            self,
            ValuePayload::Multiple(_) | ValuePayload::MultipleBinary(_)
        )
    }

    pub fn len(&self) -> usize {
        match self {
            ValuePayload::Single(_) | ValuePayload::SingleBinary(_) => 1,
            ValuePayload::Multiple(v) => v.len(),
            ValuePayload::MultipleBinary(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the payload back into typed values (backend side)
    pub fn into_values(self, property_type: PropertyType) -> Result<Vec<QValue>> {
        match self {
            ValuePayload::Single(s) => Ok(vec![QValue::from_wire(&s, property_type)?]),
            ValuePayload::Multiple(v) => v
                .iter()
                .map(|s| QValue::from_wire(s, property_type))
                .collect(),
            ValuePayload::SingleBinary(b) => Ok(vec![QValue::Binary(b)]),
            ValuePayload::MultipleBinary(v) => Ok(v.into_iter().map(QValue::Binary).collect()),
        }
    }
}
