//! Engine-typed variables.
//!
//! The engine's variable domain is a closed set of kinds; `TypedValue`
//! models it as one variant per kind so the codec can be exhaustive.

pub mod codec;

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Serialization dataformat emitted for inferred `Json` values.
pub const JSON_DATAFORMAT: &str = "application/json";

/// A variable value on the engine wire: `{type, value, valueInfo}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDto {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(rename = "valueInfo", skip_serializing_if = "Option::is_none")]
    pub value_info: Option<ValueInfo>,
}

/// Serialization metadata carried next to `Object` and `File` values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    #[serde(rename = "objectTypeName", skip_serializing_if = "Option::is_none")]
    pub object_type_name: Option<String>,
    #[serde(
        rename = "serializationDataFormat",
        skip_serializing_if = "Option::is_none"
    )]
    pub serialization_data_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl ValueInfo {
    fn is_empty(&self) -> bool {
        self.object_type_name.is_none()
            && self.serialization_data_format.is_none()
            && self.filename.is_none()
            && self.mime_type.is_none()
            && self.encoding.is_none()
    }

    /// `None` when no field is set, so empty infos are omitted on the wire.
    pub fn normalized(self) -> Option<Self> {
        if self.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

/// A decoded engine variable.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    /// An absolute point in time, offset preserved from the wire.
    Date(DateTime<FixedOffset>),
    Bytes(Vec<u8>),
    /// Parsed JSON tree; the dataformat hint is preserved so the value
    /// re-encodes with the same metadata.
    Json {
        value: serde_json::Value,
        format: Option<String>,
    },
    Xml(String),
    File(FileValue),
    /// Explicit null carrier, distinct from an absent variable.
    Null,
    Object(ObjectValue),
}

/// A `File`-typed variable payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FileValue {
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub encoding: Option<String>,
    pub bytes: Vec<u8>,
}

/// An `Object`-typed variable. The raw serialized payload is kept verbatim
/// so re-encoding reproduces the wire form; `parsed` is populated only when
/// the dataformat is a JSON dialect.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectValue {
    pub serialized: String,
    pub parsed: Option<serde_json::Value>,
    pub type_name: Option<String>,
    pub format: Option<String>,
}

impl TypedValue {
    /// The engine type tag for this value.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "String",
            Self::Long(_) => "Long",
            Self::Double(_) => "Double",
            Self::Boolean(_) => "Boolean",
            Self::Date(_) => "Date",
            Self::Bytes(_) => "Bytes",
            Self::Json { .. } => "Json",
            Self::Xml(_) => "Xml",
            Self::File(_) => "File",
            Self::Null => "Null",
            Self::Object(_) => "Object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Named variables as exchanged with the engine.
pub type Variables = HashMap<String, TypedValue>;
