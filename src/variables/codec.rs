//! Wire codec for engine-typed variables.
//!
//! Decoding is exhaustive over the engine's kind set; encoding either
//! honors an explicit tag or infers one from the native JSON shape.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, FixedOffset, SecondsFormat};

use crate::error::CodecError;
use crate::secrets::Redactor;
use crate::variables::{
    FileValue, JSON_DATAFORMAT, ObjectValue, TypedValue, ValueInfo, VariableDto,
};

/// Largest encoded variable (wire JSON bytes) reported inline with a
/// terminal call; anything larger is uploaded as a process variable via
/// its own PUT. No chunking is performed.
pub const INLINE_VARIABLE_LIMIT: usize = 4096;

/// Engine timestamp format: RFC3339 with milliseconds and a `+0000`-style
/// offset (no colon).
const ENGINE_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

/// Parse an engine timestamp. Accepts both `+0000` and `+00:00` offset
/// spellings, and plain RFC3339 including a `Z` suffix.
pub fn parse_engine_date(value: &str) -> Result<DateTime<FixedOffset>, CodecError> {
    DateTime::parse_from_str(value, ENGINE_DATE_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map_err(|e| CodecError::InvalidDate {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Format a timestamp in the engine's wire form.
pub fn format_engine_date(value: &DateTime<FixedOffset>) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.3f%z").to_string()
}

/// Decode one wire variable into its typed form.
pub fn decode(dto: &VariableDto) -> Result<TypedValue, CodecError> {
    let info = dto.value_info.clone().unwrap_or_default();

    // A null payload is a null carrier regardless of the declared kind.
    if dto.value.is_null() && dto.kind.as_deref() != Some("Object") {
        return Ok(TypedValue::Null);
    }

    let Some(kind) = dto.kind.as_deref() else {
        return Ok(infer(dto.value.clone()));
    };

    match kind {
        "String" => Ok(TypedValue::String(expect_str(kind, &dto.value)?.to_string())),
        // Narrower engine integer kinds fold into Long.
        "Long" | "Integer" | "Short" => Ok(TypedValue::Long(expect_i64(kind, &dto.value)?)),
        "Double" => Ok(TypedValue::Double(expect_f64(kind, &dto.value)?)),
        "Boolean" => match &dto.value {
            serde_json::Value::Bool(b) => Ok(TypedValue::Boolean(*b)),
            other => Err(wrong_payload(kind, "boolean", other)),
        },
        "Date" => parse_engine_date(expect_str(kind, &dto.value)?).map(TypedValue::Date),
        "Bytes" => decode_base64(kind, expect_str(kind, &dto.value)?).map(TypedValue::Bytes),
        "Json" => {
            let value = match &dto.value {
                serde_json::Value::String(raw) => serde_json::from_str(raw)?,
                tree => tree.clone(),
            };
            Ok(TypedValue::Json {
                value,
                format: info.serialization_data_format,
            })
        }
        "Xml" => Ok(TypedValue::Xml(expect_str(kind, &dto.value)?.to_string())),
        "File" => {
            let bytes = decode_base64(kind, expect_str(kind, &dto.value)?)?;
            Ok(TypedValue::File(FileValue {
                filename: info.filename,
                mime_type: info.mime_type,
                encoding: info.encoding,
                bytes,
            }))
        }
        "Null" => Ok(TypedValue::Null),
        "Object" => {
            if dto.value.is_null() {
                return Ok(TypedValue::Null);
            }
            let serialized = match &dto.value {
                serde_json::Value::String(raw) => raw.clone(),
                tree => serde_json::to_string(tree)?,
            };
            let is_json_dialect = info
                .serialization_data_format
                .as_deref()
                .is_some_and(|f| f.contains("json"));
            let parsed = if is_json_dialect {
                serde_json::from_str(&serialized).ok()
            } else {
                None
            };
            Ok(TypedValue::Object(ObjectValue {
                serialized,
                parsed,
                type_name: info.object_type_name,
                format: info.serialization_data_format,
            }))
        }
        other => Err(CodecError::UnsupportedType(other.to_string())),
    }
}

/// Encode a typed value into its wire form.
pub fn encode(value: &TypedValue) -> VariableDto {
    match value {
        TypedValue::String(s) => plain("String", serde_json::Value::String(s.clone())),
        TypedValue::Long(n) => plain("Long", serde_json::json!(n)),
        TypedValue::Double(d) => plain("Double", serde_json::json!(d)),
        TypedValue::Boolean(b) => plain("Boolean", serde_json::Value::Bool(*b)),
        TypedValue::Date(dt) => plain("Date", serde_json::Value::String(format_engine_date(dt))),
        TypedValue::Bytes(bytes) => {
            plain("Bytes", serde_json::Value::String(BASE64.encode(bytes)))
        }
        TypedValue::Json { value, format } => VariableDto {
            kind: Some("Json".to_string()),
            value: serde_json::Value::String(
                serde_json::to_string(value).unwrap_or_else(|_| "null".to_string()),
            ),
            value_info: ValueInfo {
                serialization_data_format: format.clone(),
                ..ValueInfo::default()
            }
            .normalized(),
        },
        TypedValue::Xml(s) => plain("Xml", serde_json::Value::String(s.clone())),
        TypedValue::File(file) => VariableDto {
            kind: Some("File".to_string()),
            value: serde_json::Value::String(BASE64.encode(&file.bytes)),
            value_info: ValueInfo {
                filename: file.filename.clone(),
                mime_type: file.mime_type.clone(),
                encoding: file.encoding.clone(),
                ..ValueInfo::default()
            }
            .normalized(),
        },
        TypedValue::Null => plain("Null", serde_json::Value::Null),
        TypedValue::Object(obj) => VariableDto {
            kind: Some("Object".to_string()),
            value: serde_json::Value::String(obj.serialized.clone()),
            value_info: ValueInfo {
                object_type_name: obj.type_name.clone(),
                serialization_data_format: obj.format.clone(),
                ..ValueInfo::default()
            }
            .normalized(),
        },
    }
}

/// Infer a kind for an untagged native value: null, boolean, integer,
/// float, temporal string, tree, string — checked in that order.
pub fn infer(value: serde_json::Value) -> TypedValue {
    match value {
        serde_json::Value::Null => TypedValue::Null,
        serde_json::Value::Bool(b) => TypedValue::Boolean(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                TypedValue::Long(i)
            } else {
                TypedValue::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => {
            if looks_temporal(&s) {
                match parse_engine_date(&s) {
                    Ok(dt) => TypedValue::Date(dt),
                    Err(_) => TypedValue::String(s),
                }
            } else {
                TypedValue::String(s)
            }
        }
        tree @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => TypedValue::Json {
            value: tree,
            format: Some(JSON_DATAFORMAT.to_string()),
        },
    }
}

/// Interpret one executor output value. A wire-shaped object
/// (`{"type": ..., "value": ...}`) is treated as pre-tagged; anything
/// else goes through inference.
pub fn from_output(value: serde_json::Value) -> Result<TypedValue, CodecError> {
    if let serde_json::Value::Object(map) = &value {
        let tagged = map.contains_key("value")
            && map
                .get("type")
                .and_then(|t| t.as_str())
                .is_some_and(is_known_kind);
        if tagged {
            let dto: VariableDto = serde_json::from_value(value)?;
            return decode(&dto);
        }
    }
    Ok(infer(value))
}

/// Project a typed value into the plain JSON handed to the executor.
pub fn to_native(value: &TypedValue) -> serde_json::Value {
    match value {
        TypedValue::String(s) => serde_json::Value::String(s.clone()),
        TypedValue::Long(n) => serde_json::json!(n),
        TypedValue::Double(d) => serde_json::json!(d),
        TypedValue::Boolean(b) => serde_json::Value::Bool(*b),
        TypedValue::Date(dt) => serde_json::Value::String(
            dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
        TypedValue::Bytes(bytes) => serde_json::Value::String(BASE64.encode(bytes)),
        TypedValue::Json { value, .. } => value.clone(),
        TypedValue::Xml(s) => serde_json::Value::String(s.clone()),
        TypedValue::File(file) => serde_json::json!({
            "filename": file.filename,
            "mimeType": file.mime_type,
            "encoding": file.encoding,
            "base64": BASE64.encode(&file.bytes),
        }),
        TypedValue::Null => serde_json::Value::Null,
        TypedValue::Object(obj) => obj
            .parsed
            .clone()
            .unwrap_or_else(|| serde_json::Value::String(obj.serialized.clone())),
    }
}

/// Encoded wire size of a variable, used against [`INLINE_VARIABLE_LIMIT`].
pub fn wire_len(dto: &VariableDto) -> usize {
    serde_json::to_vec(dto).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Mask every resolved secret inside a value before it leaves the worker.
pub fn scrub(value: TypedValue, redactor: &Redactor) -> TypedValue {
    if redactor.is_empty() {
        return value;
    }
    match value {
        TypedValue::String(s) => TypedValue::String(redactor.mask(&s)),
        TypedValue::Xml(s) => TypedValue::Xml(redactor.mask(&s)),
        TypedValue::Json { value, format } => TypedValue::Json {
            value: scrub_tree(value, redactor),
            format,
        },
        TypedValue::Object(obj) => TypedValue::Object(ObjectValue {
            serialized: redactor.mask(&obj.serialized),
            parsed: obj.parsed.map(|v| scrub_tree(v, redactor)),
            ..obj
        }),
        TypedValue::File(file) => TypedValue::File(FileValue {
            bytes: redactor.mask_bytes(file.bytes),
            ..file
        }),
        other => other,
    }
}

fn scrub_tree(value: serde_json::Value, redactor: &Redactor) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(redactor.mask(&s)),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.into_iter().map(|v| scrub_tree(v, redactor)).collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, scrub_tree(v, redactor)))
                .collect(),
        ),
        other => other,
    }
}

fn is_known_kind(kind: &str) -> bool {
    matches!(
        kind,
        "String"
            | "Long"
            | "Integer"
            | "Short"
            | "Double"
            | "Boolean"
            | "Date"
            | "Bytes"
            | "Json"
            | "Xml"
            | "File"
            | "Null"
            | "Object"
    )
}

fn looks_temporal(s: &str) -> bool {
    // Cheap shape check before attempting a real parse: "2026-01-02T..."
    let bytes = s.as_bytes();
    bytes.len() >= 19
        && bytes.get(10) == Some(&b'T')
        && bytes[..4].iter().all(|b| b.is_ascii_digit())
}

fn plain(kind: &str, value: serde_json::Value) -> VariableDto {
    VariableDto {
        kind: Some(kind.to_string()),
        value,
        value_info: None,
    }
}

fn expect_str<'a>(kind: &str, value: &'a serde_json::Value) -> Result<&'a str, CodecError> {
    value.as_str().ok_or_else(|| wrong_payload(kind, "string", value))
}

fn expect_i64(kind: &str, value: &serde_json::Value) -> Result<i64, CodecError> {
    value.as_i64().ok_or_else(|| wrong_payload(kind, "integer", value))
}

fn expect_f64(kind: &str, value: &serde_json::Value) -> Result<f64, CodecError> {
    value.as_f64().ok_or_else(|| wrong_payload(kind, "number", value))
}

fn wrong_payload(kind: &str, expected: &'static str, got: &serde_json::Value) -> CodecError {
    CodecError::WrongPayload {
        kind: kind.to_string(),
        expected,
        got: got.to_string(),
    }
}

fn decode_base64(kind: &str, raw: &str) -> Result<Vec<u8>, CodecError> {
    BASE64.decode(raw).map_err(|e| CodecError::InvalidBase64 {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}
