use std::fmt;
use std::sync::Arc;

use serde_json::{Map as JsonMap, Number, Value as JsonValue};
use thiserror::Error;

use crate::error::{BoxError, RpcError};
use crate::value::{CustomValue, RpcValue, WireType};

/// Extension hook for host-defined types.
///
/// `serialize` returns `None` for values it does not recognise, in which case
/// the codec falls back to the value's debug representation. `deserialize`
/// returns `Ok(None)` for type names it does not own.
pub trait ObjectConverter: Send + Sync {
    fn serialize(&self, value: &dyn CustomValue) -> Option<JsonValue>;

    fn deserialize(&self, value: &JsonValue, type_name: &str)
        -> Result<Option<RpcValue>, BoxError>;
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("expected {expected}, found {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("expected {expected} elements, found {actual}")]
    Length { expected: usize, actual: usize },

    #[error("element {index}: {source}")]
    Element {
        index: usize,
        #[source]
        source: Box<CodecError>,
    },

    #[error("key {key:?}: {source}")]
    Field {
        key: String,
        #[source]
        source: Box<CodecError>,
    },

    #[error("{input:?} is not a valid {expected}")]
    InvalidDefault { input: String, expected: String },

    #[error("no default parser for type {0}")]
    NoDefaultParser(String),

    #[error("converter failed for {type_name}: {message}")]
    Converter { type_name: String, message: String },
}

impl CodecError {
    fn mismatch(expected: &WireType, actual: &JsonValue) -> Self {
        Self::TypeMismatch { expected: expected.to_string(), actual: json_type_name(actual).into() }
    }

    /// Attributes a conversion failure to the argument at `position` (1-based).
    pub fn into_argument_error(self, position: usize, target: &WireType) -> RpcError {
        match self {
            Self::TypeMismatch { expected, actual } => {
                RpcError::ArgumentType { position, expected, actual }
            }
            other => RpcError::ArgumentType {
                position,
                expected: target.to_string(),
                actual: other.describe_actual(),
            },
        }
    }

    fn describe_actual(&self) -> String {
        match self {
            Self::TypeMismatch { actual, .. } => actual.clone(),
            Self::Length { actual, .. } => format!("array of length {actual}"),
            Self::Element { index, source } => {
                format!("{} at index {index}", source.describe_actual())
            }
            Self::Field { key, source } => format!("{} at key {key:?}", source.describe_actual()),
            Self::Converter { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// JSON type name as it appears in mismatch diagnostics.
pub fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(number) if number.is_f64() => "number",
        JsonValue::Number(_) => "integer",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Converts between [`RpcValue`]s and JSON wire values.
#[derive(Clone, Default)]
pub struct Codec {
    converter: Option<Arc<dyn ObjectConverter>>,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec").field("converter", &self.converter.is_some()).finish()
    }
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_converter(converter: Arc<dyn ObjectConverter>) -> Self {
        Self { converter: Some(converter) }
    }

    pub fn to_wire(&self, value: &RpcValue) -> JsonValue {
        match value {
            RpcValue::Null => JsonValue::Null,
            RpcValue::Bool(value) => JsonValue::Bool(*value),
            RpcValue::Int(value) => JsonValue::from(*value),
            RpcValue::Long(value) => JsonValue::from(*value),
            RpcValue::Double(value) => {
                Number::from_f64(*value).map_or(JsonValue::Null, JsonValue::Number)
            }
            RpcValue::String(value) => JsonValue::String(value.clone()),
            RpcValue::Bytes(bytes) => bytes.iter().map(|byte| JsonValue::from(*byte)).collect(),
            RpcValue::List(items) | RpcValue::Set(items) => {
                items.iter().map(|item| self.to_wire(item)).collect()
            }
            RpcValue::Map(entries) => {
                let mut object = JsonMap::with_capacity(entries.len());
                for (key, value) in entries {
                    object.insert(key.clone().unwrap_or_default(), self.to_wire(value));
                }
                JsonValue::Object(object)
            }
            RpcValue::Json(value) => value.clone(),
            RpcValue::Custom(value) => {
                let custom: &dyn CustomValue = &**value;
                self.converter
                    .as_ref()
                    .and_then(|converter| converter.serialize(custom))
                    .unwrap_or_else(|| JsonValue::String(format!("{custom:?}")))
            }
        }
    }

    pub fn from_wire(&self, value: &JsonValue, target: &WireType) -> Result<RpcValue, CodecError> {
        if value.is_null() {
            return Ok(RpcValue::Null);
        }
        match target {
            WireType::Bool => match value {
                JsonValue::Bool(flag) => Ok(RpcValue::Bool(*flag)),
                JsonValue::Number(number) => number
                    .as_i64()
                    .map(|n| RpcValue::Bool(n != 0))
                    .ok_or_else(|| CodecError::mismatch(target, value)),
                _ => Err(CodecError::mismatch(target, value)),
            },
            WireType::Int => value
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .map(RpcValue::Int)
                .ok_or_else(|| CodecError::mismatch(target, value)),
            WireType::Long => value
                .as_i64()
                .map(RpcValue::Long)
                .ok_or_else(|| CodecError::mismatch(target, value)),
            WireType::Double => match value {
                JsonValue::Number(number) => number
                    .as_f64()
                    .map(RpcValue::Double)
                    .ok_or_else(|| CodecError::mismatch(target, value)),
                _ => Err(CodecError::mismatch(target, value)),
            },
            WireType::String => match value {
                JsonValue::String(text) => Ok(RpcValue::String(text.clone())),
                _ => Err(CodecError::mismatch(target, value)),
            },
            WireType::Bytes => {
                let items = value.as_array().ok_or_else(|| CodecError::mismatch(target, value))?;
                let mut bytes = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    let byte = item.as_u64().and_then(|n| u8::try_from(n).ok()).ok_or_else(|| {
                        CodecError::Element {
                            index,
                            source: Box::new(CodecError::TypeMismatch {
                                expected: "byte".into(),
                                actual: describe_number(item),
                            }),
                        }
                    })?;
                    bytes.push(byte);
                }
                Ok(RpcValue::Bytes(bytes))
            }
            WireType::Array(element) => {
                let items = value.as_array().ok_or_else(|| CodecError::mismatch(target, value))?;
                self.elements(items, element)
            }
            WireType::FixedArray(element, len) => {
                let items = value.as_array().ok_or_else(|| CodecError::mismatch(target, value))?;
                if items.len() != *len {
                    return Err(CodecError::Length { expected: *len, actual: items.len() });
                }
                self.elements(items, element)
            }
            WireType::Map(element) => {
                let object = value.as_object().ok_or_else(|| CodecError::mismatch(target, value))?;
                let mut entries = Vec::with_capacity(object.len());
                for (key, item) in object {
                    let converted = self.from_wire(item, element).map_err(|source| {
                        CodecError::Field { key: key.clone(), source: Box::new(source) }
                    })?;
                    entries.push((Some(key.clone()), converted));
                }
                Ok(RpcValue::Map(entries))
            }
            WireType::Object => match value {
                JsonValue::Object(_) => Ok(RpcValue::Json(value.clone())),
                _ => Err(CodecError::mismatch(target, value)),
            },
            WireType::Json => Ok(RpcValue::Json(value.clone())),
            WireType::Custom(type_name) => {
                let Some(converter) = self.converter.as_ref() else {
                    return Err(CodecError::mismatch(target, value));
                };
                match converter.deserialize(value, type_name) {
                    Ok(Some(converted)) => Ok(converted),
                    Ok(None) => Err(CodecError::mismatch(target, value)),
                    Err(err) => Err(CodecError::Converter {
                        type_name: type_name.clone(),
                        message: err.to_string(),
                    }),
                }
            }
        }
    }

    fn elements(&self, items: &[JsonValue], element: &WireType) -> Result<RpcValue, CodecError> {
        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                self.from_wire(item, element)
                    .map_err(|source| CodecError::Element { index, source: Box::new(source) })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(RpcValue::List)
    }
}

fn describe_number(value: &JsonValue) -> String {
    match value {
        JsonValue::Number(number) => number.to_string(),
        other => json_type_name(other).to_string(),
    }
}

/// Parses a declared default (its canonical string form) for one of the
/// built-in scalar types.
pub fn parse_default(raw: &str, target: &WireType) -> Result<RpcValue, CodecError> {
    let invalid =
        || CodecError::InvalidDefault { input: raw.to_string(), expected: target.to_string() };
    match target {
        WireType::String => Ok(RpcValue::String(raw.to_string())),
        WireType::Int => decode_integer(raw)
            .and_then(|n| i32::try_from(n).ok())
            .map(RpcValue::Int)
            .ok_or_else(invalid),
        WireType::Long => decode_integer(raw)
            .and_then(|n| i64::try_from(n).ok())
            .map(RpcValue::Long)
            .ok_or_else(invalid),
        WireType::Bool => {
            if raw.eq_ignore_ascii_case("true") {
                Ok(RpcValue::Bool(true))
            } else if raw.eq_ignore_ascii_case("false") {
                Ok(RpcValue::Bool(false))
            } else {
                Err(invalid())
            }
        }
        WireType::Double => raw.trim().parse::<f64>().map(RpcValue::Double).map_err(|_| invalid()),
        other => Err(CodecError::NoDefaultParser(other.to_string())),
    }
}

/// Decimal, `0x`/`0X`/`#` hexadecimal or leading-zero octal, with an optional sign.
fn decode_integer(raw: &str) -> Option<i128> {
    let (negative, unsigned) = match raw.as_bytes().first()? {
        b'-' => (true, &raw[1..]),
        b'+' => (false, &raw[1..]),
        _ => (false, raw),
    };
    let (radix, digits) = if let Some(hex) =
        unsigned.strip_prefix("0x").or_else(|| unsigned.strip_prefix("0X"))
    {
        (16, hex)
    } else if let Some(hex) = unsigned.strip_prefix('#') {
        (16, hex)
    } else if unsigned.len() > 1 && unsigned.starts_with('0') {
        (8, &unsigned[1..])
    } else {
        (10, unsigned)
    };
    if digits.is_empty() || digits.starts_with(['-', '+']) {
        return None;
    }
    let magnitude = i128::from_str_radix(digits, radix).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}
