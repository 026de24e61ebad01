use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;

/// Declared type of a parameter or return value on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum WireType {
    Bool,
    Int,
    Long,
    Double,
    String,
    /// Byte sequence, carried as an array of integers in `0..=255`.
    Bytes,
    Array(Box<WireType>),
    FixedArray(Box<WireType>, usize),
    /// Object whose values all share one type.
    Map(Box<WireType>),
    /// Any JSON object, passed through untouched.
    Object,
    /// Any JSON value, passed through untouched.
    Json,
    /// Host-defined type resolved by an [`crate::ObjectConverter`].
    Custom(String),
}

impl WireType {
    pub fn array(element: WireType) -> Self {
        Self::Array(Box::new(element))
    }

    pub fn fixed_array(element: WireType, len: usize) -> Self {
        Self::FixedArray(Box::new(element), len)
    }

    pub fn map(value: WireType) -> Self {
        Self::Map(Box::new(value))
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => f.write_str("bool"),
            Self::Int => f.write_str("int"),
            Self::Long => f.write_str("long"),
            Self::Double => f.write_str("double"),
            Self::String => f.write_str("string"),
            Self::Bytes => f.write_str("bytes"),
            Self::Array(element) => write!(f, "[{element}]"),
            Self::FixedArray(element, len) => write!(f, "[{element}; {len}]"),
            Self::Map(value) => write!(f, "map<string, {value}>"),
            Self::Object => f.write_str("object"),
            Self::Json => f.write_str("json"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

/// A host-defined value that only an [`crate::ObjectConverter`] knows how to encode.
///
/// Implemented for every `'static + Debug + Send + Sync` type. Call its methods
/// through `&dyn CustomValue`, not through the `Arc` holding it.
pub trait CustomValue: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn type_name(&self) -> &'static str;
}

impl<T> CustomValue for T
where
    T: Any + fmt::Debug + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// In-process representation of arguments and results.
#[derive(Clone, Debug, Default)]
pub enum RpcValue {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<RpcValue>),
    /// Serialized in the set's own iteration order; callers must not rely on it.
    Set(Vec<RpcValue>),
    /// Keys of `None` are written as `""`.
    Map(Vec<(Option<String>, RpcValue)>),
    Json(JsonValue),
    Custom(Arc<dyn CustomValue>),
}

impl RpcValue {
    pub fn custom<T: CustomValue>(value: T) -> Self {
        Self::Custom(Arc::new(value))
    }

    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<RpcValue>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<RpcValue>,
    {
        Self::Map(
            entries.into_iter().map(|(key, value)| (Some(key.into()), value.into())).collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
            Self::Json(_) => "json",
            Self::Custom(value) => (**value).type_name(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Long(value) => i32::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(i64::from(*value)),
            Self::Long(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(value) => Some(*value),
            Self::Int(value) => Some(f64::from(*value)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RpcValue]> {
        match self {
            Self::List(items) | Self::Set(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Custom(value) => (**value).as_any().downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl PartialEq for RpcValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) | (Self::Set(a), Self::Set(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Json(a), Self::Json(b)) => a == b,
            (Self::Custom(a), Self::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<()> for RpcValue {
    fn from(_: ()) -> Self {
        Self::Null
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for RpcValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<i64> for RpcValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for RpcValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<Vec<u8>> for RpcValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<RpcValue>> for RpcValue {
    fn from(value: Vec<RpcValue>) -> Self {
        Self::List(value)
    }
}

impl From<JsonValue> for RpcValue {
    fn from(value: JsonValue) -> Self {
        Self::Json(value)
    }
}

impl<T: Into<RpcValue>> From<Option<T>> for RpcValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Marker(u8);

    #[test]
    fn wire_type_display_is_compact() {
        assert_eq!(WireType::array(WireType::Int).to_string(), "[int]");
        assert_eq!(WireType::fixed_array(WireType::String, 3).to_string(), "[string; 3]");
        assert_eq!(WireType::map(WireType::Long).to_string(), "map<string, long>");
        assert_eq!(WireType::custom("Marker").to_string(), "Marker");
    }

    #[test]
    fn numeric_accessors_widen_but_do_not_truncate() {
        assert_eq!(RpcValue::Int(7).as_i64(), Some(7));
        assert_eq!(RpcValue::Long(7).as_i32(), Some(7));
        assert_eq!(RpcValue::Long(i64::MAX).as_i32(), None);
        assert_eq!(RpcValue::Int(2).as_f64(), Some(2.0));
        assert_eq!(RpcValue::String("7".into()).as_i64(), None);
    }

    #[test]
    fn custom_values_downcast_and_compare_by_identity() {
        let value = RpcValue::custom(Marker(9));
        assert_eq!(value.downcast_ref::<Marker>().map(|marker| marker.0), Some(9));
        assert!(value.downcast_ref::<String>().is_none());
        assert_eq!(value.clone(), value);
        assert_ne!(value, RpcValue::custom(Marker(9)));
        assert!(value.kind_name().ends_with("Marker"));
    }

    #[test]
    fn option_conversion_maps_none_to_null() {
        assert!(RpcValue::from(None::<i32>).is_null());
        assert_eq!(RpcValue::from(Some("x")), RpcValue::String("x".into()));
    }
}
