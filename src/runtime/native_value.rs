//! Owned snapshots of host values.
//!
//! A [`NativeValue`] holds no handles and no reference into the heap, so it
//! can be produced on the host thread, moved to a worker thread and turned
//! back into a host value later. Unlike `serde_json::Value` it keeps NaN,
//! ±Infinity and the difference between `undefined` and `null`.

use crate::runtime::error::HostError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Maximum nesting depth of a snapshot
pub const MAX_DEPTH: usize = 100;
/// Maximum estimated size in bytes of a snapshot
pub const MAX_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// An owned, thread-safe copy of a host value.
///
/// Functions and other non-data objects have no snapshot form.
#[derive(Clone, Debug, PartialEq)]
pub enum NativeValue {
    Undefined,
    Null,
    Bool(bool),
    /// Integral number within i64 range
    Int(i64),
    /// Any other number, including NaN and ±Infinity
    Float(f64),
    String(String),
    Array(Vec<NativeValue>),
    /// Object properties in insertion order
    Object(IndexMap<String, NativeValue>),
}

impl NativeValue {
    /// Snapshot of a host number: integral values in i64 range become `Int`.
    pub fn from_number(n: f64) -> Self {
        if n.fract() == 0.0 && n.is_finite() && n.abs() < 9.007_199_254_740_992e15 {
            if n == 0.0 && n.is_sign_negative() {
                return NativeValue::Float(n);
            }
            NativeValue::Int(n as i64)
        } else {
            NativeValue::Float(n)
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, NativeValue::Undefined | NativeValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NativeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NativeValue::Int(i) => Some(*i as f64),
            NativeValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<bool> for NativeValue {
    fn from(value: bool) -> Self {
        NativeValue::Bool(value)
    }
}

impl From<i64> for NativeValue {
    fn from(value: i64) -> Self {
        NativeValue::Int(value)
    }
}

impl From<f64> for NativeValue {
    fn from(value: f64) -> Self {
        NativeValue::Float(value)
    }
}

impl From<&str> for NativeValue {
    fn from(value: &str) -> Self {
        NativeValue::String(value.to_string())
    }
}

impl From<String> for NativeValue {
    fn from(value: String) -> Self {
        NativeValue::String(value)
    }
}

impl<T: Into<NativeValue>> From<Vec<T>> for NativeValue {
    fn from(values: Vec<T>) -> Self {
        NativeValue::Array(values.into_iter().map(Into::into).collect())
    }
}

// `undefined` serializes as unit; formats without a unit type (JSON) write
// it as null.
impl Serialize for NativeValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            NativeValue::Undefined => serializer.serialize_unit(),
            NativeValue::Null => serializer.serialize_none(),
            NativeValue::Bool(b) => serializer.serialize_bool(*b),
            NativeValue::Int(i) => serializer.serialize_i64(*i),
            NativeValue::Float(f) => serializer.serialize_f64(*f),
            NativeValue::String(s) => serializer.serialize_str(s),
            NativeValue::Array(items) => items.serialize(serializer),
            NativeValue::Object(map) => map.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for NativeValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct NativeValueVisitor;

        impl<'de> Visitor<'de> for NativeValueVisitor {
            type Value = NativeValue;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a host value (null, bool, number, string, array, or object)")
            }

            fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E> {
                Ok(NativeValue::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E> {
                Ok(NativeValue::Int(value))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
                if value <= i64::MAX as u64 {
                    Ok(NativeValue::Int(value as i64))
                } else {
                    Ok(NativeValue::Float(value as f64))
                }
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E> {
                Ok(NativeValue::Float(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E> {
                Ok(NativeValue::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E> {
                Ok(NativeValue::String(value))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(NativeValue::Null)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(NativeValue::Null)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                Deserialize::deserialize(deserializer)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(NativeValue::Array(items))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut obj = IndexMap::new();
                while let Some((key, value)) = map.next_entry()? {
                    obj.insert(key, value);
                }
                Ok(NativeValue::Object(obj))
            }
        }

        deserializer.deserialize_any(NativeValueVisitor)
    }
}

/// Tracks depth and size limits while walking a host value.
pub(crate) struct LimitTracker {
    max_depth: usize,
    max_bytes: usize,
    current_depth: usize,
    current_bytes: usize,
}

impl LimitTracker {
    pub fn new(max_depth: usize, max_bytes: usize) -> Self {
        Self {
            max_depth,
            max_bytes,
            current_depth: 0,
            current_bytes: 0,
        }
    }

    pub fn enter(&mut self) -> Result<(), HostError> {
        self.current_depth += 1;
        if self.current_depth > self.max_depth {
            return Err(HostError::Conversion(format!(
                "depth exceeded maximum limit of {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    pub fn exit(&mut self) {
        self.current_depth = self.current_depth.saturating_sub(1);
    }

    pub fn add_bytes(&mut self, bytes: usize) -> Result<(), HostError> {
        self.current_bytes = self.current_bytes.saturating_add(bytes);
        if self.current_bytes > self.max_bytes {
            return Err(HostError::Conversion(format!(
                "size ({} bytes) exceeded maximum limit of {} bytes",
                self.current_bytes, self.max_bytes
            )));
        }
        Ok(())
    }
}
