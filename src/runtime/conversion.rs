//! Conversion between host values and [`NativeValue`] snapshots.

use crate::runtime::context::internal::ContextInternal;
use crate::runtime::context::Context;
use crate::runtime::error::HostError;
use crate::runtime::handle::{Handle, Value};
use crate::runtime::heap::{Heap, HeapValue, ObjectData, ObjectKind, ValueRef};
use crate::runtime::native_value::{LimitTracker, NativeValue, MAX_BYTES, MAX_DEPTH};
use crate::runtime::types::JsValue;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;

/// Snapshot a host value.
///
/// Arrays and ordinary objects are copied recursively, own properties only.
/// Error objects become objects with their `name` and `message`. Functions,
/// cycles and values beyond the depth or size limits are rejected.
pub fn to_native<'a, C: Context<'a>, T: Value>(
    cx: &mut C,
    value: Handle<'_, T>,
) -> Result<NativeValue, HostError> {
    cx.check_live(&value);
    let heap = cx.isolate().heap();
    let mut seen = HashSet::new();
    let mut tracker = LimitTracker::new(MAX_DEPTH, MAX_BYTES);
    snapshot(&heap, value.to_raw(), &mut seen, &mut tracker)
}

fn snapshot(
    heap: &Heap,
    raw: ValueRef,
    seen: &mut HashSet<ValueRef>,
    tracker: &mut LimitTracker,
) -> Result<NativeValue, HostError> {
    tracker.enter()?;

    let result = match heap.get(raw) {
        HeapValue::Undefined => {
            tracker.add_bytes(4)?;
            NativeValue::Undefined
        }
        HeapValue::Null => {
            tracker.add_bytes(4)?;
            NativeValue::Null
        }
        HeapValue::Boolean(b) => {
            tracker.add_bytes(1)?;
            NativeValue::Bool(*b)
        }
        HeapValue::Number(n) => {
            tracker.add_bytes(std::mem::size_of::<f64>())?;
            NativeValue::from_number(*n)
        }
        HeapValue::String(s) => {
            tracker.add_bytes(s.len())?;
            NativeValue::String(s.clone())
        }
        HeapValue::Object(obj) => {
            if !seen.insert(raw) {
                return Err(HostError::Conversion(
                    "circular reference detected while converting host value".to_string(),
                ));
            }
            let value = snapshot_object(heap, obj, seen, tracker)?;
            seen.remove(&raw);
            value
        }
    };

    tracker.exit();
    Ok(result)
}

fn snapshot_object(
    heap: &Heap,
    obj: &ObjectData,
    seen: &mut HashSet<ValueRef>,
    tracker: &mut LimitTracker,
) -> Result<NativeValue, HostError> {
    match &obj.kind {
        ObjectKind::Array(elements) => {
            tracker.add_bytes(16)?;
            tracker.add_bytes(elements.len().saturating_mul(std::mem::size_of::<usize>()))?;
            let mut items = Vec::with_capacity(elements.len());
            for element in elements {
                items.push(snapshot(heap, *element, seen, tracker)?);
            }
            Ok(NativeValue::Array(items))
        }
        ObjectKind::Ordinary | ObjectKind::Error(_) => {
            tracker.add_bytes(24)?;
            let mut map = IndexMap::with_capacity(obj.properties.len());
            for (key, value) in &obj.properties {
                tracker.add_bytes(key.len() + 8)?;
                map.insert(key.clone(), snapshot(heap, *value, seen, tracker)?);
            }
            Ok(NativeValue::Object(map))
        }
        ObjectKind::Function(_) | ObjectKind::Template(_) => Err(HostError::Conversion(
            "functions cannot be converted to native values".to_string(),
        )),
    }
}

/// Materialise a snapshot as a fresh host value.
pub fn from_native<'a, C: Context<'a>>(
    cx: &mut C,
    value: &NativeValue,
) -> Result<Handle<'a, JsValue>, HostError> {
    let permanent = *cx.isolate().permanent();
    let handle = match value {
        NativeValue::Undefined => cx.handle(permanent.undefined),
        NativeValue::Null => cx.handle(permanent.null),
        NativeValue::Bool(b) => {
            let raw = cx.isolate().boolean(*b);
            cx.handle(raw)
        }
        NativeValue::Int(i) => cx.alloc(HeapValue::Number(*i as f64))?,
        NativeValue::Float(f) => cx.alloc(HeapValue::Number(*f))?,
        NativeValue::String(s) => cx.alloc(HeapValue::String(s.clone()))?,
        NativeValue::Array(items) => {
            let mut elements = Vec::with_capacity(items.len());
            for item in items {
                elements.push(from_native(cx, item)?.to_raw());
            }
            cx.alloc(HeapValue::Object(ObjectData::new(ObjectKind::Array(elements))))?
        }
        NativeValue::Object(map) => {
            let mut obj = ObjectData::new(ObjectKind::Ordinary);
            for (key, item) in map {
                let item = from_native(cx, item)?;
                obj.properties.insert(key.clone(), item.to_raw());
            }
            cx.alloc(HeapValue::Object(obj))?
        }
    };
    Ok(handle)
}

/// Convert any serializable native value into a host value.
///
/// Goes through JSON, so non-finite floats arrive as `null`.
pub fn to_host<'a, C: Context<'a>, T: Serialize + ?Sized>(
    cx: &mut C,
    value: &T,
) -> Result<Handle<'a, JsValue>, HostError> {
    let json = serde_json::to_value(value).map_err(|err| HostError::Conversion(err.to_string()))?;
    let native: NativeValue =
        serde_json::from_value(json).map_err(|err| HostError::Conversion(err.to_string()))?;
    from_native(cx, &native)
}

/// Deserialize a native value out of a host value.
pub fn from_host<'a, C: Context<'a>, T: DeserializeOwned, V: Value>(
    cx: &mut C,
    value: Handle<'_, V>,
) -> Result<T, HostError> {
    let native = to_native(cx, value)?;
    let json = serde_json::to_value(&native).map_err(|err| HostError::Conversion(err.to_string()))?;
    serde_json::from_value(json).map_err(|err| HostError::Conversion(err.to_string()))
}
