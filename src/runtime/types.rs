//! Host value kinds and the operations available on their handles.

use crate::runtime::context::internal::ContextInternal;
use crate::runtime::context::{CallKind, Context, FunctionContext};
use crate::runtime::error::{HostError, JsResult, NativeResult, ResultExt};
use crate::runtime::handle::private::ValueInternal;
use crate::runtime::handle::{Handle, Key, PropertyKey, SuperType, Value};
use crate::runtime::heap::{ErrorKind, Heap, HeapValue, ObjectData, ObjectKind, ValueRef, SLOT_BYTES};
use crate::runtime::isolate::Isolate;
use crate::runtime::template::{self, native_callback, Invocation};

macro_rules! value_kind {
    ($(#[$doc:meta])* $name:ident, $label:literal, $pattern:pat) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name {
            _private: (),
        }

        impl ValueInternal for $name {
            fn name() -> &'static str {
                $label
            }

            fn is_typeof(value: &HeapValue) -> bool {
                matches!(value, $pattern)
            }
        }

        impl Value for $name {}
    };
}

/// Any host value.
#[derive(Debug)]
pub struct JsValue {
    _private: (),
}

impl ValueInternal for JsValue {
    fn name() -> &'static str {
        "any"
    }

    fn is_typeof(value: &HeapValue) -> bool {
        !matches!(
            value,
            HeapValue::Object(ObjectData {
                kind: ObjectKind::Template(_),
                ..
            })
        )
    }
}

impl Value for JsValue {}

impl<T: Value> SuperType<T> for JsValue {}

value_kind!(JsUndefined, "undefined", HeapValue::Undefined);
value_kind!(JsNull, "null", HeapValue::Null);
value_kind!(JsBoolean, "boolean", HeapValue::Boolean(_));
value_kind!(JsNumber, "number", HeapValue::Number(_));
value_kind!(JsString, "string", HeapValue::String(_));
value_kind!(
    /// Any object, including arrays, functions and errors.
    JsObject,
    "object",
    HeapValue::Object(ObjectData {
        kind: ObjectKind::Ordinary
            | ObjectKind::Array(_)
            | ObjectKind::Function(_)
            | ObjectKind::Error(_),
        ..
    })
);
value_kind!(
    JsArray,
    "array",
    HeapValue::Object(ObjectData {
        kind: ObjectKind::Array(_),
        ..
    })
);
value_kind!(
    JsFunction,
    "function",
    HeapValue::Object(ObjectData {
        kind: ObjectKind::Function(_),
        ..
    })
);
value_kind!(
    JsError,
    "error",
    HeapValue::Object(ObjectData {
        kind: ObjectKind::Error(_),
        ..
    })
);

/// A constructor template held by the class registry. Never visible to the
/// host as a value.
#[derive(Debug)]
pub(crate) struct JsFunctionTemplate {
    _private: (),
}

impl ValueInternal for JsFunctionTemplate {
    fn name() -> &'static str {
        "function template"
    }

    fn is_typeof(value: &HeapValue) -> bool {
        matches!(
            value,
            HeapValue::Object(ObjectData {
                kind: ObjectKind::Template(_),
                ..
            })
        )
    }
}

impl Value for JsFunctionTemplate {}

impl SuperType<JsArray> for JsObject {}
impl SuperType<JsFunction> for JsObject {}
impl SuperType<JsError> for JsObject {}
impl SuperType<JsObject> for JsObject {}

/// Kinds that carry properties.
pub trait Object: Value {}

impl Object for JsObject {}
impl Object for JsArray {}
impl Object for JsFunction {}
impl Object for JsError {}

impl JsUndefined {
    pub fn new<'a, C: Context<'a>>(cx: &mut C) -> Handle<'a, JsUndefined> {
        let raw = cx.isolate().permanent().undefined;
        cx.handle(raw)
    }
}

impl JsNull {
    pub fn new<'a, C: Context<'a>>(cx: &mut C) -> Handle<'a, JsNull> {
        let raw = cx.isolate().permanent().null;
        cx.handle(raw)
    }
}

impl JsBoolean {
    pub fn new<'a, C: Context<'a>>(cx: &mut C, value: bool) -> Handle<'a, JsBoolean> {
        let raw = cx.isolate().boolean(value);
        cx.handle(raw)
    }
}

impl<'a> Handle<'a, JsBoolean> {
    pub fn value<'b, C: Context<'b>>(&self, cx: &mut C) -> bool {
        cx.check_live(self);
        matches!(cx.isolate().heap().get(self.to_raw()), HeapValue::Boolean(true))
    }
}

impl JsNumber {
    pub fn try_new<'a, C: Context<'a>>(
        cx: &mut C,
        value: f64,
    ) -> Result<Handle<'a, JsNumber>, HostError> {
        cx.alloc(HeapValue::Number(value))
    }
}

impl<'a> Handle<'a, JsNumber> {
    pub fn value<'b, C: Context<'b>>(&self, cx: &mut C) -> f64 {
        cx.check_live(self);
        match cx.isolate().heap().get(self.to_raw()) {
            HeapValue::Number(n) => *n,
            _ => f64::NAN,
        }
    }
}

impl JsString {
    pub fn try_new<'a, C: Context<'a>, S: AsRef<str>>(
        cx: &mut C,
        value: S,
    ) -> Result<Handle<'a, JsString>, HostError> {
        cx.alloc(HeapValue::String(value.as_ref().to_string()))
    }

    /// Create a string from an explicit-length byte buffer.
    pub fn try_from_utf8<'a, C: Context<'a>>(
        cx: &mut C,
        bytes: &[u8],
    ) -> Result<Handle<'a, JsString>, HostError> {
        let value =
            std::str::from_utf8(bytes).map_err(|err| HostError::InvalidEncoding(err.to_string()))?;
        Self::try_new(cx, value)
    }
}

impl<'a> Handle<'a, JsString> {
    pub fn value<'b, C: Context<'b>>(&self, cx: &mut C) -> String {
        cx.check_live(self);
        match cx.isolate().heap().get(self.to_raw()) {
            HeapValue::String(s) => s.clone(),
            _ => String::new(),
        }
    }

    /// Length of the string in UTF-8 bytes.
    pub fn size<'b, C: Context<'b>>(&self, cx: &mut C) -> usize {
        cx.check_live(self);
        match cx.isolate().heap().get(self.to_raw()) {
            HeapValue::String(s) => s.len(),
            _ => 0,
        }
    }
}

impl JsObject {
    pub fn try_new<'a, C: Context<'a>>(cx: &mut C) -> Result<Handle<'a, JsObject>, HostError> {
        cx.alloc(HeapValue::Object(ObjectData::new(ObjectKind::Ordinary)))
    }
}

impl JsArray {
    /// Create an array of `len` undefined elements.
    ///
    /// The heap limit is checked before any element storage is reserved.
    pub fn try_new<'a, C: Context<'a>>(
        cx: &mut C,
        len: u32,
    ) -> Result<Handle<'a, JsArray>, HostError> {
        let len = len as usize;
        let undefined = cx.isolate().permanent().undefined;
        let mut elements: Vec<ValueRef> = Vec::new();
        {
            let heap = cx.isolate().heap();
            let bytes = len.saturating_mul(SLOT_BYTES);
            heap.ensure_headroom(bytes)?;
            elements
                .try_reserve_exact(len)
                .map_err(|_| heap.exhausted(bytes))?;
        }
        elements.resize(len, undefined);
        cx.alloc(HeapValue::Object(ObjectData::new(ObjectKind::Array(
            elements,
        ))))
    }
}

impl<'a> Handle<'a, JsArray> {
    pub fn len<'b, C: Context<'b>>(&self, cx: &mut C) -> u32 {
        cx.check_live(self);
        match cx.isolate().heap().object(self.to_raw()).map(|obj| &obj.kind) {
            Some(ObjectKind::Array(elements)) => elements.len() as u32,
            _ => 0,
        }
    }

    pub fn is_empty<'b, C: Context<'b>>(&self, cx: &mut C) -> bool {
        self.len(cx) == 0
    }

    pub fn to_vec<'b, C: Context<'b>>(&self, cx: &mut C) -> Vec<Handle<'b, JsValue>> {
        cx.check_live(self);
        let elements: Vec<ValueRef> =
            match cx.isolate().heap().object(self.to_raw()).map(|obj| &obj.kind) {
                Some(ObjectKind::Array(elements)) => elements.clone(),
                _ => Vec::new(),
            };
        elements.into_iter().map(|raw| cx.handle(raw)).collect()
    }
}

impl JsError {
    /// Construct an `Error` without throwing it.
    pub fn error<'a, C: Context<'a>, S: AsRef<str>>(cx: &mut C, message: S) -> JsResult<'a, JsError> {
        Self::with_kind(cx, ErrorKind::Error, message.as_ref())
    }

    /// Construct a `TypeError` without throwing it.
    pub fn type_error<'a, C: Context<'a>, S: AsRef<str>>(
        cx: &mut C,
        message: S,
    ) -> JsResult<'a, JsError> {
        Self::with_kind(cx, ErrorKind::TypeError, message.as_ref())
    }

    /// Construct a `RangeError` without throwing it.
    pub fn range_error<'a, C: Context<'a>, S: AsRef<str>>(
        cx: &mut C,
        message: S,
    ) -> JsResult<'a, JsError> {
        Self::with_kind(cx, ErrorKind::RangeError, message.as_ref())
    }

    fn with_kind<'a, C: Context<'a>>(
        cx: &mut C,
        kind: ErrorKind,
        message: &str,
    ) -> JsResult<'a, JsError> {
        let raw = cx.isolate().new_error(kind, message).or_throw(cx)?;
        Ok(cx.handle(raw))
    }
}

impl<'a> Handle<'a, JsError> {
    /// The error's `message` property.
    pub fn message<'b, C: Context<'b>>(&self, cx: &mut C) -> String {
        cx.check_live(self);
        let isolate = cx.isolate();
        let message = lookup(isolate, self.to_raw(), &Key::Named("message".to_string()));
        match message {
            Some(raw) => isolate.describe(raw),
            None => String::new(),
        }
    }
}

impl JsFunction {
    /// Wrap a native closure as a host function.
    pub fn new<'a, C, F, V>(cx: &mut C, f: F) -> JsResult<'a, JsFunction>
    where
        C: Context<'a>,
        F: for<'b> Fn(FunctionContext<'b>) -> JsResult<'b, V> + 'static,
        V: Value,
    {
        let callback = native_callback(move |cx| f(cx).map(|value| value.upcast()));
        let raw = template::new_function(cx.isolate(), callback).or_throw(cx)?;
        Ok(cx.handle(raw))
    }
}

impl<'a> Handle<'a, JsFunction> {
    /// Call the function with `this` as receiver.
    pub fn call<'b, 'c, C, T, A, I>(&self, cx: &mut C, this: Handle<'c, T>, args: I) -> JsResult<'b, JsValue>
    where
        C: Context<'b>,
        T: Value,
        A: Value + 'c,
        I: IntoIterator<Item = Handle<'c, A>>,
    {
        cx.check_live(self);
        cx.check_live(&this);
        let args = checked_args(&*cx, args);
        let invocation = Invocation {
            callee: self.to_raw(),
            this: this.to_raw(),
            args,
            kind: CallKind::Call,
        };
        let result = template::invoke(cx.isolate(), invocation)?;
        Ok(cx.handle(result))
    }

    /// Call the function as a constructor, as with `new`.
    pub fn construct<'b, 'c, C, A, I>(&self, cx: &mut C, args: I) -> JsResult<'b, JsObject>
    where
        C: Context<'b>,
        A: Value + 'c,
        I: IntoIterator<Item = Handle<'c, A>>,
    {
        cx.check_live(self);
        let args = checked_args(&*cx, args);
        let undefined = cx.isolate().permanent().undefined;
        let invocation = Invocation {
            callee: self.to_raw(),
            this: undefined,
            args,
            kind: CallKind::Construct,
        };
        let result = template::invoke(cx.isolate(), invocation)?;
        let result: Handle<'b, JsValue> = cx.handle(result);
        result.downcast_or_throw(cx)
    }
}

impl<'a, T: Object> Handle<'a, T> {
    /// Read a property, walking the prototype chain. Missing properties read
    /// as `undefined`.
    pub fn get<'b, C: Context<'b>, K: PropertyKey>(&self, cx: &mut C, key: K) -> JsResult<'b, JsValue> {
        cx.check_live(self);
        let key = key.to_key(cx).or_throw(cx)?;
        let isolate = cx.isolate();
        let raw = lookup(isolate, self.to_raw(), &key).unwrap_or(isolate.permanent().undefined);
        Ok(cx.handle(raw))
    }

    /// Set an own property. Index keys on arrays write elements, growing the
    /// array as needed.
    ///
    /// Growth is charged against the heap limit; exceeding it throws the
    /// heap-exhaustion `RangeError`.
    pub fn set<'b, 'c, C: Context<'b>, K: PropertyKey, W: Value>(
        &self,
        cx: &mut C,
        key: K,
        value: Handle<'c, W>,
    ) -> NativeResult<bool> {
        cx.check_live(self);
        cx.check_live(&value);
        let key = key.to_key(cx).or_throw(cx)?;
        let undefined = cx.isolate().permanent().undefined;
        let stored = {
            let mut heap = cx.isolate().heap_mut();
            store(&mut heap, self.to_raw(), &key, value.to_raw(), undefined)
        };
        stored.or_throw(cx)
    }

    /// Names of the object's own properties, array indices first.
    pub fn get_own_property_names<'b, C: Context<'b>>(&self, cx: &mut C) -> JsResult<'b, JsArray> {
        cx.check_live(self);
        let names: Vec<String> = {
            let heap = cx.isolate().heap();
            match heap.object(self.to_raw()) {
                Some(obj) => {
                    let indices = match &obj.kind {
                        ObjectKind::Array(elements) => elements.len(),
                        _ => 0,
                    };
                    (0..indices)
                        .map(|index| index.to_string())
                        .chain(obj.properties.keys().cloned())
                        .collect()
                }
                None => Vec::new(),
            }
        };

        let mut elements = Vec::with_capacity(names.len());
        for name in names {
            let raw = cx
                .isolate()
                .allocate(HeapValue::String(name))
                .or_throw(cx)?;
            elements.push(raw);
        }
        cx.alloc(HeapValue::Object(ObjectData::new(ObjectKind::Array(
            elements,
        ))))
        .or_throw(cx)
    }
}

fn checked_args<'b, 'c, C, A, I>(cx: &C, args: I) -> Vec<ValueRef>
where
    C: Context<'b>,
    A: Value + 'c,
    I: IntoIterator<Item = Handle<'c, A>>,
{
    args.into_iter()
        .map(|arg| {
            cx.check_live(&arg);
            arg.to_raw()
        })
        .collect()
}

/// Write `value` under `key`, charging any growth to `object`'s cell.
fn store(
    heap: &mut Heap,
    object: ValueRef,
    key: &Key,
    value: ValueRef,
    undefined: ValueRef,
) -> Result<bool, HostError> {
    let name = key.name();
    let added = match heap.object(object) {
        None => return Ok(false),
        Some(obj) => match (key, &obj.kind) {
            (Key::Index(index), ObjectKind::Array(elements)) => {
                (*index as usize + 1).saturating_sub(elements.len())
            }
            _ if obj.properties.contains_key(&name) => 0,
            _ => 1,
        },
    };
    let bytes = added.saturating_mul(SLOT_BYTES);
    heap.ensure_headroom(bytes)?;

    let Some(obj) = heap.object_mut(object) else {
        return Ok(false);
    };
    match (key, &mut obj.kind) {
        (Key::Index(index), ObjectKind::Array(elements)) => {
            let index = *index as usize;
            if index >= elements.len() {
                if elements.try_reserve_exact(added).is_err() {
                    return Err(heap.exhausted(bytes));
                }
                elements.resize(index + 1, undefined);
            }
            elements[index] = value;
        }
        _ => {
            obj.properties.insert(name, value);
        }
    }
    heap.grow(object, bytes)?;
    Ok(true)
}

/// Find `key` on `object` or its prototype chain.
pub(crate) fn lookup(isolate: &Isolate, object: ValueRef, key: &Key) -> Option<ValueRef> {
    let heap = isolate.heap();
    let name = key.name();
    let mut current = Some(object);
    while let Some(raw) = current {
        let obj = heap.object(raw)?;
        if let (Key::Index(index), ObjectKind::Array(elements)) = (key, &obj.kind) {
            if let Some(element) = elements.get(*index as usize) {
                return Some(*element);
            }
        }
        if let Some(value) = obj.properties.get(&name) {
            return Some(*value);
        }
        current = obj.prototype;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::config::{RuntimeConfig, ShutdownMode};

    fn isolate() -> Isolate {
        Isolate::new(RuntimeConfig::new(ShutdownMode::Strict)).unwrap()
    }

    #[test]
    fn test_primitive_values() {
        let mut isolate = isolate();
        isolate
            .execute(|mut cx| {
                let t = cx.boolean(true);
                assert!(t.value(&mut cx));
                let n = cx.number(2.5)?;
                assert_eq!(n.value(&mut cx), 2.5);
                let s = cx.string("héllo")?;
                assert_eq!(s.value(&mut cx), "héllo");
                assert_eq!(s.size(&mut cx), 6);

                let undefined = cx.undefined();
                assert!(undefined.is_a::<JsUndefined, _>(&mut cx));
                let null = cx.null();
                assert!(null.is_a::<JsNull, _>(&mut cx));
                assert!(!null.is_a::<JsObject, _>(&mut cx));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_string_from_invalid_utf8() {
        let mut isolate = isolate();
        isolate
            .execute(|mut cx| {
                let ok = JsString::try_from_utf8(&mut cx, b"abc").unwrap();
                assert_eq!(ok.value(&mut cx), "abc");
                let err = JsString::try_from_utf8(&mut cx, &[0x61, 0xc3]).unwrap_err();
                assert!(matches!(err, HostError::InvalidEncoding(_)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_object_properties() {
        let mut isolate = isolate();
        isolate
            .execute(|mut cx| {
                let obj = cx.empty_object()?;
                let one = cx.number(1.0)?;
                let two = cx.string("two")?;
                obj.set(&mut cx, "one", one)?;
                obj.set(&mut cx, "two", two)?;

                let read = obj.get(&mut cx, "one")?;
                assert_eq!(read, one);
                let missing = obj.get(&mut cx, "three")?;
                assert!(missing.is_a::<JsUndefined, _>(&mut cx));

                let names = obj.get_own_property_names(&mut cx)?;
                let names: Vec<String> = names
                    .to_vec(&mut cx)
                    .into_iter()
                    .map(|name| name.downcast::<JsString, _>(&mut cx).unwrap().value(&mut cx))
                    .collect();
                assert_eq!(names, vec!["one", "two"]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_array_elements() {
        let mut isolate = isolate();
        isolate
            .execute(|mut cx| {
                let array = cx.empty_array()?;
                assert!(array.is_empty(&mut cx));
                let v = cx.number(9.0)?;
                array.set(&mut cx, 2u32, v)?;
                assert_eq!(array.len(&mut cx), 3);

                let items = array.to_vec(&mut cx);
                assert!(items[0].is_a::<JsUndefined, _>(&mut cx));
                assert_eq!(items[2], v);
                let got = array.get(&mut cx, 2u32)?;
                assert_eq!(got, v);
                Ok(())
            })
            .unwrap();
    }

    fn small_isolate() -> Isolate {
        let config = RuntimeConfig::new(ShutdownMode::Strict).with_max_heap_size(4096);
        Isolate::new(config).unwrap()
    }

    #[test]
    fn test_sparse_array_write_is_charged_to_heap() {
        let mut isolate = small_isolate();
        let len = isolate
            .execute(|mut cx| {
                let array = cx.empty_array()?;
                let v = cx.number(1.0)?;
                let caught = cx.try_catch(|cx| array.set(cx, 20_000_000u32, v));
                let exception = caught.unwrap_err();
                assert_eq!(cx.isolate().describe(exception.to_raw()), "RangeError: host heap exhausted");
                array.set(&mut cx, 3u32, v)?;
                Ok(array.len(&mut cx))
            })
            .unwrap();
        assert_eq!(len, 4);
        assert!(isolate.heap_used() <= 4096);
    }

    #[test]
    fn test_named_properties_are_charged_to_heap() {
        let mut isolate = small_isolate();
        let stored = isolate
            .execute(|mut cx| {
                let obj = cx.empty_object()?;
                let v = cx.number(1.0)?;
                let mut stored = 0;
                for i in 0..10_000 {
                    if cx.try_catch(|cx| obj.set(cx, format!("k{i}"), v)).is_err() {
                        break;
                    }
                    stored += 1;
                }
                // overwriting an existing key needs no headroom
                obj.set(&mut cx, "k0", v)?;
                Ok(stored)
            })
            .unwrap();
        assert!(stored > 0 && stored < 10_000);
        assert!(isolate.heap_used() <= 4096);
    }

    #[test]
    fn test_oversized_array_fails_before_reserving() {
        let mut isolate = small_isolate();
        let err = isolate
            .execute(|mut cx| Ok(JsArray::try_new(&mut cx, 50_000_000).unwrap_err()))
            .unwrap();
        assert!(matches!(
            err,
            HostError::HeapExhausted { requested, limit: 4096, .. } if requested == 50_000_000 * SLOT_BYTES
        ));
        assert!(isolate.heap_used() <= 4096);
    }

    #[test]
    fn test_errors_are_not_thrown_on_construction() {
        let mut isolate = isolate();
        isolate
            .execute(|mut cx| {
                let err = cx.type_error("wrong")?;
                assert_eq!(err.message(&mut cx), "wrong");
                assert!(err.is_a::<JsObject, _>(&mut cx));
                let name = err.get(&mut cx, "name")?;
                let name = name.downcast::<JsString, _>(&mut cx).unwrap();
                assert_eq!(name.value(&mut cx), "TypeError");
                Ok(())
            })
            .unwrap();
        assert!(!isolate.has_exception());
    }

    #[test]
    #[should_panic(expected = "handle used with an isolate other than the one that created it")]
    fn test_string_size_rejects_foreign_handle() {
        let mut first = isolate();
        let mut second = isolate();
        first
            .execute(|mut cx| {
                let s = cx.string("abc")?;
                assert_eq!(s.size(&mut cx), 3);
                second.execute(|mut other| Ok(s.size(&mut other))).unwrap();
                Ok(())
            })
            .unwrap();
    }

    #[test]
    #[should_panic(expected = "handle used with an isolate other than the one that created it")]
    fn test_error_message_rejects_foreign_handle() {
        let mut first = isolate();
        let mut second = isolate();
        first
            .execute(|mut cx| {
                let err = cx.error("boom")?;
                second.execute(|mut other| Ok(err.message(&mut other))).unwrap();
                Ok(())
            })
            .unwrap();
    }

    #[test]
    #[should_panic(expected = "handle used with an isolate other than the one that created it")]
    fn test_strict_equals_rejects_foreign_operand() {
        let mut first = isolate();
        let mut second = isolate();
        first
            .execute(|mut cx| {
                let foreign = cx.number(1.0)?;
                second
                    .execute(|mut other| {
                        let local = other.number(1.0)?;
                        Ok(local.strict_equals(&mut other, foreign))
                    })
                    .unwrap();
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_call_native_function() {
        let mut isolate = isolate();
        let result = isolate
            .execute(|mut cx| {
                let add = JsFunction::new(&mut cx, |mut cx| {
                    let a = cx.argument::<JsNumber>(0)?.value(&mut cx);
                    let b = cx.argument::<JsNumber>(1)?.value(&mut cx);
                    cx.number(a + b)
                })?;
                let this = cx.undefined();
                let a = cx.number(40.0)?;
                let b = cx.number(2.0)?;
                let sum = add.call(&mut cx, this, [a, b])?;
                let sum = sum.downcast_or_throw::<JsNumber, _>(&mut cx)?;
                Ok(sum.value(&mut cx))
            })
            .unwrap();
        assert_eq!(result, 42.0);
    }

    #[test]
    fn test_construct_uses_prototype_and_receiver() {
        let mut isolate = isolate();
        isolate
            .execute(|mut cx| {
                let ctor = JsFunction::new(&mut cx, |mut cx| {
                    assert_eq!(cx.kind(), CallKind::Construct);
                    let this = cx.this().downcast_or_throw::<JsObject, _>(&mut cx)?;
                    let tag = cx.string("tagged")?;
                    this.set(&mut cx, "tag", tag)?;
                    Ok(cx.undefined())
                })?;
                let proto = cx.empty_object()?;
                let shared = cx.number(5.0)?;
                proto.set(&mut cx, "shared", shared)?;
                ctor.set(&mut cx, "prototype", proto)?;

                let args: [Handle<JsValue>; 0] = [];
                let instance = ctor.construct(&mut cx, args)?;
                let tag = instance.get(&mut cx, "tag")?;
                let tag = tag.downcast::<JsString, _>(&mut cx).unwrap();
                assert_eq!(tag.value(&mut cx), "tagged");
                let inherited = instance.get(&mut cx, "shared")?;
                assert_eq!(inherited, shared);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_missing_argument_throws() {
        let mut isolate = isolate();
        let err = isolate
            .execute(|mut cx| {
                let f = JsFunction::new(&mut cx, |mut cx| cx.argument::<JsString>(0))?;
                let this = cx.undefined();
                let args: [Handle<JsValue>; 0] = [];
                f.call(&mut cx, this, args)?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(
            err,
            HostError::Uncaught("TypeError: not enough arguments".to_string())
        );
    }
}
