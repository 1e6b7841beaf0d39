//! Scope-bound references to host values.
//!
//! A [`Handle`] is a copyable reference to a value on an isolate's heap. Its
//! lifetime parameter ties it to the context that produced it, so the borrow
//! checker rejects any use after the owning region has exited. Every handle
//! also records the isolate and frame it was created in; each heap access
//! asserts the isolate matches and, in debug builds, that the frame is live.

use crate::runtime::context::internal::ContextInternal;
use crate::runtime::context::Context;
use crate::runtime::error::{HostError, JsResult, ResultExt};
use crate::runtime::heap::{HeapValue, ValueRef};
use crate::runtime::isolate::IsolateId;
use crate::runtime::persistent::Persistent;
use crate::runtime::types::JsString;
use std::fmt;
use std::marker::PhantomData;

pub(crate) mod private {
    use crate::runtime::heap::HeapValue;

    pub trait ValueInternal {
        /// Name used in type-mismatch errors.
        fn name() -> &'static str;

        fn is_typeof(value: &HeapValue) -> bool;
    }
}

/// A kind of host value a [`Handle`] can refer to.
pub trait Value: private::ValueInternal + Sized + 'static {}

/// Marker for kinds that `T` can be upcast to.
pub trait SuperType<T: Value>: Value {}

/// A reference to a host value of kind `T`, valid while the region that
/// produced it is live.
///
/// Two handles are equal when they refer to the same heap cell.
pub struct Handle<'a, T: Value + 'a> {
    raw: ValueRef,
    isolate: IsolateId,
    frame: u32,
    _marker: PhantomData<(&'a (), fn() -> T)>,
}

impl<'a, T: Value> Clone for Handle<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T: Value> Copy for Handle<'a, T> {}

impl<'a, T: Value> fmt::Debug for Handle<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("kind", &T::name())
            .field("raw", &self.raw)
            .field("isolate", &self.isolate)
            .field("frame", &self.frame)
            .finish()
    }
}

impl<'a, 'b, T: Value, U: Value> PartialEq<Handle<'b, U>> for Handle<'a, T> {
    fn eq(&self, other: &Handle<'b, U>) -> bool {
        self.raw == other.raw
    }
}

impl<'a, T: Value> Eq for Handle<'a, T> {}

impl<'a, T: Value> Handle<'a, T> {
    pub(crate) fn new_internal(raw: ValueRef, isolate: IsolateId, frame: u32) -> Self {
        Self {
            raw,
            isolate,
            frame,
            _marker: PhantomData,
        }
    }

    pub(crate) fn to_raw(self) -> ValueRef {
        self.raw
    }

    pub(crate) fn frame(&self) -> u32 {
        self.frame
    }

    pub(crate) fn isolate_id(&self) -> IsolateId {
        self.isolate
    }

    /// Widen the handle to a more general kind.
    pub fn upcast<U: SuperType<T>>(&self) -> Handle<'a, U> {
        Handle::new_internal(self.raw, self.isolate, self.frame)
    }

    /// Whether the referent is of kind `U`.
    pub fn is_a<'b, U: Value, C: Context<'b>>(&self, cx: &mut C) -> bool {
        cx.check_live(self);
        let heap = cx.isolate().heap();
        U::is_typeof(heap.get(self.raw))
    }

    /// Narrow the handle to kind `U`, failing with a typed error.
    pub fn downcast<'b, U: Value, C: Context<'b>>(
        &self,
        cx: &mut C,
    ) -> Result<Handle<'a, U>, HostError> {
        cx.check_live(self);
        let heap = cx.isolate().heap();
        let value = heap.get(self.raw);
        if U::is_typeof(value) {
            Ok(Handle::new_internal(self.raw, self.isolate, self.frame))
        } else {
            Err(HostError::TypeMismatch {
                expected: U::name(),
                found: value.type_name(),
            })
        }
    }

    /// Narrow the handle to kind `U`, throwing a `TypeError` on mismatch.
    pub fn downcast_or_throw<'b, U: Value, C: Context<'b>>(&self, cx: &mut C) -> JsResult<'a, U> {
        self.downcast(cx).or_throw(cx)
    }

    /// Strict equality: identity for objects, value equality for primitives.
    pub fn strict_equals<'b, 'c, U: Value, C: Context<'b>>(
        &self,
        cx: &mut C,
        other: Handle<'c, U>,
    ) -> bool {
        cx.check_live(self);
        cx.check_live(&other);
        if self.raw == other.raw {
            return true;
        }
        let heap = cx.isolate().heap();
        match (heap.get(self.raw), heap.get(other.raw)) {
            (HeapValue::Undefined, HeapValue::Undefined) => true,
            (HeapValue::Null, HeapValue::Null) => true,
            (HeapValue::Boolean(a), HeapValue::Boolean(b)) => a == b,
            (HeapValue::Number(a), HeapValue::Number(b)) => a == b,
            (HeapValue::String(a), HeapValue::String(b)) => a == b,
            _ => false,
        }
    }

    /// Keep the referent alive beyond this region.
    pub fn root<'b, C: Context<'b>>(&self, cx: &mut C) -> Persistent<T> {
        Persistent::from_handle(cx, *self)
    }
}

/// A property key as understood by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Named(String),
    Index(u32),
}

impl Key {
    pub(crate) fn name(&self) -> String {
        match self {
            Key::Named(name) => name.clone(),
            Key::Index(index) => index.to_string(),
        }
    }
}

/// Types usable as object property keys.
pub trait PropertyKey {
    fn to_key<'a, C: Context<'a>>(self, cx: &mut C) -> Result<Key, HostError>;
}

impl PropertyKey for &str {
    fn to_key<'a, C: Context<'a>>(self, _cx: &mut C) -> Result<Key, HostError> {
        Ok(Key::Named(self.to_string()))
    }
}

impl PropertyKey for String {
    fn to_key<'a, C: Context<'a>>(self, _cx: &mut C) -> Result<Key, HostError> {
        Ok(Key::Named(self))
    }
}

impl PropertyKey for u32 {
    fn to_key<'a, C: Context<'a>>(self, _cx: &mut C) -> Result<Key, HostError> {
        Ok(Key::Index(self))
    }
}

impl PropertyKey for &[u8] {
    fn to_key<'a, C: Context<'a>>(self, _cx: &mut C) -> Result<Key, HostError> {
        std::str::from_utf8(self)
            .map(|name| Key::Named(name.to_string()))
            .map_err(|_| HostError::InvalidKey(String::from_utf8_lossy(self).into_owned()))
    }
}

impl<'b> PropertyKey for Handle<'b, JsString> {
    fn to_key<'a, C: Context<'a>>(self, cx: &mut C) -> Result<Key, HostError> {
        Ok(Key::Named(self.value(cx)))
    }
}
