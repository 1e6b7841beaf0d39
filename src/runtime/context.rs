//! Contexts: the scope-bearing entry points through which native code touches
//! the host.
//!
//! Every context owns exactly one entered [`Scope`]. Handles produced through
//! a context carry its lifetime, so none of them can be used once the context
//! (and with it the region) is gone.

use crate::runtime::channel::Channel;
use crate::runtime::class::{ClassDescriptor, ClassId};
use crate::runtime::error::{HostError, JsResult, NativeResult, ResultExt, Throw};
use crate::runtime::handle::{Handle, Value};
use crate::runtime::heap::{ErrorKind, ValueRef};
use crate::runtime::isolate::IsolateId;
use crate::runtime::scope::{Scope, ScopeKind};
use crate::runtime::task::TaskQueue;
use crate::runtime::types::{
    JsArray, JsBoolean, JsError, JsFunction, JsNull, JsNumber, JsObject, JsString, JsUndefined,
    JsValue,
};
use std::marker::PhantomData;

pub(crate) mod internal {
    use crate::runtime::error::HostError;
    use crate::runtime::handle::{Handle, Value};
    use crate::runtime::heap::{HeapValue, ValueRef};
    use crate::runtime::isolate::Isolate;
    use crate::runtime::scope::Scope;
    use crate::runtime::types::JsValue;

    pub trait ContextInternal<'a>: Sized {
        fn scope(&self) -> &Scope<'a>;

        fn isolate(&self) -> &'a Isolate {
            self.scope().isolate()
        }

        /// Root `raw` in this context's region.
        fn handle<T: Value>(&mut self, raw: ValueRef) -> Handle<'a, T> {
            let serial = self.isolate().handles().push(raw);
            debug_assert_eq!(
                serial,
                self.scope().serial,
                "handle created through a context that is not the innermost scope"
            );
            Handle::new_internal(raw, self.isolate().id(), serial)
        }

        fn alloc<T: Value>(&mut self, value: HeapValue) -> Result<Handle<'a, T>, HostError> {
            let raw = self.isolate().allocate(value)?;
            Ok(self.handle(raw))
        }

        fn check_live<T: Value>(&self, handle: &Handle<'_, T>) {
            assert_eq!(
                handle.isolate_id(),
                self.isolate().id(),
                "handle used with an isolate other than the one that created it"
            );
            debug_assert!(
                self.isolate().handles().is_live(handle.frame()),
                "handle used after its scope exited"
            );
        }

        fn take_exception_handle(&mut self) -> Option<Handle<'a, JsValue>> {
            let raw = self.isolate().take_exception()?;
            Some(self.handle(raw))
        }
    }
}

use internal::ContextInternal;

/// Operations available in every scope-bearing context.
pub trait Context<'a>: ContextInternal<'a> {
    fn isolate_id(&self) -> IsolateId {
        self.isolate().id()
    }

    /// Run `f` in a nested plain region. Handles created inside are released
    /// when `f` returns.
    fn execute_scoped<T, F>(&mut self, f: F) -> T
    where
        F: for<'b> FnOnce(ExecuteContext<'b>) -> T,
    {
        let isolate = self.isolate();
        Scope::with(isolate, ScopeKind::Plain, |scope| {
            f(ExecuteContext::new(scope))
        })
    }

    /// Run `f` in a nested escapable region and escape its result into this
    /// context. The region's context names this context's lifetime as the
    /// one its result escapes to.
    fn compute_scoped<V, F>(&mut self, f: F) -> JsResult<'a, V>
    where
        V: Value,
        F: for<'b> FnOnce(ComputeContext<'b, 'a>) -> JsResult<'b, V>,
    {
        let isolate = self.isolate();
        let raw = Scope::with(isolate, ScopeKind::Escapable, |scope| {
            f(ComputeContext::new(scope)).map(Handle::to_raw)
        })?;
        Ok(self.handle(raw))
    }

    /// Run `f`, catching any exception it leaves pending.
    fn try_catch<T, F>(&mut self, f: F) -> Result<T, Handle<'a, JsValue>>
    where
        F: FnOnce(&mut Self) -> NativeResult<T>,
    {
        match f(self) {
            Ok(value) => Ok(value),
            Err(_) => match self.take_exception_handle() {
                Some(exception) => Err(exception),
                None => {
                    let isolate = self.isolate();
                    let raw = isolate
                        .new_error(ErrorKind::Error, "exception was not set")
                        .unwrap_or(isolate.permanent().heap_exhausted);
                    Err(self.handle(raw))
                }
            },
        }
    }

    fn undefined(&mut self) -> Handle<'a, JsUndefined> {
        JsUndefined::new(self)
    }

    fn null(&mut self) -> Handle<'a, JsNull> {
        JsNull::new(self)
    }

    fn boolean(&mut self, value: bool) -> Handle<'a, JsBoolean> {
        JsBoolean::new(self, value)
    }

    fn number<N: Into<f64>>(&mut self, value: N) -> JsResult<'a, JsNumber> {
        JsNumber::try_new(self, value.into()).or_throw(self)
    }

    fn string<S: AsRef<str>>(&mut self, value: S) -> JsResult<'a, JsString> {
        JsString::try_new(self, value).or_throw(self)
    }

    /// Create a string from an explicit-length byte buffer, reporting invalid
    /// encoding or exhaustion as a typed failure.
    fn try_string(&mut self, bytes: &[u8]) -> Result<Handle<'a, JsString>, HostError> {
        JsString::try_from_utf8(self, bytes)
    }

    fn empty_object(&mut self) -> JsResult<'a, JsObject> {
        JsObject::try_new(self).or_throw(self)
    }

    fn empty_array(&mut self) -> JsResult<'a, JsArray> {
        JsArray::try_new(self, 0).or_throw(self)
    }

    fn global(&mut self) -> Handle<'a, JsObject> {
        let raw = self.isolate().permanent().global;
        self.handle(raw)
    }

    /// Throw `value` as a host exception.
    fn throw<T: Value, U>(&mut self, value: Handle<'_, T>) -> NativeResult<U> {
        self.check_live(&value);
        self.isolate().set_exception(value.to_raw());
        Err(Throw::new())
    }

    fn error<S: AsRef<str>>(&mut self, message: S) -> JsResult<'a, JsError> {
        JsError::error(self, message)
    }

    fn type_error<S: AsRef<str>>(&mut self, message: S) -> JsResult<'a, JsError> {
        JsError::type_error(self, message)
    }

    fn range_error<S: AsRef<str>>(&mut self, message: S) -> JsResult<'a, JsError> {
        JsError::range_error(self, message)
    }

    fn throw_error<S: AsRef<str>, T>(&mut self, message: S) -> NativeResult<T> {
        Err(self.isolate().throw_error(ErrorKind::Error, message.as_ref()))
    }

    fn throw_type_error<S: AsRef<str>, T>(&mut self, message: S) -> NativeResult<T> {
        Err(self.isolate().throw_error(ErrorKind::TypeError, message.as_ref()))
    }

    fn throw_range_error<S: AsRef<str>, T>(&mut self, message: S) -> NativeResult<T> {
        Err(self.isolate().throw_error(ErrorKind::RangeError, message.as_ref()))
    }

    /// Throw an `Error` whose message is the UTF-8 text in `bytes`.
    fn throw_error_from_utf8<T>(&mut self, bytes: &[u8]) -> NativeResult<T> {
        match std::str::from_utf8(bytes) {
            Ok(message) => self.throw_error(message),
            Err(_) => self.throw_error("an unknown native error occurred"),
        }
    }

    /// Convert a typed failure into a host exception.
    fn throw_host_error<T>(&mut self, err: HostError) -> NativeResult<T> {
        let isolate = self.isolate();
        let throw = match &err {
            HostError::HeapExhausted { .. } => {
                isolate.set_exception(isolate.permanent().heap_exhausted);
                Throw::new()
            }
            HostError::TypeMismatch { .. }
            | HostError::NotAnInstance(_)
            | HostError::InvalidKey(_)
            | HostError::InvalidEncoding(_) => {
                isolate.throw_error(ErrorKind::TypeError, &err.to_string())
            }
            _ => isolate.throw_error(ErrorKind::Error, &err.to_string()),
        };
        Err(throw)
    }

    /// A channel for sending closures to this isolate's event loop from any
    /// thread. The channel keeps the loop alive until it is unreferenced or
    /// dropped.
    fn channel(&mut self) -> Channel {
        Channel::new(self)
    }

    fn task_queue(&mut self) -> TaskQueue {
        self.isolate().task_queue()
    }
}

/// Context of a top-level entry or a nested plain region.
pub struct ExecuteContext<'a> {
    scope: Scope<'a>,
}

impl<'a> ExecuteContext<'a> {
    pub(crate) fn new(scope: Scope<'a>) -> Self {
        Self { scope }
    }
}

impl<'a> ContextInternal<'a> for ExecuteContext<'a> {
    fn scope(&self) -> &Scope<'a> {
        &self.scope
    }
}

impl<'a> Context<'a> for ExecuteContext<'a> {}

/// Context of an escapable region entered with
/// [`Context::compute_scoped`]. `'outer` is the lifetime of the calling
/// context, which receives the escaped result.
pub struct ComputeContext<'a, 'outer> {
    scope: Scope<'a>,
    _outer: PhantomData<&'outer ()>,
}

impl<'a, 'outer> ComputeContext<'a, 'outer> {
    pub(crate) fn new(scope: Scope<'a>) -> Self {
        Self {
            scope,
            _outer: PhantomData,
        }
    }
}

impl<'a, 'outer> ContextInternal<'a> for ComputeContext<'a, 'outer> {
    fn scope(&self) -> &Scope<'a> {
        &self.scope
    }
}

impl<'a, 'outer> Context<'a> for ComputeContext<'a, 'outer> {}

/// Context in which event-loop callbacks and task completions run.
pub struct TaskContext<'a> {
    scope: Scope<'a>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(scope: Scope<'a>) -> Self {
        Self { scope }
    }
}

impl<'a> ContextInternal<'a> for TaskContext<'a> {
    fn scope(&self) -> &Scope<'a> {
        &self.scope
    }
}

impl<'a> Context<'a> for TaskContext<'a> {}

/// How the host invoked a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `new F(...)`
    Construct,
    /// `F(...)`
    Call,
}

/// Context of a native function invoked by the host. `T` is the kind of the
/// receiver.
pub struct CallContext<'a, T: Value> {
    scope: Scope<'a>,
    kind: CallKind,
    this: ValueRef,
    callee: ValueRef,
    args: Vec<ValueRef>,
    _marker: PhantomData<fn() -> T>,
}

/// A function call with an arbitrary receiver.
pub type FunctionContext<'a> = CallContext<'a, JsValue>;

/// A method call whose receiver is a verified class instance.
pub type MethodContext<'a> = CallContext<'a, JsObject>;

impl<'a, T: Value> CallContext<'a, T> {
    /// Root the receiver, callee and arguments in `scope`.
    pub(crate) fn new(
        scope: Scope<'a>,
        kind: CallKind,
        this: ValueRef,
        callee: ValueRef,
        args: Vec<ValueRef>,
    ) -> Self {
        {
            let mut handles = scope.isolate().handles();
            handles.push(callee);
            handles.push(this);
            for arg in &args {
                handles.push(*arg);
            }
        }
        Self {
            scope,
            kind,
            this,
            callee,
            args,
            _marker: PhantomData,
        }
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Number of arguments passed.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn argument_opt(&self, index: usize) -> Option<Handle<'a, JsValue>> {
        self.args
            .get(index)
            .map(|raw| Handle::new_internal(*raw, self.scope.isolate.id(), self.scope.serial))
    }

    /// The argument at `index` as kind `V`, throwing a `TypeError` if it is
    /// missing or of another kind.
    pub fn argument<V: Value>(&mut self, index: usize) -> JsResult<'a, V> {
        match self.argument_opt(index) {
            Some(value) => value.downcast_or_throw(self),
            None => self.throw_type_error("not enough arguments"),
        }
    }

    pub fn this(&self) -> Handle<'a, T> {
        Handle::new_internal(self.this, self.scope.isolate.id(), self.scope.serial)
    }

    pub fn callee(&self) -> Handle<'a, JsFunction> {
        Handle::new_internal(self.callee, self.scope.isolate.id(), self.scope.serial)
    }

    /// Reinterpret the receiver. The caller has verified that it is of kind
    /// `U`.
    pub(crate) fn cast_receiver<U: Value>(self) -> CallContext<'a, U> {
        CallContext {
            scope: self.scope,
            kind: self.kind,
            this: self.this,
            callee: self.callee,
            args: self.args,
            _marker: PhantomData,
        }
    }
}

impl<'a, T: Value> ContextInternal<'a> for CallContext<'a, T> {
    fn scope(&self) -> &Scope<'a> {
        &self.scope
    }
}

impl<'a, T: Value> Context<'a> for CallContext<'a, T> {}

/// Context in which a native module initializes its exports.
pub struct ModuleContext<'a> {
    scope: Scope<'a>,
    exports: ValueRef,
}

impl<'a> ModuleContext<'a> {
    pub(crate) fn new(scope: Scope<'a>, exports: ValueRef) -> Self {
        scope.isolate().handles().push(exports);
        Self { scope, exports }
    }

    pub fn exports_object(&mut self) -> Handle<'a, JsObject> {
        Handle::new_internal(self.exports, self.scope.isolate.id(), self.scope.serial)
    }

    /// Export a native function under `name`.
    pub fn export_function<F, V>(&mut self, name: &str, f: F) -> NativeResult<()>
    where
        F: for<'b> Fn(FunctionContext<'b>) -> JsResult<'b, V> + 'static,
        V: Value,
    {
        let function = JsFunction::new(self, f)?;
        self.export_value(name, function)
    }

    pub fn export_value<T: Value>(&mut self, name: &str, value: Handle<'_, T>) -> NativeResult<()> {
        let exports = self.exports_object();
        exports.set(self, name, value)?;
        Ok(())
    }

    /// Register a class and export its constructor under the class name.
    pub fn export_class<T: 'static>(&mut self, descriptor: ClassDescriptor<T>) -> NativeResult<ClassId> {
        let class = descriptor.register(self).or_throw(self)?;
        let constructor = class.constructor(self)?;
        let name = class.name(self).or_throw(self)?;
        self.export_value(&name, constructor)?;
        Ok(class)
    }
}

impl<'a> ContextInternal<'a> for ModuleContext<'a> {
    fn scope(&self) -> &Scope<'a> {
        &self.scope
    }
}

impl<'a> Context<'a> for ModuleContext<'a> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::config::{RuntimeConfig, ShutdownMode};
    use crate::runtime::isolate::Isolate;

    fn isolate() -> Isolate {
        Isolate::new(RuntimeConfig::new(ShutdownMode::Strict)).unwrap()
    }

    #[test]
    fn test_execute_scoped_releases_handles() {
        let mut isolate = isolate();
        isolate
            .execute(|mut cx| {
                let before = cx.isolate().handles().len();
                for i in 0..100 {
                    cx.execute_scoped(|mut cx| {
                        let n = cx.number(i as f64).unwrap();
                        let s = cx.string("temporary").unwrap();
                        assert!(n.is_a::<JsNumber, _>(&mut cx));
                        assert!(s.is_a::<JsString, _>(&mut cx));
                    });
                }
                assert_eq!(cx.isolate().handles().len(), before);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_compute_scoped_escapes_one_handle() {
        let mut isolate = isolate();
        isolate
            .execute(|mut cx| {
                let depth = cx.isolate().handles().depth();
                let obj = cx.compute_scoped(|mut cx| {
                    for _ in 0..10 {
                        cx.empty_object()?;
                    }
                    let obj = cx.empty_object()?;
                    let marker = cx.string("kept")?;
                    obj.set(&mut cx, "marker", marker)?;
                    Ok(obj)
                })?;
                assert_eq!(cx.isolate().handles().depth(), depth);
                assert!(cx.isolate().handles().is_live(obj.frame()));

                // Only the escaped object and its property survive a collection.
                let before = cx.isolate().heap().live_objects();
                let freed = {
                    let isolate = cx.isolate();
                    let roots: Vec<ValueRef> = isolate.handles().roots().collect();
                    let permanent = isolate.permanent();
                    let mut all = roots;
                    all.extend([
                        permanent.undefined,
                        permanent.null,
                        permanent.true_value,
                        permanent.false_value,
                        permanent.global,
                        permanent.heap_exhausted,
                    ]);
                    isolate.heap_mut().collect(all);
                    isolate.heap().stats().last_freed_count
                };
                assert_eq!(freed, 10);
                assert_eq!(cx.isolate().heap().live_objects(), before - 10);

                let marker = obj.get(&mut cx, "marker")?;
                let marker = marker.downcast_or_throw::<JsString, _>(&mut cx)?;
                assert_eq!(marker.value(&mut cx), "kept");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_nested_compute_escapes_to_correct_ancestor() {
        let mut isolate = isolate();
        let value = isolate
            .execute(|mut cx| {
                let outer = cx.compute_scoped(|mut cx| {
                    let inner = cx.compute_scoped(|mut cx| cx.number(3.0))?;
                    let doubled = inner.value(&mut cx) * 2.0;
                    cx.number(doubled)
                })?;
                Ok(outer.value(&mut cx))
            })
            .unwrap();
        assert_eq!(value, 6.0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "handle used after its scope exited")]
    fn test_handle_from_exited_scope_is_caught() {
        let mut isolate = isolate();
        let _ = isolate.execute(|mut cx| {
            let raw = cx.number(1.0)?.to_raw();
            let exited = cx.execute_scoped(|cx| cx.scope().serial);
            let stale: Handle<JsNumber> = Handle::new_internal(raw, cx.isolate_id(), exited);
            stale.value(&mut cx);
            Ok(())
        });
    }

    #[test]
    #[should_panic(expected = "handle used with an isolate other than the one that created it")]
    fn test_handle_from_another_isolate_is_rejected() {
        let mut first = isolate();
        let mut second = isolate();
        let _ = first.execute(|mut cx| {
            let s = cx.string("from the first isolate")?;
            let _ = second.execute(|mut other| Ok(s.value(&mut other)));
            Ok(())
        });
    }

    #[test]
    fn test_try_catch_returns_exception() {
        let mut isolate = isolate();
        isolate
            .execute(|mut cx| {
                let caught = cx.try_catch(|cx| cx.throw_range_error::<_, ()>("out of range"));
                let exception = caught.unwrap_err();
                let error = exception.downcast::<JsError, _>(&mut cx).unwrap();
                assert_eq!(error.message(&mut cx), "out of range");
                assert!(!cx.isolate().has_exception());

                let ok = cx.try_catch(|cx| cx.number(1.0).map(|_| 5));
                assert_eq!(ok.unwrap(), 5);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_throw_arbitrary_value() {
        let mut isolate = isolate();
        let err = isolate
            .execute(|mut cx| {
                let value = cx.string("plain string")?;
                cx.throw::<_, ()>(value)
            })
            .unwrap_err();
        assert_eq!(err, HostError::Uncaught("plain string".to_string()));
    }

    #[test]
    fn test_throw_error_from_utf8() {
        let mut isolate = isolate();
        let err = isolate
            .execute(|mut cx| cx.throw_error_from_utf8::<()>(b"native failure"))
            .unwrap_err();
        assert_eq!(err, HostError::Uncaught("Error: native failure".to_string()));

        let err = isolate
            .execute(|mut cx| cx.throw_error_from_utf8::<()>(&[0xc0, 0x00]))
            .unwrap_err();
        assert_eq!(
            err,
            HostError::Uncaught("Error: an unknown native error occurred".to_string())
        );
    }

    #[test]
    fn test_try_string_reports_typed_failure() {
        let mut isolate = isolate();
        isolate
            .execute(|mut cx| {
                assert!(cx.try_string(b"ok").is_ok());
                assert!(matches!(
                    cx.try_string(&[0xff]),
                    Err(HostError::InvalidEncoding(_))
                ));
                assert!(!cx.isolate().has_exception());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_call_context_arguments() {
        let mut isolate = isolate();
        isolate
            .execute(|mut cx| {
                let f = JsFunction::new(&mut cx, |mut cx| {
                    assert_eq!(cx.kind(), CallKind::Call);
                    assert_eq!(cx.len(), 2);
                    assert!(cx.argument_opt(2).is_none());
                    let first = cx.argument::<JsString>(0)?.value(&mut cx);
                    let second = cx.argument::<JsNumber>(1)?.value(&mut cx);
                    cx.string(format!("{first}:{second}"))
                })?;
                let this = cx.null();
                let a = cx.string("x")?.upcast::<JsValue>();
                let b = cx.number(4.0)?.upcast::<JsValue>();
                let result = f.call(&mut cx, this, [a, b])?;
                let result = result.downcast_or_throw::<JsString, _>(&mut cx)?;
                assert_eq!(result.value(&mut cx), "x:4");
                Ok(())
            })
            .unwrap();
    }
}
