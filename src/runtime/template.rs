//! Function templates and the native callback boundary.
//!
//! Every host-to-native call goes through [`invoke`]: it enters an escapable
//! region, roots the receiver and arguments there, runs the callback and
//! turns whatever the callback did (returned, threw, panicked) into either a
//! value for the caller or a pending exception.

use crate::runtime::context::{CallContext, CallKind, FunctionContext};
use crate::runtime::error::{HostError, JsResult, NativeResult, Throw};
use crate::runtime::handle::{Handle, Key};
use crate::runtime::heap::{
    ErrorKind, FunctionData, HeapValue, ObjectData, ObjectKind, TemplateData, ValueRef,
};
use crate::runtime::isolate::{panic_message, Isolate};
use crate::runtime::scope::{Scope, ScopeKind};
use crate::runtime::types::{lookup, JsValue};
use indexmap::IndexMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

/// Boxed native function body.
pub(crate) type NativeCallback = Rc<dyn for<'a> Fn(FunctionContext<'a>) -> JsResult<'a, JsValue>>;

/// Box `f` as a [`NativeCallback`].
pub(crate) fn native_callback<F>(f: F) -> NativeCallback
where
    F: for<'a> Fn(FunctionContext<'a>) -> JsResult<'a, JsValue> + 'static,
{
    Rc::new(f)
}

pub(crate) struct Invocation {
    pub callee: ValueRef,
    pub this: ValueRef,
    pub args: Vec<ValueRef>,
    pub kind: CallKind,
}

/// Invoke a host function from native code or from the host itself.
pub(crate) fn invoke(isolate: &Isolate, invocation: Invocation) -> NativeResult<ValueRef> {
    let Invocation {
        callee,
        this,
        args,
        kind,
    } = invocation;

    let callback = match callback_of(isolate, callee) {
        Ok(callback) => callback,
        Err(found) => {
            return Err(isolate.throw_error(ErrorKind::TypeError, &format!("{found} is not a function")))
        }
    };

    let this = match kind {
        CallKind::Call => this,
        CallKind::Construct => {
            let prototype = lookup(isolate, callee, &Key::Named("prototype".to_string()))
                .filter(|proto| isolate.heap().object(*proto).is_some());
            let receiver = ObjectData::new(ObjectKind::Ordinary).with_prototype(prototype);
            match isolate.allocate(HeapValue::Object(receiver)) {
                Ok(receiver) => receiver,
                Err(_) => {
                    isolate.set_exception(isolate.permanent().heap_exhausted);
                    return Err(Throw::new());
                }
            }
        }
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        Scope::with(isolate, ScopeKind::Escapable, |scope| {
            let cx = CallContext::new(scope, kind, this, callee, args);
            callback(cx).map(Handle::to_raw)
        })
    }));

    match outcome {
        Ok(Ok(value)) => match kind {
            CallKind::Construct if isolate.heap().object(value).is_none() => Ok(this),
            _ => Ok(value),
        },
        Ok(Err(throw)) => {
            if isolate.has_exception() {
                Err(throw)
            } else {
                Err(isolate.throw_error(
                    ErrorKind::Error,
                    "native function failed without throwing an exception",
                ))
            }
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::warn!(isolate = %isolate.id(), message = %message, "native callback panicked");
            Err(isolate.throw_error(
                ErrorKind::Error,
                &format!("internal error in native code: {message}"),
            ))
        }
    }
}

fn callback_of(isolate: &Isolate, callee: ValueRef) -> Result<NativeCallback, &'static str> {
    let heap = isolate.heap();
    let value = heap.get(callee);
    match value.as_object().map(|obj| &obj.kind) {
        Some(ObjectKind::Function(function)) => Ok(function.callback.clone()),
        _ => Err(value.type_name()),
    }
}

/// Allocate a constructor template around `callback`.
pub(crate) fn new_template(
    isolate: &Isolate,
    callback: NativeCallback,
    class_name: Option<String>,
) -> Result<ValueRef, HostError> {
    let template = TemplateData {
        callback,
        class_name,
        methods: IndexMap::new(),
        internal_field_count: 1,
        function: None,
    };
    isolate.allocate(HeapValue::Object(ObjectData::new(ObjectKind::Template(
        template,
    ))))
}

fn template_mut<R>(isolate: &Isolate, template: ValueRef, f: impl FnOnce(&mut TemplateData) -> R) -> Option<R> {
    let mut heap = isolate.heap_mut();
    match heap.object_mut(template).map(|obj| &mut obj.kind) {
        Some(ObjectKind::Template(data)) => Some(f(data)),
        _ => None,
    }
}

pub(crate) fn set_class_name(isolate: &Isolate, template: ValueRef, name: String) {
    let function = template_mut(isolate, template, |data| {
        data.class_name = Some(name.clone());
        data.function
    })
    .flatten();
    if let Some(function) = function {
        if let Ok(name) = isolate.allocate(HeapValue::String(name)) {
            set_own(isolate, function, "name", name);
        }
    }
}

pub(crate) fn class_name(isolate: &Isolate, template: ValueRef) -> Option<String> {
    template_mut(isolate, template, |data| data.class_name.clone()).flatten()
}

/// The function for `template` if it has been instantiated.
pub(crate) fn cached_function(isolate: &Isolate, template: ValueRef) -> Option<ValueRef> {
    template_mut(isolate, template, |data| data.function).flatten()
}

/// The function for `template`, creating it and its prototype on first use.
pub(crate) fn instantiate(isolate: &Isolate, template: ValueRef) -> Result<ValueRef, HostError> {
    let Some((callback, class_name, methods, cached)) = template_mut(isolate, template, |data| {
        (
            data.callback.clone(),
            data.class_name.clone(),
            data.methods.clone(),
            data.function,
        )
    }) else {
        return Err(HostError::TypeMismatch {
            expected: "function template",
            found: isolate.heap().get(template).type_name(),
        });
    };
    if let Some(function) = cached {
        return Ok(function);
    }

    let mut prototype = ObjectData::new(ObjectKind::Ordinary);
    prototype.properties = methods;
    let prototype = isolate.allocate(HeapValue::Object(prototype))?;

    let name = isolate.allocate(HeapValue::String(class_name.unwrap_or_default()))?;
    let mut function = ObjectData::new(ObjectKind::Function(FunctionData {
        callback,
        template: Some(template),
    }));
    function.properties.insert("prototype".to_string(), prototype);
    function.properties.insert("name".to_string(), name);
    let function = isolate.allocate(HeapValue::Object(function))?;

    set_own(isolate, prototype, "constructor", function);
    template_mut(isolate, template, |data| data.function = Some(function));
    Ok(function)
}

/// Install `method` on the template's prototype, and on the live prototype
/// if the template was already instantiated.
pub(crate) fn add_template_method(isolate: &Isolate, template: ValueRef, name: &str, method: ValueRef) -> bool {
    let Some(function) = template_mut(isolate, template, |data| {
        data.methods.insert(name.to_string(), method);
        data.function
    }) else {
        return false;
    };
    if let Some(function) = function {
        let prototype = lookup(isolate, function, &Key::Named("prototype".to_string()));
        if let Some(prototype) = prototype {
            set_own(isolate, prototype, name, method);
        }
    }
    true
}

/// Allocate a plain function around `callback`.
pub(crate) fn new_function(isolate: &Isolate, callback: NativeCallback) -> Result<ValueRef, HostError> {
    isolate.allocate(HeapValue::Object(ObjectData::new(ObjectKind::Function(
        FunctionData {
            callback,
            template: None,
        },
    ))))
}

pub(crate) fn set_own(isolate: &Isolate, object: ValueRef, name: &str, value: ValueRef) {
    if let Some(obj) = isolate.heap_mut().object_mut(object) {
        obj.properties.insert(name.to_string(), value);
    }
}
