//! Class metadata registry.
//!
//! Native types are exposed to the host as classes. Each registration builds
//! a constructor template whose callback dispatches on how the host invoked
//! it: `new C()` runs the class's `allocate` and `construct` kernels, a plain
//! `C()` runs its `call` kernel. Registrations live in a [`ClassMap`] stored
//! in an isolate-local slot and destroyed by a teardown hook when the isolate
//! is disposed.

use crate::runtime::context::internal::ContextInternal;
use crate::runtime::context::{CallKind, Context, FunctionContext, MethodContext};
use crate::runtime::error::{HostError, JsResult, NativeResult, ResultExt};
use crate::runtime::handle::{Handle, Key, Value};
use crate::runtime::heap::{Finalizer, Internals, ValueRef};
use crate::runtime::isolate::Isolate;
use crate::runtime::persistent::Persistent;
use crate::runtime::template::{self, native_callback, NativeCallback};
use crate::runtime::types::{lookup, JsFunction, JsFunctionTemplate, JsObject, JsValue};
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const DEFAULT_CALL_ERROR: &str = "constructor called without new.";
const DEFAULT_CONSTRUCT_ERROR: &str = "class cannot be constructed.";
const DEFAULT_THIS_ERROR: &str = "this is not an object of the expected type.";

type AllocateKernel<T> = Rc<dyn Fn(&mut FunctionContext<'_>) -> NativeResult<T>>;
type ConstructKernel = Rc<dyn Fn(&mut MethodContext<'_>) -> NativeResult<()>>;
type DropKernel<T> = Rc<dyn Fn(&mut T)>;
type MethodKernel = Rc<dyn for<'a> Fn(MethodContext<'a>) -> JsResult<'a, JsValue>>;

fn method_kernel<F>(f: F) -> MethodKernel
where
    F: for<'a> Fn(MethodContext<'a>) -> JsResult<'a, JsValue> + 'static,
{
    Rc::new(f)
}

/// Builder describing a native type `T` as a host class.
pub struct ClassDescriptor<T: 'static> {
    name: String,
    allocate: Option<AllocateKernel<T>>,
    construct: Option<ConstructKernel>,
    call: Option<NativeCallback>,
    methods: Vec<(String, MethodKernel)>,
    on_drop: Option<DropKernel<T>>,
    call_error: String,
    construct_error: String,
    this_error: String,
}

impl<T: 'static> ClassDescriptor<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allocate: None,
            construct: None,
            call: None,
            methods: Vec::new(),
            on_drop: None,
            call_error: DEFAULT_CALL_ERROR.to_string(),
            construct_error: DEFAULT_CONSTRUCT_ERROR.to_string(),
            this_error: DEFAULT_THIS_ERROR.to_string(),
        }
    }

    /// Produce the native block stored in a new instance's internal slot.
    pub fn allocate<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut FunctionContext<'_>) -> NativeResult<T> + 'static,
    {
        self.allocate = Some(Rc::new(f));
        self
    }

    /// Runs on `new`, after `allocate`, with the new instance as `this`.
    pub fn construct<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut MethodContext<'_>) -> NativeResult<()> + 'static,
    {
        self.construct = Some(Rc::new(f));
        self
    }

    /// Runs when the constructor is called without `new`.
    pub fn call<F, V>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(FunctionContext<'a>) -> JsResult<'a, V> + 'static,
        V: Value,
    {
        self.call = Some(native_callback(move |cx| f(cx).map(|value| value.upcast())));
        self
    }

    /// Add a prototype method. `this` is verified to be an instance of the
    /// class before `f` runs.
    pub fn method<F, V>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(MethodContext<'a>) -> JsResult<'a, V> + 'static,
        V: Value,
    {
        let kernel = method_kernel(move |cx| f(cx).map(|value| value.upcast()));
        self.methods.push((name.into(), kernel));
        self
    }

    /// Runs when an instance is collected, before its native block is freed.
    pub fn on_drop<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut T) + 'static,
    {
        self.on_drop = Some(Rc::new(f));
        self
    }

    pub fn call_error(mut self, message: impl Into<String>) -> Self {
        self.call_error = message.into();
        self
    }

    pub fn construct_error(mut self, message: impl Into<String>) -> Self {
        self.construct_error = message.into();
        self
    }

    pub fn this_error(mut self, message: impl Into<String>) -> Self {
        self.this_error = message.into();
        self
    }

    /// Register the class on the context's isolate.
    pub fn register<'a, C: Context<'a>>(self, cx: &mut C) -> Result<ClassId, HostError> {
        let isolate = cx.isolate();
        let map = class_map(isolate);
        let type_id = TypeId::of::<T>();
        if map.borrow().by_type.contains_key(&type_id) {
            return Err(HostError::ClassAlreadyRegistered(std::any::type_name::<T>()));
        }
        let id = ClassId(map.borrow().classes.len());

        let callback = constructor_callback(
            self.allocate,
            self.construct,
            self.call,
            self.on_drop,
            self.call_error.clone(),
            self.construct_error.clone(),
        );
        let template = template::new_template(isolate, callback, Some(self.name.clone()))?;
        let template: Handle<'a, JsFunctionTemplate> = cx.handle(template);

        for (name, kernel) in self.methods {
            let method = template::new_function(isolate, method_callback(id, kernel))?;
            template::add_template_method(isolate, template.to_raw(), &name, method);
        }

        let metadata = ClassMetadata {
            type_name: std::any::type_name::<T>(),
            template: template.root(cx),
            call_error: self.call_error,
            this_error: self.this_error,
        };
        {
            let mut map = map.borrow_mut();
            map.by_type.insert(type_id, id);
            map.classes.push(Rc::new(metadata));
        }

        tracing::debug!(
            isolate = %isolate.id(),
            class = %self.name,
            id = id.0,
            "class registered"
        );
        Ok(id)
    }
}

struct ClassMetadata {
    type_name: &'static str,
    template: Persistent<JsFunctionTemplate>,
    call_error: String,
    this_error: String,
}

/// Registered classes of one isolate.
#[derive(Default)]
pub(crate) struct ClassMap {
    by_type: HashMap<TypeId, ClassId>,
    classes: Vec<Rc<ClassMetadata>>,
}

impl ClassMap {
    fn get(&self, id: ClassId) -> Option<Rc<ClassMetadata>> {
        self.classes.get(id.0).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.classes.len()
    }
}

/// The isolate's class map, created on first use together with the teardown
/// hook that destroys it.
fn class_map(isolate: &Isolate) -> Rc<RefCell<ClassMap>> {
    let (map, created) = isolate.slot_or_insert_with(|| RefCell::new(ClassMap::default()));
    if created {
        isolate.at_exit(|isolate| {
            if let Some(map) = isolate.remove_slot::<RefCell<ClassMap>>() {
                let classes = map.borrow().len();
                tracing::debug!(isolate = %isolate.id(), classes, "class registry destroyed");
            }
        });
    }
    map
}

fn constructor_callback<T: 'static>(
    allocate: Option<AllocateKernel<T>>,
    construct: Option<ConstructKernel>,
    call: Option<NativeCallback>,
    on_drop: Option<DropKernel<T>>,
    call_error: String,
    construct_error: String,
) -> NativeCallback {
    native_callback(move |mut cx| match cx.kind() {
        CallKind::Construct => {
            if allocate.is_none() && construct.is_none() {
                return cx.throw_type_error(&construct_error);
            }
            let this = cx.this().downcast_or_throw::<JsObject, _>(&mut cx)?;
            if let Some(allocate) = &allocate {
                let data = allocate(&mut cx)?;
                attach_internals(cx.isolate(), this.to_raw(), data, on_drop.clone());
            }
            let mut cx = cx.cast_receiver::<JsObject>();
            if let Some(construct) = &construct {
                construct(&mut cx)?;
            }
            Ok(this.upcast())
        }
        CallKind::Call => match &call {
            Some(call) => call(cx),
            None => cx.throw_type_error(&call_error),
        },
    })
}

fn method_callback(class: ClassId, kernel: MethodKernel) -> NativeCallback {
    native_callback(move |mut cx| {
        let this = cx.this();
        if !class.has_instance(&mut cx, this) {
            return class.throw_this_error(&mut cx);
        }
        kernel(cx.cast_receiver())
    })
}

fn attach_internals<T: 'static>(
    isolate: &Isolate,
    object: ValueRef,
    data: T,
    on_drop: Option<DropKernel<T>>,
) {
    let data: Box<dyn Any> = Box::new(data);
    let finalizer = on_drop.map(|on_drop| -> Finalizer {
        Rc::new(move |data: &mut dyn Any| {
            if let Some(value) = data.downcast_mut::<T>() {
                on_drop(value);
            }
        })
    });
    if let Some(obj) = isolate.heap_mut().object_mut(object) {
        obj.internals = Some(Internals { data, finalizer });
    }
}

/// Run `f` on the native block in `object`'s internal slot.
///
/// Returns `None` unless `object` is an instance of a class whose native type
/// is `T`. The block stays owned by the instance: `f` borrows it for the
/// duration of the call and cannot reach the host while it does.
pub fn instance_internals<'a, T: 'static, R, C: Context<'a>>(
    cx: &mut C,
    object: Handle<'_, JsObject>,
    f: impl FnOnce(&mut T) -> R,
) -> Option<R> {
    cx.check_live(&object);
    let mut heap = cx.isolate().heap_mut();
    let data = heap
        .object_mut(object.to_raw())?
        .internals
        .as_mut()?
        .data
        .downcast_mut::<T>()?;
    Some(f(data))
}

/// Identifier of a class registered on an isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(usize);

impl ClassId {
    /// The class registered for native type `T`, if any.
    pub fn of<'a, T: 'static, C: Context<'a>>(cx: &mut C) -> Option<ClassId> {
        let map = cx.isolate().slot::<RefCell<ClassMap>>()?;
        let id = map.borrow().by_type.get(&TypeId::of::<T>()).copied();
        id
    }

    fn metadata(self, isolate: &Isolate) -> Result<Rc<ClassMetadata>, HostError> {
        isolate
            .slot::<RefCell<ClassMap>>()
            .and_then(|map| map.borrow().get(self))
            .ok_or(HostError::UnknownClass(self.0))
    }

    fn template(self, isolate: &Isolate) -> Result<ValueRef, HostError> {
        self.metadata(isolate)?
            .template
            .get_raw(isolate)
            .ok_or(HostError::EmptyPersistent)
    }

    /// Add a prototype method after registration. Instances created earlier
    /// see it too.
    pub fn add_method<'a, C, F, V>(self, cx: &mut C, name: &[u8], f: F) -> Result<(), HostError>
    where
        C: Context<'a>,
        F: for<'b> Fn(MethodContext<'b>) -> JsResult<'b, V> + 'static,
        V: Value,
    {
        let name = std::str::from_utf8(name)
            .map_err(|_| HostError::InvalidKey(String::from_utf8_lossy(name).into_owned()))?;
        let isolate = cx.isolate();
        let template = self.template(isolate)?;
        let kernel = method_kernel(move |cx| f(cx).map(|value| value.upcast()));
        let method = template::new_function(isolate, method_callback(self, kernel))?;
        template::add_template_method(isolate, template, name, method);
        Ok(())
    }

    pub fn set_name<'a, C: Context<'a>>(self, cx: &mut C, name: &str) -> Result<(), HostError> {
        let isolate = cx.isolate();
        let template = self.template(isolate)?;
        template::set_class_name(isolate, template, name.to_string());
        Ok(())
    }

    pub fn name<'a, C: Context<'a>>(self, cx: &mut C) -> Result<String, HostError> {
        let isolate = cx.isolate();
        let template = self.template(isolate)?;
        Ok(template::class_name(isolate, template).unwrap_or_default())
    }

    /// Name of the native type the class was registered for.
    pub fn type_name<'a, C: Context<'a>>(self, cx: &mut C) -> Result<&'static str, HostError> {
        Ok(self.metadata(cx.isolate())?.type_name)
    }

    /// The class constructor, instantiating the template on first use.
    pub fn constructor<'a, C: Context<'a>>(self, cx: &mut C) -> JsResult<'a, JsFunction> {
        let isolate = cx.isolate();
        let function = self
            .template(isolate)
            .and_then(|template| template::instantiate(isolate, template))
            .or_throw(cx)?;
        Ok(cx.handle(function))
    }

    /// Whether `value` has this class's prototype on its prototype chain.
    pub fn has_instance<'a, C: Context<'a>, V: Value>(self, cx: &mut C, value: Handle<'_, V>) -> bool {
        cx.check_live(&value);
        let isolate = cx.isolate();
        let Ok(template) = self.template(isolate) else {
            return false;
        };
        let Some(function) = template::cached_function(isolate, template) else {
            return false;
        };
        let Some(prototype) = lookup(isolate, function, &Key::Named("prototype".to_string())) else {
            return false;
        };

        let heap = isolate.heap();
        let mut current = heap.object(value.to_raw()).and_then(|obj| obj.prototype);
        while let Some(candidate) = current {
            if candidate == prototype {
                return true;
            }
            current = heap.object(candidate).and_then(|obj| obj.prototype);
        }
        false
    }

    /// Narrow `value` to an instance of this class, with a typed failure.
    pub fn downcast<'a, 'b, C: Context<'a>, V: Value>(
        self,
        cx: &mut C,
        value: Handle<'b, V>,
    ) -> Result<Handle<'b, JsObject>, HostError> {
        if self.has_instance(cx, value) {
            value.downcast::<JsObject, _>(cx)
        } else {
            let name = self.name(cx).unwrap_or_default();
            Err(HostError::NotAnInstance(name))
        }
    }

    pub fn throw_call_error<'a, C: Context<'a>, T>(self, cx: &mut C) -> NativeResult<T> {
        let message = self
            .metadata(cx.isolate())
            .map(|metadata| metadata.call_error.clone())
            .unwrap_or_else(|_| DEFAULT_CALL_ERROR.to_string());
        cx.throw_type_error(message)
    }

    pub fn throw_this_error<'a, C: Context<'a>, T>(self, cx: &mut C) -> NativeResult<T> {
        let message = self
            .metadata(cx.isolate())
            .map(|metadata| metadata.this_error.clone())
            .unwrap_or_else(|_| DEFAULT_THIS_ERROR.to_string());
        cx.throw_type_error(message)
    }
}
