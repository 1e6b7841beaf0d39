//! The host runtime instance.
//!
//! An [`Isolate`] owns one garbage-collected heap together with everything
//! rooted in it: the handle stack, the persistent table, the pending
//! exception, the global object and the instance-local slots used by the
//! class registry. It is confined to the thread that created it.

use crate::runtime::config::{RuntimeConfig, ShutdownMode};
use crate::runtime::context::{ExecuteContext, TaskContext};
use crate::runtime::error::{HostError, NativeResult, Throw};
use crate::runtime::event_loop::{EventLoop, LoopStats};
use crate::runtime::heap::{
    ErrorKind, GcStats, Heap, HeapValue, Internals, ObjectData, ObjectKind, ValueRef,
};
use crate::runtime::persistent::{PersistentRef, PersistentTable};
use crate::runtime::scope::{HandleStack, Scope, ScopeKind};
use crate::runtime::task::TaskQueue;
use std::any::{Any, TypeId};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::mpsc::{self as std_mpsc, Receiver as StdReceiver, Sender as StdSender};

/// Process-unique identifier of an isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsolateId(pub(crate) u64);

impl fmt::Display for IsolateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Values that live as long as the isolate and are always GC roots.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Permanent {
    pub undefined: ValueRef,
    pub null: ValueRef,
    pub true_value: ValueRef,
    pub false_value: ValueRef,
    pub global: ValueRef,
    /// Thrown when an error object cannot be allocated.
    pub heap_exhausted: ValueRef,
}

impl Permanent {
    fn allocate(heap: &mut Heap) -> Self {
        let undefined = heap.allocate_permanent(HeapValue::Undefined);
        let null = heap.allocate_permanent(HeapValue::Null);
        let true_value = heap.allocate_permanent(HeapValue::Boolean(true));
        let false_value = heap.allocate_permanent(HeapValue::Boolean(false));
        let global = heap.allocate_permanent(HeapValue::Object(ObjectData::new(
            ObjectKind::Ordinary,
        )));

        let kind = ErrorKind::RangeError;
        let name = heap.allocate_permanent(HeapValue::String(kind.name().to_string()));
        let message =
            heap.allocate_permanent(HeapValue::String("host heap exhausted".to_string()));
        let mut error = ObjectData::new(ObjectKind::Error(kind));
        error.properties.insert("name".to_string(), name);
        error.properties.insert("message".to_string(), message);
        let heap_exhausted = heap.allocate_permanent(HeapValue::Object(error));

        Self {
            undefined,
            null,
            true_value,
            false_value,
            global,
            heap_exhausted,
        }
    }

    fn iter(&self) -> [ValueRef; 6] {
        [
            self.undefined,
            self.null,
            self.true_value,
            self.false_value,
            self.global,
            self.heap_exhausted,
        ]
    }
}

type TeardownHook = Box<dyn FnOnce(&Isolate)>;

/// A single-threaded host runtime instance.
pub struct Isolate {
    id: IsolateId,
    config: RuntimeConfig,
    heap: RefCell<Heap>,
    handles: RefCell<HandleStack>,
    persistents: RefCell<PersistentTable>,
    release_tx: StdSender<PersistentRef>,
    release_rx: StdReceiver<PersistentRef>,
    exception: Cell<Option<ValueRef>>,
    permanent: Permanent,
    slots: RefCell<HashMap<TypeId, Rc<dyn Any>>>,
    at_exit: RefCell<Vec<TeardownHook>>,
    event_loop: EventLoop,
}

impl Isolate {
    /// Create an isolate with its own heap, event loop and worker pool.
    pub fn new(config: RuntimeConfig) -> Result<Self, HostError> {
        config.validate()?;

        let event_loop = EventLoop::new(&config)?;
        let mut heap = Heap::new(config.max_heap_size, config.initial_heap_size);
        let permanent = Permanent::allocate(&mut heap);
        let (release_tx, release_rx) = std_mpsc::channel();
        let id = super::register_isolate();

        tracing::debug!(
            isolate = %id,
            max_heap_size = ?config.max_heap_size,
            worker_threads = config.worker_threads,
            shutdown_mode = ?config.shutdown_mode,
            "isolate created"
        );

        Ok(Self {
            id,
            config,
            heap: RefCell::new(heap),
            handles: RefCell::new(HandleStack::new()),
            persistents: RefCell::new(PersistentTable::new()),
            release_tx,
            release_rx,
            exception: Cell::new(None),
            permanent,
            slots: RefCell::new(HashMap::new()),
            at_exit: RefCell::new(Vec::new()),
            event_loop,
        })
    }

    pub fn id(&self) -> IsolateId {
        self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Enter a top-level scope and run `f` in it.
    ///
    /// An exception left pending when `f` returns `Err(Throw)` is taken off
    /// the isolate and reported as [`HostError::Uncaught`].
    pub fn execute<T, F>(&mut self, f: F) -> Result<T, HostError>
    where
        F: for<'a> FnOnce(ExecuteContext<'a>) -> NativeResult<T>,
    {
        let result = Scope::with(self, ScopeKind::Plain, |scope| {
            f(ExecuteContext::new(scope))
        });
        self.drain_released();
        result.map_err(|_| self.uncaught())
    }

    /// Collect unreachable host values, running class `drop` kernels for
    /// collected instances.
    pub fn collect_garbage(&mut self) -> GcStats {
        self.collect()
    }

    pub fn gc_stats(&self) -> GcStats {
        self.heap().stats().clone()
    }

    /// Approximate number of bytes currently allocated on the heap.
    pub fn heap_used(&self) -> usize {
        self.heap().used_bytes()
    }

    /// Number of occupied persistent slots.
    pub fn persistent_count(&self) -> usize {
        self.drain_released();
        self.persistents.borrow().live()
    }

    /// Drive the event loop until no task is outstanding and no referenced
    /// channel remains, bounded by the configured `event_loop_timeout`.
    ///
    /// Must not be called from within an async runtime.
    pub fn run_event_loop(&mut self) -> Result<LoopStats, HostError> {
        self.event_loop.run(self, self.config.event_loop_timeout)
    }

    pub fn loop_stats(&self) -> LoopStats {
        self.event_loop.stats()
    }

    /// A sendable handle for scheduling tasks from any thread.
    pub fn task_queue(&self) -> TaskQueue {
        self.event_loop.task_queue()
    }

    pub(crate) fn with_task_context<T>(&self, f: impl for<'a> FnOnce(TaskContext<'a>) -> T) -> T {
        Scope::with(self, ScopeKind::Plain, |scope| f(TaskContext::new(scope)))
    }

    pub(crate) fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub(crate) fn heap(&self) -> Ref<'_, Heap> {
        self.heap.borrow()
    }

    pub(crate) fn heap_mut(&self) -> RefMut<'_, Heap> {
        self.heap.borrow_mut()
    }

    pub(crate) fn handles(&self) -> RefMut<'_, HandleStack> {
        self.handles.borrow_mut()
    }

    pub(crate) fn persistents(&self) -> RefMut<'_, PersistentTable> {
        self.persistents.borrow_mut()
    }

    pub(crate) fn release_sender(&self) -> StdSender<PersistentRef> {
        self.release_tx.clone()
    }

    /// Free persistent slots whose owners were dropped since the last safe
    /// point.
    pub(crate) fn drain_released(&self) {
        let mut table = self.persistents.borrow_mut();
        for slot in self.release_rx.try_iter() {
            table.free(slot);
        }
    }

    pub(crate) fn permanent(&self) -> &Permanent {
        &self.permanent
    }

    pub(crate) fn boolean(&self, value: bool) -> ValueRef {
        if value {
            self.permanent.true_value
        } else {
            self.permanent.false_value
        }
    }

    pub(crate) fn allocate(&self, value: HeapValue) -> Result<ValueRef, HostError> {
        self.heap.borrow_mut().allocate(value)
    }

    pub(crate) fn set_exception(&self, value: ValueRef) {
        self.exception.set(Some(value));
    }

    pub(crate) fn take_exception(&self) -> Option<ValueRef> {
        self.exception.take()
    }

    pub(crate) fn has_exception(&self) -> bool {
        self.exception.get().is_some()
    }

    /// Allocate an error object without throwing it.
    pub(crate) fn new_error(&self, kind: ErrorKind, message: &str) -> Result<ValueRef, HostError> {
        let mut heap = self.heap.borrow_mut();
        let name = heap.allocate(HeapValue::String(kind.name().to_string()))?;
        let message = heap.allocate(HeapValue::String(message.to_string()))?;
        let mut data = ObjectData::new(ObjectKind::Error(kind));
        data.properties.insert("name".to_string(), name);
        data.properties.insert("message".to_string(), message);
        heap.allocate(HeapValue::Object(data))
    }

    /// Throw a freshly allocated error, or the permanent heap-exhaustion
    /// error if there is no room for one.
    pub(crate) fn throw_error(&self, kind: ErrorKind, message: &str) -> Throw {
        let error = self
            .new_error(kind, message)
            .unwrap_or(self.permanent.heap_exhausted);
        self.set_exception(error);
        Throw::new()
    }

    pub(crate) fn uncaught(&self) -> HostError {
        match self.take_exception() {
            Some(exception) => HostError::Uncaught(self.describe(exception)),
            None => HostError::Uncaught("exception was not set".to_string()),
        }
    }

    /// Human-readable rendering of a value, used for diagnostics.
    pub(crate) fn describe(&self, value: ValueRef) -> String {
        let heap = self.heap();
        match heap.get(value) {
            HeapValue::Undefined => "undefined".to_string(),
            HeapValue::Null => "null".to_string(),
            HeapValue::Boolean(b) => b.to_string(),
            HeapValue::Number(n) => format_number(*n),
            HeapValue::String(s) => s.clone(),
            HeapValue::Object(obj) => match &obj.kind {
                ObjectKind::Error(kind) => {
                    let message = obj
                        .properties
                        .get("message")
                        .and_then(|m| match heap.get(*m) {
                            HeapValue::String(s) => Some(s.as_str()),
                            _ => None,
                        })
                        .unwrap_or_default();
                    format!("{}: {}", kind.name(), message)
                }
                ObjectKind::Array(_) => "[object Array]".to_string(),
                ObjectKind::Function(_) | ObjectKind::Template(_) => "[function]".to_string(),
                ObjectKind::Ordinary => "[object Object]".to_string(),
            },
        }
    }

    /// Get the instance-local value of type `T`, if one was installed.
    pub(crate) fn slot<T: Any>(&self) -> Option<Rc<T>> {
        let value = self.slots.borrow().get(&TypeId::of::<T>()).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Get the instance-local value of type `T`, installing it with `init`
    /// first if needed. The flag reports whether it was created by this call.
    pub(crate) fn slot_or_insert_with<T: Any>(&self, init: impl FnOnce() -> T) -> (Rc<T>, bool) {
        if let Some(existing) = self.slot::<T>() {
            return (existing, false);
        }
        let value = Rc::new(init());
        self.slots
            .borrow_mut()
            .insert(TypeId::of::<T>(), value.clone() as Rc<dyn Any>);
        (value, true)
    }

    pub(crate) fn remove_slot<T: Any>(&self) -> Option<Rc<T>> {
        let value = self.slots.borrow_mut().remove(&TypeId::of::<T>())?;
        value.downcast::<T>().ok()
    }

    /// Register a hook to run when the isolate is torn down. Hooks run in
    /// reverse registration order.
    pub(crate) fn at_exit(&self, hook: impl FnOnce(&Isolate) + 'static) {
        self.at_exit.borrow_mut().push(Box::new(hook));
    }

    fn roots(&self) -> Vec<ValueRef> {
        let mut roots: Vec<ValueRef> = self.permanent.iter().to_vec();
        roots.extend(self.handles.borrow().roots());
        roots.extend(self.persistents.borrow().values());
        roots.extend(self.exception.get());
        roots
    }

    fn collect(&self) -> GcStats {
        self.drain_released();
        let roots = self.roots();
        let finalizable = self.heap.borrow_mut().collect(roots);
        run_finalizers(self.id, finalizable);

        let stats = self.heap().stats().clone();
        tracing::debug!(
            isolate = %self.id,
            collections = stats.collections,
            freed = stats.last_freed_count,
            finalized = stats.last_finalized_count,
            live_objects = stats.live_objects,
            live_bytes = stats.live_bytes,
            pause = ?stats.last_pause_time,
            "garbage collection finished"
        );
        stats
    }

    fn teardown(&mut self) {
        match self.config.shutdown_mode {
            ShutdownMode::Strict => {
                let channel_refs = self.event_loop.keep_alive().channel_refs();
                if channel_refs > 0 && self.config.event_loop_timeout.is_none() {
                    tracing::warn!(
                        isolate = %self.id,
                        channel_refs,
                        "strict teardown without a timeout waits for referenced channels to be dropped"
                    );
                }
                if let Err(err) = self.event_loop.run(self, self.config.event_loop_timeout) {
                    tracing::warn!(isolate = %self.id, error = %err, "event loop did not drain before teardown");
                }
            }
            ShutdownMode::Detach => {
                let outstanding = self.event_loop.outstanding();
                if outstanding > 0 {
                    tracing::debug!(isolate = %self.id, outstanding, "detaching from outstanding tasks");
                }
            }
        }
        self.event_loop.close();

        let hooks = std::mem::take(&mut *self.at_exit.borrow_mut());
        for hook in hooks.into_iter().rev() {
            hook(self);
        }
        let slots = std::mem::take(&mut *self.slots.borrow_mut());
        drop(slots);

        self.exception.set(None);
        self.drain_released();
        let leaked = self.persistents.borrow().live();
        if leaked > 0 {
            tracing::warn!(
                isolate = %self.id,
                leaked,
                "persistent handles not released before teardown"
            );
        }

        // Nothing is rooted any more: every remaining instance is finalized.
        let finalizable = self.heap.borrow_mut().collect(std::iter::empty());
        run_finalizers(self.id, finalizable);

        self.event_loop.shutdown_workers();
        super::unregister_isolate(self.id);
        tracing::debug!(isolate = %self.id, "isolate disposed");
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn run_finalizers(isolate: IsolateId, blocks: Vec<Internals>) {
    for mut block in blocks {
        let Some(finalizer) = block.finalizer.take() else {
            continue;
        };
        let data = &mut *block.data;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| finalizer(data))) {
            tracing::error!(
                isolate = %isolate,
                message = %panic_message(payload.as_ref()),
                "native drop kernel panicked"
            );
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n == f64::INFINITY {
        "Infinity".to_string()
    } else if n == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::Context;
    use crate::runtime::types::{JsNumber, JsObject};

    fn isolate() -> Isolate {
        Isolate::new(RuntimeConfig::new(ShutdownMode::Strict)).unwrap()
    }

    #[test]
    fn test_execute_returns_value() {
        let mut isolate = isolate();
        let result = isolate
            .execute(|mut cx| {
                let n = cx.number(40.0)?;
                Ok(n.value(&mut cx) + 2.0)
            })
            .unwrap();
        assert_eq!(result, 42.0);
    }

    #[test]
    fn test_execute_reports_uncaught_exception() {
        let mut isolate = isolate();
        let err = isolate
            .execute(|mut cx| cx.throw_type_error::<_, ()>("bad input"))
            .unwrap_err();
        assert_eq!(err, HostError::Uncaught("TypeError: bad input".to_string()));
        assert!(!isolate.has_exception());
    }

    #[test]
    fn test_handles_are_released_after_execute() {
        let mut isolate = isolate();
        isolate
            .execute(|mut cx| {
                for i in 0..10 {
                    cx.number(i as f64)?;
                }
                cx.empty_object()?;
                Ok(())
            })
            .unwrap();
        assert_eq!(isolate.handles().len(), 0);

        let stats = isolate.collect_garbage();
        assert_eq!(stats.last_freed_count, 11);
    }

    #[test]
    fn test_global_survives_collection() {
        let mut isolate = isolate();
        isolate
            .execute(|mut cx| {
                let global = cx.global();
                let value = cx.number(7.0)?;
                global.set(&mut cx, "answer", value)?;
                Ok(())
            })
            .unwrap();
        isolate.collect_garbage();

        let answer = isolate
            .execute(|mut cx| {
                let global = cx.global();
                let value = global.get(&mut cx, "answer")?;
                let value = value.downcast_or_throw::<JsNumber, _>(&mut cx)?;
                Ok(value.value(&mut cx))
            })
            .unwrap();
        assert_eq!(answer, 7.0);
    }

    #[test]
    fn test_heap_limit_surfaces_as_typed_failure() {
        let config = RuntimeConfig::new(ShutdownMode::Strict).with_max_heap_size(4 * 1024);
        let mut isolate = Isolate::new(config).unwrap();
        let outcome = isolate
            .execute(|mut cx| {
                let mut last = None;
                for _ in 0..1000 {
                    match JsObject::try_new(&mut cx) {
                        Ok(_) => {}
                        Err(err) => {
                            last = Some(err);
                            break;
                        }
                    }
                }
                Ok(last)
            })
            .unwrap();
        assert!(matches!(outcome, Some(HostError::HeapExhausted { .. })));
    }

    #[test]
    fn test_heap_exhaustion_throws_permanent_error() {
        let config = RuntimeConfig::new(ShutdownMode::Strict).with_max_heap_size(4 * 1024);
        let mut isolate = Isolate::new(config).unwrap();
        let err = isolate
            .execute(|mut cx| -> NativeResult<()> {
                loop {
                    cx.empty_object()?;
                }
            })
            .unwrap_err();
        assert_eq!(
            err,
            HostError::Uncaught("RangeError: host heap exhausted".to_string())
        );
    }

    #[test]
    fn test_slots_and_teardown_hooks() {
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let isolate = isolate();
            let (value, created) = isolate.slot_or_insert_with(|| 5u32);
            assert!(created);
            assert_eq!(*value, 5);
            let (_, created) = isolate.slot_or_insert_with(|| 6u32);
            assert!(!created);

            let first = order.clone();
            isolate.at_exit(move |_| first.borrow_mut().push(1));
            let second = order.clone();
            isolate.at_exit(move |isolate| {
                assert!(isolate.slot::<u32>().is_some());
                second.borrow_mut().push(2);
            });
        }
        assert_eq!(*order.borrow(), vec![2, 1]);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-0.5), "-0.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }
}
