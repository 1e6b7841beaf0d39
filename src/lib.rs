//! Safe interoperation between native Rust code and an embedded,
//! single-threaded, garbage-collected host runtime.
//!
//! The crate provides scope-bound [`Handle`]s, [`Persistent`] roots that may
//! cross threads, a per-isolate class registry for exposing native types as
//! host classes, and a task bridge that runs work on native worker threads
//! and delivers the results back onto the host thread.

mod runtime;

pub use runtime::channel::{Channel, SendError};
pub use runtime::class::{instance_internals, ClassDescriptor, ClassId};
pub use runtime::config::{RuntimeConfig, ShutdownMode};
pub use runtime::context::{
    CallContext, CallKind, ComputeContext, Context, ExecuteContext, FunctionContext,
    MethodContext, ModuleContext, TaskContext,
};
pub use runtime::conversion::{from_host, from_native, to_host, to_native};
pub use runtime::error::{HostError, JsResult, NativeResult, ResultExt, Throw};
pub use runtime::event_loop::LoopStats;
pub use runtime::handle::{Handle, PropertyKey, SuperType, Value};
pub use runtime::heap::GcStats;
pub use runtime::isolate::{Isolate, IsolateId};
pub use runtime::module::{abi_version, ModuleDescriptor, ModuleInit, ABI_VERSION};
pub use runtime::native_value::NativeValue;
pub use runtime::persistent::Persistent;
pub use runtime::task::{Task, TaskQueue, TaskState, TaskStats, TaskToken};
pub use runtime::types::{
    JsArray, JsBoolean, JsError, JsFunction, JsNull, JsNumber, JsObject, JsString, JsUndefined,
    JsValue,
};
pub use runtime::{initialize_platform_once, is_platform_initialized, live_isolates};
