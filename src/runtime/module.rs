//! Native module entry points and ABI versioning.

use crate::runtime::context::{Context, ModuleContext};
use crate::runtime::error::{HostError, NativeResult, ResultExt};
use crate::runtime::heap::{HeapValue, ObjectData, ObjectKind};
use crate::runtime::isolate::Isolate;
use crate::runtime::persistent::Persistent;
use crate::runtime::scope::{Scope, ScopeKind};
use crate::runtime::types::JsObject;
use std::cell::RefCell;
use std::collections::HashMap;

/// Version of the native module ABI this build of the host provides.
pub const ABI_VERSION: u32 = 1;

/// The host's native module ABI version.
pub fn abi_version() -> u32 {
    ABI_VERSION
}

/// Initializer run once per isolate with a fresh exports object.
pub type ModuleInit = fn(ModuleContext<'_>) -> NativeResult<()>;

/// Describes a native module to load into an isolate.
#[derive(Clone, Copy)]
pub struct ModuleDescriptor {
    pub name: &'static str,
    /// ABI version the module was built against
    pub abi_version: u32,
    pub init: ModuleInit,
}

impl ModuleDescriptor {
    /// A descriptor for the ABI of this build.
    pub const fn new(name: &'static str, init: ModuleInit) -> Self {
        Self {
            name,
            abi_version: ABI_VERSION,
            init,
        }
    }
}

impl std::fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("abi_version", &self.abi_version)
            .finish()
    }
}

#[derive(Default)]
struct ModuleCache {
    exports: RefCell<HashMap<&'static str, Persistent<JsObject>>>,
}

impl Isolate {
    /// Load `module`, returning its exports.
    ///
    /// A module whose ABI version differs from [`ABI_VERSION`] is rejected
    /// before any of its code runs. Each module is initialized at most once
    /// per isolate; later loads return the cached exports.
    pub fn load_module(&mut self, module: &ModuleDescriptor) -> Result<Persistent<JsObject>, HostError> {
        if module.abi_version != ABI_VERSION {
            tracing::error!(
                isolate = %self.id(),
                module = module.name,
                expected = ABI_VERSION,
                found = module.abi_version,
                "refusing to load native module built for a different ABI"
            );
            return Err(HostError::AbiMismatch {
                module: module.name.to_string(),
                expected: ABI_VERSION,
                found: module.abi_version,
            });
        }

        let (cache, created) = self.slot_or_insert_with(ModuleCache::default);
        if created {
            self.at_exit(|isolate| {
                if let Some(cache) = isolate.remove_slot::<ModuleCache>() {
                    let modules = cache.exports.borrow().len();
                    tracing::debug!(isolate = %isolate.id(), modules, "module cache dropped");
                }
            });
        }

        let cached = self.execute(|mut cx| {
            let exports = cache.exports.borrow();
            let cached = match exports.get(module.name) {
                Some(exports) => exports.clone_in(&mut cx).map(Some).or_throw(&mut cx),
                None => Ok(None),
            };
            cached
        })?;
        if let Some(exports) = cached {
            return Ok(exports);
        }

        let init = module.init;
        let outcome = Scope::with(self, ScopeKind::Plain, |scope| -> Result<_, HostError> {
            let exports = scope
                .isolate()
                .allocate(HeapValue::Object(ObjectData::new(ObjectKind::Ordinary)))?;
            let mut cx = ModuleContext::new(scope, exports);
            let exports = cx.exports_object().root(&mut cx);
            Ok(init(cx).map(|()| exports))
        });
        self.drain_released();

        let exports = match outcome? {
            Ok(exports) => exports,
            Err(_) => {
                let message = match self.uncaught() {
                    HostError::Uncaught(message) => message,
                    other => other.to_string(),
                };
                tracing::error!(isolate = %self.id(), module = module.name, error = %message, "native module failed to initialize");
                return Err(HostError::ModuleInit {
                    module: module.name.to_string(),
                    message,
                });
            }
        };

        let result = self.execute(|mut cx| exports.clone_in(&mut cx).or_throw(&mut cx))?;
        cache.exports.borrow_mut().insert(module.name, exports);
        tracing::debug!(isolate = %self.id(), module = module.name, "native module loaded");
        Ok(result)
    }
}
