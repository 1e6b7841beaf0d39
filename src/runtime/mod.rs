//! Host runtime bridge.
//!
//! This module implements an in-process host runtime patterned after an
//! embedded JavaScript engine. Each [`Isolate`](isolate::Isolate) owns a
//! garbage-collected heap that is only touched from the thread that created
//! it; native worker threads reach it exclusively through the task bridge and
//! [`Channel`](channel::Channel)s.

pub mod channel;
pub mod class;
pub mod config;
pub mod context;
pub mod conversion;
pub mod error;
pub mod event_loop;
pub mod handle;
pub mod heap;
pub mod isolate;
pub mod module;
pub mod native_value;
pub mod persistent;
pub mod scope;
pub mod task;
pub mod template;
pub mod types;

use once_cell::sync::OnceCell;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use isolate::IsolateId;

/// Process-wide bookkeeping shared by every isolate.
struct Platform {
    next_isolate_id: AtomicU64,
    live: Mutex<BTreeSet<IsolateId>>,
}

/// Global platform instance.
///
/// Initialized once on first access. Isolates register themselves here on
/// creation and remove themselves on teardown, so per-isolate state never
/// lives in a global singleton.
static PLATFORM: OnceCell<Platform> = OnceCell::new();

/// Initialize the platform exactly once.
///
/// This function is safe to call multiple times; subsequent calls are no-ops.
/// [`Isolate::new`](isolate::Isolate::new) calls it implicitly.
pub fn initialize_platform_once() {
    platform();
}

/// Check if the platform has been initialized.
pub fn is_platform_initialized() -> bool {
    PLATFORM.get().is_some()
}

/// Identifiers of the isolates currently alive in this process.
pub fn live_isolates() -> Vec<IsolateId> {
    match platform().live.lock() {
        Ok(live) => live.iter().copied().collect(),
        Err(poisoned) => poisoned.into_inner().iter().copied().collect(),
    }
}

fn platform() -> &'static Platform {
    PLATFORM.get_or_init(|| {
        tracing::debug!("initializing host platform");
        Platform {
            next_isolate_id: AtomicU64::new(1),
            live: Mutex::new(BTreeSet::new()),
        }
    })
}

pub(crate) fn register_isolate() -> IsolateId {
    let platform = platform();
    let id = IsolateId(platform.next_isolate_id.fetch_add(1, Ordering::Relaxed));
    match platform.live.lock() {
        Ok(mut live) => live.insert(id),
        Err(poisoned) => poisoned.into_inner().insert(id),
    };
    id
}

pub(crate) fn unregister_isolate(id: IsolateId) {
    match platform().live.lock() {
        Ok(mut live) => live.remove(&id),
        Err(poisoned) => poisoned.into_inner().remove(&id),
    };
}
