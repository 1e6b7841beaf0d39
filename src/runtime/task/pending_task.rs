//! Finished `perform` phases waiting to complete on the host thread.

use super::{Task, TaskShared, TaskState};
use crate::runtime::context::internal::ContextInternal;
use crate::runtime::context::{Context, TaskContext};
use crate::runtime::error::JsResult;
use crate::runtime::handle::Handle;
use crate::runtime::isolate::{panic_message, Isolate};
use crate::runtime::persistent::Persistent;
use crate::runtime::types::{JsFunction, JsValue};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Information about a scheduled task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingTaskInfo {
    pub id: u64,
    pub name: &'static str,
}

impl PendingTaskInfo {
    pub fn new(id: u64, name: &'static str) -> Self {
        Self { id, name }
    }
}

type CompleteFn = Box<dyn for<'a> FnOnce(&mut TaskContext<'a>) -> JsResult<'a, JsValue> + Send>;

fn complete_fn<F>(f: F) -> CompleteFn
where
    F: for<'a> FnOnce(&mut TaskContext<'a>) -> JsResult<'a, JsValue> + Send + 'static,
{
    Box::new(f)
}

enum Outcome {
    Performed(CompleteFn),
    Panicked(String),
}

/// A task whose `perform` phase has finished.
pub(crate) struct PendingTask {
    info: PendingTaskInfo,
    shared: Arc<TaskShared>,
    outcome: Outcome,
    callback: Persistent<JsFunction>,
}

impl PendingTask {
    pub fn performed<T: Task>(
        info: PendingTaskInfo,
        shared: Arc<TaskShared>,
        task: T,
        result: Result<T::Output, T::Error>,
        callback: Persistent<JsFunction>,
    ) -> Self {
        let complete = complete_fn(move |cx| task.complete(cx, result).map(|event| event.upcast()));
        Self {
            info,
            shared,
            outcome: Outcome::Performed(complete),
            callback,
        }
    }

    pub fn panicked(
        info: PendingTaskInfo,
        shared: Arc<TaskShared>,
        message: String,
        callback: Persistent<JsFunction>,
    ) -> Self {
        Self {
            info,
            shared,
            outcome: Outcome::Panicked(message),
            callback,
        }
    }
}

/// How a completion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// The callback ran and returned.
    Delivered,
    /// The callback was invalidated and not called.
    Skipped,
    /// The callback threw; the exception is pending on the isolate.
    CallbackThrew,
}

/// Run the host half of a task: `complete`, then the callback.
pub(crate) fn complete_task(isolate: &Isolate, pending: PendingTask) -> Completion {
    let PendingTask {
        info,
        shared,
        outcome,
        mut callback,
    } = pending;
    let invalidated = shared.begin_completing();

    let completion = isolate.with_task_context(|mut cx| {
        let event = match outcome {
            Outcome::Performed(complete) => {
                match panic::catch_unwind(AssertUnwindSafe(|| cx.try_catch(|cx| complete(cx)))) {
                    Ok(event) => event,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::warn!(task = info.id, name = info.name, message = %message, "task complete panicked");
                        Err(error_value(&mut cx, format!("internal error in native code: {message}")))
                    }
                }
            }
            Outcome::Panicked(message) => {
                Err(error_value(&mut cx, format!("task perform panicked: {message}")))
            }
        };

        if invalidated {
            callback.release(&mut cx);
            return Completion::Skipped;
        }

        let callback = match callback.into_inner(&mut cx) {
            Ok(callback) => callback,
            Err(err) => {
                tracing::warn!(task = info.id, error = %err, "task callback is unavailable");
                return Completion::Skipped;
            }
        };
        let this = cx.undefined();
        let args: Vec<Handle<JsValue>> = match event {
            Ok(value) => vec![cx.null().upcast(), value],
            Err(error) => vec![error],
        };
        match callback.call(&mut cx, this, args) {
            Ok(_) => Completion::Delivered,
            Err(_) => Completion::CallbackThrew,
        }
    });

    shared.set_state(TaskState::Finished);
    tracing::trace!(task = info.id, name = info.name, ?completion, "task finished");
    completion
}

fn error_value<'a>(cx: &mut TaskContext<'a>, message: String) -> Handle<'a, JsValue> {
    match cx.error(message) {
        Ok(error) => error.upcast(),
        Err(_) => match cx.take_exception_handle() {
            Some(exception) => exception,
            None => cx.undefined().upcast(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::config::{RuntimeConfig, ShutdownMode};
    use crate::runtime::error::{HostError, NativeResult};
    use crate::runtime::types::{JsNumber, JsString};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        dropped: Arc<AtomicUsize>,
    }

    impl Drop for Echo {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Task for Echo {
        type Output = String;
        type Error = ();
        type JsEvent = JsString;

        fn perform(&self) -> Result<String, ()> {
            Ok("echo".to_string())
        }

        fn complete<'a>(self, cx: &mut TaskContext<'a>, result: Result<String, ()>) -> JsResult<'a, JsString> {
            match result {
                Ok(text) => cx.string(text),
                Err(()) => cx.throw_error("unreachable"),
            }
        }
    }

    fn isolate() -> Isolate {
        Isolate::new(RuntimeConfig::new(ShutdownMode::Strict)).unwrap()
    }

    fn callback_storing_first_arg(isolate: &mut Isolate, throws: bool) -> Persistent<JsFunction> {
        isolate
            .execute(|mut cx| {
                let f = JsFunction::new::<_, _, JsValue>(&mut cx, move |mut cx| {
                    let global = cx.global();
                    let count = cx.len() as f64;
                    let count = cx.number(count)?;
                    global.set(&mut cx, "argc", count)?;
                    if throws {
                        return cx.throw_range_error("callback failed");
                    }
                    Ok(cx.undefined().upcast())
                })?;
                Ok(f.root(&mut cx))
            })
            .unwrap()
    }

    fn argc(isolate: &mut Isolate) -> Option<f64> {
        isolate
            .execute(|mut cx| -> NativeResult<Option<f64>> {
                let global = cx.global();
                let argc = global.get(&mut cx, "argc")?;
                Ok(argc
                    .downcast::<JsNumber, _>(&mut cx)
                    .ok()
                    .map(|n| n.value(&mut cx)))
            })
            .unwrap()
    }

    fn pending(callback: Persistent<JsFunction>, dropped: &Arc<AtomicUsize>) -> (PendingTask, Arc<TaskShared>) {
        let shared = Arc::new(TaskShared::new());
        let task = Echo {
            dropped: dropped.clone(),
        };
        let result = task.perform();
        let pending = PendingTask::performed(
            PendingTaskInfo::new(1, "Echo"),
            shared.clone(),
            task,
            result,
            callback,
        );
        (pending, shared)
    }

    #[test]
    fn test_delivered_with_null_error_argument() {
        let mut isolate = isolate();
        let callback = callback_storing_first_arg(&mut isolate, false);
        let dropped = Arc::new(AtomicUsize::new(0));
        let (task, shared) = pending(callback, &dropped);

        assert_eq!(complete_task(&isolate, task), Completion::Delivered);
        assert_eq!(shared.state(), TaskState::Finished);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(argc(&mut isolate), Some(2.0));
        assert_eq!(isolate.persistent_count(), 0);
    }

    #[test]
    fn test_invalidated_task_still_releases_payload() {
        let mut isolate = isolate();
        let callback = callback_storing_first_arg(&mut isolate, false);
        let dropped = Arc::new(AtomicUsize::new(0));
        let (task, shared) = pending(callback, &dropped);
        assert!(shared.invalidate());

        assert_eq!(complete_task(&isolate, task), Completion::Skipped);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(argc(&mut isolate), None);
        assert_eq!(isolate.persistent_count(), 0);
    }

    #[test]
    fn test_throwing_callback_leaves_exception_pending() {
        let mut isolate = isolate();
        let callback = callback_storing_first_arg(&mut isolate, true);
        let dropped = Arc::new(AtomicUsize::new(0));
        let (task, _) = pending(callback, &dropped);

        assert_eq!(complete_task(&isolate, task), Completion::CallbackThrew);
        assert_eq!(
            isolate.uncaught(),
            HostError::Uncaught("RangeError: callback failed".to_string())
        );
    }

    #[test]
    fn test_panicked_perform_delivers_error() {
        let mut isolate = isolate();
        let callback = callback_storing_first_arg(&mut isolate, false);
        let task = PendingTask::panicked(
            PendingTaskInfo::new(2, "Boom"),
            Arc::new(TaskShared::new()),
            "boom".to_string(),
            callback,
        );
        assert_eq!(complete_task(&isolate, task), Completion::Delivered);
        assert_eq!(argc(&mut isolate), Some(1.0));
    }
}
