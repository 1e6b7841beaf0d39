//! Task queue bridge.
//!
//! A [`Task`] runs its `perform` phase on a native worker thread and its
//! `complete` phase back on the host thread, where it may create handles and
//! call the callback it was scheduled with.
//!
//! Lifecycle: `Created -> Queued -> Executing -> Completing -> Finished`.
//! Completions are delivered in the order `perform` finished, not the order
//! tasks were scheduled.

pub(crate) mod pending_task;
pub(crate) mod worker_pool;

use crate::runtime::channel::SendError;
use crate::runtime::context::{Context, TaskContext};
use crate::runtime::error::JsResult;
use crate::runtime::event_loop::{KeepAlive, LoopMessage};
use crate::runtime::handle::{Handle, Value};
use crate::runtime::isolate::panic_message;
use crate::runtime::persistent::Persistent;
use crate::runtime::types::JsFunction;
use pending_task::{Completion, PendingTask, PendingTaskInfo};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Work split between a native worker thread and the host thread.
pub trait Task: Send + Sized + 'static {
    /// Value produced by `perform`.
    type Output: Send + 'static;
    /// Failure produced by `perform`.
    type Error: Send + 'static;
    /// Host value passed to the callback on success.
    type JsEvent: Value;

    /// Runs on a worker thread. Must not touch the isolate.
    fn perform(&self) -> Result<Self::Output, Self::Error>;

    /// Runs on the host thread once `perform` has finished. Throwing here
    /// passes the exception to the callback as its only argument.
    fn complete<'a>(
        self,
        cx: &mut TaskContext<'a>,
        result: Result<Self::Output, Self::Error>,
    ) -> JsResult<'a, Self::JsEvent>;

    /// Schedule this task with `callback` on the isolate behind `cx`.
    fn schedule<'a, C: Context<'a>>(
        self,
        cx: &mut C,
        callback: Handle<'_, JsFunction>,
    ) -> Result<TaskToken, SendError> {
        let callback = callback.root(cx);
        cx.task_queue().schedule(self, callback)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    Queued = 1,
    Executing = 2,
    Completing = 3,
    Finished = 4,
}

impl TaskState {
    fn from_bits(bits: u8) -> Self {
        match bits & STATE_MASK {
            0 => TaskState::Created,
            1 => TaskState::Queued,
            2 => TaskState::Executing,
            3 => TaskState::Completing,
            _ => TaskState::Finished,
        }
    }
}

const STATE_MASK: u8 = 0x0f;
const INVALIDATED: u8 = 0x80;

/// State shared between a token and its task. The phase and the
/// invalidation flag live in one atomic so invalidation cannot race the
/// move into `Completing`.
#[derive(Debug)]
pub(crate) struct TaskShared {
    bits: AtomicU8,
}

impl TaskShared {
    fn new() -> Self {
        Self {
            bits: AtomicU8::new(TaskState::Created as u8),
        }
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_bits(self.bits.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: TaskState) {
        let _ = self
            .bits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                Some((bits & INVALIDATED) | state as u8)
            });
    }

    /// Move into `Completing`, returning whether the callback was
    /// invalidated beforehand.
    pub fn begin_completing(&self) -> bool {
        let previous = self
            .bits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                Some((bits & INVALIDATED) | TaskState::Completing as u8)
            })
            .unwrap_or_else(|bits| bits);
        previous & INVALIDATED != 0
    }

    fn invalidate(&self) -> bool {
        self.bits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                if TaskState::from_bits(bits) >= TaskState::Completing {
                    None
                } else {
                    Some(bits | INVALIDATED)
                }
            })
            .is_ok()
    }

    fn is_invalidated(&self) -> bool {
        self.bits.load(Ordering::SeqCst) & INVALIDATED != 0
    }
}

/// Handle to a scheduled task, usable from any thread.
#[derive(Debug, Clone)]
pub struct TaskToken {
    id: u64,
    shared: Arc<TaskShared>,
}

impl TaskToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    /// Suppress the host callback. `complete` still runs so native resources
    /// are released. Returns `false` once the task has reached `Completing`.
    pub fn invalidate_callback(&self) -> bool {
        self.shared.invalidate()
    }

    pub fn is_invalidated(&self) -> bool {
        self.shared.is_invalidated()
    }
}

/// Statistics about scheduled tasks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskStats {
    /// Tasks scheduled but not yet completed
    pub pending_count: usize,
    /// Total tasks scheduled
    pub total_submitted: usize,
    /// Total tasks whose callback was called
    pub total_completed: usize,
    /// Total tasks whose callback was skipped after invalidation
    pub total_skipped: usize,
    /// Total tasks whose `perform` panicked
    pub total_panicked: usize,
    /// Total callbacks that threw
    pub callback_errors: usize,
}

#[derive(Debug, Default)]
pub(crate) struct TaskCounters {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    skipped: AtomicUsize,
    panicked: AtomicUsize,
    callback_errors: AtomicUsize,
}

impl TaskCounters {
    pub fn record(&self, completion: Completion) {
        let counter = match completion {
            Completion::Delivered => &self.completed,
            Completion::Skipped => &self.skipped,
            Completion::CallbackThrew => &self.callback_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Schedules tasks onto an isolate's worker pool. Cheap to clone and usable
/// from any thread.
#[derive(Clone)]
pub struct TaskQueue {
    tx: UnboundedSender<LoopMessage>,
    keep_alive: Arc<KeepAlive>,
    workers: tokio::runtime::Handle,
    counters: Arc<TaskCounters>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").field("stats", &self.stats()).finish()
    }
}

impl TaskQueue {
    pub(crate) fn new(
        tx: UnboundedSender<LoopMessage>,
        keep_alive: Arc<KeepAlive>,
        workers: tokio::runtime::Handle,
        counters: Arc<TaskCounters>,
        next_id: Arc<AtomicU64>,
    ) -> Self {
        Self {
            tx,
            keep_alive,
            workers,
            counters,
            next_id,
        }
    }

    /// Run `task.perform` on a worker thread, then `task.complete` and
    /// `callback` on the host thread.
    ///
    /// The event loop is kept alive until the completion has been delivered.
    pub fn schedule<T: Task>(
        &self,
        task: T,
        callback: Persistent<JsFunction>,
    ) -> Result<TaskToken, SendError> {
        if self.keep_alive.is_closed() {
            return Err(SendError);
        }

        let token = TaskToken {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            shared: Arc::new(TaskShared::new()),
        };
        let info = PendingTaskInfo::new(token.id, std::any::type_name::<T>());

        self.keep_alive.task_started();
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        token.shared.set_state(TaskState::Queued);
        tracing::trace!(task = info.id, name = info.name, "task scheduled");

        let shared = token.shared.clone();
        let tx = self.tx.clone();
        let keep_alive = self.keep_alive.clone();
        let counters = self.counters.clone();

        self.workers.spawn_blocking(move || {
            shared.set_state(TaskState::Executing);
            let pending = match panic::catch_unwind(AssertUnwindSafe(|| task.perform())) {
                Ok(result) => PendingTask::performed(info, shared, task, result, callback),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::warn!(task = info.id, name = info.name, message = %message, "task perform panicked");
                    counters.panicked.fetch_add(1, Ordering::Relaxed);
                    drop(task);
                    PendingTask::panicked(info, shared, message, callback)
                }
            };
            if tx.send(LoopMessage::Complete(pending)).is_err() {
                // The isolate is gone; the payload and callback root are
                // released with the rejected message.
                keep_alive.task_finished();
            }
        });

        Ok(token)
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            pending_count: self.keep_alive.pending_tasks(),
            total_submitted: self.counters.submitted.load(Ordering::Relaxed),
            total_completed: self.counters.completed.load(Ordering::Relaxed),
            total_skipped: self.counters.skipped.load(Ordering::Relaxed),
            total_panicked: self.counters.panicked.load(Ordering::Relaxed),
            callback_errors: self.counters.callback_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::config::{RuntimeConfig, ShutdownMode};
    use crate::runtime::context::internal::ContextInternal;
    use crate::runtime::conversion::{from_native, to_native};
    use crate::runtime::error::ResultExt;
    use crate::runtime::isolate::Isolate;
    use crate::runtime::native_value::NativeValue;
    use crate::runtime::types::{JsArray, JsBoolean, JsNumber, JsValue};
    use std::thread;
    use std::time::Duration;

    struct Square(u32);

    impl Task for Square {
        type Output = u32;
        type Error = String;
        type JsEvent = JsNumber;

        fn perform(&self) -> Result<u32, String> {
            Ok(self.0 * self.0)
        }

        fn complete<'a>(
            self,
            cx: &mut TaskContext<'a>,
            result: Result<u32, String>,
        ) -> JsResult<'a, JsNumber> {
            match result {
                Ok(value) => cx.number(value),
                Err(message) => cx.throw_error(message),
            }
        }
    }

    struct Fails;

    impl Task for Fails {
        type Output = ();
        type Error = String;
        type JsEvent = JsValue;

        fn perform(&self) -> Result<(), String> {
            Err("disk on fire".to_string())
        }

        fn complete<'a>(
            self,
            cx: &mut TaskContext<'a>,
            result: Result<(), String>,
        ) -> JsResult<'a, JsValue> {
            match result {
                Ok(()) => Ok(cx.undefined().upcast()),
                Err(message) => cx.throw_type_error(message),
            }
        }
    }

    struct Panics;

    impl Task for Panics {
        type Output = ();
        type Error = String;
        type JsEvent = JsValue;

        fn perform(&self) -> Result<(), String> {
            panic!("worker exploded")
        }

        fn complete<'a>(self, cx: &mut TaskContext<'a>, _: Result<(), String>) -> JsResult<'a, JsValue> {
            Ok(cx.undefined().upcast())
        }
    }

    fn isolate() -> Isolate {
        Isolate::new(RuntimeConfig::new(ShutdownMode::Strict)).unwrap()
    }

    /// Install a global `results` array and return a callback that pushes
    /// `[err, value]` pairs onto it.
    fn recorder(isolate: &mut Isolate) -> Persistent<JsFunction> {
        isolate
            .execute(|mut cx| {
                let results = cx.empty_array()?;
                let global = cx.global();
                global.set(&mut cx, "results", results)?;
                let f = JsFunction::new(&mut cx, |mut cx| {
                    let global = cx.global();
                    let results = global.get(&mut cx, "results")?;
                    let results = results.downcast_or_throw::<JsArray, _>(&mut cx)?;
                    let entry = cx.empty_array()?;
                    for i in 0..cx.len() {
                        if let Some(arg) = cx.argument_opt(i) {
                            entry.set(&mut cx, i as u32, arg)?;
                        }
                    }
                    let len = results.len(&mut cx);
                    results.set(&mut cx, len, entry)?;
                    Ok(cx.undefined())
                })?;
                Ok(f.root(&mut cx))
            })
            .unwrap()
    }

    fn recorded(isolate: &mut Isolate) -> Vec<String> {
        isolate
            .execute(|mut cx| {
                let global = cx.global();
                let results = global.get(&mut cx, "results")?;
                let results = results.downcast_or_throw::<JsArray, _>(&mut cx)?;
                let mut out = Vec::new();
                for entry in results.to_vec(&mut cx) {
                    let entry = entry.downcast_or_throw::<JsArray, _>(&mut cx)?;
                    let parts: Vec<String> = entry
                        .to_vec(&mut cx)
                        .into_iter()
                        .map(|value| cx.isolate().describe(value.to_raw()))
                        .collect();
                    out.push(parts.join(","));
                }
                Ok(out)
            })
            .unwrap()
    }

    #[test]
    fn test_task_state_bits() {
        let shared = TaskShared::new();
        assert_eq!(shared.state(), TaskState::Created);
        shared.set_state(TaskState::Executing);
        assert!(shared.invalidate());
        assert_eq!(shared.state(), TaskState::Executing);
        assert!(shared.begin_completing());
        assert_eq!(shared.state(), TaskState::Completing);
        assert!(!shared.invalidate());

        let late = TaskShared::new();
        assert!(!late.begin_completing());
        assert!(!late.invalidate());
        assert!(!late.is_invalidated());
    }

    #[test]
    fn test_completion_calls_back_node_style() {
        let mut isolate = isolate();
        let callback = recorder(&mut isolate);
        let queue = isolate.task_queue();
        let token = queue.schedule(Square(7), callback).unwrap();

        isolate.run_event_loop().unwrap();
        assert_eq!(token.state(), TaskState::Finished);
        assert_eq!(recorded(&mut isolate), vec!["null,49".to_string()]);

        let stats = queue.stats();
        assert_eq!(stats.pending_count, 0);
        assert_eq!(stats.total_submitted, 1);
        assert_eq!(stats.total_completed, 1);
    }

    #[test]
    fn test_complete_throw_is_passed_to_callback() {
        let mut isolate = isolate();
        let callback = recorder(&mut isolate);
        isolate.task_queue().schedule(Fails, callback).unwrap();
        isolate.run_event_loop().unwrap();
        assert_eq!(recorded(&mut isolate), vec!["TypeError: disk on fire".to_string()]);
    }

    #[test]
    fn test_perform_panic_skips_complete() {
        let mut isolate = isolate();
        let callback = recorder(&mut isolate);
        let queue = isolate.task_queue();
        queue.schedule(Panics, callback).unwrap();
        isolate.run_event_loop().unwrap();
        assert_eq!(
            recorded(&mut isolate),
            vec!["Error: task perform panicked: worker exploded".to_string()]
        );
        assert_eq!(queue.stats().total_panicked, 1);
    }

    #[test]
    fn test_schedule_from_handle_context() {
        let mut isolate = isolate();
        let callback = recorder(&mut isolate);
        let token = isolate
            .execute(|mut cx| {
                let callback = callback.read(&mut cx).or_throw(&mut cx)?;
                Square(3).schedule(&mut cx, callback).or_else(|err| cx.throw_error(err.to_string()))
            })
            .unwrap();
        drop(callback);
        isolate.run_event_loop().unwrap();
        assert_eq!(token.state(), TaskState::Finished);
        assert_eq!(recorded(&mut isolate), vec!["null,9".to_string()]);
    }

    #[test]
    fn test_tasks_scheduled_from_worker_threads() {
        let mut isolate = isolate();
        let callback = recorder(&mut isolate);
        let queue = isolate.task_queue();

        let producers: Vec<_> = (0..3u32)
            .map(|t| {
                let queue = queue.clone();
                let callbacks: Vec<_> = (0..5)
                    .map(|_| {
                        isolate
                            .execute(|mut cx| {
                                let f = callback.read(&mut cx).or_throw(&mut cx)?;
                                Ok(f.root(&mut cx))
                            })
                            .unwrap()
                    })
                    .collect();
                thread::spawn(move || {
                    for (i, callback) in callbacks.into_iter().enumerate() {
                        queue.schedule(Square(t * 10 + i as u32), callback).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        isolate.run_event_loop().unwrap();
        assert_eq!(recorded(&mut isolate).len(), 15);
        let stats = queue.stats();
        assert_eq!(stats.total_submitted, 15);
        assert_eq!(stats.total_completed, 15);
        assert_eq!(stats.pending_count, 0);
    }

    struct Slow(Arc<std::sync::Barrier>);

    impl Task for Slow {
        type Output = ();
        type Error = String;
        type JsEvent = JsValue;

        fn perform(&self) -> Result<(), String> {
            self.0.wait();
            thread::sleep(Duration::from_millis(10));
            Ok(())
        }

        fn complete<'a>(self, cx: &mut TaskContext<'a>, _: Result<(), String>) -> JsResult<'a, JsValue> {
            let global = cx.global();
            let flag = cx.boolean(true);
            global.set(cx, "completed", flag)?;
            Ok(cx.undefined().upcast())
        }
    }

    #[test]
    fn test_invalidated_callback_is_skipped_but_complete_runs() {
        let mut isolate = isolate();
        let callback = recorder(&mut isolate);
        let queue = isolate.task_queue();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let token = queue.schedule(Slow(barrier.clone()), callback).unwrap();

        barrier.wait();
        assert!(token.invalidate_callback());
        assert!(token.is_invalidated());

        isolate.run_event_loop().unwrap();
        assert_eq!(token.state(), TaskState::Finished);
        assert!(!token.invalidate_callback());
        assert!(recorded(&mut isolate).is_empty());
        assert_eq!(queue.stats().total_skipped, 1);

        let completed = isolate
            .execute(|mut cx| {
                let global = cx.global();
                let flag = global.get(&mut cx, "completed")?;
                Ok(flag.is_a::<JsBoolean, _>(&mut cx))
            })
            .unwrap();
        assert!(completed);
    }

    struct Doubles(NativeValue);

    impl Task for Doubles {
        type Output = NativeValue;
        type Error = String;
        type JsEvent = JsValue;

        fn perform(&self) -> Result<NativeValue, String> {
            let NativeValue::Array(items) = &self.0 else {
                return Err("expected an array".to_string());
            };
            items
                .iter()
                .map(|item| {
                    item.as_f64()
                        .map(|n| NativeValue::from_number(n * 2.0))
                        .ok_or_else(|| "expected numbers".to_string())
                })
                .collect::<Result<Vec<_>, _>>()
                .map(NativeValue::Array)
        }

        fn complete<'a>(
            self,
            cx: &mut TaskContext<'a>,
            result: Result<NativeValue, String>,
        ) -> JsResult<'a, JsValue> {
            let value = match result {
                Ok(value) => value,
                Err(message) => return cx.throw_error(message),
            };
            let value = from_native(cx, &value).or_throw(cx)?;
            let global = cx.global();
            global.set(cx, "doubled", value)?;
            Ok(value)
        }
    }

    #[test]
    fn test_snapshot_crosses_to_worker_and_back() {
        let mut isolate = isolate();
        let callback = recorder(&mut isolate);
        let token = isolate
            .execute(|mut cx| {
                let input = cx.empty_array()?;
                for (i, n) in [1.5, 2.0, 4.0].into_iter().enumerate() {
                    let n = cx.number(n)?;
                    input.set(&mut cx, i as u32, n)?;
                }
                let snapshot = to_native(&mut cx, input).or_throw(&mut cx)?;
                let callback = callback.read(&mut cx).or_throw(&mut cx)?;
                Doubles(snapshot)
                    .schedule(&mut cx, callback)
                    .or_else(|err| cx.throw_error(err.to_string()))
            })
            .unwrap();
        drop(callback);

        isolate.run_event_loop().unwrap();
        assert_eq!(token.state(), TaskState::Finished);
        assert_eq!(recorded(&mut isolate), vec!["null,[object Array]".to_string()]);

        let doubled = isolate
            .execute(|mut cx| {
                let global = cx.global();
                let doubled = global.get(&mut cx, "doubled")?;
                to_native(&mut cx, doubled).or_throw(&mut cx)
            })
            .unwrap();
        assert_eq!(
            doubled,
            NativeValue::Array(vec![NativeValue::Int(3), NativeValue::Int(4), NativeValue::Int(8)])
        );
    }

    #[test]
    fn test_schedule_after_teardown_fails() {
        let mut isolate = isolate();
        let callback = recorder(&mut isolate);
        let queue = isolate.task_queue();
        drop(isolate);
        assert_eq!(queue.schedule(Square(1), callback).unwrap_err(), SendError);
    }
}
