//! The isolate's event loop.
//!
//! Native threads never touch the isolate directly. They post
//! [`LoopMessage`]s over an unbounded tokio channel, and the host thread
//! drains that channel inside [`EventLoop::run`], which blocks on a
//! current-thread tokio runtime until nothing keeps the loop alive.

use crate::runtime::config::RuntimeConfig;
use crate::runtime::context::TaskContext;
use crate::runtime::error::{HostError, NativeResult};
use crate::runtime::heap::ErrorKind;
use crate::runtime::isolate::{panic_message, Isolate};
use crate::runtime::task::pending_task::{complete_task, Completion, PendingTask};
use crate::runtime::task::worker_pool::WorkerPool;
use crate::runtime::task::{TaskCounters, TaskQueue};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// A closure sent to the host thread through a [`Channel`](crate::Channel).
pub(crate) type LoopCallback = Box<dyn for<'a> FnOnce(TaskContext<'a>) -> NativeResult<()> + Send>;

pub(crate) enum LoopMessage {
    /// Run a closure on the host thread.
    Callback(LoopCallback),
    /// A task whose `perform` has finished.
    Complete(PendingTask),
    /// Re-check whether the loop should stay alive.
    Wake,
}

/// What keeps the loop running: outstanding tasks and referenced channels.
#[derive(Debug, Default)]
pub(crate) struct KeepAlive {
    pending_tasks: AtomicUsize,
    channel_refs: AtomicUsize,
    closed: AtomicBool,
}

impl KeepAlive {
    pub fn task_started(&self) {
        self.pending_tasks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn task_finished(&self) {
        self.pending_tasks.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn pending_tasks(&self) -> usize {
        self.pending_tasks.load(Ordering::SeqCst)
    }

    pub fn channel_referenced(&self) {
        self.channel_refs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn channel_released(&self) {
        self.channel_refs.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn channel_refs(&self) -> usize {
        self.channel_refs.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.pending_tasks() > 0 || self.channel_refs() > 0
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Statistics about the event loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Messages dispatched
    pub ticks: u64,
    /// Channel callbacks run
    pub callbacks_run: u64,
    /// Task completions run
    pub tasks_completed: u64,
    /// Exceptions that escaped a callback or task completion
    pub uncaught_exceptions: u64,
    /// Rendering of the most recent uncaught exception
    pub last_uncaught: Option<String>,
}

pub(crate) struct EventLoop {
    tx: UnboundedSender<LoopMessage>,
    rx: RefCell<UnboundedReceiver<LoopMessage>>,
    keep_alive: Arc<KeepAlive>,
    runtime: tokio::runtime::Runtime,
    workers: WorkerPool,
    stats: RefCell<LoopStats>,
    counters: Arc<TaskCounters>,
    next_task_id: Arc<AtomicU64>,
}

impl EventLoop {
    pub fn new(config: &RuntimeConfig) -> Result<Self, HostError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| HostError::WorkerPool(err.to_string()))?;
        let workers = WorkerPool::new(config.worker_threads)?;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            tx,
            rx: RefCell::new(rx),
            keep_alive: Arc::new(KeepAlive::default()),
            runtime,
            workers,
            stats: RefCell::new(LoopStats::default()),
            counters: Arc::new(TaskCounters::default()),
            next_task_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn sender(&self) -> UnboundedSender<LoopMessage> {
        self.tx.clone()
    }

    pub fn keep_alive(&self) -> Arc<KeepAlive> {
        self.keep_alive.clone()
    }

    pub fn task_queue(&self) -> TaskQueue {
        TaskQueue::new(
            self.tx.clone(),
            self.keep_alive.clone(),
            self.workers.handle(),
            self.counters.clone(),
            self.next_task_id.clone(),
        )
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.borrow().clone()
    }

    /// Tasks scheduled but not yet completed.
    pub fn outstanding(&self) -> usize {
        self.keep_alive.pending_tasks()
    }

    /// Stop accepting new work.
    pub fn close(&self) {
        self.keep_alive.close();
    }

    pub fn shutdown_workers(&self) {
        self.workers.shutdown();
    }

    /// Dispatch messages until nothing keeps the loop alive.
    pub fn run(&self, isolate: &Isolate, timeout: Option<Duration>) -> Result<LoopStats, HostError> {
        let Ok(mut rx) = self.rx.try_borrow_mut() else {
            return Err(HostError::EventLoopBusy);
        };

        let drive = async {
            loop {
                while let Ok(message) = rx.try_recv() {
                    self.dispatch(isolate, message);
                }
                isolate.drain_released();
                if !self.keep_alive.is_alive() {
                    break;
                }
                match rx.recv().await {
                    Some(message) => self.dispatch(isolate, message),
                    None => break,
                }
            }
        };

        match timeout {
            Some(limit) => self
                .runtime
                .block_on(async { tokio::time::timeout(limit, drive).await })
                .map_err(|_| HostError::EventLoopTimeout(limit))?,
            None => self.runtime.block_on(drive),
        }

        let stats = self.stats();
        tracing::trace!(
            isolate = %isolate.id(),
            ticks = stats.ticks,
            uncaught = stats.uncaught_exceptions,
            "event loop drained"
        );
        Ok(stats)
    }

    fn dispatch(&self, isolate: &Isolate, message: LoopMessage) {
        self.stats.borrow_mut().ticks += 1;
        match message {
            LoopMessage::Callback(callback) => {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| isolate.with_task_context(callback)));
                self.stats.borrow_mut().callbacks_run += 1;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => self.report_uncaught(isolate),
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        isolate.throw_error(
                            ErrorKind::Error,
                            &format!("internal error in native code: {message}"),
                        );
                        self.report_uncaught(isolate);
                    }
                }
            }
            LoopMessage::Complete(task) => {
                let completion = complete_task(isolate, task);
                self.counters.record(completion);
                self.stats.borrow_mut().tasks_completed += 1;
                if completion == Completion::CallbackThrew {
                    self.report_uncaught(isolate);
                }
                self.keep_alive.task_finished();
            }
            LoopMessage::Wake => {}
        }
    }

    fn report_uncaught(&self, isolate: &Isolate) {
        let message = match isolate.uncaught() {
            HostError::Uncaught(message) => message,
            other => other.to_string(),
        };
        tracing::error!(isolate = %isolate.id(), exception = %message, "uncaught exception in event loop");
        let mut stats = self.stats.borrow_mut();
        stats.uncaught_exceptions += 1;
        stats.last_uncaught = Some(message);
    }
}
