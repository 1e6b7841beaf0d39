//! Runtime configuration for a single isolate.
//!
//! This module defines the configuration structure for host isolates,
//! including heap limits, the native worker pool and shutdown behavior.

use crate::runtime::error::HostError;
use std::time::Duration;

/// Default number of native worker threads running task `perform` phases.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// What an isolate does with outstanding work when it is torn down.
///
/// There is deliberately no default: every isolate must pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Drain the event loop (bounded by `event_loop_timeout` if set) before
    /// tearing down, so every scheduled task reaches its `complete` phase.
    ///
    /// A referenced [`Channel`](crate::runtime::channel::Channel) keeps the
    /// loop alive, so without a timeout teardown blocks until every
    /// referenced channel has been dropped or unref'd.
    Strict,
    /// Abandon outstanding tasks and channels. Their native payloads are
    /// released without running `complete` or any host callback.
    Detach,
}

/// Runtime configuration for a single isolate.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum heap size in bytes (None = unlimited)
    pub max_heap_size: Option<usize>,

    /// Initial heap size in bytes, used as a capacity hint
    pub initial_heap_size: Option<usize>,

    /// Number of native worker threads for task `perform` phases
    pub worker_threads: usize,

    /// Optional upper bound for a single `run_event_loop` call
    pub event_loop_timeout: Option<Duration>,

    /// Teardown behavior for outstanding work
    pub shutdown_mode: ShutdownMode,
}

impl RuntimeConfig {
    /// Create a configuration with the given shutdown mode and defaults for
    /// everything else.
    pub fn new(shutdown_mode: ShutdownMode) -> Self {
        Self {
            max_heap_size: None,
            initial_heap_size: None,
            worker_threads: DEFAULT_WORKER_THREADS,
            event_loop_timeout: None,
            shutdown_mode,
        }
    }

    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = Some(bytes);
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_event_loop_timeout(mut self, timeout: Duration) -> Self {
        self.event_loop_timeout = Some(timeout);
        self
    }

    /// Check the configuration for inconsistent settings.
    pub fn validate(&self) -> Result<(), HostError> {
        if self.initial_heap_size.is_some() && self.max_heap_size.is_none() {
            return Err(HostError::InvalidConfig(
                "initial_heap_size requires max_heap_size to be set as well".to_string(),
            ));
        }

        if let (Some(initial), Some(max)) = (self.initial_heap_size, self.max_heap_size) {
            if initial > max {
                return Err(HostError::InvalidConfig(format!(
                    "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                    initial, max
                )));
            }
        }

        if self.worker_threads == 0 {
            return Err(HostError::InvalidConfig(
                "worker_threads must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
