//! Native worker threads for task `perform` phases.

use crate::runtime::error::HostError;
use std::cell::RefCell;
use tokio::runtime::{Builder, Handle, Runtime};

/// A tokio multi-thread runtime used only for its blocking pool.
pub(crate) struct WorkerPool {
    runtime: RefCell<Option<Runtime>>,
    handle: Handle,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self, HostError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name("hostlink-worker")
            .build()
            .map_err(|err| HostError::WorkerPool(err.to_string()))?;
        let handle = runtime.handle().clone();
        tracing::debug!(threads, "native worker pool started");
        Ok(Self {
            runtime: RefCell::new(Some(runtime)),
            handle,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Stop the pool without waiting for running `perform` phases.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.borrow_mut().take() {
            runtime.shutdown_background();
            tracing::debug!("native worker pool shut down");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
