//! Channels: the cross-thread way into an isolate's event loop.
//!
//! A [`Channel`] is `Send + Sync` and can be cloned onto any thread. Closures
//! sent through it run later on the host thread with a fresh
//! [`TaskContext`]. While at least one referenced channel is alive the event
//! loop keeps running.

use crate::runtime::context::internal::ContextInternal;
use crate::runtime::context::{Context, TaskContext};
use crate::runtime::error::NativeResult;
use crate::runtime::event_loop::{KeepAlive, LoopMessage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// The event loop is closed and no longer accepts work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the event loop is no longer accepting work")]
pub struct SendError;

pub(crate) struct ChannelState {
    tx: UnboundedSender<LoopMessage>,
    keep_alive: Arc<KeepAlive>,
    ref_count: AtomicUsize,
}

impl ChannelState {
    fn reference(&self) {
        if self.ref_count.fetch_add(1, Ordering::SeqCst) == 0 {
            self.keep_alive.channel_referenced();
        }
    }

    fn unreference(&self) {
        if self.ref_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.keep_alive.channel_released();
            // The loop may be parked waiting for messages.
            let _ = self.tx.send(LoopMessage::Wake);
        }
    }
}

/// Sends closures to the event loop of the isolate that created it.
pub struct Channel {
    state: Arc<ChannelState>,
    has_ref: bool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("has_ref", &self.has_ref).finish()
    }
}

impl Channel {
    /// Create a referenced channel for the isolate behind `cx`.
    pub fn new<'a, C: Context<'a>>(cx: &mut C) -> Self {
        let event_loop = cx.isolate().event_loop();
        let state = Arc::new(ChannelState {
            tx: event_loop.sender(),
            keep_alive: event_loop.keep_alive(),
            ref_count: AtomicUsize::new(0),
        });
        state.reference();
        Self {
            state,
            has_ref: true,
        }
    }

    /// Stop this channel from keeping the event loop alive.
    pub fn unref<'a, C: Context<'a>>(&mut self, _cx: &mut C) -> &mut Self {
        if self.has_ref {
            self.has_ref = false;
            self.state.unreference();
        }
        self
    }

    /// Make this channel keep the event loop alive again.
    pub fn reference<'a, C: Context<'a>>(&mut self, _cx: &mut C) -> &mut Self {
        if !self.has_ref {
            self.has_ref = true;
            self.state.reference();
        }
        self
    }

    pub fn has_ref(&self) -> bool {
        self.has_ref
    }

    /// Queue `f` to run on the host thread.
    ///
    /// Closures run in the order they were sent. An exception left pending
    /// by `f` is reported as uncaught by the event loop.
    pub fn send<F>(&self, f: F) -> Result<(), SendError>
    where
        F: for<'a> FnOnce(TaskContext<'a>) -> NativeResult<()> + Send + 'static,
    {
        if self.state.keep_alive.is_closed() {
            return Err(SendError);
        }
        self.state
            .tx
            .send(LoopMessage::Callback(Box::new(f)))
            .map_err(|_| SendError)
    }
}

impl Clone for Channel {
    fn clone(&self) -> Self {
        if self.has_ref {
            self.state.reference();
        }
        Self {
            state: self.state.clone(),
            has_ref: self.has_ref,
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.has_ref {
            self.state.unreference();
        }
    }
}
