//! Stack-disciplined handle regions.
//!
//! Every live [`Handle`](crate::Handle) is backed by an entry in the
//! isolate's [`HandleStack`]. Entering a region pushes a frame; exiting it
//! truncates the stack back to where the frame began, so every handle created
//! inside stops being a GC root at that instant. Frames carry a serial number
//! that handles record, which lets debug builds assert liveness on access.

use crate::runtime::heap::ValueRef;
use crate::runtime::isolate::Isolate;
use std::marker::PhantomData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Handles cannot leave the region.
    Plain,
    /// Exactly one handle may be promoted to the parent region on exit.
    Escapable,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    serial: u32,
    base: usize,
    kind: ScopeKind,
}

#[derive(Debug, Default)]
pub struct HandleStack {
    roots: Vec<ValueRef>,
    frames: Vec<Frame>,
    next_serial: u32,
}

impl HandleStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&mut self, kind: ScopeKind) -> u32 {
        self.next_serial = self.next_serial.wrapping_add(1);
        let serial = self.next_serial;
        self.frames.push(Frame {
            serial,
            base: self.roots.len(),
            kind,
        });
        serial
    }

    pub fn exit(&mut self, serial: u32) {
        let Some(frame) = self.frames.pop() else {
            debug_assert!(false, "scope exit without a matching enter");
            return;
        };
        debug_assert_eq!(frame.serial, serial, "scopes must exit in LIFO order");
        self.roots.truncate(frame.base);
    }

    /// Root `value` in the innermost frame and return that frame's serial.
    pub fn push(&mut self, value: ValueRef) -> u32 {
        debug_assert!(!self.frames.is_empty(), "handle created outside any scope");
        self.roots.push(value);
        self.current()
    }

    pub fn current(&self) -> u32 {
        self.frames.last().map(|frame| frame.serial).unwrap_or(0)
    }

    pub fn current_kind(&self) -> Option<ScopeKind> {
        self.frames.last().map(|frame| frame.kind)
    }

    /// Whether the frame with `serial` is still on the stack.
    pub fn is_live(&self, serial: u32) -> bool {
        self.frames.iter().rev().any(|frame| frame.serial == serial)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn roots(&self) -> impl Iterator<Item = ValueRef> + '_ {
        self.roots.iter().copied()
    }
}

/// An entered region. Exits on drop, including during unwinding.
pub struct Scope<'a> {
    pub(crate) isolate: &'a Isolate,
    pub(crate) serial: u32,
    _marker: PhantomData<&'a ()>,
}

impl<'a> Scope<'a> {
    /// Run `f` inside a freshly entered region of `kind`.
    pub(crate) fn with<T>(
        isolate: &Isolate,
        kind: ScopeKind,
        f: impl for<'b> FnOnce(Scope<'b>) -> T,
    ) -> T {
        let serial = isolate.handles().enter(kind);
        f(Scope {
            isolate,
            serial,
            _marker: PhantomData,
        })
    }

    pub(crate) fn isolate(&self) -> &'a Isolate {
        self.isolate
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        self.isolate.handles().exit(self.serial);
    }
}
