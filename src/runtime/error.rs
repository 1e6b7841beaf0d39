//! Error types shared across the bridge.
//!
//! Two kinds of failure exist. A [`Throw`] means a host exception is pending
//! on the isolate and control should unwind back to the host. A
//! [`HostError`] is a typed, recoverable failure reported to the immediate
//! native caller, which may turn it into a host exception with
//! [`ResultExt::or_throw`].

use crate::runtime::context::Context;
use crate::runtime::handle::Handle;
use crate::runtime::isolate::IsolateId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Marker indicating that a host exception is pending.
///
/// Only produced by the throwing operations of a [`Context`], so holding an
/// `Err(Throw)` always means the isolate has an exception to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throw(());

impl Throw {
    pub(crate) fn new() -> Self {
        Throw(())
    }
}

impl fmt::Display for Throw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a host exception is pending")
    }
}

impl std::error::Error for Throw {}

/// Result of a native operation that may leave an exception pending.
pub type NativeResult<T> = Result<T, Throw>;

/// Result of a native operation producing a handle.
pub type JsResult<'a, T> = NativeResult<Handle<'a, T>>;

/// Recoverable failures reported to native callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HostError {
    #[error("host heap exhausted: {requested} bytes requested, {used} of {limit} bytes in use")]
    HeapExhausted {
        requested: usize,
        used: usize,
        limit: usize,
    },

    #[error("property key cannot be encoded as a host string: {0}")]
    InvalidKey(String),

    #[error("byte buffer is not valid UTF-8: {0}")]
    InvalidEncoding(String),

    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("value is not an instance of class `{0}`")]
    NotAnInstance(String),

    #[error("a class for native type `{0}` is already registered")]
    ClassAlreadyRegistered(&'static str),

    #[error("class #{0} is not registered on this isolate")]
    UnknownClass(usize),

    #[error("persistent handle is empty")]
    EmptyPersistent,

    #[error("persistent handle belongs to isolate {expected}, not {actual}")]
    WrongIsolate {
        expected: IsolateId,
        actual: IsolateId,
    },

    #[error("native module `{module}` targets ABI version {found}, host provides {expected}")]
    AbiMismatch {
        module: String,
        expected: u32,
        found: u32,
    },

    #[error("native module `{module}` failed to initialize: {message}")]
    ModuleInit { module: String, message: String },

    #[error("uncaught host exception: {0}")]
    Uncaught(String),

    #[error("event loop timed out after {0:?}")]
    EventLoopTimeout(Duration),

    #[error("event loop is already running")]
    EventLoopBusy,

    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to start native worker pool: {0}")]
    WorkerPool(String),

    #[error("value conversion failed: {0}")]
    Conversion(String),
}

/// Conversion of typed failures into host exceptions.
pub trait ResultExt<T> {
    /// Throw the error as a host exception on `cx`.
    fn or_throw<'a, C: Context<'a>>(self, cx: &mut C) -> NativeResult<T>;
}

impl<T> ResultExt<T> for Result<T, HostError> {
    fn or_throw<'a, C: Context<'a>>(self, cx: &mut C) -> NativeResult<T> {
        match self {
            Ok(value) => Ok(value),
            Err(err) => cx.throw_host_error(err),
        }
    }
}
