//! Mark-sweep object heap backing an isolate.
//!
//! Cells are addressed by [`ValueRef`], an index plus a generation counter, so
//! a reference to a freed cell can never silently alias a newer value. The
//! heap never collects on its own: the isolate triggers [`Heap::collect`] at
//! quiescent points with the full root set.

use crate::runtime::error::HostError;
use crate::runtime::template::NativeCallback;
use indexmap::IndexMap;
use std::any::Any;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Approximate fixed cost of one heap cell, used for heap-limit accounting.
const CELL_OVERHEAD: usize = 48;

/// Accounted cost of one property or array element.
pub(crate) const SLOT_BYTES: usize = std::mem::size_of::<ValueRef>() * 2;

/// Reference to a heap cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueRef {
    index: u32,
    generation: u32,
}

pub enum HeapValue {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Object(ObjectData),
}

impl HeapValue {
    /// Host-facing name of the value's kind, used in type-mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            HeapValue::Undefined => "undefined",
            HeapValue::Null => "null",
            HeapValue::Boolean(_) => "boolean",
            HeapValue::Number(_) => "number",
            HeapValue::String(_) => "string",
            HeapValue::Object(obj) => match obj.kind {
                ObjectKind::Ordinary => "object",
                ObjectKind::Array(_) => "array",
                ObjectKind::Function(_) => "function",
                ObjectKind::Error(_) => "error",
                ObjectKind::Template(_) => "function template",
            },
        }
    }

    pub fn as_object(&self) -> Option<&ObjectData> {
        match self {
            HeapValue::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

pub struct ObjectData {
    pub kind: ObjectKind,
    pub properties: IndexMap<String, ValueRef>,
    pub prototype: Option<ValueRef>,
    /// Internal slot 0, populated only for class instances.
    pub internals: Option<Internals>,
}

impl ObjectData {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            properties: IndexMap::new(),
            prototype: None,
            internals: None,
        }
    }

    pub fn with_prototype(mut self, prototype: Option<ValueRef>) -> Self {
        self.prototype = prototype;
        self
    }
}

pub enum ObjectKind {
    Ordinary,
    Array(Vec<ValueRef>),
    Function(FunctionData),
    Error(ErrorKind),
    Template(TemplateData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    TypeError,
    RangeError,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::RangeError => "RangeError",
        }
    }
}

pub struct FunctionData {
    pub callback: NativeCallback,
    /// Template this function was instantiated from, if any.
    pub template: Option<ValueRef>,
}

/// Host-side description of a constructor: its invocation callback, the
/// methods installed on instances' prototype, and the cached function once
/// the template has been instantiated.
pub struct TemplateData {
    pub callback: NativeCallback,
    pub class_name: Option<String>,
    pub methods: IndexMap<String, ValueRef>,
    pub internal_field_count: usize,
    pub function: Option<ValueRef>,
}

/// Native block owned by a class instance. The instance is its only owner.
pub struct Internals {
    pub data: Box<dyn Any>,
    pub finalizer: Option<Finalizer>,
}

/// Runs when the owning instance is collected, before the block is dropped.
pub type Finalizer = Rc<dyn Fn(&mut dyn Any)>;

/// Garbage collector statistics
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Total number of collections
    pub collections: usize,

    /// Total objects freed
    pub objects_freed: usize,

    /// Total bytes freed
    pub bytes_freed: usize,

    /// Total pause time across all collections
    pub total_pause_time: Duration,

    /// Last collection duration
    pub last_pause_time: Duration,

    /// Maximum pause time
    pub max_pause_time: Duration,

    /// Objects marked in last collection
    pub last_marked_count: usize,

    /// Objects freed in last collection
    pub last_freed_count: usize,

    /// Bytes freed in last collection
    pub last_freed_bytes: usize,

    /// Instances whose native block was finalized in last collection
    pub last_finalized_count: usize,

    /// Live objects after last collection
    pub live_objects: usize,

    /// Live bytes after last collection
    pub live_bytes: usize,
}

impl GcStats {
    fn update(&mut self, pause: Duration, marked: usize, freed: usize, freed_bytes: usize) {
        self.collections += 1;
        self.objects_freed += freed;
        self.bytes_freed += freed_bytes;
        self.total_pause_time += pause;
        self.last_pause_time = pause;
        self.max_pause_time = self.max_pause_time.max(pause);
        self.last_marked_count = marked;
        self.last_freed_count = freed;
        self.last_freed_bytes = freed_bytes;
    }
}

struct Entry {
    value: HeapValue,
    bytes: usize,
    marked: bool,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    used_bytes: usize,
    max_bytes: Option<usize>,
    stats: GcStats,
}

impl Heap {
    pub fn new(max_bytes: Option<usize>, initial_bytes: Option<usize>) -> Self {
        let capacity = initial_bytes.map(|bytes| bytes / CELL_OVERHEAD).unwrap_or(0);
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            used_bytes: 0,
            max_bytes,
            stats: GcStats::default(),
        }
    }

    /// Allocate a cell, failing if the heap limit would be exceeded.
    pub fn allocate(&mut self, value: HeapValue) -> Result<ValueRef, HostError> {
        let bytes = estimate_size(&value);
        self.ensure_headroom(bytes)?;
        Ok(self.insert(value, bytes))
    }

    /// Fail unless `bytes` more can be accounted without exceeding the limit.
    pub fn ensure_headroom(&self, bytes: usize) -> Result<(), HostError> {
        match self.max_bytes {
            Some(limit) if self.used_bytes.saturating_add(bytes) > limit => {
                Err(self.exhausted(bytes))
            }
            _ => Ok(()),
        }
    }

    pub fn exhausted(&self, requested: usize) -> HostError {
        HostError::HeapExhausted {
            requested,
            used: self.used_bytes,
            limit: self.max_bytes.unwrap_or(usize::MAX),
        }
    }

    /// Charge `bytes` of growth to the live cell `r`.
    ///
    /// The growth is released together with the cell when it is swept.
    pub fn grow(&mut self, r: ValueRef, bytes: usize) -> Result<(), HostError> {
        if bytes == 0 {
            return Ok(());
        }
        self.ensure_headroom(bytes)?;
        let Some(entry) = self.entry_mut(r) else {
            return Ok(());
        };
        if entry.bytes == 0 {
            // permanent cells stay outside the accounting
            return Ok(());
        }
        entry.bytes += bytes;
        self.used_bytes += bytes;
        Ok(())
    }

    /// Allocate a cell that is exempt from the heap limit. Used for the
    /// isolate's permanent values.
    pub fn allocate_permanent(&mut self, value: HeapValue) -> ValueRef {
        self.insert(value, 0)
    }

    fn insert(&mut self, value: HeapValue, bytes: usize) -> ValueRef {
        self.used_bytes += bytes;
        let entry = Entry {
            value,
            bytes,
            marked: false,
        };
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                ValueRef {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                ValueRef {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn entry(&self, r: ValueRef) -> Option<&Entry> {
        match self.slots.get(r.index as usize) {
            Some(slot) if slot.generation == r.generation => slot.entry.as_ref(),
            _ => None,
        }
    }

    fn entry_mut(&mut self, r: ValueRef) -> Option<&mut Entry> {
        match self.slots.get_mut(r.index as usize) {
            Some(slot) if slot.generation == r.generation => slot.entry.as_mut(),
            _ => None,
        }
    }

    pub fn contains(&self, r: ValueRef) -> bool {
        self.entry(r).is_some()
    }

    /// Read a live cell.
    ///
    /// Every reference handed out by the isolate is rooted while reachable
    /// through the public API, so a stale reference here is an internal bug.
    pub fn get(&self, r: ValueRef) -> &HeapValue {
        match self.entry(r) {
            Some(entry) => &entry.value,
            None => panic!("stale host value reference {:?}", r),
        }
    }

    pub fn get_mut(&mut self, r: ValueRef) -> &mut HeapValue {
        match self.entry_mut(r) {
            Some(entry) => &mut entry.value,
            None => panic!("stale host value reference {:?}", r),
        }
    }

    pub fn object(&self, r: ValueRef) -> Option<&ObjectData> {
        self.get(r).as_object()
    }

    pub fn object_mut(&mut self, r: ValueRef) -> Option<&mut ObjectData> {
        match self.get_mut(r) {
            HeapValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn live_objects(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Mark from `roots` and sweep everything unreachable.
    ///
    /// Returns the native blocks of collected instances. The caller runs
    /// their finalizers once the heap is no longer borrowed.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = ValueRef>) -> Vec<Internals> {
        let start = Instant::now();

        let mut worklist: Vec<ValueRef> = roots.into_iter().collect();
        let mut marked = 0;
        while let Some(r) = worklist.pop() {
            let Some(entry) = self.entry_mut(r) else {
                continue;
            };
            if entry.marked {
                continue;
            }
            entry.marked = true;
            marked += 1;
            if let HeapValue::Object(obj) = &entry.value {
                trace_object(obj, &mut worklist);
            }
        }

        let mut finalizable = Vec::new();
        let mut freed = 0;
        let mut freed_bytes = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot.entry.take() {
                Some(mut entry) if entry.marked => {
                    entry.marked = false;
                    slot.entry = Some(entry);
                }
                Some(entry) => {
                    freed += 1;
                    freed_bytes += entry.bytes;
                    if let HeapValue::Object(ObjectData {
                        internals: Some(internals),
                        ..
                    }) = entry.value
                    {
                        finalizable.push(internals);
                    }
                    slot.generation = slot.generation.wrapping_add(1);
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        self.used_bytes -= freed_bytes;

        self.stats
            .update(start.elapsed(), marked, freed, freed_bytes);
        self.stats.last_finalized_count = finalizable.len();
        self.stats.live_objects = self.live_objects();
        self.stats.live_bytes = self.used_bytes;
        finalizable
    }
}

fn trace_object(obj: &ObjectData, worklist: &mut Vec<ValueRef>) {
    worklist.extend(obj.properties.values().copied());
    worklist.extend(obj.prototype);
    match &obj.kind {
        ObjectKind::Ordinary | ObjectKind::Error(_) => {}
        ObjectKind::Array(elements) => worklist.extend(elements.iter().copied()),
        ObjectKind::Function(function) => worklist.extend(function.template),
        ObjectKind::Template(template) => {
            worklist.extend(template.methods.values().copied());
            worklist.extend(template.function);
        }
    }
}

fn estimate_size(value: &HeapValue) -> usize {
    let payload = match value {
        HeapValue::String(s) => s.len(),
        HeapValue::Object(obj) => {
            let elements = match &obj.kind {
                ObjectKind::Array(elements) => elements.len(),
                _ => 0,
            };
            (obj.properties.len() + elements).saturating_mul(SLOT_BYTES)
        }
        _ => 0,
    };
    CELL_OVERHEAD + payload
}
