//! Persistent roots.
//!
//! A [`Persistent`] owns one slot of its isolate's persistent table and keeps
//! the referent reachable until it is reset, released or dropped. The value
//! itself is only an index and a generation, so it can be stored in native
//! structs and moved across threads; reading it back into a [`Handle`]
//! requires a context on the owning isolate.

use crate::runtime::context::internal::ContextInternal;
use crate::runtime::context::Context;
use crate::runtime::error::HostError;
use crate::runtime::handle::{Handle, Value};
use crate::runtime::heap::ValueRef;
use crate::runtime::isolate::{Isolate, IsolateId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

/// Reference to a slot of a [`PersistentTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PersistentRef {
    index: u32,
    generation: u32,
}

struct Cell {
    generation: u32,
    value: Option<ValueRef>,
}

/// Stable-address roots owned by native code.
#[derive(Default)]
pub struct PersistentTable {
    cells: Vec<Cell>,
    free: Vec<u32>,
    live: usize,
}

impl PersistentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: ValueRef) -> PersistentRef {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let cell = &mut self.cells[index as usize];
                cell.value = Some(value);
                PersistentRef {
                    index,
                    generation: cell.generation,
                }
            }
            None => {
                let index = self.cells.len() as u32;
                self.cells.push(Cell {
                    generation: 0,
                    value: Some(value),
                });
                PersistentRef {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn cell_mut(&mut self, slot: PersistentRef) -> Option<&mut Cell> {
        self.cells
            .get_mut(slot.index as usize)
            .filter(|cell| cell.generation == slot.generation && cell.value.is_some())
    }

    pub fn get(&self, slot: PersistentRef) -> Option<ValueRef> {
        let cell = self.cells.get(slot.index as usize)?;
        if cell.generation == slot.generation {
            cell.value
        } else {
            None
        }
    }

    /// Point an occupied slot at a new referent.
    pub fn set(&mut self, slot: PersistentRef, value: ValueRef) -> bool {
        match self.cell_mut(slot) {
            Some(cell) => {
                cell.value = Some(value);
                true
            }
            None => false,
        }
    }

    /// Free a slot. Stale or already-freed references are ignored.
    pub fn free(&mut self, slot: PersistentRef) -> bool {
        let Some(cell) = self.cell_mut(slot) else {
            return false;
        };
        cell.value = None;
        cell.generation = cell.generation.wrapping_add(1);
        self.free.push(slot.index);
        self.live -= 1;
        true
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn values(&self) -> impl Iterator<Item = ValueRef> + '_ {
        self.cells.iter().filter_map(|cell| cell.value)
    }
}

struct Slot {
    isolate: IsolateId,
    reference: PersistentRef,
    releaser: Mutex<Sender<PersistentRef>>,
}

/// An owned root keeping a host value of kind `T` alive across scopes and
/// threads.
///
/// Dropping a non-empty persistent queues its slot for release on the owning
/// isolate's thread; the slot is freed at the next safe point.
pub struct Persistent<T: Value> {
    slot: Option<Slot>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Value> fmt::Debug for Persistent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Persistent");
        s.field("kind", &T::name());
        if let Some(slot) = &self.slot {
            s.field("isolate", &slot.isolate)
                .field("reference", &slot.reference);
        }
        s.finish()
    }
}

impl<T: Value> Default for Persistent<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Value> Persistent<T> {
    /// An empty persistent.
    pub fn new() -> Self {
        Self {
            slot: None,
            _marker: PhantomData,
        }
    }

    pub(crate) fn from_handle<'a, C: Context<'a>>(cx: &mut C, handle: Handle<'_, T>) -> Self {
        let mut persistent = Self::new();
        persistent.store(cx, handle);
        persistent
    }

    fn store<'a, C: Context<'a>>(&mut self, cx: &mut C, handle: Handle<'_, T>) {
        cx.check_live(&handle);
        let isolate = cx.isolate();
        let reference = isolate.persistents().insert(handle.to_raw());
        self.slot = Some(Slot {
            isolate: isolate.id(),
            reference,
            releaser: Mutex::new(isolate.release_sender()),
        });
    }

    /// Store a new referent, releasing the previous one.
    pub fn reset<'a, 'b, C: Context<'a>>(
        &mut self,
        cx: &mut C,
        handle: Handle<'b, T>,
    ) -> Result<(), HostError> {
        match &self.slot {
            Some(slot) => {
                let isolate = cx.isolate();
                if slot.isolate != isolate.id() {
                    return Err(HostError::WrongIsolate {
                        expected: slot.isolate,
                        actual: isolate.id(),
                    });
                }
                cx.check_live(&handle);
                if !isolate.persistents().set(slot.reference, handle.to_raw()) {
                    // The slot was freed behind our back; take a fresh one.
                    self.slot = None;
                    self.store(cx, handle);
                }
            }
            None => self.store(cx, handle),
        }
        Ok(())
    }

    /// A handle to the referent, rooted in `cx`'s region.
    pub fn read<'a, C: Context<'a>>(&self, cx: &mut C) -> Result<Handle<'a, T>, HostError> {
        let slot = self.slot.as_ref().ok_or(HostError::EmptyPersistent)?;
        let isolate = cx.isolate();
        if slot.isolate != isolate.id() {
            return Err(HostError::WrongIsolate {
                expected: slot.isolate,
                actual: isolate.id(),
            });
        }
        let raw = isolate
            .persistents()
            .get(slot.reference)
            .ok_or(HostError::EmptyPersistent)?;
        Ok(cx.handle(raw))
    }

    /// Release the referent. Releasing an empty persistent is a no-op.
    pub fn release<'a, C: Context<'a>>(&mut self, cx: &mut C) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let isolate = cx.isolate();
        if slot.isolate == isolate.id() {
            isolate.persistents().free(slot.reference);
        } else {
            slot.queue_release();
        }
    }

    /// Read the referent and release the persistent in one step.
    pub fn into_inner<'a, C: Context<'a>>(mut self, cx: &mut C) -> Result<Handle<'a, T>, HostError> {
        let handle = self.read(cx)?;
        self.release(cx);
        Ok(handle)
    }

    /// A second persistent to the same referent.
    pub fn clone_in<'a, C: Context<'a>>(&self, cx: &mut C) -> Result<Self, HostError> {
        let handle = self.read(cx)?;
        Ok(Self::from_handle(cx, handle))
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    /// The referent on `isolate`, without rooting it in any region.
    pub(crate) fn get_raw(&self, isolate: &Isolate) -> Option<ValueRef> {
        let slot = self.slot.as_ref()?;
        if slot.isolate != isolate.id() {
            return None;
        }
        isolate.persistents().get(slot.reference)
    }

    pub fn isolate_id(&self) -> Option<IsolateId> {
        self.slot.as_ref().map(|slot| slot.isolate)
    }
}

impl Slot {
    fn queue_release(self) {
        if let Ok(releaser) = self.releaser.lock() {
            // The isolate may already be gone, in which case its table is too.
            let _ = releaser.send(self.reference);
        }
    }
}

impl<T: Value> Drop for Persistent<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.queue_release();
        }
    }
}
