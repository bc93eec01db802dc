//! Heap value store.
//!
//! A store owns every [`HeapValue`] of one domain. Two interchangeable
//! storage strategies exist and the collector only ever talks to the store:
//! - [`DenseStorage`]: boxes in a vector, survivors are compacted to the front
//!   after a sweep (swap-and-shrink) and their slot index is rewritten.
//! - [`KeyedStorage`]: boxes in a hash map keyed by address, sweeping removes
//!   entries in place.
//!
//! Cells are individually boxed in both cases, so a cell's address never
//! changes while it is alive. Compaction only moves the box pointer.
use std::{
    collections::HashMap,
    mem,
    ptr::NonNull,
};

use crate::{HeapValue, Payload, StoreId, Value, ValueRef};

#[cfg(windows)]
pub type DefaultStorage = KeyedStorage;
#[cfg(not(windows))]
pub type DefaultStorage = DenseStorage;

/// Ownership container behind a [`ValueStore`].
pub trait Storage: Default {
    fn insert(&mut self, value: Box<HeapValue>) -> ValueRef;
    fn len(&self) -> usize;
    fn get(&self, addr: usize) -> Option<&HeapValue>;
    fn get_mut(&mut self, addr: usize) -> Option<&mut HeapValue>;
    fn for_each(&self, f: impl FnMut(&HeapValue));
    /// Drops every value `keep` rejects. Each value is offered exactly once.
    fn retain(&mut self, keep: impl FnMut(&HeapValue) -> bool);
    fn clear(&mut self);
}

#[inline]
fn value_ref(value: &HeapValue) -> ValueRef {
    ValueRef::from_ptr(NonNull::from(value), value.serial())
}

#[derive(Debug, Default)]
pub struct DenseStorage {
    values: Vec<Box<HeapValue>>,
    // address -> slot, mirrors HeapValue::slot
    index: HashMap<usize, usize, ahash::RandomState>,
}

impl Storage for DenseStorage {
    fn insert(&mut self, value: Box<HeapValue>) -> ValueRef {
        let slot = self.values.len();
        value.set_slot(slot);
        let r = value_ref(&value);
        self.index.insert(r.addr(), slot);
        self.values.push(value);
        r
    }

    #[inline]
    fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    fn get(&self, addr: usize) -> Option<&HeapValue> {
        let slot = *self.index.get(&addr)?;
        let value: &HeapValue = &self.values[slot];
        debug_assert_eq!(value.slot(), slot, "dense slot out of sync");
        Some(value)
    }

    #[inline]
    fn get_mut(&mut self, addr: usize) -> Option<&mut HeapValue> {
        let slot = *self.index.get(&addr)?;
        Some(&mut *self.values[slot])
    }

    fn for_each(&self, mut f: impl FnMut(&HeapValue)) {
        self.values.iter().for_each(|value| f(&**value));
    }

    fn retain(&mut self, mut keep: impl FnMut(&HeapValue) -> bool) {
        // [live] [live] ... [live] [dead] ... [dead]
        // 0                        offset        len
        let mut offset = 0;
        for i in 0..self.values.len() {
            if !keep(&*self.values[i]) {
                continue;
            }
            if offset != i {
                self.values.swap(offset, i);
                let moved = &self.values[offset];
                moved.set_slot(offset);
                self.index.insert(value_ref(moved).addr(), offset);
            }
            offset += 1;
        }

        for dead in self.values.drain(offset..) {
            self.index.remove(&value_ref(&dead).addr());
        }
        debug_assert_eq!(self.values.len(), self.index.len());
    }

    fn clear(&mut self) {
        self.values.clear();
        self.index.clear();
    }
}

#[derive(Debug, Default)]
pub struct KeyedStorage {
    values: HashMap<usize, Box<HeapValue>, ahash::RandomState>,
}

impl Storage for KeyedStorage {
    fn insert(&mut self, value: Box<HeapValue>) -> ValueRef {
        let r = value_ref(&value);
        self.values.insert(r.addr(), value);
        r
    }

    #[inline]
    fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    fn get(&self, addr: usize) -> Option<&HeapValue> {
        self.values.get(&addr).map(|value| &**value)
    }

    #[inline]
    fn get_mut(&mut self, addr: usize) -> Option<&mut HeapValue> {
        self.values.get_mut(&addr).map(|value| &mut **value)
    }

    fn for_each(&self, mut f: impl FnMut(&HeapValue)) {
        self.values.values().for_each(|value| f(&**value));
    }

    fn retain(&mut self, mut keep: impl FnMut(&HeapValue) -> bool) {
        self.values.retain(|_, value| keep(&**value));
    }

    fn clear(&mut self) {
        self.values.clear();
    }
}

/// Lowest and highest address of any live value, both inclusive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Bounds {
    pub min: usize,
    pub max: usize,
}

impl Bounds {
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.min <= addr && addr <= self.max
    }

    #[inline]
    fn extend(self, addr: usize) -> Self {
        Self {
            min: self.min.min(addr),
            max: self.max.max(addr),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub before: usize,
    pub survivors: usize,
    pub freed: usize,
}

#[derive(Debug)]
pub struct ValueStore<S: Storage = DefaultStorage> {
    id: StoreId,
    storage: S,
    bounds: Option<Bounds>,
}

impl<S: Storage> Default for ValueStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Storage> ValueStore<S> {
    pub fn new() -> Self {
        Self {
            id: StoreId::next(),
            storage: S::default(),
            bounds: None,
        }
    }

    #[inline]
    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn allocate(&mut self, payload: Payload) -> ValueRef {
        let value = Box::new(HeapValue::new(self.id, payload));
        let r = self.storage.insert(value);
        let addr = r.addr();
        self.bounds = Some(match self.bounds {
            Some(bounds) => bounds.extend(addr),
            None => Bounds {
                min: addr,
                max: addr,
            },
        });
        r
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_each(&self, mut visitor: impl FnMut(ValueRef, &HeapValue)) {
        self.storage.for_each(|value| visitor(value_ref(value), value));
    }

    /// The value `value` was handed out for. A handle whose value has been
    /// freed resolves to nothing, even if the address was reused since.
    #[inline]
    pub fn get(&self, value: ValueRef) -> Option<&HeapValue> {
        self.storage
            .get(value.addr())
            .filter(|v| v.serial() == value.serial())
    }

    #[inline]
    pub fn get_mut(&mut self, value: ValueRef) -> Option<&mut HeapValue> {
        self.storage
            .get_mut(value.addr())
            .filter(|v| v.serial() == value.serial())
    }

    #[inline]
    pub fn contains(&self, value: ValueRef) -> bool {
        self.get(value).is_some()
    }

    #[inline]
    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    /// Cheap plausibility test for a scanned word: aligned and inside the
    /// live address range. Does not prove the word names a value.
    #[inline]
    pub fn is_possible_pointer(&self, word: usize) -> bool {
        word & (mem::align_of::<HeapValue>() - 1) == 0
            && self.bounds.is_some_and(|bounds| bounds.contains(word))
    }

    /// The value whose address is exactly `word`, if any.
    #[inline]
    pub fn resolve(&self, word: usize) -> Option<&HeapValue> {
        if !self.is_possible_pointer(word) {
            return None;
        }
        self.storage.get(word)
    }

    /// Handle for the value a stored word names, if it is one of ours.
    #[inline]
    pub fn reference(&self, value: Value) -> Option<ValueRef> {
        if !value.is_reference() {
            return None;
        }
        self.resolve(value.raw()).map(value_ref)
    }

    /// Marks `value` for the current pass, returns false if it already was.
    #[inline]
    pub fn mark(&self, value: &HeapValue) -> bool {
        match value.owner() {
            None => false,
            Some(owner) => {
                debug_assert_eq!(owner, self.id, "value marked by a foreign store");
                value.set_owner(None);
                true
            }
        }
    }

    #[inline]
    pub fn unmark(&self, value: &HeapValue) {
        value.set_owner(Some(self.id));
    }

    #[inline]
    pub fn is_marked(&self, value: &HeapValue) -> bool {
        value.owner().is_none()
    }

    /// Releases every unmarked value and unmarks the survivors.
    pub fn sweep(&mut self) -> SweepOutcome {
        let before = self.len();
        let id = self.id;
        self.storage.retain(|value| match value.owner() {
            None => {
                value.set_owner(Some(id));
                true
            }
            Some(owner) => {
                debug_assert_eq!(owner, id, "corrupted back-reference");
                false
            }
        });
        self.recompute_bounds();

        let survivors = self.len();
        SweepOutcome {
            before,
            survivors,
            freed: before - survivors,
        }
    }

    /// Releases everything, returns how many values were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.len();
        self.storage.clear();
        self.bounds = None;
        count
    }

    fn recompute_bounds(&mut self) {
        let mut bounds: Option<Bounds> = None;
        self.storage.for_each(|value| {
            let addr = value_ref(value).addr();
            bounds = Some(match bounds {
                Some(b) => b.extend(addr),
                None => Bounds {
                    min: addr,
                    max: addr,
                },
            });
        });
        self.bounds = bounds;
    }
}
