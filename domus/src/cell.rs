use std::{
    cell::Cell,
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use crate::{Value, Visitable, Visitor};

static NEXT_STORE_ID: AtomicUsize = AtomicUsize::new(1);
// process wide, a serial never repeats across stores
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`crate::ValueStore`], stored in every cell it owns.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StoreId(NonZeroUsize);

impl StoreId {
    pub(crate) fn next() -> Self {
        let raw = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroUsize::new(raw).expect("store id counter wrapped"))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Buffer,
    Array,
    Mapping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    String(String),
    Buffer(Vec<u8>),
    Array(Vec<Value>),
    /// Insertion ordered pairs, keys compare by word identity.
    Mapping(Vec<(Value, Value)>),
}

/// A garbage collected cell.
///
/// `owner` doubles as the mark bit: at rest it always names the owning store,
/// during a collection `None` means "reached this pass". Only the store flips
/// it, see [`crate::ValueStore::mark`].
///
/// `serial` is unique for the life of the process. Handles carry it so a
/// handle to a freed cell does not match a new cell at the same address.
#[derive(Debug)]
pub struct HeapValue {
    owner: Cell<Option<StoreId>>,
    slot: Cell<usize>,
    serial: u64,
    payload: Payload,
}

impl HeapValue {
    pub(crate) fn new(owner: StoreId, payload: Payload) -> Self {
        Self {
            owner: Cell::new(Some(owner)),
            slot: Cell::new(0),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            payload,
        }
    }

    #[inline]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    #[inline]
    pub(crate) fn owner(&self) -> Option<StoreId> {
        self.owner.get()
    }

    #[inline]
    pub(crate) fn set_owner(&self, owner: Option<StoreId>) {
        self.owner.set(owner);
    }

    /// Position inside a compacting store, meaningless for keyed storage.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot.get()
    }

    #[inline]
    pub(crate) fn set_slot(&self, slot: usize) {
        self.slot.set(slot);
    }

    #[inline]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn kind(&self) -> ValueKind {
        self.payload.kind()
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.payload {
            Payload::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match &self.payload {
            Payload::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match &mut self.payload {
            Payload::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl Payload {
    pub fn kind(&self) -> ValueKind {
        match self {
            Payload::String(_) => ValueKind::String,
            Payload::Buffer(_) => ValueKind::Buffer,
            Payload::Array(_) => ValueKind::Array,
            Payload::Mapping(_) => ValueKind::Mapping,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Payload::Array(_) | Payload::Mapping(_))
    }

    pub fn mapping_get(&self, key: Value) -> Option<Value> {
        match self {
            Payload::Mapping(pairs) => pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|&(_, v)| v),
            _ => None,
        }
    }

    /// Inserts or replaces, returning the previous value for `key`.
    /// Returns `None` without storing anything if this is not a mapping.
    pub fn mapping_insert(&mut self, key: Value, value: Value) -> Option<Value> {
        let Payload::Mapping(pairs) = self else {
            return None;
        };
        match pairs.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                pairs.push((key, value));
                None
            }
        }
    }
}

impl Visitable for Payload {
    #[inline]
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        match self {
            Payload::String(_) | Payload::Buffer(_) => (),
            Payload::Array(items) => items.visit_edges(visitor),
            Payload::Mapping(pairs) => pairs.iter().for_each(|&(k, v)| {
                if k.is_reference() {
                    visitor.visit(k);
                }
                if v.is_reference() {
                    visitor.visit(v);
                }
            }),
        }
    }
}

impl Visitable for HeapValue {
    #[inline]
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        self.payload.visit_edges(visitor);
    }
}
