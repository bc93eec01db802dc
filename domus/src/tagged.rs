//! Value: a machine word that is either nil, a small integer or a reference.
//!
//! References are stored untagged, the word *is* the address of the
//! [`HeapValue`]. That keeps every block of `Value`s readable by the
//! conservative scanner without any decoding: a word found on a stack or in a
//! root object either equals the address of a live cell or it does not.
//!
//! ValueRef: a non-owning handle to a heap value, its address plus the
//! serial the value was allocated with. Access always goes through the owning
//! store, which checks both, so a handle to a freed value never resolves to a
//! newer value that happens to reuse the address.
use std::{fmt, mem, ptr::NonNull};

use crate::HeapValue;

#[repr(usize)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueTag {
    Reference = 0b0,
    Fixnum = 0b1,
}

pub const VALUE_TAG_MASK: usize = 0b1;

/// Size of one scanned word.
pub const WORD_SIZE: usize = mem::size_of::<usize>();

/// A generic Value
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Value(usize);

/// Handle to a [`HeapValue`] owned by some store.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ValueRef {
    ptr: NonNull<HeapValue>,
    serial: u64,
}

// SAFETY: a ValueRef is never dereferenced, stores only use it as a lookup key
// while the owning domain is held
unsafe impl Send for ValueRef {}
// SAFETY: see above
unsafe impl Sync for ValueRef {}

impl Value {
    #[inline]
    pub const fn nil() -> Self {
        Self(0)
    }

    /// Tags a small integer. The top bit does not survive the shift.
    #[inline]
    pub fn from_fixnum(value: i64) -> Self {
        let shifted = (value as isize).wrapping_shl(1) as usize;
        Self(shifted | ValueTag::Fixnum as usize)
    }

    #[inline]
    pub fn from_ref(value: ValueRef) -> Self {
        Self(value.addr())
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_fixnum(self) -> bool {
        self.0 & VALUE_TAG_MASK == ValueTag::Fixnum as usize
    }

    #[inline]
    pub fn is_reference(self) -> bool {
        !self.is_nil() && self.0 & VALUE_TAG_MASK == ValueTag::Reference as usize
    }

    #[inline]
    pub fn as_fixnum(self) -> Option<i64> {
        self.is_fixnum().then(|| ((self.0 as isize) >> 1) as i64)
    }
}

impl ValueRef {
    #[inline]
    pub(crate) fn from_ptr(ptr: NonNull<HeapValue>, serial: u64) -> Self {
        debug_assert_eq!(
            ptr.as_ptr() as usize & VALUE_TAG_MASK,
            0,
            "heap values must be aligned so the tag bit is free"
        );
        Self { ptr, serial }
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Allocation serial of the value this handle was created for.
    #[inline]
    pub fn serial(self) -> u64 {
        self.serial
    }

    /// The bare address word, as stored in payloads and root objects.
    #[inline]
    pub fn as_value(self) -> Value {
        Value::from_ref(self)
    }
}

impl From<ValueRef> for Value {
    fn from(value: ValueRef) -> Self {
        value.as_value()
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::from_fixnum(value)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("nil")
        } else if let Some(n) = self.as_fixnum() {
            write!(f, "{n}")
        } else {
            write!(f, "ref({:#x})", self.0)
        }
    }
}

impl fmt::Debug for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueRef({:#x}#{})", self.addr(), self.serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_is_neither_fixnum_nor_reference() {
        let v = Value::nil();
        assert!(v.is_nil());
        assert!(!v.is_fixnum());
        assert!(!v.is_reference());
        assert_eq!(v, Value::default());
    }

    #[test]
    fn fixnum_sets_low_bit_and_keeps_sign() {
        let v = Value::from_fixnum(-42);
        assert_eq!(v.raw() & 0b1, 1);
        assert!(v.is_fixnum());
        assert!(!v.is_reference());
        assert_eq!(v.as_fixnum(), Some(-42));
        assert_eq!(Value::from(7i64).as_fixnum(), Some(7));
    }

    #[test]
    fn reference_word_is_the_raw_address() {
        let cell = Box::new(0u64);
        let addr = &*cell as *const u64 as usize;
        let ptr = NonNull::new(addr as *mut HeapValue).unwrap();
        let r = ValueRef::from_ptr(ptr, 7);
        let v = Value::from(r);

        assert_eq!(v.raw(), addr, "references must not be tagged");
        assert!(v.is_reference());
        assert_eq!(v.as_fixnum(), None);
        assert_ne!(r, ValueRef::from_ptr(ptr, 8), "serial is part of the identity");
        assert_eq!(ValueRef::from_ptr(ptr, 8).as_value(), v);
    }
}
