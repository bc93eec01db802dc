//! Program descriptors and the root objects instantiated from them.
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{DomainId, Value, WORD_SIZE, scan::ScanRegion};

/// Compiled program as far as the heap cares: how big its instances are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    name: String,
    member_count: usize,
}

impl Program {
    pub fn new(name: impl Into<String>, member_count: usize) -> Self {
        Self {
            name: name.into(),
            member_count,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn member_count(&self) -> usize {
        self.member_count
    }

    /// Bytes of the member block of one instance.
    #[inline]
    pub fn entire_object_size(&self) -> usize {
        self.member_count * WORD_SIZE
    }
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle of a root object joined to a domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Instance of a [`Program`] whose members are GC roots of its domain.
pub struct RootObject {
    id: ObjectId,
    domain: DomainId,
    program: Arc<Program>,
    // contiguous, scanned word by word
    members: Box<[Value]>,
}

impl RootObject {
    pub fn new(domain: DomainId, program: Arc<Program>) -> Self {
        let members = vec![Value::nil(); program.member_count()].into_boxed_slice();
        debug_assert_eq!(
            std::mem::size_of_val(&*members),
            program.entire_object_size()
        );
        Self {
            id: ObjectId::next(),
            domain,
            program,
            members,
        }
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    pub fn owning_domain(&self) -> DomainId {
        self.domain
    }

    #[inline]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    #[inline]
    pub fn members(&self) -> &[Value] {
        &self.members
    }

    #[inline]
    pub fn member(&self, index: usize) -> Option<Value> {
        self.members.get(index).copied()
    }

    /// Stores `value` in member `index`, returns the previous value.
    ///
    /// # Panics
    /// if `index` is out of range for the program.
    pub fn set_member(&mut self, index: usize, value: Value) -> Value {
        let count = self.members.len();
        let slot = self
            .members
            .get_mut(index)
            .unwrap_or_else(|| panic!("member {index} out of range for {count} members"));
        std::mem::replace(slot, value)
    }

    /// Member block as a root region.
    #[inline]
    pub fn region(&self) -> ScanRegion {
        ScanRegion::Block {
            start: self.members.as_ptr() as usize,
            len: self.program.entire_object_size(),
        }
    }
}

impl fmt::Debug for RootObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootObject")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("program", &self.program.name())
            .field("members", &self.members)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_size_is_whole_words() {
        let program = Program::new("point", 3);
        assert_eq!(program.entire_object_size(), 3 * WORD_SIZE);
    }

    #[test]
    fn members_start_nil_and_cover_the_region() {
        let program = Arc::new(Program::new("pair", 2));
        let mut obj = RootObject::new(DomainId::new(0, 1), program);
        assert_eq!(obj.members(), &[Value::nil(), Value::nil()]);
        assert_eq!(obj.set_member(1, Value::from_fixnum(9)), Value::nil());
        assert_eq!(obj.member(1), Some(Value::from_fixnum(9)));
        assert_eq!(obj.member(2), None);

        let mut words = Vec::new();
        unsafe { crate::scan::scan_words(obj.region(), |w| words.push(w)) };
        assert_eq!(words, vec![0, Value::from_fixnum(9).raw()]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn member_index_is_checked() {
        let mut obj = RootObject::new(DomainId::new(0, 1), Arc::new(Program::new("empty", 0)));
        obj.set_member(0, Value::nil());
    }

    #[test]
    fn object_ids_are_unique() {
        let program = Arc::new(Program::new("p", 1));
        let a = RootObject::new(DomainId::new(0, 1), program.clone());
        let b = RootObject::new(DomainId::new(0, 1), program);
        assert_ne!(a.id(), b.id());
    }
}
