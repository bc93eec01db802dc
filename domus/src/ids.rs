//! Paged identifier allocator.
//!
//! Slots are handed out from a free-list stack and the slot space grows one
//! page at a time up to a fixed limit. Every allocation of a slot bumps its
//! generation, so a released id is never handed out again.
use std::fmt;

use crate::{DomainError, Result};

/// Identifier of a domain: `generation << 32 | index`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(u64);

impl DomainId {
    #[inline]
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainId({}.{})", self.index(), self.generation())
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index(), self.generation())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    generation: u32,
    live: bool,
}

#[derive(Debug)]
pub struct IdAllocator {
    page_size: usize,
    max_pages: usize,
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl IdAllocator {
    pub fn new(page_size: usize, max_pages: usize) -> Self {
        assert!(page_size > 0, "page size must be positive");
        assert!(
            page_size.checked_mul(max_pages).is_some_and(|n| n <= u32::MAX as usize),
            "id space does not fit a 32 bit index"
        );
        Self {
            page_size,
            max_pages,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn allocate(&mut self) -> Result<DomainId> {
        if self.free.is_empty() {
            self.grow()?;
        }
        let Some(index) = self.free.pop() else {
            unreachable!("grow always refills the free list");
        };
        let slot = &mut self.slots[index as usize];
        debug_assert!(!slot.live, "free list handed out a live slot");
        slot.generation = slot.generation.wrapping_add(1);
        slot.live = true;
        self.live += 1;
        Ok(DomainId::new(index, slot.generation))
    }

    pub fn release(&mut self, id: DomainId) -> Result<()> {
        match self.slots.get_mut(id.index() as usize) {
            Some(slot) if slot.live && slot.generation == id.generation() => {
                slot.live = false;
                self.free.push(id.index());
                self.live -= 1;
                Ok(())
            }
            _ => Err(DomainError::UnknownId(id)),
        }
    }

    pub fn is_live(&self, id: DomainId) -> bool {
        self.slots
            .get(id.index() as usize)
            .is_some_and(|slot| slot.live && slot.generation == id.generation())
    }

    /// Ids currently handed out.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Slots in the pages grown so far.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn pages(&self) -> usize {
        self.slots.len() / self.page_size
    }

    fn grow(&mut self) -> Result<()> {
        let pages = self.pages();
        if pages >= self.max_pages {
            return Err(DomainError::IdSpaceExhausted { pages });
        }
        let start = self.slots.len();
        let end = start + self.page_size;
        self.slots.resize(end, Slot::default());
        // lowest index on top of the stack
        self.free.extend((start as u32..end as u32).rev());
        log::trace!("ids: grew to {} pages", pages + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_grow_by_pages() {
        let mut ids = IdAllocator::new(4, 3);
        assert_eq!(ids.pages(), 0);

        let first: Vec<_> = (0..4).map(|_| ids.allocate().unwrap()).collect();
        assert_eq!(
            first.iter().map(|id| id.index()).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(ids.pages(), 1);
        assert_eq!(ids.capacity(), 4);

        ids.allocate().unwrap();
        assert_eq!(ids.pages(), 2);
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut ids = IdAllocator::new(2, 2);
        for _ in 0..4 {
            ids.allocate().unwrap();
        }
        assert_eq!(
            ids.allocate(),
            Err(DomainError::IdSpaceExhausted { pages: 2 })
        );
    }

    #[test]
    fn released_slots_are_reused_with_a_new_generation() {
        let mut ids = IdAllocator::new(2, 1);
        let a = ids.allocate().unwrap();
        let _b = ids.allocate().unwrap();
        ids.release(a).unwrap();
        assert!(!ids.is_live(a));

        let c = ids.allocate().unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a, "a full id is never handed out twice");
        assert_eq!(c.generation(), a.generation() + 1);
        assert!(ids.is_live(c));
    }

    #[test]
    fn stale_and_unknown_ids_are_rejected() {
        let mut ids = IdAllocator::new(2, 1);
        let a = ids.allocate().unwrap();
        ids.release(a).unwrap();
        assert_eq!(ids.release(a), Err(DomainError::UnknownId(a)));

        let bogus = DomainId::new(17, 1);
        assert_eq!(ids.release(bogus), Err(DomainError::UnknownId(bogus)));
        assert!(ids.is_empty());
    }

    #[test]
    fn display_shows_index_and_generation() {
        let id = DomainId::new(3, 2);
        assert_eq!(id.to_string(), "3.2");
        assert_eq!(id.raw(), (2u64 << 32) | 3);
    }
}
