//! Raw memory access for the collector.
//!
//! Nothing else in the crate reads memory as untyped words.
use std::{hint, ptr};

use crate::WORD_SIZE;

/// A memory range the collector reads word by word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRegion {
    /// Stack window between two stack positions. Both ends are excluded and
    /// the order of `start` and `end` does not matter.
    Stack { start: usize, end: usize },
    /// A whole block `[start, start + len)`.
    Block { start: usize, len: usize },
}

impl ScanRegion {
    /// First word address and exclusive end of the words to read.
    fn word_range(self) -> (usize, usize) {
        match self {
            ScanRegion::Stack { start, end } => {
                let lo = start.min(end);
                let hi = start.max(end);
                (align_up(lo + 1), hi)
            }
            ScanRegion::Block { start, len } => (align_up(start), start + len),
        }
    }

    /// Number of whole words the region covers.
    pub fn word_count(self) -> usize {
        let (first, end) = self.word_range();
        end.saturating_sub(first) / WORD_SIZE
    }
}

#[inline]
fn align_up(addr: usize) -> usize {
    (addr + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

/// Hands every address-sized word of `region` to `visit`, returns how many
/// words were read.
///
/// # Safety
/// every word of the region must be mapped and readable for the whole call.
pub unsafe fn scan_words(region: ScanRegion, mut visit: impl FnMut(usize)) -> usize {
    let (mut p, end) = region.word_range();
    let mut words = 0;
    while p + WORD_SIZE <= end {
        // SAFETY: by contract the region is readable, stale stack slots are
        // read volatile because they are not owned by any Rust value
        let word = unsafe { ptr::read_volatile(p as *const usize) };
        visit(word);
        words += 1;
        p += WORD_SIZE;
    }
    words
}

/// Address of a stack slot owned by the caller.
///
/// A window anchored here covers every frame the caller calls into later.
#[inline(always)]
pub fn stack_anchor(slot: &usize) -> usize {
    hint::black_box(slot as *const usize) as usize
}

/// Approximate current stack position, below every frame of the caller.
#[inline(never)]
pub fn stack_pointer() -> usize {
    let marker = 0usize;
    stack_anchor(&marker)
}

#[cfg(target_arch = "x86_64")]
pub const SPILLED_REGISTERS: usize = 6;
#[cfg(target_arch = "aarch64")]
pub const SPILLED_REGISTERS: usize = 11;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const SPILLED_REGISTERS: usize = 0;

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn spill(regs: &mut [usize; SPILLED_REGISTERS]) {
    // SAFETY: only stores into `regs`, no register or flag is modified
    unsafe {
        std::arch::asm!(
            "mov [{p}], rbx",
            "mov [{p} + 8], rbp",
            "mov [{p} + 16], r12",
            "mov [{p} + 24], r13",
            "mov [{p} + 32], r14",
            "mov [{p} + 40], r15",
            p = in(reg) regs.as_mut_ptr(),
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn spill(regs: &mut [usize; SPILLED_REGISTERS]) {
    // SAFETY: only stores into `regs`, no register or flag is modified
    unsafe {
        std::arch::asm!(
            "stp x19, x20, [{p}]",
            "stp x21, x22, [{p}, #16]",
            "stp x23, x24, [{p}, #32]",
            "stp x25, x26, [{p}, #48]",
            "stp x27, x28, [{p}, #64]",
            "str x29, [{p}, #80]",
            p = in(reg) regs.as_mut_ptr(),
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
fn spill(_regs: &mut [usize; SPILLED_REGISTERS]) {}

/// Runs `f` with the caller's callee-saved registers stored in this frame.
///
/// A value that only lives in a register of some caller frame is not on the
/// stack yet. Any stack window that ends inside `f` covers the spilled copy.
#[inline(never)]
pub fn with_spilled_registers<R>(f: impl FnOnce() -> R) -> R {
    let mut regs = [0usize; SPILLED_REGISTERS];
    spill(&mut regs);
    let result = f();
    hint::black_box(&regs);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_scan_reads_every_word() {
        let words = [1usize, 2, 3, 4];
        let region = ScanRegion::Block {
            start: words.as_ptr() as usize,
            len: std::mem::size_of_val(&words),
        };
        let mut seen = Vec::new();
        let count = unsafe { scan_words(region, |w| seen.push(w)) };
        assert_eq!(count, 4);
        assert_eq!(region.word_count(), 4);
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn stack_scan_excludes_both_ends() {
        let words = [10usize, 20, 30, 40, 50];
        let base = words.as_ptr() as usize;
        let region = ScanRegion::Stack {
            start: base + 4 * WORD_SIZE,
            end: base,
        };
        let mut seen = Vec::new();
        unsafe { scan_words(region, |w| seen.push(w)) };
        assert_eq!(seen, vec![20, 30, 40]);

        let reversed = ScanRegion::Stack {
            start: base,
            end: base + 4 * WORD_SIZE,
        };
        let mut again = Vec::new();
        unsafe { scan_words(reversed, |w| again.push(w)) };
        assert_eq!(again, seen, "direction must not matter");
    }

    #[test]
    fn empty_regions_read_nothing() {
        let word = 7usize;
        let addr = &word as *const usize as usize;
        let stack = ScanRegion::Stack {
            start: addr,
            end: addr,
        };
        let block = ScanRegion::Block { start: addr, len: 0 };
        assert_eq!(unsafe { scan_words(stack, |_| panic!("read")) }, 0);
        assert_eq!(unsafe { scan_words(block, |_| panic!("read")) }, 0);
    }

    #[inline(never)]
    fn deeper() -> usize {
        stack_pointer()
    }

    #[test]
    fn spilled_registers_sit_between_caller_and_callee() {
        let anchor = 0usize;
        let top = stack_anchor(&anchor);
        let (inner, result) = with_spilled_registers(|| (stack_pointer(), 42));
        assert_eq!(result, 42);
        assert!(inner < top);

        // the spill frame is part of any window from an outer anchor to `inner`
        let window = ScanRegion::Stack { start: top, end: inner };
        assert!(window.word_count() >= SPILLED_REGISTERS);
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn spill_stores_register_contents() {
        const POISON: usize = 0x5a5a_5a5a;
        let mut regs = [POISON; SPILLED_REGISTERS];
        spill(&mut regs);
        assert!(regs.iter().any(|&r| r != POISON));
    }

    #[test]
    fn stack_pointer_descends_into_callees() {
        let anchor = 0usize;
        let top = stack_anchor(&anchor);
        assert!(deeper() < top, "stack is expected to grow downwards");
    }
}
