//! Thread tokens and per-thread execution contexts.
//!
//! A [`ThreadContext`] describes the part of a thread's stack that belongs to
//! one stay inside a domain: everything between the position where the
//! thread started running there and the position it last reported. The
//! collector scans that window for roots, also while the thread is off
//! running in another domain.
use std::{
    cell::RefCell,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use crate::{DomainId, scan};

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
    static ACTIVE: RefCell<Vec<ActiveFrame>> = const { RefCell::new(Vec::new()) };
}

/// Process unique token of the calling thread, never 0.
pub fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

#[derive(Debug)]
pub struct ThreadContext {
    thread: u64,
    start_sp: usize,
    end_sp: AtomicUsize,
}

impl ThreadContext {
    pub(crate) fn new(start_sp: usize) -> Self {
        Self {
            thread: current_thread_token(),
            start_sp,
            end_sp: AtomicUsize::new(start_sp),
        }
    }

    #[inline]
    pub fn thread(&self) -> u64 {
        self.thread
    }

    #[inline]
    pub fn start_sp(&self) -> usize {
        self.start_sp
    }

    #[inline]
    pub fn end_sp(&self) -> usize {
        self.end_sp.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_end_sp(&self, sp: usize) {
        self.end_sp.store(sp, Ordering::Release);
    }

    /// Stack window scanned for roots.
    #[inline]
    pub fn window(&self) -> scan::ScanRegion {
        scan::ScanRegion::Stack {
            start: self.start_sp,
            end: self.end_sp(),
        }
    }
}

#[derive(Debug)]
struct ActiveFrame {
    domain: DomainId,
    context: Arc<ThreadContext>,
}

/// Records that the calling thread now runs inside `domain`.
pub(crate) fn push_active(domain: DomainId, context: Arc<ThreadContext>) {
    ACTIVE.with(|frames| frames.borrow_mut().push(ActiveFrame { domain, context }));
}

/// Undoes the matching [`push_active`].
pub(crate) fn pop_active(domain: DomainId) -> Arc<ThreadContext> {
    ACTIVE.with(|frames| {
        let frame = frames.borrow_mut().pop();
        match frame {
            Some(frame) if frame.domain == domain => frame.context,
            other => panic!(
                "active context stack out of order: expected {domain}, found {:?}",
                other.map(|f| f.domain)
            ),
        }
    })
}

/// Domain the calling thread currently executes in, if any.
pub fn active_domain() -> Option<DomainId> {
    ACTIVE.with(|frames| frames.borrow().last().map(|f| f.domain))
}

/// Number of domain stays the calling thread has open, the innermost included.
pub fn active_depth() -> usize {
    ACTIVE.with(|frames| frames.borrow().len())
}

/// Moves the end of the calling thread's innermost context to the current
/// stack position. Does nothing unless that context belongs to `domain`.
#[inline(never)]
pub fn refresh_current_context(domain: DomainId) -> bool {
    let sp = scan::stack_pointer();
    ACTIVE.with(|frames| match frames.borrow().last() {
        Some(frame) if frame.domain == domain => {
            frame.context.set_end_sp(sp);
            true
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn id(index: u32) -> DomainId {
        DomainId::new(index, 1)
    }

    #[test]
    fn tokens_are_per_thread() {
        let here = current_thread_token();
        assert_ne!(here, 0);
        assert_eq!(here, current_thread_token());
        let there = thread::spawn(current_thread_token).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn frames_nest_and_refresh_the_innermost() {
        let outer = Arc::new(ThreadContext::new(scan::stack_pointer()));
        let inner = Arc::new(ThreadContext::new(scan::stack_pointer()));
        assert_eq!(active_domain(), None);

        push_active(id(1), outer.clone());
        push_active(id(2), inner.clone());
        assert_eq!(active_domain(), Some(id(2)));
        assert_eq!(active_depth(), 2);

        let outer_end = outer.end_sp();
        assert!(!refresh_current_context(id(1)), "outer context is frozen");
        assert_eq!(outer.end_sp(), outer_end);
        assert!(refresh_current_context(id(2)));
        assert_eq!(inner.thread(), current_thread_token());

        assert!(Arc::ptr_eq(&pop_active(id(2)), &inner));
        assert!(Arc::ptr_eq(&pop_active(id(1)), &outer));
        assert_eq!(active_depth(), 0);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn popping_the_wrong_domain_panics() {
        push_active(id(1), Arc::new(ThreadContext::new(0)));
        pop_active(id(2));
    }

    #[test]
    fn window_spans_start_and_end() {
        let ctx = ThreadContext::new(0x1000);
        ctx.set_end_sp(0x800);
        assert_eq!(
            ctx.window(),
            scan::ScanRegion::Stack {
                start: 0x1000,
                end: 0x800
            }
        );
    }
}
