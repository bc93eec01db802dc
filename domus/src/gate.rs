//! Run-exclusion gate: at most one thread executes inside a domain.
//!
//! Fast path is a single swap on the run flag. Losers register as waiters and
//! block on a condition variable, retrying the swap after every wake. There
//! is no queue, whoever wins the swap gets in.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, fence};

use parking_lot::{Condvar, Mutex};

use crate::threads::current_thread_token;

#[derive(Debug, Default)]
pub struct RunGate {
    running: AtomicBool,
    waiters: AtomicUsize,
    // thread token of the holder, 0 when free
    holder: AtomicU64,
    contended: AtomicU64,
    lock: Mutex<()>,
    cv: Condvar,
}

impl RunGate {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    /// Blocks until the calling thread holds the gate.
    ///
    /// # Panics
    /// if the calling thread already holds it.
    pub fn enter(&self) {
        let me = current_thread_token();
        assert_ne!(
            self.holder.load(Ordering::Acquire),
            me,
            "thread re-entered a domain it already holds"
        );

        if !self.try_acquire() {
            self.contended.fetch_add(1, Ordering::Relaxed);
            self.waiters.fetch_add(1, Ordering::SeqCst);
            log::trace!("gate: thread {me} waiting");
            let mut guard = self.lock.lock();
            while !self.try_acquire() {
                self.cv.wait(&mut guard);
            }
            drop(guard);
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }

        self.holder.store(me, Ordering::Release);
    }

    /// Non blocking variant of [`RunGate::enter`].
    pub fn try_enter(&self) -> bool {
        if !self.try_acquire() {
            return false;
        }
        self.holder.store(current_thread_token(), Ordering::Release);
        true
    }

    /// Releases the gate and wakes one waiter, if any.
    pub fn leave(&self) {
        debug_assert_eq!(
            self.holder.load(Ordering::Acquire),
            current_thread_token(),
            "gate released by a thread that does not hold it"
        );
        self.holder.store(0, Ordering::Release);
        self.running.store(false, Ordering::SeqCst);
        // pairs with the waiter count increment before the waiter's last try
        fence(Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _g = self.lock.lock();
            self.cv.notify_one();
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Token of the holding thread.
    #[inline]
    pub fn holder(&self) -> Option<u64> {
        match self.holder.load(Ordering::Acquire) {
            0 => None,
            token => Some(token),
        }
    }

    #[inline]
    pub fn is_held_by_current(&self) -> bool {
        self.holder() == Some(current_thread_token())
    }

    /// Number of entries that had to wait.
    #[inline]
    pub fn contended(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }
}
