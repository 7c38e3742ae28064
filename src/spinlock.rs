//! A minimal test-and-test-and-set spinlock, standing in for the C source's
//! `pthread_spinlock_t` (`NODE_LOCK`/`NODE_UNLOCK` in
//! `avl-contention-friendly.c`, `rbt_links_td_ext_fg_spinlock.c`).
//!
//! This crate hand-rolls the primitive rather than pulling in a lock crate
//! because the spinlock's exact behavior (busy-wait, no fairness, no
//! parking) is part of what the fine-grained-lock and relaxed variants are
//! benchmarking — hiding it behind a general-purpose `Mutex` would change
//! the thing under test.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct Spinlock {
    locked: AtomicBool,
}

pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

impl Spinlock {
    pub const fn new() -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinlockGuard<'_> {
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return SpinlockGuard { lock: self };
            }
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard<'_>> {
        if !self.locked.swap(true, Ordering::Acquire) {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn mutual_exclusion_under_contention() {
        let lock = Arc::new(Spinlock::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));

        crossbeam_utils::thread::scope(|s| {
            for _ in 0..8 {
                let lock = lock.clone();
                let counter = counter.clone();
                s.spawn(move |_| {
                    for _ in 0..10_000 {
                        let _g = lock.lock();
                        counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 80_000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Spinlock::new();
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
