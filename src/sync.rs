//! The one concurrency primitive the shared pools are allowed to use.
//!
//! [`CriticalSection`] is a recursive, owner-tracked spin lock with a scoped
//! guard. Re-entering from the owning thread is permitted; this is what lets
//! bookkeeping containers allocate through the global allocator while a
//! strategy lock is held. The guard releases on every exit path, panics
//! included.

use core::sync::atomic::{AtomicUsize, Ordering};

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

std::thread_local! {
    static THREAD_ID: usize = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_id() -> usize {
    THREAD_ID.with(|id| *id)
}

pub struct CriticalSection {
    /// Thread id of the current owner, 0 when unlocked.
    owner: AtomicUsize,
    /// Recursion depth; written only by the owning thread.
    depth: AtomicUsize,
}

impl CriticalSection {
    pub const fn new() -> CriticalSection {
        CriticalSection {
            owner: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    /// Acquire the section, spinning until it is free or owned by the
    /// calling thread. Returns a guard that releases on drop.
    pub fn enter(&self) -> SectionGuard<'_> {
        let me = current_thread_id();

        if self.owner.load(Ordering::Acquire) != me {
            while self
                .owner
                .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                core::hint::spin_loop();
            }
        }

        self.depth.fetch_add(1, Ordering::Relaxed);
        SectionGuard { section: self }
    }

    /// True if the calling thread currently holds the section.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_id()
    }

    fn leave(&self) {
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(0, Ordering::Release);
        }
    }
}

impl Default for CriticalSection {
    fn default() -> Self {
        CriticalSection::new()
    }
}

pub struct SectionGuard<'a> {
    section: &'a CriticalSection,
}

impl<'a> Drop for SectionGuard<'a> {
    fn drop(&mut self) {
        self.section.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reentrant_on_same_thread() {
        let cs = CriticalSection::new();
        let _outer = cs.enter();
        let _inner = cs.enter();
        assert!(cs.is_held_by_current_thread());
    }

    #[test]
    fn released_after_last_guard() {
        let cs = CriticalSection::new();
        {
            let _a = cs.enter();
            let _b = cs.enter();
        }
        assert_eq!(cs.owner.load(Ordering::Relaxed), 0);
        assert_eq!(cs.depth.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn excludes_other_threads() {
        let cs = Arc::new(CriticalSection::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cs = Arc::clone(&cs);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = cs.enter();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn released_on_panic() {
        let cs = Arc::new(CriticalSection::new());
        let cs2 = Arc::clone(&cs);

        let _ = std::thread::spawn(move || {
            let _guard = cs2.enter();
            panic!("poisoning is not a thing here");
        })
        .join();

        // The panicking thread's guard must have released the section.
        let _guard = cs.enter();
    }
}
