//! C3: the thread object (spec.md §3 "Thread state", §4.3).
//!
//! One OS thread per user thread plus a per-thread binary semaphore realizes
//! the cooperative contract directly (spec.md §9 "Cooperative concurrency
//! without async keywords"). The teacher (`rd`) has no need for cross-thread
//! synchronization of its own, so the `Mutex`/`Condvar` pairing here is
//! grounded instead in the pack's own deterministic test-runtime analog
//! (`other_examples/.../common-src-runtime-testing-runtime.rs`), which reaches
//! for `parking_lot::{Mutex, Condvar}` for the same "exactly one runnable at
//! a time" discipline.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::timescope::TimescopeId;

pub type ThreadId = u64;

/// A handle to a user thread, distinct from the raw id used internally as a
/// map key — mirrors the teacher's habit of wrapping raw ids (`pid_t`,
/// `TaskUid`) in a named type at the public surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TesterThread(pub ThreadId);

/// Payload used to unwind a thread during driver teardown (spec.md §5
/// "Cancellation"). Not a real error — caught and swallowed at the thread
/// boundary, never surfaced through `interruptedException`.
#[derive(Debug)]
pub struct Interrupted;

struct SemaphoreState {
    permits: u32,
    interrupted: bool,
}

/// A binary-or-better counting semaphore built on `parking_lot`'s
/// non-poisoning `Mutex`/`Condvar`: a panic on one tester thread must never
/// wedge every other tester thread's ability to acquire its own semaphore.
pub struct Semaphore {
    state: Mutex<SemaphoreState>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(initial_permits: u32) -> Self {
        Semaphore {
            state: Mutex::new(SemaphoreState {
                permits: initial_permits,
                interrupted: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Blocks until a permit is available, then consumes it. If the
    /// semaphore has been `interrupt()`-ed, panics with `Interrupted`
    /// instead of returning — the calling thread's body is expected to
    /// unwind through `std::panic::catch_unwind` at its boundary and swallow
    /// the payload (spec.md §4.3 "Exceptional exits").
    pub fn acquire(&self) {
        let mut guard = self.state.lock();
        loop {
            if guard.interrupted {
                drop(guard);
                std::panic::panic_any(Interrupted);
            }
            if guard.permits > 0 {
                guard.permits -= 1;
                return;
            }
            self.cv.wait(&mut guard);
        }
    }

    pub fn release(&self) {
        let mut guard = self.state.lock();
        guard.permits += 1;
        self.cv.notify_one();
    }

    /// Marks the semaphore as interrupted and wakes whoever is (or will be)
    /// waiting on it, so the next `acquire()` panics instead of blocking.
    pub fn interrupt(&self) {
        let mut guard = self.state.lock();
        guard.interrupted = true;
        self.cv.notify_one();
    }
}

/// The scheduler-facing view of a `TesterThread` (spec.md §3 "Thread
/// state"). Persists after the thread completes so `doJoin`'s `target.done`
/// check keeps working for targets that finished before the join was
/// issued; `allThreads`-style liveness bookkeeping lives in `CoreState`
/// separately.
pub struct ThreadHandle {
    pub id: ThreadId,
    pub level: u32,
    pub done: bool,
    pub semaphore: Arc<Semaphore>,
    pub bottom_timescope: TimescopeId,
    pub top_timescope: TimescopeId,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            sem2.acquire();
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        sem.release();
        handle.join().unwrap();
    }

    #[test]
    fn interrupt_causes_acquire_to_panic() {
        let sem = Arc::new(Semaphore::new(0));
        sem.interrupt();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sem.acquire()));
        assert!(result.is_err());
    }
}
