//! C4: level-ordered cooperative dispatch state (spec.md §3 "Scheduler
//! state", §4.4). The dispatch algorithm itself lives in `core.rs`'s
//! `TesterCore::dispatch_next`, since it also needs to read/write
//! `CoreState` fields (`current_thread`, `interruptedException`) that don't
//! belong to the scheduler's own bookkeeping.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::action_log::ClockId;
use crate::thread::{Semaphore, ThreadId};

pub struct SchedulerState {
    /// The deepest level that still has runnable threads, or -1 when idle.
    pub current_level: i64,
    pub active_threads: BTreeMap<u32, VecDeque<ThreadId>>,
    pub blocked_threads: HashMap<ClockId, Vec<ThreadId>>,
    pub driver_semaphore: Arc<Semaphore>,
}

impl SchedulerState {
    pub fn new() -> Self {
        SchedulerState {
            current_level: -1,
            active_threads: BTreeMap::new(),
            blocked_threads: HashMap::new(),
            driver_semaphore: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.current_level == -1 && self.active_threads.is_empty() && self.blocked_threads.is_empty()
    }

    /// Enqueues `thread` at `level`. `currentLevel` tracks "the deepest
    /// level that still has runnable threads" (spec.md §3), so a freshly
    /// forked child or a re-queued joiner at a level above the current one
    /// must bump `currentLevel` immediately — `scheduler()`'s own
    /// level-selection step only ever has to move it *down* again once that
    /// level's queue drains, matching the "levels only decrease within one
    /// dispatch cycle" assertion in spec.md §4.4.
    pub fn enqueue(&mut self, level: u32, thread: ThreadId) {
        self.active_threads.entry(level).or_default().push_back(thread);
        if level as i64 > self.current_level {
            self.current_level = level as i64;
        }
    }

    pub fn has_runnable(&self) -> bool {
        !self.active_threads.is_empty()
    }

    pub fn max_level(&self) -> Option<u32> {
        self.active_threads.keys().next_back().copied()
    }

    /// Step 1 of `scheduler()`: if the FIFO at `currentLevel` is empty,
    /// remove that level from `activeThreads`.
    pub fn prune_current_if_empty(&mut self) {
        if self.current_level >= 0 {
            let level = self.current_level as u32;
            if self.active_threads.get(&level).map_or(true, VecDeque::is_empty) {
                self.active_threads.remove(&level);
            }
        }
    }

    pub fn current_level_has_queue(&self) -> bool {
        self.current_level >= 0 && self.active_threads.contains_key(&(self.current_level as u32))
    }

    /// Pops the head of `currentLevel`'s FIFO. The level's map entry is
    /// dropped eagerly once its queue empties so `has_runnable()` can be a
    /// plain "is the map empty" check instead of having to scan every
    /// queue's length.
    pub fn pop_head_of_current_level(&mut self) -> Option<ThreadId> {
        if self.current_level < 0 {
            return None;
        }
        let level = self.current_level as u32;
        let popped = self.active_threads.get_mut(&level).and_then(VecDeque::pop_front);
        if self.active_threads.get(&level).map_or(false, VecDeque::is_empty) {
            self.active_threads.remove(&level);
        }
        popped
    }

    pub fn take_blocked(&mut self) -> HashMap<ClockId, Vec<ThreadId>> {
        std::mem::take(&mut self.blocked_threads)
    }

    pub fn reset_to_idle(&mut self) {
        self.current_level = -1;
        self.active_threads.clear();
        self.blocked_threads.clear();
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}
