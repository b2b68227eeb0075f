//! C5: the core operations (spec.md §4, §5) gluing together the timescope
//! tree (C1), action log (C2), thread objects (C3) and scheduler (C4).
//!
//! All mutable shared state lives behind one `parking_lot::Mutex<CoreState>`.
//! This looks heavier than spec.md's "no locking is required beyond the
//! semaphore discipline" (§5), but it is the same discipline translated into
//! Rust: at most one OS thread ever *holds* the lock at a time in practice
//! (every other live thread is parked on its own semaphore, not contending
//! this one), the mutex just gives the compiler a way to let multiple OS
//! threads share `&CoreState` safely. `rd` gets the analogous guarantee for
//! free via `Rc<RefCell<_>>` because it has no real concurrency; we have
//! real OS threads, so the lock is the idiomatic substitute.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::action_log::{ClockId, PeekRecord, PokeRecord, SignalActionLog, SignalId, SignalValue, Timestep};
use crate::error::{panic_message, CoreError};
use crate::log::LogLevel;
use crate::scheduler::SchedulerState;
use crate::thread::{Interrupted, Semaphore, TesterThread, ThreadHandle, ThreadId};
use crate::timescope::{ScopeData, ThreadRootData, TimescopeArena, TimescopeId, TimescopeNode};
use crate::trace::Trace;

/// Everything spec.md §3 calls out as "Global collections" plus the
/// scheduler and timescope/action-log state, held behind one lock.
pub struct CoreState {
    pub current_timestep: Timestep,
    pub arena: TimescopeArena,
    pub action_log: SignalActionLog,
    pub scheduler: SchedulerState,
    /// Every thread ever created, keyed by id. Entries persist after a
    /// thread finishes so `doJoin`'s `target.done` lookup keeps working.
    pub threads: HashMap<ThreadId, ThreadHandle>,
    /// `allThreads`: live threads only, for sanity assertions.
    pub live_threads: HashSet<ThreadId>,
    /// `joinedThreads`: append-on-add, per spec.md §9's resolution of the
    /// Open Question about last-wins vs. append semantics.
    pub joined_threads: HashMap<ThreadId, Vec<ThreadId>>,
    pub current_thread: Option<ThreadId>,
    pub interrupted_exceptions: std::collections::VecDeque<CoreError>,
    pub next_thread_id: ThreadId,
    /// External interface (spec.md §6): read-only combinational fan-in map.
    pub combinational_paths: HashMap<SignalId, HashSet<SignalId>>,
    /// External interface (spec.md §6): signal names, for diagnostics only.
    pub data_names: HashMap<SignalId, String>,
}

impl CoreState {
    fn signal_name(&self, signal: SignalId) -> String {
        self.data_names
            .get(&signal)
            .cloned()
            .unwrap_or_else(|| format!("signal#{}", signal.0))
    }
}

/// The core's public facade (spec.md §6 "The core exposes to user code").
pub struct TesterCore {
    state: Mutex<CoreState>,
    join_handles: Mutex<HashMap<ThreadId, std::thread::JoinHandle<()>>>,
}

impl TesterCore {
    pub fn new(
        combinational_paths: HashMap<SignalId, HashSet<SignalId>>,
        data_names: HashMap<SignalId, String>,
    ) -> Arc<Self> {
        Arc::new(TesterCore {
            state: Mutex::new(CoreState {
                current_timestep: 0,
                arena: TimescopeArena::new(),
                action_log: SignalActionLog::new(),
                scheduler: SchedulerState::new(),
                threads: HashMap::new(),
                live_threads: HashSet::new(),
                joined_threads: HashMap::new(),
                current_thread: None,
                interrupted_exceptions: std::collections::VecDeque::new(),
                next_thread_id: 1,
                combinational_paths,
                data_names,
            }),
            join_handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn current_timestep(&self) -> Timestep {
        self.state.lock().current_timestep
    }

    /// `currentTimestep` is "assignable by the driver" (spec.md §6).
    pub fn set_current_timestep(&self, timestep: Timestep) {
        self.state.lock().current_timestep = timestep;
    }

    // ---------------------------------------------------------------
    // C5 core operations: doPoke / doPeek (spec.md §4.2)
    // ---------------------------------------------------------------

    pub fn do_poke(&self, signal: SignalId, value: SignalValue) -> Result<(), CoreError> {
        let trace = Trace::capture();
        let mut st = self.state.lock();
        let timestep = st.current_timestep;
        let top = self.current_top_timescope(&st)?;
        match st.arena.get_mut(top) {
            TimescopeNode::Scope(d) => {
                let action_id = d.next_action_id;
                d.next_action_id += 1;
                d.pokes.insert(
                    signal,
                    PokeRecord {
                        timestep,
                        action_id,
                        value,
                        trace,
                    },
                );
            }
            _ => return Err(CoreError::invariant("doPoke: topTimescope is not a Scope")),
        }
        st.action_log.record_active_poke(signal, top);
        crate::log!(
            LogLevel::Debug,
            "poke {} = {} at timestep {}",
            st.signal_name(signal),
            value,
            timestep
        );
        Ok(())
    }

    pub fn do_peek(&self, signal: SignalId) -> Result<(), CoreError> {
        let trace = Trace::capture();
        let mut st = self.state.lock();
        let timestep = st.current_timestep;
        let top = self.current_top_timescope(&st)?;
        let action_id = match st.arena.get_mut(top) {
            TimescopeNode::Scope(d) => {
                let action_id = d.next_action_id;
                d.next_action_id += 1;
                action_id
            }
            _ => return Err(CoreError::invariant("doPeek: topTimescope is not a Scope")),
        };
        st.action_log.record_peek(
            signal,
            PeekRecord {
                timescope: top,
                timestep,
                action_id,
                trace,
            },
        );
        Ok(())
    }

    fn current_top_timescope(&self, st: &CoreState) -> Result<TimescopeId, CoreError> {
        let tid = st
            .current_thread
            .ok_or_else(|| CoreError::invariant("core operation invoked with no current thread"))?;
        Ok(st.threads[&tid].top_timescope)
    }

    // ---------------------------------------------------------------
    // C1: newTimescope / closeTimescope (spec.md §4.1)
    // ---------------------------------------------------------------

    pub fn new_timescope(&self) -> Result<TimescopeId, CoreError> {
        let mut st = self.state.lock();
        let tid = st
            .current_thread
            .ok_or_else(|| CoreError::invariant("newTimescope invoked with no current thread"))?;
        let parent_id = st.threads[&tid].top_timescope;
        let parent_action_id = match st.arena.get_mut(parent_id) {
            TimescopeNode::ThreadRoot(_) => 0,
            TimescopeNode::Scope(d) => {
                let id = d.next_action_id;
                d.next_action_id += 1;
                id
            }
            TimescopeNode::Root => {
                return Err(CoreError::invariant(
                    "newTimescope: topTimescope is Root, not a ThreadRoot or Scope",
                ))
            }
        };
        let opened_timestep = st.current_timestep;
        let scope_id = st.arena.insert_scope(ScopeData {
            parent: parent_id,
            thread: tid,
            opened_timestep,
            parent_action_id,
            next_action_id: 0,
            closed_timestep: None,
            pokes: HashMap::new(),
        });
        st.threads.get_mut(&tid).unwrap().top_timescope = scope_id;
        Ok(scope_id)
    }

    pub fn close_timescope(&self, ts: TimescopeId) -> Result<HashMap<SignalId, Option<SignalValue>>, CoreError> {
        let mut st = self.state.lock();
        let tid = st
            .current_thread
            .ok_or_else(|| CoreError::invariant("closeTimescope invoked with no current thread"))?;
        let top = st.threads[&tid].top_timescope;
        if top != ts {
            return Err(CoreError::invariant(
                "closeTimescope: target is not the current thread's topTimescope",
            ));
        }
        let (parent, poked_signals) = match st.arena.get_mut(ts) {
            TimescopeNode::Scope(d) => {
                d.closed_timestep = Some(st.current_timestep);
                (d.parent, d.pokes.keys().copied().collect::<Vec<_>>())
            }
            _ => return Err(CoreError::invariant("closeTimescope: target is not a Scope")),
        };
        st.threads.get_mut(&tid).unwrap().top_timescope = parent;

        let mut revert = HashMap::new();
        for signal in poked_signals {
            let ancestor = st.arena.nearest_poking_ancestor(ts, signal);
            let value = ancestor.and_then(|aid| match st.arena.get(aid) {
                TimescopeNode::Scope(d) => d.pokes.get(&signal).map(|p| p.value),
                _ => None,
            });
            revert.insert(signal, value);
        }
        Ok(revert)
    }

    /// `withTimescope(body)` (spec.md §6): opens a timescope, runs `body`,
    /// then closes it on both normal and exceptional exit. Since spec.md
    /// does not say who consumes the revert map this sugar produces, it is
    /// forwarded to `on_close` rather than silently dropped; code that wants
    /// the map directly should call `new_timescope`/`close_timescope`
    /// itself (see DESIGN.md).
    pub fn with_timescope<F, R, C>(&self, body: F, on_close: C) -> R
    where
        F: FnOnce() -> R,
        C: FnOnce(HashMap<SignalId, Option<SignalValue>>),
    {
        let ts = self
            .new_timescope()
            .expect("newTimescope invariant violated in withTimescope");
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
        let revert = self
            .close_timescope(ts)
            .expect("closeTimescope invariant violated in withTimescope");
        on_close(revert);
        match outcome {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    // ---------------------------------------------------------------
    // C4: fork / join / thread lifecycle (spec.md §4.3, §4.4)
    // ---------------------------------------------------------------

    /// Spawns the initial (level-0) user thread for a `runThreads` batch.
    pub fn spawn_root_thread<F>(self: &Arc<Self>, body: F) -> TesterThread
    where
        F: FnOnce() + Send + 'static,
    {
        let thread_id = {
            let mut st = self.state.lock();
            let thread_id = st.next_thread_id;
            st.next_thread_id += 1;
            let thread_root = st.arena.insert_thread_root(ThreadRootData {
                parent: TimescopeArena::ROOT,
                thread: thread_id,
                opened_timestep: st.current_timestep,
                parent_action_id: 0,
            });
            let semaphore = Arc::new(Semaphore::new(0));
            st.threads.insert(
                thread_id,
                ThreadHandle {
                    id: thread_id,
                    level: 0,
                    done: false,
                    semaphore,
                    bottom_timescope: thread_root,
                    top_timescope: thread_root,
                },
            );
            st.live_threads.insert(thread_id);
            thread_id
        };
        self.start_os_thread(thread_id, body);
        TesterThread(thread_id)
    }

    /// `doFork(runnable)` (spec.md §4.4).
    pub fn do_fork<F>(self: &Arc<Self>, body: F) -> Result<TesterThread, CoreError>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread_id = {
            let mut st = self.state.lock();
            let caller = st
                .current_thread
                .ok_or_else(|| CoreError::invariant("doFork invoked with no current thread"))?;
            let caller_level = st.threads[&caller].level;
            let caller_top = st.threads[&caller].top_timescope;
            let parent_action_id = match st.arena.get_mut(caller_top) {
                TimescopeNode::Scope(d) => {
                    let id = d.next_action_id;
                    d.next_action_id += 1;
                    id
                }
                _ => {
                    return Err(CoreError::invariant(
                        "doFork: caller's topTimescope is not a Scope",
                    ))
                }
            };
            let new_level = caller_level + 1;
            let thread_id = st.next_thread_id;
            st.next_thread_id += 1;
            let thread_root = st.arena.insert_thread_root(ThreadRootData {
                parent: caller_top,
                thread: thread_id,
                opened_timestep: st.current_timestep,
                parent_action_id,
            });
            let semaphore = Arc::new(Semaphore::new(0));
            st.threads.insert(
                thread_id,
                ThreadHandle {
                    id: thread_id,
                    level: new_level,
                    done: false,
                    semaphore,
                    bottom_timescope: thread_root,
                    top_timescope: thread_root,
                },
            );
            st.live_threads.insert(thread_id);
            // Pushed to the tail of the current level's FIFO: the caller
            // continues first until it yields (spec.md §4.4).
            st.scheduler.enqueue(new_level, thread_id);
            thread_id
        };
        self.start_os_thread(thread_id, body);
        Ok(TesterThread(thread_id))
    }

    fn start_os_thread<F>(self: &Arc<Self>, thread_id: ThreadId, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let semaphore = self.state.lock().threads[&thread_id].semaphore.clone();
        let core = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("tester-thread-{}", thread_id))
            .spawn(move || {
                semaphore.acquire();
                core.run_thread_body(thread_id, body);
            })
            .expect("failed to spawn tester thread");
        self.join_handles.lock().insert(thread_id, handle);
    }

    /// The thread body wrapper of spec.md §4.3: opens the user-visible root
    /// timescope, runs the closure, closes it, and asserts the scope stack
    /// unwound cleanly before handing control back to the scheduler.
    fn run_thread_body<F>(self: Arc<Self>, thread_id: ThreadId, body: F)
    where
        F: FnOnce() + 'static,
    {
        let ts = match self.new_timescope() {
            Ok(ts) => ts,
            Err(e) => return self.fail(thread_id, e),
        };
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
        match outcome {
            Ok(()) => match self.close_timescope(ts) {
                Ok(_revert) => {
                    let unwound_cleanly = {
                        let st = self.state.lock();
                        let h = &st.threads[&thread_id];
                        h.top_timescope == h.bottom_timescope
                    };
                    if unwound_cleanly {
                        self.thread_finished(thread_id);
                    } else {
                        self.fail(
                            thread_id,
                            CoreError::invariant(
                                "thread finished with unbalanced timescopes: topTimescope != bottomTimescope",
                            ),
                        );
                    }
                }
                Err(e) => self.fail(thread_id, e),
            },
            Err(payload) => {
                if payload.downcast_ref::<Interrupted>().is_some() {
                    self.swallow_interrupted(thread_id);
                } else {
                    let message = panic_message(&*payload);
                    self.fail(thread_id, CoreError::UserException { thread: thread_id, message });
                }
            }
        }
    }

    fn fail(&self, thread_id: ThreadId, err: CoreError) {
        let _ = thread_id;
        let mut st = self.state.lock();
        st.interrupted_exceptions.push_back(err);
        self.dispatch_next(&mut st);
    }

    fn swallow_interrupted(&self, _thread_id: ThreadId) {
        let mut st = self.state.lock();
        self.dispatch_next(&mut st);
    }

    /// `threadFinished(t)` (spec.md §4.4).
    fn thread_finished(&self, thread_id: ThreadId) {
        let mut st = self.state.lock();
        let t_level = st.threads[&thread_id].level;
        st.threads.get_mut(&thread_id).unwrap().done = true;
        st.live_threads.remove(&thread_id);
        if let Some(waiters) = st.joined_threads.remove(&thread_id) {
            for waiter in waiters {
                let waiter_level = st.threads[&waiter].level;
                assert!(
                    t_level > waiter_level,
                    "threadFinished: a joiner's level must be strictly less than the finished thread's level"
                );
                st.scheduler.enqueue(waiter_level, waiter);
            }
        }
        self.dispatch_next(&mut st);
    }

    /// `doJoin(target)` (spec.md §4.4).
    pub fn do_join(&self, target: TesterThread) -> Result<(), CoreError> {
        let semaphore = {
            let mut st = self.state.lock();
            let caller = st
                .current_thread
                .ok_or_else(|| CoreError::invariant("doJoin invoked with no current thread"))?;
            let caller_level = st.threads[&caller].level;
            let target_handle = st
                .threads
                .get(&target.0)
                .ok_or_else(|| CoreError::invariant("doJoin: unknown target thread"))?;
            if caller_level >= target_handle.level {
                return Err(CoreError::invariant(
                    "doJoin requires caller.level < target.level",
                ));
            }
            if target_handle.done {
                return Ok(());
            }
            st.joined_threads.entry(target.0).or_default().push(caller);
            let semaphore = st.threads[&caller].semaphore.clone();
            self.dispatch_next(&mut st);
            semaphore
        };
        semaphore.acquire();
        Ok(())
    }

    /// The clock-blocking suspension point of spec.md §4.4 (described there
    /// as "external call into core, specified here for completeness").
    pub fn block_on_clock(&self, clock: ClockId) -> Result<(), CoreError> {
        let semaphore = {
            let mut st = self.state.lock();
            let tid = st
                .current_thread
                .ok_or_else(|| CoreError::invariant("block_on_clock invoked with no current thread"))?;
            st.scheduler.blocked_threads.entry(clock).or_default().push(tid);
            let semaphore = st.threads[&tid].semaphore.clone();
            self.dispatch_next(&mut st);
            semaphore
        };
        semaphore.acquire();
        Ok(())
    }

    // ---------------------------------------------------------------
    // C4: the scheduler's dispatch algorithm (spec.md §4.4 "scheduler()")
    // ---------------------------------------------------------------

    fn dispatch_next(&self, st: &mut CoreState) {
        st.scheduler.prune_current_if_empty();
        if !st.interrupted_exceptions.is_empty() || !st.scheduler.has_runnable() {
            st.current_thread = None;
            st.scheduler.driver_semaphore.release();
            return;
        }
        if !st.scheduler.current_level_has_queue() {
            let max_level = st
                .scheduler
                .max_level()
                .expect("has_runnable() implies a max level exists");
            if st.scheduler.current_level >= 0 {
                assert!(
                    (max_level as i64) < st.scheduler.current_level,
                    "scheduler levels must only decrease within one dispatch cycle"
                );
            }
            st.scheduler.current_level = max_level as i64;
        }
        let next = st
            .scheduler
            .pop_head_of_current_level()
            .expect("current level's queue must be non-empty after level selection");
        st.current_thread = Some(next);
        let semaphore = st.threads[&next].semaphore.clone();
        semaphore.release();
    }

    // ---------------------------------------------------------------
    // Driver-facing entry points (spec.md §4.4 "runThreads", §6)
    // ---------------------------------------------------------------

    /// `runThreads(threads)` (spec.md §4.4).
    pub fn run_threads(&self, ready: Vec<TesterThread>) -> Result<HashMap<ClockId, Vec<TesterThread>>, CoreError> {
        let driver_semaphore = {
            let mut st = self.state.lock();
            assert_eq!(
                st.scheduler.current_level, -1,
                "runThreads precondition violated: currentLevel must be -1"
            );
            assert!(
                st.scheduler.active_threads.is_empty(),
                "runThreads precondition violated: activeThreads must be empty"
            );
            assert!(
                st.scheduler.blocked_threads.is_empty(),
                "runThreads precondition violated: blockedThreads must be empty"
            );
            for t in &ready {
                let level = st
                    .threads
                    .get(&t.0)
                    .unwrap_or_else(|| panic!("runThreads given unknown thread {}", t.0))
                    .level;
                st.scheduler.enqueue(level, t.0);
            }
            match st.scheduler.max_level() {
                Some(max_level) => {
                    st.scheduler.current_level = max_level as i64;
                    self.dispatch_next(&mut st);
                }
                None => return Ok(HashMap::new()),
            }
            st.scheduler.driver_semaphore.clone()
        };
        driver_semaphore.acquire();

        let mut st = self.state.lock();
        let pending = st.interrupted_exceptions.pop_front();
        let blocked = st.scheduler.take_blocked();
        st.scheduler.reset_to_idle();
        drop(st);

        match pending {
            Some(err) => Err(err),
            None => Ok(blocked
                .into_iter()
                .map(|(clock, threads)| (clock, threads.into_iter().map(TesterThread).collect()))
                .collect()),
        }
    }

    /// `onException(err)` (spec.md §6): lets the driver inject a failure
    /// that isn't a user-thread panic (e.g. a simulator-bridge error) into
    /// the same queue `runThreads` drains.
    pub fn on_exception(&self, err: CoreError) {
        self.state.lock().interrupted_exceptions.push_back(err);
    }

    /// `timestep()` (spec.md §4.5): report conflicts for the timestep just
    /// ended, prune closed scopes out of `activePokes`, and clear
    /// `signalPeeks`.
    pub fn timestep(&self) -> Vec<CoreError> {
        let mut st = self.state.lock();
        let ended = st.current_timestep;
        let errors = if crate::config::Config::get().strict_conflict_checks {
            crate::conflict::check_conflicts(&st, ended)
        } else {
            Vec::new()
        };
        let closed = st.arena.closed_scope_ids();
        st.action_log.prune_closed(&closed);
        st.action_log.clear_peeks();
        errors
    }

    /// Interrupts every live thread (spec.md §5 "Cancellation") and joins
    /// their OS threads. Used during driver teardown to abort a test run
    /// without running any more user-thread cleanup.
    pub fn shutdown(&self) {
        let semaphores: Vec<Arc<Semaphore>> = {
            let st = self.state.lock();
            st.threads.values().map(|h| h.semaphore.clone()).collect()
        };
        for semaphore in &semaphores {
            semaphore.interrupt();
        }
        let handles: Vec<std::thread::JoinHandle<()>> = self.join_handles.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn signal_name(&self, signal: SignalId) -> String {
        self.state.lock().signal_name(signal)
    }

    pub fn is_idle(&self) -> bool {
        let st = self.state.lock();
        st.scheduler.is_idle() && st.current_thread.is_none()
    }
}
