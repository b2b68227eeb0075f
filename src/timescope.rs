//! C1: the parented timescope tree (spec.md §3 "Timescope variants", §4.1).
//!
//! Timescopes point parentward only and form a forest, so a plain arena
//! indexed by a small integer id is enough — no `Rc`/`RefCell` back-chaining
//! is needed the way `rd`'s `ThreadGroup` needs it for its parent/child
//! `Weak` pointers, since nothing here is ever mutated from more than one OS
//! thread at a time (the core's single-mutex discipline, see `core.rs`).

use std::collections::{HashMap, HashSet};

use crate::action_log::{ActionId, PokeRecord, SignalId, Timestep};
use crate::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimescopeId(pub usize);

/// Sentinel placed at the bottom of every user thread's scope stack
/// (spec.md §3 "ThreadRoot").
pub struct ThreadRootData {
    pub parent: TimescopeId,
    pub thread: ThreadId,
    pub opened_timestep: Timestep,
    pub parent_action_id: ActionId,
}

/// A scope opened by `newTimescope` (spec.md §3 "Timescope").
pub struct ScopeData {
    pub parent: TimescopeId,
    pub thread: ThreadId,
    pub opened_timestep: Timestep,
    pub parent_action_id: ActionId,
    pub next_action_id: ActionId,
    pub closed_timestep: Option<Timestep>,
    pub pokes: HashMap<SignalId, PokeRecord>,
}

impl ScopeData {
    pub fn is_closed(&self) -> bool {
        self.closed_timestep.is_some()
    }
}

pub enum TimescopeNode {
    /// Singleton parent of all top-level threads; no pokes, no parent.
    Root,
    ThreadRoot(ThreadRootData),
    Scope(ScopeData),
}

/// Owns every `TimescopeNode` ever created during a core's lifetime,
/// addressed by a stable index. `TimescopeId(0)` is always `Root`.
pub struct TimescopeArena {
    nodes: Vec<TimescopeNode>,
}

impl TimescopeArena {
    pub const ROOT: TimescopeId = TimescopeId(0);

    pub fn new() -> Self {
        TimescopeArena {
            nodes: vec![TimescopeNode::Root],
        }
    }

    pub fn get(&self, id: TimescopeId) -> &TimescopeNode {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: TimescopeId) -> &mut TimescopeNode {
        &mut self.nodes[id.0]
    }

    pub fn insert_thread_root(&mut self, data: ThreadRootData) -> TimescopeId {
        let id = TimescopeId(self.nodes.len());
        self.nodes.push(TimescopeNode::ThreadRoot(data));
        id
    }

    pub fn insert_scope(&mut self, data: ScopeData) -> TimescopeId {
        let id = TimescopeId(self.nodes.len());
        self.nodes.push(TimescopeNode::Scope(data));
        id
    }

    pub fn parent(&self, id: TimescopeId) -> Option<TimescopeId> {
        match self.get(id) {
            TimescopeNode::Root => None,
            TimescopeNode::ThreadRoot(d) => Some(d.parent),
            TimescopeNode::Scope(d) => Some(d.parent),
        }
    }

    pub fn owning_thread(&self, id: TimescopeId) -> Option<ThreadId> {
        match self.get(id) {
            TimescopeNode::Root => None,
            TimescopeNode::ThreadRoot(d) => Some(d.thread),
            TimescopeNode::Scope(d) => Some(d.thread),
        }
    }

    /// Walks the parent chain starting at `start`'s parent, treating
    /// `ThreadRoot` as transparent (spec.md §4.1 "Poke lookup discipline"),
    /// and returns the nearest ancestor `Scope` that pokes `signal`.
    pub fn nearest_poking_ancestor(&self, start: TimescopeId, signal: SignalId) -> Option<TimescopeId> {
        let mut cur = self.parent(start);
        while let Some(id) = cur {
            match self.get(id) {
                TimescopeNode::Root => break,
                TimescopeNode::ThreadRoot(d) => cur = Some(d.parent),
                TimescopeNode::Scope(d) => {
                    if d.pokes.contains_key(&signal) {
                        return Some(id);
                    }
                    cur = Some(d.parent);
                }
            }
        }
        None
    }

    /// The set of threads in `start`'s own thread-lineage: `start`'s owning
    /// thread plus every ancestor thread reached by climbing back through
    /// `ThreadRoot` spawn points. Two timescopes share a covering thread iff
    /// the intersection of their lineages is non-empty (used by the
    /// multiple-writer conflict check, spec.md §4.5).
    pub fn ancestor_threads(&self, start: TimescopeId) -> HashSet<ThreadId> {
        let mut threads = HashSet::new();
        let mut cur = Some(start);
        while let Some(id) = cur {
            match self.get(id) {
                TimescopeNode::Root => break,
                TimescopeNode::ThreadRoot(d) => {
                    threads.insert(d.thread);
                    cur = Some(d.parent);
                }
                TimescopeNode::Scope(d) => {
                    threads.insert(d.thread);
                    cur = Some(d.parent);
                }
            }
        }
        threads
    }

    /// True iff `ancestor` appears anywhere in `start`'s thread lineage.
    pub fn lineage_contains(&self, start: TimescopeId, ancestor: ThreadId) -> bool {
        self.ancestor_threads(start).contains(&ancestor)
    }

    pub fn closed_scope_ids(&self) -> HashSet<TimescopeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| match node {
                TimescopeNode::Scope(d) if d.is_closed() => Some(TimescopeId(i)),
                _ => None,
            })
            .collect()
    }
}

impl Default for TimescopeArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::trace::Trace;

    fn poke(value: u64) -> PokeRecord {
        PokeRecord {
            timestep: 0,
            action_id: 0,
            value,
            trace: Trace::capture(),
        }
    }

    #[test]
    fn nearest_poking_ancestor_skips_thread_root() {
        let mut arena = TimescopeArena::new();
        let thread_a: ThreadId = 1;
        let thread_b: ThreadId = 2;

        // Thread A: scope A pokes signal 7.
        let a_root = arena.insert_thread_root(ThreadRootData {
            parent: TimescopeArena::ROOT,
            thread: thread_a,
            opened_timestep: 0,
            parent_action_id: 0,
        });
        let mut a = ScopeData {
            parent: a_root,
            thread: thread_a,
            opened_timestep: 0,
            parent_action_id: 0,
            next_action_id: 0,
            closed_timestep: None,
            pokes: HashMap::new(),
        };
        a.pokes.insert(SignalId(7), poke(5));
        let scope_a = arena.insert_scope(a);

        // Thread B forked from scope A, has no poke of its own on signal 7.
        let b_root = arena.insert_thread_root(ThreadRootData {
            parent: scope_a,
            thread: thread_b,
            opened_timestep: 0,
            parent_action_id: 1,
        });
        let b = ScopeData {
            parent: b_root,
            thread: thread_b,
            opened_timestep: 0,
            parent_action_id: 0,
            next_action_id: 0,
            closed_timestep: None,
            pokes: HashMap::new(),
        };
        let scope_b = arena.insert_scope(b);

        assert_eq!(
            arena.nearest_poking_ancestor(scope_b, SignalId(7)),
            Some(scope_a)
        );
    }

    #[test]
    fn ancestor_threads_includes_spawning_lineage() {
        let mut arena = TimescopeArena::new();
        let thread_a: ThreadId = 1;
        let thread_b: ThreadId = 2;

        let a_root = arena.insert_thread_root(ThreadRootData {
            parent: TimescopeArena::ROOT,
            thread: thread_a,
            opened_timestep: 0,
            parent_action_id: 0,
        });
        let scope_a = arena.insert_scope(ScopeData {
            parent: a_root,
            thread: thread_a,
            opened_timestep: 0,
            parent_action_id: 0,
            next_action_id: 0,
            closed_timestep: None,
            pokes: HashMap::new(),
        });
        let b_root = arena.insert_thread_root(ThreadRootData {
            parent: scope_a,
            thread: thread_b,
            opened_timestep: 0,
            parent_action_id: 1,
        });
        let scope_b = arena.insert_scope(ScopeData {
            parent: b_root,
            thread: thread_b,
            opened_timestep: 0,
            parent_action_id: 0,
            next_action_id: 0,
            closed_timestep: None,
            pokes: HashMap::new(),
        });

        let lineage = arena.ancestor_threads(scope_b);
        assert!(lineage.contains(&thread_a));
        assert!(lineage.contains(&thread_b));
    }
}
