//! Post-hoc conflict detection run from `timestep()` (spec.md §4.5).
//!
//! Two kinds of conflict are checked per signal: multiple writers with no
//! common covering thread, and a peek by a thread that isn't in the lineage
//! of whoever is currently driving the signal. Both checks expand through
//! `combinationalPaths` first, since a poke on an upstream signal can make a
//! downstream signal's value "driven" just as much as a poke directly on it.

use std::collections::HashSet;

use crate::action_log::{PokeRecord, SignalId};
use crate::core::CoreState;
use crate::error::{ConflictKind, CoreError};
use crate::thread::ThreadId;
use crate::timescope::{TimescopeId, TimescopeNode};
use crate::trace::Trace;

/// Every signal currently touched by an active poke or a peek this timestep,
/// in a deterministic order — conflicts are reported signal-name order so
/// the set of errors a run produces doesn't depend on `HashMap` iteration
/// order (spec.md leaves the ordering of simultaneous conflicts
/// unspecified; this crate picks a stable one, see DESIGN.md).
fn signals_to_check(st: &CoreState) -> Vec<SignalId> {
    let mut signals: HashSet<SignalId> = HashSet::new();
    signals.extend(st.action_log.signals_with_pokes().copied());
    signals.extend(st.action_log.signals_with_peeks().copied());
    let mut ordered: Vec<SignalId> = signals.into_iter().collect();
    ordered.sort_by_key(|s| s.0);
    ordered
}

/// Expands `signal` through `combinationalPaths` to the full set of
/// timescopes that currently drive it, directly or combinationally, paired
/// with the signal each one actually poked (its own poke record lives under
/// that key in the scope's `pokes` map, not necessarily `signal` itself).
/// `combinationalPaths[s]` holds the upstream signals that fan into `s`, so
/// a poke anywhere in that closure counts as driving `s` too.
fn driving_timescopes(st: &CoreState, signal: SignalId) -> Vec<(TimescopeId, SignalId)> {
    let mut visited = HashSet::new();
    let mut stack = vec![signal];
    let mut drivers = Vec::new();
    while let Some(s) = stack.pop() {
        if !visited.insert(s) {
            continue;
        }
        drivers.extend(st.action_log.active_pokes(s).iter().map(|&ts| (ts, s)));
        if let Some(upstream) = st.combinational_paths.get(&s) {
            stack.extend(upstream.iter().copied());
        }
    }
    drivers
}

fn poke_record<'a>(st: &'a CoreState, ts: TimescopeId, signal: SignalId) -> Option<&'a PokeRecord> {
    match st.arena.get(ts) {
        TimescopeNode::Scope(d) => d.pokes.get(&signal),
        _ => None,
    }
}

/// Runs both conflict checks over every signal with recent activity and
/// returns them in a stable order (by signal, multi-writer before
/// peek-ordering within a signal).
pub fn check_conflicts(st: &CoreState, timestep: crate::action_log::Timestep) -> Vec<CoreError> {
    let mut errors = Vec::new();
    for signal in signals_to_check(st) {
        if let Some(kind) = check_multi_writer(st, signal, timestep) {
            errors.push(CoreError::Conflict { timestep, kind });
        }
        errors.extend(
            check_peek_after_poke(st, signal, timestep)
                .into_iter()
                .map(|kind| CoreError::Conflict { timestep, kind }),
        );
    }
    errors
}

/// A signal has a multiple-writer conflict when more than one thread poked
/// it (directly or combinationally) *during the timestep that just ended*
/// and no single one of those threads' lineages covers every other driver —
/// i.e. there is no common ancestor thread whose own poke is "the" poke
/// everyone else's descends from. A thread quietly holding an older poke
/// steady across later cycles is not a fresh write and must not keep
/// re-triggering this check on every subsequent `timestep()` (spec.md §4.5:
/// the check fires only for the cycle the conflicting write happened in).
fn check_multi_writer(st: &CoreState, signal: SignalId, timestep: crate::action_log::Timestep) -> Option<ConflictKind> {
    let drivers: Vec<(TimescopeId, SignalId)> = driving_timescopes(st, signal)
        .into_iter()
        .filter(|&(ts, sig)| poke_record(st, ts, sig).map_or(false, |p| p.timestep == timestep))
        .collect();
    if drivers.len() < 2 {
        return None;
    }
    let driver_threads: Vec<ThreadId> = drivers
        .iter()
        .filter_map(|&(ts, _)| st.arena.owning_thread(ts))
        .collect();
    let distinct: HashSet<ThreadId> = driver_threads.iter().copied().collect();
    if distinct.len() < 2 {
        return None;
    }

    let covered = drivers.iter().any(|&(ts, _)| {
        let lineage = st.arena.ancestor_threads(ts);
        distinct.iter().all(|t| lineage.contains(t))
    });
    if covered {
        return None;
    }

    let traces: Vec<Trace> = drivers
        .iter()
        .filter_map(|&(ts, sig)| poke_record(st, ts, sig).map(|p| p.trace.clone()))
        .collect();
    Some(ConflictKind::MultipleWriter {
        signal,
        drivers: distinct.into_iter().collect(),
        traces,
    })
}

/// A peek on `signal` conflicts when the peeking thread isn't in the
/// lineage of a thread that drove the signal *during the same timestep as
/// the peek* — the peeker is observing a value it has no causal
/// relationship to. A signal driven once and then held steady (its scope
/// never closes) must not flag every later peek by a sibling thread: only a
/// poke and peek landing on the same timestep are compared (spec.md §4.5).
fn check_peek_after_poke(st: &CoreState, signal: SignalId, timestep: crate::action_log::Timestep) -> Vec<ConflictKind> {
    let drivers = driving_timescopes(st, signal);
    let mut conflicts = Vec::new();
    for peek in st
        .action_log
        .peeks(signal)
        .iter()
        .filter(|peek| peek.timestep == timestep)
    {
        let same_cycle_drivers: Vec<(TimescopeId, SignalId)> = drivers
            .iter()
            .copied()
            .filter(|&(ts, sig)| poke_record(st, ts, sig).map_or(false, |p| p.timestep == peek.timestep))
            .collect();
        if same_cycle_drivers.is_empty() {
            continue;
        }

        let peeker_lineage = st.arena.ancestor_threads(peek.timescope);
        let covered = same_cycle_drivers
            .iter()
            .filter_map(|&(ts, _)| st.arena.owning_thread(ts))
            .any(|t| peeker_lineage.contains(&t));
        if covered {
            continue;
        }

        let (driver_thread, poke_trace) = same_cycle_drivers
            .iter()
            .filter_map(|&(ts, sig)| {
                let thread = st.arena.owning_thread(ts)?;
                let trace = poke_record(st, ts, sig)?.trace.clone();
                Some((thread, trace))
            })
            .next()
            .expect("same_cycle_drivers is non-empty and every entry is a poking Scope");
        conflicts.push(ConflictKind::PeekAfterPokeByNonAncestor {
            signal,
            peeker: st
                .arena
                .owning_thread(peek.timescope)
                .expect("a peek's timescope always has an owning thread"),
            driver: driver_thread,
            peek_trace: peek.trace.clone(),
            poke_trace,
        });
    }
    conflicts
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action_log::{PeekRecord, SignalActionLog};
    use crate::scheduler::SchedulerState;
    use crate::timescope::{ScopeData, ThreadRootData, TimescopeArena};
    use std::collections::HashMap;

    fn core_state() -> CoreState {
        CoreState {
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
            combinational_paths: HashMap::new(),
            data_names: HashMap::new(),
        }
    }

    fn poke(value: u64) -> PokeRecord {
        PokeRecord {
            timestep: 0,
            action_id: 0,
            value,
            trace: Trace::capture(),
        }
    }

    #[test]
    fn sibling_threads_poking_same_signal_conflict() {
        let mut st = core_state();
        let thread_a: ThreadId = 1;
        let thread_b: ThreadId = 2;

        let a_root = st.arena.insert_thread_root(ThreadRootData {
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
        a.pokes.insert(SignalId(1), poke(1));
        let scope_a = st.arena.insert_scope(a);

        let b_root = st.arena.insert_thread_root(ThreadRootData {
            parent: TimescopeArena::ROOT,
            thread: thread_b,
            opened_timestep: 0,
            parent_action_id: 0,
        });
        let mut b = ScopeData {
            parent: b_root,
            thread: thread_b,
            opened_timestep: 0,
            parent_action_id: 0,
            next_action_id: 0,
            closed_timestep: None,
            pokes: HashMap::new(),
        };
        b.pokes.insert(SignalId(1), poke(2));
        let scope_b = st.arena.insert_scope(b);

        st.action_log.record_active_poke(SignalId(1), scope_a);
        st.action_log.record_active_poke(SignalId(1), scope_b);

        let kind = check_multi_writer(&st, SignalId(1), 0);
        assert!(matches!(kind, Some(ConflictKind::MultipleWriter { .. })));
    }

    #[test]
    fn parent_poke_covers_child_poke_no_conflict() {
        let mut st = core_state();
        let thread_a: ThreadId = 1;

        let a_root = st.arena.insert_thread_root(ThreadRootData {
            parent: TimescopeArena::ROOT,
            thread: thread_a,
            opened_timestep: 0,
            parent_action_id: 0,
        });
        let mut outer = ScopeData {
            parent: a_root,
            thread: thread_a,
            opened_timestep: 0,
            parent_action_id: 0,
            next_action_id: 0,
            closed_timestep: None,
            pokes: HashMap::new(),
        };
        outer.pokes.insert(SignalId(1), poke(1));
        let scope_outer = st.arena.insert_scope(outer);

        let mut inner = ScopeData {
            parent: scope_outer,
            thread: thread_a,
            opened_timestep: 0,
            parent_action_id: 0,
            next_action_id: 0,
            closed_timestep: None,
            pokes: HashMap::new(),
        };
        inner.pokes.insert(SignalId(1), poke(2));
        let scope_inner = st.arena.insert_scope(inner);

        st.action_log.record_active_poke(SignalId(1), scope_outer);
        st.action_log.record_active_poke(SignalId(1), scope_inner);

        assert!(check_multi_writer(&st, SignalId(1), 0).is_none());
    }

    #[test]
    fn peek_by_unrelated_thread_conflicts() {
        let mut st = core_state();
        let thread_a: ThreadId = 1;
        let thread_b: ThreadId = 2;

        let a_root = st.arena.insert_thread_root(ThreadRootData {
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
        a.pokes.insert(SignalId(1), poke(1));
        let scope_a = st.arena.insert_scope(a);
        st.action_log.record_active_poke(SignalId(1), scope_a);

        let b_root = st.arena.insert_thread_root(ThreadRootData {
            parent: TimescopeArena::ROOT,
            thread: thread_b,
            opened_timestep: 0,
            parent_action_id: 0,
        });
        let scope_b = st.arena.insert_scope(ScopeData {
            parent: b_root,
            thread: thread_b,
            opened_timestep: 0,
            parent_action_id: 0,
            next_action_id: 0,
            closed_timestep: None,
            pokes: HashMap::new(),
        });
        st.action_log.record_peek(
            SignalId(1),
            PeekRecord {
                timescope: scope_b,
                timestep: 0,
                action_id: 0,
                trace: Trace::capture(),
            },
        );

        let conflicts = check_peek_after_poke(&st, SignalId(1), 0);
        assert_eq!(conflicts.len(), 1);
        assert!(matches!(
            conflicts[0],
            ConflictKind::PeekAfterPokeByNonAncestor { .. }
        ));
    }

    #[test]
    fn held_poke_does_not_conflict_with_a_later_peek() {
        let mut st = core_state();
        let thread_a: ThreadId = 1;
        let thread_b: ThreadId = 2;

        // Thread A poked signal 1 back at timestep 0 and is just holding it
        // steady; thread B peeks it much later, at timestep 5.
        let a_root = st.arena.insert_thread_root(ThreadRootData {
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
        a.pokes.insert(SignalId(1), poke(1));
        let scope_a = st.arena.insert_scope(a);
        st.action_log.record_active_poke(SignalId(1), scope_a);

        let b_root = st.arena.insert_thread_root(ThreadRootData {
            parent: TimescopeArena::ROOT,
            thread: thread_b,
            opened_timestep: 5,
            parent_action_id: 0,
        });
        let scope_b = st.arena.insert_scope(ScopeData {
            parent: b_root,
            thread: thread_b,
            opened_timestep: 5,
            parent_action_id: 0,
            next_action_id: 0,
            closed_timestep: None,
            pokes: HashMap::new(),
        });
        st.action_log.record_peek(
            SignalId(1),
            PeekRecord {
                timescope: scope_b,
                timestep: 5,
                action_id: 0,
                trace: Trace::capture(),
            },
        );

        assert!(check_peek_after_poke(&st, SignalId(1), 5).is_empty());
    }

    #[test]
    fn held_poke_does_not_retrigger_multi_writer_on_a_later_timestep() {
        let mut st = core_state();
        let thread_a: ThreadId = 1;
        let thread_b: ThreadId = 2;

        // Both threads poked signal 1 back at timestep 0 and have simply
        // held their scopes open since; checking timestep 5 must not
        // re-report the same conflict every cycle.
        let a_root = st.arena.insert_thread_root(ThreadRootData {
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
        a.pokes.insert(SignalId(1), poke(1));
        let scope_a = st.arena.insert_scope(a);

        let b_root = st.arena.insert_thread_root(ThreadRootData {
            parent: TimescopeArena::ROOT,
            thread: thread_b,
            opened_timestep: 0,
            parent_action_id: 0,
        });
        let mut b = ScopeData {
            parent: b_root,
            thread: thread_b,
            opened_timestep: 0,
            parent_action_id: 0,
            next_action_id: 0,
            closed_timestep: None,
            pokes: HashMap::new(),
        };
        b.pokes.insert(SignalId(1), poke(2));
        let scope_b = st.arena.insert_scope(b);

        st.action_log.record_active_poke(SignalId(1), scope_a);
        st.action_log.record_active_poke(SignalId(1), scope_b);

        assert!(check_multi_writer(&st, SignalId(1), 5).is_none());
    }

    #[test]
    fn combinational_fan_in_counts_upstream_poke_as_driver() {
        let mut st = core_state();
        let thread_a: ThreadId = 1;
        let thread_b: ThreadId = 2;

        // Signal 2 is combinationally driven by signal 1.
        st.combinational_paths
            .entry(SignalId(2))
            .or_default()
            .insert(SignalId(1));

        let a_root = st.arena.insert_thread_root(ThreadRootData {
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
        a.pokes.insert(SignalId(1), poke(1));
        let scope_a = st.arena.insert_scope(a);
        st.action_log.record_active_poke(SignalId(1), scope_a);

        let b_root = st.arena.insert_thread_root(ThreadRootData {
            parent: TimescopeArena::ROOT,
            thread: thread_b,
            opened_timestep: 0,
            parent_action_id: 0,
        });
        let mut b = ScopeData {
            parent: b_root,
            thread: thread_b,
            opened_timestep: 0,
            parent_action_id: 0,
            next_action_id: 0,
            closed_timestep: None,
            pokes: HashMap::new(),
        };
        b.pokes.insert(SignalId(2), poke(9));
        let scope_b = st.arena.insert_scope(b);
        st.action_log.record_active_poke(SignalId(2), scope_b);

        // Signal 2's own drivers are just thread B, but via fan-in thread A
        // also counts as driving it, and neither covers the other.
        let kind = check_multi_writer(&st, SignalId(2), 0);
        assert!(matches!(kind, Some(ConflictKind::MultipleWriter { .. })));
    }
}
