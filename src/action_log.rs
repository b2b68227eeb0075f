//! C2: the per-signal action log (spec.md §3 "Signal action log", §4.2).

use std::collections::{HashMap, HashSet};

use crate::timescope::TimescopeId;
use crate::trace::Trace;

pub type Timestep = u64;
pub type ActionId = u64;
/// Signal values are opaque to the core; a plain bit-pattern is enough since
/// the simulator bridge (outside the core's scope) owns the actual wire
/// widths and types.
pub type SignalValue = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClockId(pub u32);

#[derive(Debug, Clone)]
pub struct PokeRecord {
    pub timestep: Timestep,
    pub action_id: ActionId,
    pub value: SignalValue,
    pub trace: Trace,
}

#[derive(Debug, Clone)]
pub struct PeekRecord {
    pub timescope: TimescopeId,
    pub timestep: Timestep,
    pub action_id: ActionId,
    pub trace: Trace,
}

/// `activePokes`/`signalPeeks` of spec.md §3. `activePokes[signal]` is kept
/// in insertion order with no duplicates, matching "ordered sequence of
/// Timescopes" in the spec.
#[derive(Default)]
pub struct SignalActionLog {
    active_pokes: HashMap<SignalId, Vec<TimescopeId>>,
    signal_peeks: HashMap<SignalId, Vec<PeekRecord>>,
}

impl SignalActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_active_poke(&mut self, signal: SignalId, ts: TimescopeId) {
        let scopes = self.active_pokes.entry(signal).or_default();
        if !scopes.contains(&ts) {
            scopes.push(ts);
        }
    }

    pub fn active_pokes(&self, signal: SignalId) -> &[TimescopeId] {
        self.active_pokes
            .get(&signal)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn signals_with_pokes(&self) -> impl Iterator<Item = &SignalId> {
        self.active_pokes.keys()
    }

    pub fn record_peek(&mut self, signal: SignalId, record: PeekRecord) {
        self.signal_peeks.entry(signal).or_default().push(record);
    }

    pub fn peeks(&self, signal: SignalId) -> &[PeekRecord] {
        self.signal_peeks
            .get(&signal)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn signals_with_peeks(&self) -> impl Iterator<Item = &SignalId> {
        self.signal_peeks.keys()
    }

    /// `timestep()`'s cleanup pass (spec.md §4.5): drop every closed
    /// timescope from `activePokes`, regardless of whether the signal still
    /// has a live driver through an ancestor (invariant 5 in spec.md §3:
    /// closed scopes are pruned unconditionally).
    pub fn prune_closed(&mut self, closed: &HashSet<TimescopeId>) {
        for scopes in self.active_pokes.values_mut() {
            scopes.retain(|ts| !closed.contains(ts));
        }
        self.active_pokes.retain(|_, scopes| !scopes.is_empty());
    }

    /// `timestep()` clears `signalPeeks` at every timestep boundary.
    pub fn clear_peeks(&mut self) {
        self.signal_peeks.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn trace() -> Trace {
        Trace::capture()
    }

    #[test]
    fn active_pokes_has_no_duplicates() {
        let mut log = SignalActionLog::new();
        let ts = TimescopeId(3);
        log.record_active_poke(SignalId(1), ts);
        log.record_active_poke(SignalId(1), ts);
        assert_eq!(log.active_pokes(SignalId(1)), &[ts]);
    }

    #[test]
    fn prune_closed_drops_only_closed_scopes() {
        let mut log = SignalActionLog::new();
        let open = TimescopeId(1);
        let closed = TimescopeId(2);
        log.record_active_poke(SignalId(5), open);
        log.record_active_poke(SignalId(5), closed);

        let mut closed_set = HashSet::new();
        closed_set.insert(closed);
        log.prune_closed(&closed_set);

        assert_eq!(log.active_pokes(SignalId(5)), &[open]);
    }

    #[test]
    fn clear_peeks_empties_every_signal() {
        let mut log = SignalActionLog::new();
        log.record_peek(
            SignalId(1),
            PeekRecord {
                timescope: TimescopeId(1),
                timestep: 0,
                action_id: 0,
                trace: trace(),
            },
        );
        log.clear_peeks();
        assert!(log.peeks(SignalId(1)).is_empty());
    }
}
