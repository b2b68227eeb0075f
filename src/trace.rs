use std::fmt;

use backtrace::Backtrace;

use crate::config::Config;

/// An opaque captured call site, stashed on every `PokeRecord`/`PeekRecord`
/// so conflict diagnostics can point at the offending poke or peek. `rd`
/// depends on `backtrace` for exactly this kind of after-the-fact capture;
/// we reuse it here instead of rolling our own stack walker.
#[derive(Clone)]
pub struct Trace(Backtrace);

impl Trace {
    /// Captures the caller's stack. Symbol resolution is skipped unless
    /// `TIMESCOPE_FULL_BACKTRACE` is set, since doPoke/doPeek are on the hot
    /// path of every test and resolving symbols on each call is not cheap.
    pub fn capture() -> Self {
        let bt = if Config::get().capture_full_backtraces {
            Backtrace::new()
        } else {
            Backtrace::new_unresolved()
        };
        Trace(bt)
    }

    pub fn resolve(&mut self) {
        self.0.resolve();
    }

    pub fn frame_count(&self) -> usize {
        self.0.frames().len()
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Trace({} frames)", self.0.frames().len())
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}
