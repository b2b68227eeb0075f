//! Error kinds of spec.md §7. `InterruptedForTeardown` is deliberately
//! absent from this enum — the spec calls it out as "not an error", and it
//! is represented instead by the `Interrupted` panic payload in `thread.rs`
//! that never reaches the exception queue.

use std::any::Any;

use thiserror::Error;

use crate::action_log::{SignalId, Timestep};
use crate::thread::ThreadId;
use crate::trace::Trace;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Programmer error in the core or in user code driving it: wrong-thread
    /// close, stack mismatch, unexpected scheduler state. Always fatal.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// An arbitrary failure raised from a user-thread body.
    #[error("thread {thread} raised an exception: {message}")]
    UserException { thread: ThreadId, message: String },

    /// Surfaced by `timestep()`: a multi-writer or peek-ordering violation
    /// detected post-hoc.
    #[error("conflict on timestep {timestep}: {kind}")]
    Conflict {
        timestep: Timestep,
        kind: ConflictKind,
    },
}

impl CoreError {
    pub fn invariant(message: impl Into<String>) -> Self {
        CoreError::InvariantViolation(message.into())
    }
}

#[derive(Debug, Error)]
pub enum ConflictKind {
    #[error("multiple-writer conflict on signal {signal:?}: drivers {drivers:?}")]
    MultipleWriter {
        signal: SignalId,
        drivers: Vec<ThreadId>,
        traces: Vec<Trace>,
    },
    #[error(
        "peek on signal {signal:?} by thread {peeker} is not an ancestor of driving thread {driver}"
    )]
    PeekAfterPokeByNonAncestor {
        signal: SignalId,
        peeker: ThreadId,
        driver: ThreadId,
        peek_trace: Trace,
        poke_trace: Trace,
    },
}

/// Renders a caught panic payload into a message suitable for
/// `CoreError::UserException`. Handles the two payload shapes `std::panic`
/// actually produces (`&'static str` from `panic!("literal")`, `String` from
/// `panic!("{}", x)`); anything else is reported generically.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "user thread panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn panic_message_handles_str_and_string_payloads() {
        let a: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*a), "boom");

        let b: Box<dyn Any + Send> = Box::new(String::from("also boom"));
        assert_eq!(panic_message(&*b), "also boom");

        let c: Box<dyn Any + Send> = Box::new(42i32);
        assert_eq!(panic_message(&*c), "user thread panicked with a non-string payload");
    }
}
