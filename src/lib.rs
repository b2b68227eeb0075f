//! A cooperative threading and timescope core for hardware-simulation test
//! drivers: user stimulus threads run as OS threads multiplexed one-at-a-time
//! onto a single-threaded simulator, nested lexically-scoped timescopes
//! auto-revert their pokes on close, and concurrent pokes/peeks on the same
//! signal are checked for conflicts at each timestep boundary.
//!
//! This crate is a library only — it has no notion of a wire protocol, a
//! simulator process, or a CLI; a driver embeds `TesterCore` and wires it to
//! whatever simulator bridge it has (spec.md §6 "External interface").

pub mod action_log;
pub mod config;
mod conflict;
pub mod core;
pub mod error;
#[macro_use]
pub mod log;
pub mod scheduler;
pub mod thread;
pub mod timescope;
pub mod trace;

pub use crate::action_log::{ClockId, SignalId, SignalValue, Timestep};
pub use crate::core::TesterCore;
pub use crate::error::{ConflictKind, CoreError};
pub use crate::thread::TesterThread;
pub use crate::timescope::TimescopeId;
