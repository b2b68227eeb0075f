use std::env;

use crate::log::LogLevel;
use lazy_static::lazy_static;

lazy_static! {
    static ref CONFIG: Config = init_config();
}

/// Process-wide tunables. The core has no CLI of its own (the driver owns
/// that), so these are read once from the environment, the way `Flags` does
/// it for `rd`.
#[derive(Clone, Debug)]
pub struct Config {
    pub log_level: LogLevel,
    /// Resolve symbol names when capturing a poke/peek trace. Off by default
    /// because resolving symbols on every poke is not cheap.
    pub capture_full_backtraces: bool,
    /// Whether `timestep()` should run the conflict checks of spec.md §4.5 at
    /// all. Exists for drivers that want to disable the checks entirely
    /// during a bring-up run with known-dirty scheduling.
    pub strict_conflict_checks: bool,
}

impl Config {
    pub fn get() -> &'static Config {
        &CONFIG
    }
}

fn init_config() -> Config {
    Config {
        log_level: env::var("TIMESCOPE_LOG")
            .ok()
            .and_then(|s| LogLevel::parse(&s))
            .unwrap_or(LogLevel::Warn),
        capture_full_backtraces: env_flag("TIMESCOPE_FULL_BACKTRACE", false),
        strict_conflict_checks: env_flag("TIMESCOPE_STRICT_CONFLICTS", true),
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => v != "0" && !v.eq_ignore_ascii_case("false"),
        Err(_) => default,
    }
}
