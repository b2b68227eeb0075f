//! A tiny internal logging facade, in the style `rd` uses in `flags.rs` and
//! `thread_group.rs` (`crate::log::LogLevel::LogDebug`) rather than pulling
//! in the `log`/`tracing` crates: the core has no business picking a
//! subscriber for its host process.

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Logs at `$level` if the configured threshold lets it through.
///
/// ```ignore
/// log!(LogLevel::Debug, "dispatching thread {} at level {}", tid, level);
/// ```
#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)+) => {
        if $level >= $crate::config::Config::get().log_level {
            eprintln!("[{:?}] {}", $level, format!($($arg)+));
        }
    };
}
