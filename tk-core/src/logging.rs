// tk-core/src/logging.rs
// Stderr diagnostics for store internals. The store is a library, so it is
// quiet by default; one process-wide knob raises verbosity for recovery,
// reindex and commit tracing without pulling in a logger dependency.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// How much the store reports on stderr, from quietest to noisiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Verbosity {
    /// Nothing, not even warnings
    Silent = 0,
    /// Survivable anomalies: corrupt WAL encountered, truncate failures
    Warnings = 1,
    /// Recovery replays, reindex results, schema rebuilds
    Operations = 2,
    /// Per-step detail, e.g. discarded uncommitted WALs
    Debug = 3,
}

impl Verbosity {
    /// Parse a verbosity name (case-insensitive), e.g. from a CLI flag or
    /// environment variable owned by the embedding application.
    pub fn parse(s: &str) -> Option<Verbosity> {
        match s.to_ascii_lowercase().as_str() {
            "silent" | "off" => Some(Verbosity::Silent),
            "warn" | "warnings" => Some(Verbosity::Warnings),
            "ops" | "operations" => Some(Verbosity::Operations),
            "debug" => Some(Verbosity::Debug),
            _ => None,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Verbosity::Silent => "silent",
            Verbosity::Warnings => "warn",
            Verbosity::Operations => "ops",
            Verbosity::Debug => "debug",
        }
    }
}

// Quiet default: embedding applications opt in to diagnostics.
static VERBOSITY: AtomicU8 = AtomicU8::new(Verbosity::Warnings as u8);

/// Set the process-wide verbosity.
pub fn set_verbosity(level: Verbosity) {
    VERBOSITY.store(level as u8, Ordering::Relaxed);
}

/// Current process-wide verbosity.
pub fn verbosity() -> Verbosity {
    match VERBOSITY.load(Ordering::Relaxed) {
        0 => Verbosity::Silent,
        1 => Verbosity::Warnings,
        2 => Verbosity::Operations,
        _ => Verbosity::Debug,
    }
}

/// Write one diagnostic line: `tk[component] level: message`. The
/// component names the store subsystem (recovery, reindex, store, commit)
/// so interleaved output from several stores stays attributable.
#[doc(hidden)]
pub fn emit(level: Verbosity, component: &'static str, message: fmt::Arguments<'_>) {
    if level == Verbosity::Silent {
        return;
    }
    if level <= verbosity() {
        eprintln!("tk[{}] {}: {}", component, level.tag(), message);
    }
}

/// Report a survivable anomaly.
#[macro_export]
macro_rules! tk_warn {
    ($component:expr, $($arg:tt)*) => {
        $crate::logging::emit(
            $crate::logging::Verbosity::Warnings,
            $component,
            format_args!($($arg)*),
        )
    };
}

/// Report a completed store operation (recovery, reindex, rebuild).
#[macro_export]
macro_rules! tk_ops {
    ($component:expr, $($arg:tt)*) => {
        $crate::logging::emit(
            $crate::logging::Verbosity::Operations,
            $component,
            format_args!($($arg)*),
        )
    };
}

/// Report per-step detail.
#[macro_export]
macro_rules! tk_debug {
    ($component:expr, $($arg:tt)*) => {
        $crate::logging::emit(
            $crate::logging::Verbosity::Debug,
            $component,
            format_args!($($arg)*),
        )
    };
}
