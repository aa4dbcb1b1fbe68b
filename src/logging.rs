//! Tracing subscriber setup for the binary.
//!
//! Filter priority, highest first:
//! 1. `DEADLINE_REBALANCER_LOG` (full `EnvFilter` directives)
//! 2. `RUST_LOG`
//! 3. `-v` / `-q` command-line flags
//! 4. `warn`

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Crate-specific log directive variable.
pub const LOG_ENV: &str = "DEADLINE_REBALANCER_LOG";

/// Verbosity selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    /// `-v` → info, `-vv` → debug, `-vvv` and beyond → trace.
    Verbose(u8),
}

impl Verbosity {
    pub fn from_flags(verbose: u8, quiet: bool) -> Self {
        if verbose > 0 {
            Verbosity::Verbose(verbose)
        } else if quiet {
            Verbosity::Quiet
        } else {
            Verbosity::Normal
        }
    }

    pub fn level(self) -> Level {
        match self {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Normal => Level::WARN,
            Verbosity::Verbose(1) => Level::INFO,
            Verbosity::Verbose(2) => Level::DEBUG,
            Verbosity::Verbose(_) => Level::TRACE,
        }
    }
}

/// Install the global subscriber, writing to stderr.
///
/// Returns an error if a subscriber is already installed.
pub fn init(verbosity: Verbosity) -> Result<(), tracing_subscriber::util::TryInitError> {
    let use_ansi = std::io::IsTerminal::is_terminal(&std::io::stderr());
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(use_ansi)
        .with_thread_names(true)
        .with_target(false);

    tracing_subscriber::registry()
        .with(build_filter(verbosity))
        .with(layer)
        .try_init()
}

fn build_filter(verbosity: Verbosity) -> EnvFilter {
    if let Ok(directives) = std::env::var(LOG_ENV) {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(verbosity.level().as_str())
}
