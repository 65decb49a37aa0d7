#![deny(missing_docs)]
//! Shared logging utilities for the pdfbatch workspace.
//!
//! This crate provides the `engine_*` logging macros used across the codebase,
//! the `simplelog` backend setup used by the server binary, and a minimal test
//! initializer for the global logger.

use std::fs::File;
use std::path::Path;

use log::LevelFilter;
use serde::Deserialize;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    TestLogger, WriteLogger,
};

/// `log::trace!` under the workspace name.
#[macro_export]
macro_rules! engine_trace {
    ($($arg:tt)*) => {{
        log::trace!($($arg)*);
    }};
}

/// Logs an info-level message using the global logging facade.
#[macro_export]
macro_rules! engine_info {
    ($($arg:tt)*) => {{
        log::info!($($arg)*);
    }};
}

/// `log::debug!` under the workspace name.
#[macro_export]
macro_rules! engine_debug {
    ($($arg:tt)*) => {{
        log::debug!($($arg)*);
    }};
}

/// `log::warn!` under the workspace name.
#[macro_export]
macro_rules! engine_warn {
    ($($arg:tt)*) => {{
        log::warn!($($arg)*);
    }};
}

/// Logs an error-level message using the global logging facade.
#[macro_export]
macro_rules! engine_error {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
    }};
}

/// Where log records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum LogDestination {
    /// The log file only.
    File,
    /// Stdout/stderr only.
    #[default]
    Terminal,
    /// Log file and terminal.
    Both,
}

impl LogDestination {
    fn to_terminal(self) -> bool {
        matches!(self, LogDestination::Terminal | LogDestination::Both)
    }

    fn to_file(self) -> bool {
        matches!(self, LogDestination::File | LogDestination::Both)
    }
}

/// Installs the global logger for a server process.
///
/// The log file is opened in append mode so restarts keep earlier history. If
/// it cannot be opened the problem goes to stderr and only the terminal sink
/// (if any) is installed. Returns `false` when nothing was installed, either
/// because no sink could be built or a logger already exists.
pub fn initialize(destination: LogDestination, level: LevelFilter, log_path: &Path) -> bool {
    let mut sinks: Vec<Box<dyn SharedLogger>> = Vec::with_capacity(2);
    if destination.to_terminal() {
        sinks.push(TermLogger::new(
            level,
            server_config(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }
    if destination.to_file() {
        match open_log_file(log_path) {
            Ok(file) => sinks.push(WriteLogger::new(level, server_config(), file)),
            Err(err) => eprintln!("Log file {log_path:?} unavailable, file logging disabled: {err}"),
        }
    }
    if sinks.is_empty() {
        return false;
    }
    CombinedLogger::init(sinks).is_ok()
}

/// Routes log output through the test harness so it is shown only for
/// failing tests. Later calls are no-ops.
pub fn initialize_for_tests() {
    let _ = TestLogger::init(LevelFilter::Debug, Config::default());
}

fn server_config() -> Config {
    ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_target_level(LevelFilter::Error)
        .add_filter_ignore_str("hyper")
        .add_filter_ignore_str("reqwest")
        .build()
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    File::options().create(true).append(true).open(path)
}
