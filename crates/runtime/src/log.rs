//! Console log: the evaluator's non-fatal diagnostic stream.
//!
//! Paired with `tracing`: a host with no subscriber installed still gets
//! the in-memory log `Runtime::get_console_log` returns; a host that
//! installs `tracing-subscriber` sees the same diagnostics as they
//! happen.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
pub struct ConsoleLog {
    entries: Vec<(LogLevel, String)>,
}

impl ConsoleLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warning => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
        self.entries.push((level, message));
    }

    pub fn entries(&self) -> &[(LogLevel, String)] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
