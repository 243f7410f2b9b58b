//! Output classifiers for collaborator programs
//!
//! Each program prefixes its log lines differently. A classifier strips the
//! prefix and maps the program's level name onto [`LogLevel`]. Lines that do
//! not match the expected shape are passed through at `info`.

/// Normalized severity of one output line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Map a program's level name; unknown names are `Info`
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "debug" | "trace" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "err" | "error" | "fatal" | "alert" | "emerg" | "crit" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Splits a raw output line into a level and a cleaned message
pub trait LineClassifier: Send + Sync {
    fn classify(&self, line: &str) -> (LogLevel, String);
}

/// Pass-through classifier
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainLog;

impl LineClassifier for PlainLog {
    fn classify(&self, line: &str) -> (LogLevel, String) {
        (LogLevel::Info, line.to_string())
    }
}

/// Tor: `Oct 19 14:31:02.000 [notice] Bootstrapped 100% (done): Done`
#[derive(Debug, Default, Clone, Copy)]
pub struct TorLog;

impl LineClassifier for TorLog {
    fn classify(&self, line: &str) -> (LogLevel, String) {
        match bracketed(line) {
            Some((level, rest)) => (LogLevel::from_name(level), rest.trim_start().to_string()),
            None => (LogLevel::Info, line.to_string()),
        }
    }
}

/// Privoxy: `2024-01-15 10:22:33.123 7f5e0c1f2700 Fatal error: can't bind`
#[derive(Debug, Default, Clone, Copy)]
pub struct PrivoxyLog;

impl LineClassifier for PrivoxyLog {
    fn classify(&self, line: &str) -> (LogLevel, String) {
        let Some((head, message)) = line.split_once(": ") else {
            return (LogLevel::Info, line.to_string());
        };

        // date, time and thread id precede the level words
        match head.split_whitespace().nth(3) {
            Some(level) => (LogLevel::from_name(level), message.to_string()),
            None => (LogLevel::Info, line.to_string()),
        }
    }
}

/// HAProxy: `[WARNING]  (1234) : config : missing timeouts`
#[derive(Debug, Default, Clone, Copy)]
pub struct HaproxyLog;

impl LineClassifier for HaproxyLog {
    fn classify(&self, line: &str) -> (LogLevel, String) {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('[') {
            return (LogLevel::Info, line.to_string());
        }
        let Some((level, rest)) = bracketed(trimmed) else {
            return (LogLevel::Info, line.to_string());
        };

        let message = match rest.split_once(": ") {
            Some((_, message)) => message,
            None => rest.trim_start(),
        };
        (LogLevel::from_name(level), message.to_string())
    }
}

/// Returns the text inside the first `[...]` and everything after it
fn bracketed(line: &str) -> Option<(&str, &str)> {
    let open = line.find('[')?;
    let close = open + line[open..].find(']')?;
    Some((&line[open + 1..close], &line[close + 1..]))
}
