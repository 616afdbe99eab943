//! Runtime configuration.
//!
//! Read once at startup and passed by reference into constructors. Nothing in
//! the library consults the environment after construction except path
//! resolution, which happens inside the constructor that needs it.
//!
//! # Environment Variable
//!
//! Set `REQSOCK_DEBUG` to an integer verbosity:
//! - `0` - no logging
//! - `1` - errors
//! - `2` - warnings and errors (default)
//! - `3` - info, warnings and errors

use serde::{Deserialize, Serialize};

/// Name of the verbosity environment variable.
pub const DEBUG_ENV_VAR: &str = "REQSOCK_DEBUG";

/// Default initial receive buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default capacity of the pending-reply FIFO and the handler table.
pub const DEFAULT_CAPACITY: usize = 128;

/// Default `listen(2)` backlog.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 128;

/// Library log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Logging disabled.
    None,
    /// Errors only.
    Error,
    /// Warnings and errors.
    #[default]
    Warn,
    /// Informational messages, warnings and errors.
    Info,
}

impl LogLevel {
    /// Parse the integer form used by `REQSOCK_DEBUG`.
    ///
    /// Returns `None` for anything that is not `0..=3`.
    #[must_use]
    pub fn from_level_str(s: &str) -> Option<Self> {
        match s.trim().parse::<u32>().ok()? {
            0 => Some(Self::None),
            1 => Some(Self::Error),
            2 => Some(Self::Warn),
            3 => Some(Self::Info),
            _ => None,
        }
    }

    /// Matching `log` crate filter.
    #[must_use]
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            Self::None => log::LevelFilter::Off,
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Error => write!(f, "error"),
            Self::Warn => write!(f, "warn"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// Configuration shared by senders, receivers, clients and servers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Log verbosity, from `REQSOCK_DEBUG`.
    pub log_level: LogLevel,
    /// Initial receive buffer capacity; doubled on demand.
    pub buffer_size: usize,
    /// Maximum number of requests awaiting a reply on one sender.
    pub pending_capacity: usize,
    /// Maximum number of request handlers on one server.
    pub handler_capacity: usize,
    /// Backlog passed to `listen(2)`.
    pub listen_backlog: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            pending_capacity: DEFAULT_CAPACITY,
            handler_capacity: DEFAULT_CAPACITY,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
        }
    }
}

impl Config {
    /// Defaults plus the verbosity read from `REQSOCK_DEBUG`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Config::from_env`] but with an injectable variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = lookup(DEBUG_ENV_VAR)
            .and_then(|v| LogLevel::from_level_str(&v))
            .unwrap_or_default();
        Self {
            log_level,
            ..Self::default()
        }
    }

    /// Builder-style override of the receive buffer size.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Builder-style override of the pending-reply FIFO capacity.
    #[must_use]
    pub fn with_pending_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity;
        self
    }

    /// Builder-style override of the handler table capacity.
    #[must_use]
    pub fn with_handler_capacity(mut self, capacity: usize) -> Self {
        self.handler_capacity = capacity;
        self
    }
}
