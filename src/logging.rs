//! Process-wide routing of HBM's `log` records to a caller callback.

use std::fmt;
use std::sync::{Once, PoisonError, RwLock};

/// Log level of a message or the message filter.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Disables all messages.
    Off = 0,
    /// A mandatory operation failed.
    Error = 1,
    /// An optional operation failed.
    Warn = 2,
    Info = 3,
    Debug = 4,
}

impl LogLevel {
    #[must_use]
    pub const fn to_filter(self) -> log::LevelFilter {
        match self {
            Self::Off => log::LevelFilter::Off,
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
        }
    }

    /// Converts a raw C level, clamping unknown values to `Debug`.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Off,
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            _ => Self::Debug,
        }
    }
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Self::Error,
            log::Level::Warn => Self::Warn,
            log::Level::Info => Self::Info,
            log::Level::Debug | log::Level::Trace => Self::Debug,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "OFF",
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        })
    }
}

pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

struct Logger {
    callback: RwLock<Option<LogCallback>>,
}

static LOGGER: Logger = Logger {
    callback: RwLock::new(None),
};

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = LogLevel::from(record.level());
        let msg = record.args().to_string();
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match callback.as_ref() {
            Some(cb) => cb(level, &msg),
            None => eprintln!("[hbm] {level}: {msg}"),
        }
    }

    fn flush(&self) {}
}

/// Installs the HBM logger.
///
/// The logger is registered on the first call; every call sets the maximum level and replaces
/// the callback.  Without a callback, messages go to stderr.  If the process already has another
/// `log` implementation, HBM records go there instead.
pub fn log_init(max_level: LogLevel, callback: Option<LogCallback>) {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if let Err(e) = log::set_logger(&LOGGER) {
            eprintln!("[hbm] WARN: {e}");
        }
    });

    *LOGGER
        .callback
        .write()
        .unwrap_or_else(PoisonError::into_inner) = callback;
    log::set_max_level(max_level.to_filter());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn callback_receives_filtered_messages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: LogCallback = Box::new(move |level, msg: &str| {
            if msg.starts_with("hbm-log-test") {
                sink.lock().unwrap().push((level, msg.to_string()));
            }
        });
        log_init(LogLevel::Info, Some(callback));

        log::info!("hbm-log-test one");
        log::debug!("hbm-log-test hidden");
        log::error!("hbm-log-test two");

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (LogLevel::Info, "hbm-log-test one".to_string()),
                (LogLevel::Error, "hbm-log-test two".to_string()),
            ]
        );
    }

    #[test]
    fn raw_levels() {
        assert_eq!(LogLevel::from_raw(0), LogLevel::Off);
        assert_eq!(LogLevel::from_raw(2), LogLevel::Warn);
        assert_eq!(LogLevel::from_raw(99), LogLevel::Debug);
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
        assert!(LogLevel::Error < LogLevel::Debug);
    }
}
