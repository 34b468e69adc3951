//! Routes ray-tracing library log messages into `tracing`.
//!
//! The library reports `(level, tag, message)` triples through a callback.
//! Levels follow the OptiX convention: 1 fatal, 2 error, 3 warning, 4 print.
//! A message is emitted when its level is at or below the configured
//! threshold. A threshold of 0 silences everything, level 0 messages included.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "i32")]
pub struct LogLevel(u8);

impl LogLevel {
    pub const DISABLED: LogLevel = LogLevel(0);
    pub const FATAL: LogLevel = LogLevel(1);
    pub const ERROR: LogLevel = LogLevel(2);
    pub const WARNING: LogLevel = LogLevel(3);
    pub const PRINT: LogLevel = LogLevel(4);

    pub fn new(level: i32) -> Result<Self> {
        match u8::try_from(level) {
            Ok(level) if level <= Self::PRINT.0 => Ok(LogLevel(level)),
            _ => Err(Error::invalid(format!("log level {level} out of range (0-4 allowed)"))),
        }
    }

    pub fn get(self) -> u32 {
        self.0 as u32
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::PRINT
    }
}

impl TryFrom<i32> for LogLevel {
    type Error = Error;

    fn try_from(level: i32) -> Result<Self> {
        LogLevel::new(level)
    }
}

/// Process-side filter shared between the context and the library callback.
#[derive(Debug)]
pub struct LogFilter {
    threshold: AtomicU8,
}

impl LogFilter {
    pub fn new(level: LogLevel) -> Self {
        Self { threshold: AtomicU8::new(level.0) }
    }

    pub fn level(&self) -> LogLevel {
        LogLevel(self.threshold.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: LogLevel) {
        self.threshold.store(level.0, Ordering::Relaxed);
    }

    pub fn enabled(&self, level: u32) -> bool {
        let threshold = self.level().get();
        threshold > 0 && level <= threshold
    }

    pub fn emit(&self, level: u32, tag: &str, message: &str) {
        if !self.enabled(level) {
            return;
        }

        let message = message.trim_end();
        match level {
            0..=2 => error!(target: "optix", tag, severity = level, "{message}"),
            3 => warn!(target: "optix", tag, severity = level, "{message}"),
            _ => info!(target: "optix", tag, severity = level, "{message}"),
        }
    }
}

impl Default for LogFilter {
    fn default() -> Self {
        LogFilter::new(LogLevel::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn bounds_are_inclusive() {
        assert_eq!(LogLevel::new(0).unwrap(), LogLevel::DISABLED);
        assert_eq!(LogLevel::new(4).unwrap(), LogLevel::PRINT);
        assert_eq!(LogLevel::new(5).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(LogLevel::new(-1).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(LogLevel::new(i32::MAX).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn default_is_most_verbose() {
        assert_eq!(LogLevel::default().get(), 4);
        assert_eq!(LogFilter::default().level(), LogLevel::PRINT);
    }

    #[test]
    fn filter_threshold() {
        let filter = LogFilter::new(LogLevel::WARNING);
        assert!(filter.enabled(1));
        assert!(filter.enabled(3));
        assert!(!filter.enabled(4));

        filter.set_level(LogLevel::DISABLED);
        assert!(!filter.enabled(1));
        assert!(!filter.enabled(0));
    }

    #[test]
    fn deserializes_from_integer() {
        let level: LogLevel = serde_json::from_str("2").unwrap();
        assert_eq!(level, LogLevel::ERROR);
        assert!(serde_json::from_str::<LogLevel>("7").is_err());
    }
}
