use serde::Deserialize;

use crate::diagnostics::LogLevel;

/// Settings a host application picks when creating a [`crate::TraceContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Threshold for library log messages (0-4).
    pub log_level: LogLevel,
    /// CUDA device whose primary context is bound when no context is current.
    pub device_ordinal: u32,
}

impl TraceConfig {
    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = log_level;
        self
    }

    pub fn with_device_ordinal(mut self, device_ordinal: u32) -> Self {
        self.device_ordinal = device_ordinal;
        self
    }
}
