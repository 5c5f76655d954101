//! Buffer configuration.
//!
//! Loaded from TOML. Every section is optional; missing keys take the
//! defaults below.
//!
//! ```toml
//! mode = "hybrid"
//! memory_size = 16777216
//! max_age_secs = 600
//! offline_buffer_hours = 24
//!
//! [export]
//! max_records = 1000
//!
//! [streams.discovery]
//! memory = false
//!
//! [database]
//! path = "/var/lib/relaybuf/buffer.db"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::{LogConfig, LogLevel};
use crate::record::Stream;
use crate::state::BufferMode;

/// Records per upload batch.
pub const MAX_RECORDS: usize = 1000;
/// Records per export cycle across all streams.
pub const MAX_RECORDS_TOTAL: usize = 10_000;
/// Largest upload document accepted upstream (1 GiB).
pub const MAX_PAYLOAD_BYTES: usize = 1 << 30;
/// Headroom for the document envelope: four maximal text values plus 4 KiB.
pub const RESERVED_BYTES: usize = 65_536 * 4 + 4 * 1024;
/// Offline buffer bounds, hours.
pub const OFFLINE_BUFFER_HOURS_MIN: u32 = 1;
pub const OFFLINE_BUFFER_HOURS_MAX: u32 = 720;

/// Output format for logs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Upload limits and export cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub max_records: usize,
    pub max_records_total: usize,
    pub max_payload_bytes: usize,
    pub reserved_bytes: usize,
    /// Export cycle period in milliseconds.
    pub interval_ms: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_records: MAX_RECORDS,
            max_records_total: MAX_RECORDS_TOTAL,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            reserved_bytes: RESERVED_BYTES,
            interval_ms: 1000,
        }
    }
}

impl ExportConfig {
    /// Largest single upload document.
    #[must_use]
    pub fn record_limit(&self) -> usize {
        self.max_payload_bytes.saturating_sub(self.reserved_bytes)
    }

    /// Byte budget for one batch.
    #[must_use]
    pub fn batch_limit(&self) -> usize {
        self.record_limit() / 2
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Buffering policy for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamPolicy {
    /// Whether records of this stream may be held in memory. When false the
    /// stream is written through to the database in every state.
    pub memory: bool,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self { memory: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    pub history: StreamPolicy,
    pub discovery: StreamPolicy,
    pub autoreg: StreamPolicy,
}

impl StreamsConfig {
    #[must_use]
    pub const fn policy(&self, stream: Stream) -> StreamPolicy {
        match stream {
            Stream::History => self.history,
            Stream::Discovery => self.discovery,
            Stream::Autoreg => self.autoreg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("relaybuf.db"),
            busy_timeout_ms: 5000,
        }
    }
}

impl DatabaseConfig {
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Top-level buffer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub mode: BufferMode,
    /// Memory quota ceiling in bytes.
    pub memory_size: usize,
    /// Longest a record may stay in memory before the buffer falls back to
    /// the database. 0 disables the check.
    pub max_age_secs: u64,
    /// Unsent records older than this are discarded by housekeeping.
    pub offline_buffer_hours: u32,
    /// Free quota required before switching back to memory.
    pub min_headroom_bytes: usize,
    pub export: ExportConfig,
    pub streams: StreamsConfig,
    pub database: DatabaseConfig,
    pub log: LogConfig,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            mode: BufferMode::Disk,
            memory_size: 16 * 1024 * 1024,
            max_age_secs: 0,
            offline_buffer_hours: OFFLINE_BUFFER_HOURS_MIN,
            min_headroom_bytes: 0,
            export: ExportConfig::default(),
            streams: StreamsConfig::default(),
            database: DatabaseConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl BufferConfig {
    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    #[must_use]
    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_secs > 0).then(|| Duration::from_secs(self.max_age_secs))
    }

    #[must_use]
    pub fn offline_buffer_secs(&self) -> u64 {
        u64::from(self.offline_buffer_hours) * 3600
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode.allows_memory() && self.memory_size == 0 {
            return Err(ConfigError::ValidationError(format!(
                "memory_size must be > 0 in {} mode",
                self.mode
            )));
        }
        if self.min_headroom_bytes > self.memory_size {
            return Err(ConfigError::ValidationError(format!(
                "min_headroom_bytes ({}) exceeds memory_size ({})",
                self.min_headroom_bytes, self.memory_size
            )));
        }
        if !(OFFLINE_BUFFER_HOURS_MIN..=OFFLINE_BUFFER_HOURS_MAX)
            .contains(&self.offline_buffer_hours)
        {
            return Err(ConfigError::ValidationError(format!(
                "offline_buffer_hours must be within {OFFLINE_BUFFER_HOURS_MIN}..={OFFLINE_BUFFER_HOURS_MAX}, got {}",
                self.offline_buffer_hours
            )));
        }
        if self.export.max_payload_bytes <= self.export.reserved_bytes {
            return Err(ConfigError::ValidationError(format!(
                "export.max_payload_bytes ({}) must exceed export.reserved_bytes ({})",
                self.export.max_payload_bytes, self.export.reserved_bytes
            )));
        }
        if self.export.max_records == 0 || self.export.max_records_total == 0 {
            return Err(ConfigError::ValidationError(
                "export.max_records and export.max_records_total must be >= 1".to_string(),
            ));
        }
        if self.export.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "export.interval_ms must be > 0".to_string(),
            ));
        }
        LogLevel::from_str(&self.log.level).map_err(ConfigError::ValidationError)?;
        Ok(())
    }
}
