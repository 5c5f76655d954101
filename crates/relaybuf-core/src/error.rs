//! Error types for relaybuf-core

use std::fmt::Write;
use thiserror::Error;

use crate::record::Stream;
use crate::state::BufferState;

/// Operator guidance attached to an error: what to change, which
/// `relaybuf` invocations help diagnose it, and the config key involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remediation {
    pub summary: String,
    pub commands: Vec<String>,
    pub config_key: Option<&'static str>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            config_key: None,
        }
    }

    /// Suggest running `relaybuf <args>`.
    #[must_use]
    pub fn run(mut self, args: impl AsRef<str>) -> Self {
        self.commands.push(format!("relaybuf {}", args.as_ref()));
        self
    }

    #[must_use]
    pub fn key(mut self, key: &'static str) -> Self {
        self.config_key = Some(key);
        self
    }

    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = format!("To fix:\n  {}\n", self.summary);
        for cmd in &self.commands {
            let _ = writeln!(output, "  $ {cmd}");
        }
        if let Some(key) = self.config_key {
            let _ = writeln!(output, "  Config key: {key}");
        }
        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for relaybuf-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Buffer(err) => Some(err.remediation()),
            Self::Storage(err) => Some(err.remediation()),
            Self::Transport(_) => Some(
                Remediation::new("Upload failed. Records stay buffered and are offered again next cycle.")
                    .run("inspect")
                    .key("export.max_payload_bytes"),
            ),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions on the database and output paths.")
                    .run("config"),
            ),
            Self::Json(_) => None,
        }
    }
}

/// Errors raised by the buffering engine itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Quota ceiling would be exceeded; the caller routes to durable storage
    /// or reports backpressure to the producer.
    #[error("admission denied for {stream}: requested {requested} bytes, {free} bytes free")]
    AdmissionDenied {
        stream: Stream,
        requested: usize,
        free: usize,
    },

    /// A gap between the expected next id and the next available record.
    #[error("data loss in {stream}: ids {first_missing}..={last_missing} missing (state {state})")]
    DataLoss {
        stream: Stream,
        first_missing: u64,
        last_missing: u64,
        state: BufferState,
    },

    #[error("durable storage unavailable for {stream}: {reason}")]
    DurableUnavailable { stream: Stream, reason: String },

    /// Programming error: double free, foreign handle, id reuse, sent past
    /// the retrievable range. Never recovered from.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("transition from {from} not allowed: {reason}")]
    Transition { from: BufferState, reason: String },
}

impl BufferError {
    /// Whether the caller may continue after logging the error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvariantViolation(_))
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::AdmissionDenied { .. } => Remediation::new(
                "Memory quota exhausted. Raise memory_size, or use hybrid mode so overflow spills to the database.",
            )
            .run("inspect")
            .key("memory_size"),
            Self::DataLoss {
                first_missing,
                last_missing,
                ..
            } => Remediation::new(format!(
                "Records {first_missing}..={last_missing} were not retrievable and were skipped."
            ))
            .run("inspect --format json"),
            Self::DurableUnavailable { .. } => Remediation::new(
                "The local database could not be written or read. Check disk space and permissions.",
            )
            .run("inspect")
            .key("database.busy_timeout_ms"),
            Self::InvariantViolation(_) => Remediation::new(
                "Internal consistency check failed. Capture the debug log and the inspect output.",
            )
            .run("inspect --format json --log-level debug"),
            Self::Transition { .. } => Remediation::new(
                "State change refused. Disk mode stays on the database; otherwise wait for the current drain.",
            )
            .key("mode"),
        }
    }
}

/// Durable storage errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Corrupt row in {table} at id {id}: {details}")]
    Corrupt {
        table: String,
        id: u64,
        details: String,
    },
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy
                        | rusqlite::ErrorCode::DatabaseLocked
                        | rusqlite::ErrorCode::CannotOpen
                        | rusqlite::ErrorCode::DiskFull
                ) =>
            {
                Self::Unavailable(err.to_string())
            }
            other => Self::Database(other.to_string()),
        }
    }
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) | Self::Unavailable(_) => Remediation::new(
                "Database operation failed. database.path must be writable and the disk not full.",
            )
            .key("database.path"),
            Self::Schema(_) => Remediation::new(
                "Existing tables do not match the buffer schema. Move the database aside.",
            )
            .run("inspect"),
            Self::Corrupt { .. } => Remediation::new(
                "Corrupt rows found. Drain what remains, then recreate the database.",
            )
            .run("drain --out backlog.jsonl"),
        }
    }
}

/// Upstream transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("upstream rejected batch: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Cannot read {path}. Check the path or set RELAYBUF_CONFIG."))
            }
            Self::ParseFailed(_) | Self::SerializeFailed(_) => {
                Remediation::new("Fix the TOML syntax. `relaybuf config` prints a valid file.")
                    .run("config")
            }
            Self::ValidationError(_) => Remediation::new("Fix the field named above and validate again.")
                .run("config --validate <path>"),
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
