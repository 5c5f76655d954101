//! relaybuf-core: buffering engine for proxy telemetry
//!
//! Collected history values, discovery results and autoregistration events
//! are held in process memory or in a local SQLite database until the
//! upstream server acknowledges them, each stream exported once and in id
//! order.
//!
//! # Architecture
//!
//! ```text
//! producers ─▶ ProxyBuffer::submit ─┬─▶ QuotaAllocator + StreamQueue (memory)
//!                                   └─▶ DurableStore (database)
//!
//! ExportWorker ─▶ Exporter::run_cycle ─▶ next_batch ─▶ Transport ─▶ confirm_sent
//! ```
//!
//! # Modules
//!
//! - `buffer`: the controller owning queues, watermarks and state
//! - `state`: buffer modes, the four-state machine and its lock-free snapshot
//! - `quota`: bounded memory allocator with RAII leases
//! - `stream`: per-stream memory queue and watermark set
//! - `fallback`: quota and staleness conditions that leave memory mode
//! - `export`: upload batches merged from memory and the database
//! - `storage`: `DurableStore` trait and the SQLite implementation
//! - `tables`: table layout and field-to-wire-tag mapping
//! - `transport`: upload documents and the `Transport` trait
//! - `worker`: export cycle and async worker
//! - `config`, `logging`, `error`, `clock`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod buffer;
pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod fallback;
pub mod logging;
pub mod quota;
pub mod record;
pub mod state;
pub mod storage;
pub mod stream;
pub mod tables;
pub mod transport;
pub mod worker;

pub use buffer::{Admission, BufferStats, HousekeepReport, ProxyBuffer, StateTransition};
pub use config::BufferConfig;
pub use error::{BufferError, Error, Result};
pub use export::{Batch, IdGap};
pub use record::{AutoregRecord, DiscoveryRecord, HistoryRecord, Record, Stream, Timespec};
pub use state::{BufferMode, BufferState, StorageTier};
pub use storage::{DurableStore, SqliteStore};
pub use transport::{JsonLinesTransport, Transport, UploadBatch};
pub use worker::{ExportWorker, Exporter};
