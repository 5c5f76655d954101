//! Shared fixtures for relaybuf-core integration tests.
//!
//! ```ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use relaybuf_core::clock::ManualClock;
use relaybuf_core::error::{StorageError, TransportError};
use relaybuf_core::storage::{DurableRow, ReadLimits};
use relaybuf_core::tables::{EncodedRow, TableSet};
use relaybuf_core::{
    BufferConfig, BufferMode, DurableStore, HistoryRecord, ProxyBuffer, Record, SqliteStore,
    Stream, Timespec, Transport, UploadBatch,
};

pub const T0: u64 = 1_700_000_000;

pub fn config(mode: BufferMode, memory_size: usize) -> BufferConfig {
    BufferConfig {
        mode,
        memory_size,
        ..BufferConfig::default()
    }
}

pub fn open(config: BufferConfig, store: Arc<dyn DurableStore>, clock: &ManualClock) -> ProxyBuffer {
    ProxyBuffer::open(config, store, Arc::new(clock.clone())).expect("open buffer")
}

pub fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory().expect("in-memory sqlite"))
}

/// History record whose quota charge is exactly `bytes`.
pub fn history_of_size(bytes: usize) -> HistoryRecord {
    let base = Record::from(HistoryRecord::new(1, Timespec::new(10, 0), "")).mem_size();
    assert!(bytes >= base, "{bytes} is below the fixed record size {base}");
    let record = HistoryRecord::new(1, Timespec::new(10, 0), "x".repeat(bytes - base));
    assert_eq!(Record::from(record.clone()).mem_size(), bytes);
    record
}

pub fn history(value: &str) -> HistoryRecord {
    HistoryRecord::new(42, Timespec::new(T0 as i64, 0), value)
}

/// Export `stream` through `next_batch`/`confirm_sent` until empty and
/// return the ids in delivery order.
pub fn drain_all(buffer: &ProxyBuffer, stream: Stream) -> Vec<u64> {
    let mut ids = Vec::new();
    for _ in 0..10_000 {
        let batch = buffer.next_batch(stream, 7, usize::MAX);
        if batch.is_empty() {
            break;
        }
        ids.extend(batch.rows.iter().map(|row| row.id));
        buffer.confirm_sent(&batch).expect("confirm");
    }
    ids
}

/// SQLite store whose reads or writes can be made to fail.
pub struct FlakyStore {
    inner: SqliteStore,
    pub fail_writes: AtomicBool,
    pub fail_reads: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteStore::open_in_memory().expect("in-memory sqlite"),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("disk I/O error".to_string()))
        } else {
            Ok(())
        }
    }
}

impl DurableStore for FlakyStore {
    fn tables(&self) -> &TableSet {
        self.inner.tables()
    }

    fn insert(&self, rows: &[DurableRow]) -> Result<(), StorageError> {
        Self::check(&self.fail_writes)?;
        self.inner.insert(rows)
    }

    fn read_forward(
        &self,
        stream: Stream,
        after_id: u64,
        limits: ReadLimits,
    ) -> Result<Vec<EncodedRow>, StorageError> {
        Self::check(&self.fail_reads)?;
        self.inner.read_forward(stream, after_id, limits)
    }

    fn max_id(&self, stream: Stream) -> Result<u64, StorageError> {
        self.inner.max_id(stream)
    }

    fn count_after(&self, stream: Stream, after_id: u64) -> Result<u64, StorageError> {
        self.inner.count_after(stream, after_id)
    }

    fn last_sent_id(&self, stream: Stream) -> Result<u64, StorageError> {
        self.inner.last_sent_id(stream)
    }

    fn set_last_sent_id(&self, stream: Stream, id: u64) -> Result<(), StorageError> {
        Self::check(&self.fail_writes)?;
        self.inner.set_last_sent_id(stream, id)
    }

    fn delete_through(&self, stream: Stream, id: u64) -> Result<usize, StorageError> {
        Self::check(&self.fail_writes)?;
        self.inner.delete_through(stream, id)
    }

    fn expire_before(
        &self,
        stream: Stream,
        after_id: u64,
        cutoff: u64,
    ) -> Result<Option<u64>, StorageError> {
        Self::check(&self.fail_reads)?;
        self.inner.expire_before(stream, after_id, cutoff)
    }
}

/// Transport that records delivered ids and can be told to fail.
#[derive(Default)]
pub struct RecordingTransport {
    pub delivered: Mutex<Vec<(Stream, Vec<u64>)>>,
    pub fail: AtomicBool,
}

impl RecordingTransport {
    pub fn ids(&self, stream: Stream) -> Vec<u64> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == stream)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, batch: &UploadBatch<'_>) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("upstream unavailable".to_string()));
        }
        let ids = batch.rows.iter().map(|row| row.id).collect();
        self.delivered.lock().unwrap().push((batch.stream, ids));
        Ok(())
    }
}
