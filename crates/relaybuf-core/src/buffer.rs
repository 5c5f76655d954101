//! Buffer controller.
//!
//! [`ProxyBuffer`] owns the memory queues, the watermarks and the state
//! machine behind one mutex. Producers call [`ProxyBuffer::submit`]; the
//! exporter calls [`ProxyBuffer::next_batch`] and
//! [`ProxyBuffer::confirm_sent`]. Database calls are made with the mutex
//! released: an id is reserved under the lock, the row is written, and the
//! lock is taken again to record the outcome.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::BufferConfig;
use crate::error::{BufferError, Result, StorageError};
use crate::fallback::{FallbackReason, StalenessCheck};
use crate::quota::{QuotaAllocator, QuotaUsage};
use crate::record::{AutoregRecord, DiscoveryRecord, HistoryRecord, PerStream, Record, Stream};
use crate::state::{BufferMode, BufferState, StateSnapshot, StorageTier};
use crate::storage::{DurableRow, DurableStore, SqliteStore};
use crate::stream::{Resident, StreamQueue, WatermarkSet, Watermarks};
use crate::tables::TableSet;

/// Where an admitted record was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub stream: Stream,
    pub id: u64,
    pub tier: StorageTier,
}

/// Most recent state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: BufferState,
    pub to: BufferState,
    pub message: String,
    /// Seconds since epoch.
    pub at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub watermarks: Watermarks,
    pub memory_enabled: bool,
    pub memory_records: usize,
    pub memory_bytes: usize,
    pub pending_writes: usize,
}

/// Point-in-time view of the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub mode: BufferMode,
    pub state: BufferState,
    pub changes_num: u64,
    /// Durable inserts in flight across all streams.
    pub db_handles_num: usize,
    pub quota: QuotaUsage,
    pub streams: PerStream<StreamStats>,
    pub last_transition: Option<StateTransition>,
}

/// Result of one housekeeping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HousekeepReport {
    /// Sent rows removed from the database.
    pub deleted: PerStream<usize>,
    /// Unsent records discarded for exceeding the offline buffer.
    pub expired: PerStream<u64>,
}

impl HousekeepReport {
    #[must_use]
    pub fn total_expired(&self) -> u64 {
        self.expired.iter().map(|(_, n)| *n).sum()
    }
}

/// State guarded by the buffer mutex.
#[derive(Debug)]
pub(crate) struct BufferInner {
    pub(crate) state: BufferState,
    pub(crate) queues: PerStream<StreamQueue>,
    pub(crate) marks: PerStream<WatermarkSet>,
    /// Last id handed out per stream.
    pub(crate) last_id: PerStream<u64>,
    /// Ids whose database insert is in flight.
    pub(crate) pending: PerStream<BTreeSet<u64>>,
    /// Ids assigned to records that were refused after assignment. Export
    /// steps over them silently.
    pub(crate) skipped: PerStream<BTreeSet<u64>>,
    pub(crate) changes_num: u64,
    pub(crate) last_transition: Option<StateTransition>,
}

impl BufferInner {
    fn assign_id(&mut self, stream: Stream) -> u64 {
        self.last_id[stream] += 1;
        self.changes_num += 1;
        self.last_id[stream]
    }

    pub(crate) fn memory_is_empty(&self) -> bool {
        self.queues.iter().all(|(_, queue)| queue.is_empty())
    }
}

/// The buffering engine. One per process.
pub struct ProxyBuffer {
    config: BufferConfig,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    quota: QuotaAllocator,
    staleness: StalenessCheck,
    snapshot: StateSnapshot,
    inner: Mutex<BufferInner>,
}

impl std::fmt::Debug for ProxyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyBuffer")
            .field("mode", &self.config.mode)
            .field("state", &self.snapshot.load())
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

impl ProxyBuffer {
    /// Open the SQLite database named in the config and build the buffer on
    /// the system clock.
    pub fn from_config(config: BufferConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.database.path, config.database.busy_timeout())?;
        Self::open(config, Arc::new(store), Arc::new(SystemClock))
    }

    /// Build the buffer over an existing store, resuming from its persisted
    /// watermarks.
    pub fn open(
        config: BufferConfig,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let mut marks = PerStream::<WatermarkSet>::default();
        let mut last_id = PerStream::<u64>::default();
        let mut backlog = false;
        for stream in Stream::ALL {
            let persisted = store.max_id(stream)?;
            let sent = store.last_sent_id(stream)?;
            // Sent rows may already be deleted, leaving max_id below sent.
            marks[stream] = WatermarkSet::new(sent, persisted.max(sent));
            last_id[stream] = persisted.max(sent);
            let memory_enabled =
                config.mode.allows_memory() && config.streams.policy(stream).memory;
            backlog |= memory_enabled && persisted > sent;
        }

        let state = config.mode.initial_state(backlog);
        info!(
            mode = %config.mode,
            state = %state,
            memory_size = config.memory_size,
            history_sent = marks.history.read().sent,
            history_persisted = marks.history.read().persisted,
            "Buffer opened"
        );

        Ok(Self {
            quota: QuotaAllocator::new(config.memory_size),
            staleness: StalenessCheck::new(config.max_age_secs),
            snapshot: StateSnapshot::new(state),
            inner: Mutex::new(BufferInner {
                state,
                queues: PerStream::from_fn(StreamQueue::new),
                marks,
                last_id,
                pending: PerStream::default(),
                skipped: PerStream::default(),
                changes_num: 0,
                last_transition: None,
            }),
            config,
            store,
            clock,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn store(&self) -> &dyn DurableStore {
        self.store.as_ref()
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_secs()
    }

    #[must_use]
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    #[must_use]
    pub fn tables(&self) -> &TableSet {
        self.store.tables()
    }

    /// Lock-free read of the current state.
    #[must_use]
    pub fn current_state(&self) -> BufferState {
        self.snapshot.load()
    }

    /// Shareable handle for monitoring the state from other threads.
    #[must_use]
    pub fn state_handle(&self) -> StateSnapshot {
        self.snapshot.clone()
    }

    #[must_use]
    pub fn free_capacity(&self) -> usize {
        self.quota.free_capacity()
    }

    /// Whether records of `stream` may be held in memory at all.
    #[must_use]
    pub fn memory_enabled(&self, stream: Stream) -> bool {
        self.config.mode.allows_memory() && self.config.streams.policy(stream).memory
    }

    #[must_use]
    pub fn watermarks(&self, stream: Stream) -> Watermarks {
        self.lock().marks[stream].read()
    }

    #[must_use]
    pub fn changes_num(&self) -> u64 {
        self.lock().changes_num
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        let inner = self.lock();
        BufferStats {
            mode: self.config.mode,
            state: inner.state,
            changes_num: inner.changes_num,
            db_handles_num: inner.pending.iter().map(|(_, p)| p.len()).sum(),
            quota: self.quota.usage(),
            streams: PerStream::from_fn(|stream| StreamStats {
                watermarks: inner.marks[stream].read(),
                memory_enabled: self.memory_enabled(stream),
                memory_records: inner.queues[stream].len(),
                memory_bytes: inner.queues[stream].bytes(),
                pending_writes: inner.pending[stream].len(),
            }),
            last_transition: inner.last_transition.clone(),
        }
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    pub(crate) fn transition_locked(
        &self,
        inner: &mut BufferInner,
        to: BufferState,
        message: &str,
    ) {
        let from = inner.state;
        if from == to {
            info!(state = %to, reason = message, "Buffer state unchanged");
            return;
        }
        inner.state = to;
        inner.changes_num += 1;
        self.snapshot.store(to);
        inner.last_transition = Some(StateTransition {
            from,
            to,
            message: message.to_string(),
            at: self.now(),
        });
        info!(from = %from, state = %to, reason = message, "Buffer state changed");
    }

    /// Every memory-enabled stream has its database backlog sent and no
    /// insert in flight.
    fn durable_drained(&self, inner: &BufferInner) -> bool {
        Stream::ALL
            .into_iter()
            .filter(|stream| self.memory_enabled(*stream))
            .all(|stream| {
                let marks = inner.marks[stream].read();
                marks.sent >= marks.persisted && inner.pending[stream].is_empty()
            })
    }

    /// Complete a drain whose source tier has emptied.
    pub(crate) fn finalize_locked(&self, inner: &mut BufferInner) {
        let next = inner
            .state
            .finalize(inner.memory_is_empty(), self.durable_drained(inner));
        match (inner.state, next) {
            (BufferState::DrainingToDatabase, BufferState::Database) => {
                self.transition_locked(inner, next, "memory drained, buffering in database");
            }
            (BufferState::DrainingToMemory, BufferState::Memory) => {
                self.transition_locked(inner, next, "database backlog drained, buffering in memory");
            }
            _ => {}
        }
    }

    /// Force a state. Repeating the current state only logs `message`.
    pub fn set_state(&self, state: BufferState, message: &str) -> std::result::Result<(), BufferError> {
        let mut inner = self.lock();
        if !self.config.mode.allows_memory() && state != BufferState::Database {
            return Err(BufferError::Transition {
                from: inner.state,
                reason: "disk mode buffers in the database only".to_string(),
            });
        }
        self.transition_locked(&mut inner, state, message);
        Ok(())
    }

    /// Start buffering in memory again. Requires `min_headroom_bytes` of
    /// free quota; the database backlog keeps draining first.
    pub fn request_memory_mode(&self, reason: &str) -> std::result::Result<BufferState, BufferError> {
        let mut inner = self.lock();
        if !self.config.mode.allows_memory() {
            return Err(BufferError::Transition {
                from: inner.state,
                reason: "disk mode buffers in the database only".to_string(),
            });
        }
        let free = self.quota.free_capacity();
        if free < self.config.min_headroom_bytes || free == 0 {
            return Err(BufferError::Transition {
                from: inner.state,
                reason: format!(
                    "{free} bytes of memory free, {} required",
                    self.config.min_headroom_bytes.max(1)
                ),
            });
        }
        let next = inner.state.request_memory()?;
        self.transition_locked(&mut inner, next, reason);
        self.finalize_locked(&mut inner);
        Ok(inner.state)
    }

    /// Stop admitting to memory. Queued memory records still export first.
    pub fn fallback_to_database(&self, message: &str) -> std::result::Result<BufferState, BufferError> {
        let mut inner = self.lock();
        if !self.config.mode.allows_fallback() {
            return Err(BufferError::Transition {
                from: inner.state,
                reason: format!("{} mode does not fall back to the database", self.config.mode),
            });
        }
        let reason = FallbackReason::Requested {
            message: message.to_string(),
        };
        self.fallback_locked(&mut inner, &reason);
        Ok(inner.state)
    }

    fn fallback_locked(&self, inner: &mut BufferInner, reason: &FallbackReason) {
        let next = inner.state.fallback();
        if next != inner.state {
            warn!(state = %inner.state, reason = %reason, "Falling back to database buffering");
        }
        self.transition_locked(inner, next, &reason.to_string());
        self.finalize_locked(inner);
    }

    /// Fall back if a memory record has outlived `max_age_secs`.
    pub fn check_staleness(&self) -> Option<FallbackReason> {
        let now = self.now();
        let mut inner = self.lock();
        self.check_staleness_locked(&mut inner, now)
    }

    fn check_staleness_locked(&self, inner: &mut BufferInner, now: u64) -> Option<FallbackReason> {
        if !self.config.mode.allows_fallback()
            || !matches!(
                inner.state,
                BufferState::Memory | BufferState::DrainingToMemory
            )
        {
            return None;
        }
        let reason = self.staleness.check(&inner.queues, now)?;
        self.fallback_locked(inner, &reason);
        Some(reason)
    }

    /// Hybrid mode: return to memory once the database backlog is sent and
    /// the quota has headroom.
    pub fn promote_if_drained(&self) -> bool {
        if !self.config.mode.allows_fallback() {
            return false;
        }
        let mut inner = self.lock();
        if inner.state != BufferState::Database || !self.durable_drained(&inner) {
            return false;
        }
        let free = self.quota.free_capacity();
        if free < self.config.min_headroom_bytes || free == 0 {
            return false;
        }
        self.transition_locked(
            &mut inner,
            BufferState::DrainingToMemory,
            "database backlog sent, memory headroom available",
        );
        self.finalize_locked(&mut inner);
        true
    }

    // =========================================================================
    // Admission
    // =========================================================================

    pub fn submit_history(&self, record: HistoryRecord) -> std::result::Result<Admission, BufferError> {
        self.submit(record)
    }

    pub fn submit_discovery(
        &self,
        record: DiscoveryRecord,
    ) -> std::result::Result<Admission, BufferError> {
        self.submit(record)
    }

    pub fn submit_autoreg(&self, record: AutoregRecord) -> std::result::Result<Admission, BufferError> {
        self.submit(record)
    }

    /// Admit a record. The buffer assigns its id.
    ///
    /// Memory admission never blocks: if the quota is exhausted a hybrid
    /// buffer falls back and writes this record to the database, a memory
    /// buffer reports [`BufferError::AdmissionDenied`].
    pub fn submit(&self, record: impl Into<Record>) -> std::result::Result<Admission, BufferError> {
        let mut record = record.into();
        let stream = record.stream();
        let now = self.now();

        let id = {
            let mut inner = self.lock();
            self.check_staleness_locked(&mut inner, now);

            let memory_target = self.memory_enabled(stream)
                && inner.state.admission_target() == StorageTier::Memory
                && !(inner.state == BufferState::DrainingToMemory
                    && !inner.pending[stream].is_empty());

            if memory_target {
                let size = record.mem_size();
                match self.quota.allocate(size) {
                    Ok(lease) => {
                        let id = inner.assign_id(stream);
                        record.set_id(id);
                        inner.queues[stream].push(Resident::new(record, now, lease))?;
                        inner.marks[stream].mark_memory(id);
                        trace!(stream = %stream, id, bytes = size, "Admitted to memory");
                        return Ok(Admission {
                            stream,
                            id,
                            tier: StorageTier::Memory,
                        });
                    }
                    Err(denied) if self.config.mode.allows_fallback() => {
                        self.fallback_locked(&mut inner, &FallbackReason::quota(stream, denied));
                    }
                    Err(denied) => {
                        warn!(
                            stream = %stream,
                            bytes = size,
                            free = denied.free,
                            state = %inner.state,
                            "Memory admission denied"
                        );
                        return Err(BufferError::AdmissionDenied {
                            stream,
                            requested: denied.requested,
                            free: denied.free,
                        });
                    }
                }
            }

            let id = inner.assign_id(stream);
            inner.pending[stream].insert(id);
            id
        };

        record.set_id(id);
        let row = DurableRow {
            record,
            write_clock: now,
        };
        match self.store.insert(std::slice::from_ref(&row)) {
            Ok(()) => {
                let mut inner = self.lock();
                inner.pending[stream].remove(&id);
                inner.marks[stream].mark_persisted(id);
                inner.changes_num += 1;
                trace!(stream = %stream, id, "Admitted to database");
                Ok(Admission {
                    stream,
                    id,
                    tier: StorageTier::Database,
                })
            }
            Err(err) => self.durable_write_failed(row, &err),
        }
    }

    /// Keep a record whose insert failed in memory if the quota allows,
    /// otherwise give up its id.
    fn durable_write_failed(
        &self,
        row: DurableRow,
        err: &StorageError,
    ) -> std::result::Result<Admission, BufferError> {
        let stream = row.record.stream();
        let id = row.record.id();
        let mut inner = self.lock();
        inner.pending[stream].remove(&id);
        inner.changes_num += 1;

        match self.quota.allocate(row.record.mem_size()) {
            Ok(lease) => {
                inner.queues[stream].push(Resident::new(row.record, row.write_clock, lease))?;
                inner.marks[stream].mark_memory(id);
                warn!(
                    stream = %stream,
                    id,
                    state = %inner.state,
                    reason = %err,
                    "Database write failed, record kept in memory"
                );
                Ok(Admission {
                    stream,
                    id,
                    tier: StorageTier::Memory,
                })
            }
            Err(_) => {
                inner.skipped[stream].insert(id);
                warn!(
                    stream = %stream,
                    id,
                    state = %inner.state,
                    reason = %err,
                    "Database write failed and memory is full, record refused"
                );
                Err(BufferError::DurableUnavailable {
                    stream,
                    reason: err.to_string(),
                })
            }
        }
    }

    // =========================================================================
    // Housekeeping and teardown
    // =========================================================================

    /// Delete sent rows and discard unsent records older than the offline
    /// buffer.
    pub fn housekeep(&self, now: u64) -> Result<HousekeepReport> {
        let mut report = HousekeepReport::default();
        let cutoff = now.saturating_sub(self.config.offline_buffer_secs());

        for stream in Stream::ALL {
            let (sent, persisted, pending_floor, memory_cut) = {
                let inner = self.lock();
                let marks = inner.marks[stream].read();
                (
                    marks.sent,
                    marks.persisted,
                    inner.pending[stream].first().copied(),
                    inner.queues[stream].last_id_written_before(cutoff),
                )
            };

            let durable_cut = self
                .store
                .expire_before(stream, sent, cutoff)?
                .map(|id| id.min(persisted))
                .filter(|id| pending_floor.is_none_or(|floor| *id < floor));
            let expire_to = memory_cut.max(durable_cut).unwrap_or(0);

            let sent = if expire_to > sent {
                let (expired, sent_now) = {
                    let mut inner = self.lock();
                    // The exporter may have confirmed past `sent` meanwhile.
                    let before = inner.marks[stream].read().sent;
                    if expire_to > before {
                        let removed = inner.queues[stream].remove_through(expire_to);
                        inner.marks[stream].mark_sent(expire_to)?;
                        let keep = inner.skipped[stream].split_off(&(expire_to + 1));
                        inner.skipped[stream] = keep;
                        inner.changes_num += 1;
                        self.finalize_locked(&mut inner);
                        warn!(
                            stream = %stream,
                            first_id = before + 1,
                            last_id = expire_to,
                            memory_records = removed,
                            state = %inner.state,
                            "Discarded unsent records older than the offline buffer"
                        );
                    }
                    (expire_to.saturating_sub(before), inner.marks[stream].read().sent)
                };
                report.expired[stream] = expired;
                if expired > 0 {
                    self.store.set_last_sent_id(stream, sent_now)?;
                }
                sent_now
            } else {
                sent
            };

            report.deleted[stream] = self.store.delete_through(stream, sent)?;
            if report.deleted[stream] > 0 {
                debug!(stream = %stream, last_id = sent, rows = report.deleted[stream], "Deleted sent rows");
            }
        }
        Ok(report)
    }

    /// Write every memory record to the database. Runs on drop.
    pub fn flush(&self) -> Result<usize> {
        let rows: Vec<DurableRow> = {
            let inner = self.lock();
            inner
                .queues
                .iter()
                .flat_map(|(_, queue)| queue.iter_after(0))
                .map(|resident| DurableRow {
                    record: resident.record.clone(),
                    write_clock: resident.write_clock,
                })
                .collect()
        };
        if rows.is_empty() {
            return Ok(0);
        }

        self.store.insert(&rows)?;

        let mut inner = self.lock();
        for row in &rows {
            let stream = row.record.stream();
            let id = row.record.id();
            let _ = inner.queues[stream].remove_id(id);
            inner.marks[stream].mark_persisted(id);
        }
        inner.changes_num += 1;
        self.finalize_locked(&mut inner);
        info!(rows = rows.len(), state = %inner.state, "Flushed memory records to database");
        Ok(rows.len())
    }
}

impl Drop for ProxyBuffer {
    fn drop(&mut self) {
        if self.lock().memory_is_empty() {
            return;
        }
        if let Err(err) = self.flush() {
            error!(error = %err, "Failed to flush memory records at shutdown");
        }
    }
}
