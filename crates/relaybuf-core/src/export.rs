//! Upload batches.
//!
//! A batch holds the records of one stream strictly after its sent
//! watermark, merged by id from memory and the database. Only confirming a
//! batch moves the watermark; an unconfirmed batch is simply produced again
//! on the next cycle.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::buffer::ProxyBuffer;
use crate::error::{BufferError, Result};
use crate::record::Stream;
use crate::state::BufferState;
use crate::storage::ReadLimits;
use crate::tables::{EncodedRow, encode_row};

/// Inclusive range of ids that could not be found anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdGap {
    pub first: u64,
    pub last: u64,
}

/// Records ready for upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    pub stream: Stream,
    pub rows: Vec<EncodedRow>,
    /// Estimated encoded size of `rows`.
    pub bytes: usize,
    /// The database could not be read; only memory records are included.
    pub degraded: bool,
    /// Ids skipped over to reach the first row. Confirming the batch
    /// advances past them.
    pub data_loss: Vec<IdGap>,
    /// More records were available than fit the limits.
    pub more: bool,
    /// State when the batch was built.
    pub state: BufferState,
    /// Sent watermark the batch was built from.
    pub after_id: u64,
}

impl Batch {
    fn empty(stream: Stream, state: BufferState, after_id: u64, degraded: bool) -> Self {
        Self {
            stream,
            rows: Vec::new(),
            bytes: 0,
            degraded,
            data_loss: Vec::new(),
            more: false,
            state,
            after_id,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn first_id(&self) -> Option<u64> {
        self.rows.first().map(|row| row.id)
    }

    #[must_use]
    pub fn last_id(&self) -> Option<u64> {
        self.rows.last().map(|row| row.id)
    }

    /// Gaps as errors, for callers that report them.
    #[must_use]
    pub fn data_loss_errors(&self) -> Vec<BufferError> {
        self.data_loss
            .iter()
            .map(|gap| BufferError::DataLoss {
                stream: self.stream,
                first_missing: gap.first,
                last_missing: gap.last,
                state: self.state,
            })
            .collect()
    }
}

/// Ranges in `(from, to)` exclusive, minus the ids in `skipped`.
fn missing_ranges(from: u64, to: u64, skipped: &BTreeSet<u64>) -> Vec<IdGap> {
    let mut gaps = Vec::new();
    let mut cursor = from + 1;
    if cursor >= to {
        return gaps;
    }
    for &id in skipped.range(cursor..to) {
        if id > cursor {
            gaps.push(IdGap {
                first: cursor,
                last: id - 1,
            });
        }
        cursor = id + 1;
    }
    if cursor < to {
        gaps.push(IdGap {
            first: cursor,
            last: to - 1,
        });
    }
    gaps
}

/// Merge two id-sorted row lists, preferring `first` on duplicate ids.
fn merge_by_id(first: Vec<EncodedRow>, second: Vec<EncodedRow>) -> Vec<EncodedRow> {
    let mut merged = Vec::with_capacity(first.len() + second.len());
    let mut a = first.into_iter().peekable();
    let mut b = second.into_iter().peekable();
    loop {
        let order = match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => x.id.cmp(&y.id),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };
        match order {
            Ordering::Less => merged.extend(a.next()),
            Ordering::Greater => merged.extend(b.next()),
            Ordering::Equal => {
                b.next();
                merged.extend(a.next());
            }
        }
    }
    merged
}

impl ProxyBuffer {
    /// Next records of `stream` after its sent watermark, at most
    /// `max_records` and `max_bytes` (the first record is always included).
    ///
    /// Records come from memory when held there and from the database
    /// otherwise. Nothing at or beyond an in-flight database insert is
    /// returned.
    pub fn next_batch(&self, stream: Stream, max_records: usize, max_bytes: usize) -> Batch {
        // One extra row tells whether more records remain.
        let lookahead = max_records.saturating_add(1);
        let (state, marks, pending_floor, skipped, memory) = {
            let inner = self.lock();
            let marks = inner.marks[stream].read();
            let pending_floor = inner.pending[stream].first().copied();
            let memory: Vec<_> = inner.queues[stream]
                .iter_after(marks.sent)
                .take_while(|r| pending_floor.is_none_or(|floor| r.id() < floor))
                .take(lookahead)
                .map(|r| (r.record.clone(), r.write_clock))
                .collect();
            (
                inner.state,
                marks,
                pending_floor,
                inner.skipped[stream].clone(),
                memory,
            )
        };
        let sent = marks.sent;

        let spec = self.tables().get(stream);
        let memory_rows: Vec<EncodedRow> = memory
            .iter()
            .map(|(record, write_clock)| {
                encode_row(spec, record.id(), *write_clock, &record.columns())
            })
            .collect();

        let mut degraded = false;
        let durable_rows = if marks.persisted > sent {
            let limits = ReadLimits {
                below_id: pending_floor,
                max_rows: lookahead,
                max_bytes,
            };
            match self.store().read_forward(stream, sent, limits) {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(
                        stream = %stream,
                        first_id = sent + 1,
                        state = %state,
                        reason = %err,
                        "Database read failed, exporting memory records only"
                    );
                    degraded = true;
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        // A truncated database read hides rows past its last id; memory rows
        // beyond that point wait for a later batch.
        let durable_ceiling = pending_floor.map_or(marks.persisted, |floor| {
            marks.persisted.min(floor.saturating_sub(1))
        });
        let horizon = durable_rows
            .last()
            .map(|row| row.id)
            .filter(|id| *id < durable_ceiling);

        let candidates = merge_by_id(memory_rows, durable_rows);
        let mut batch = Batch::empty(stream, state, sent, degraded);
        let mut expected_after = sent;
        for row in candidates {
            if horizon.is_some_and(|h| row.id > h) {
                batch.more = true;
                break;
            }
            let gaps = missing_ranges(expected_after, row.id, &skipped);
            if !gaps.is_empty() {
                if degraded || !batch.rows.is_empty() {
                    // Unread database rows may fill this range, or the batch
                    // already has content; stop here and try again later.
                    batch.more = !degraded;
                    break;
                }
                for gap in &gaps {
                    error!(
                        stream = %stream,
                        first_id = gap.first,
                        last_id = gap.last,
                        state = %state,
                        "Records missing from both memory and database, skipping"
                    );
                }
                batch.data_loss = gaps;
            }
            let size = row.estimated_size();
            if batch.rows.len() >= max_records
                || (!batch.rows.is_empty() && batch.bytes + size > max_bytes)
            {
                batch.more = true;
                break;
            }
            expected_after = row.id;
            batch.bytes += size;
            batch.rows.push(row);
        }

        if let (Some(first_id), Some(last_id)) = (batch.first_id(), batch.last_id()) {
            debug!(
                stream = %stream,
                first_id,
                last_id,
                bytes = batch.bytes,
                state = %state,
                degraded,
                "Built upload batch"
            );
        }
        batch
    }

    /// Record upstream acknowledgment of `batch`: advance the sent
    /// watermark to its last id and release the memory records it covered.
    /// Confirming an already confirmed batch is a no-op.
    pub fn confirm_sent(&self, batch: &Batch) -> Result<()> {
        let Some(last_id) = batch.last_id() else {
            return Ok(());
        };
        let stream = batch.stream;

        let sent = {
            let mut inner = self.lock();
            if !inner.marks[stream].mark_sent(last_id)? {
                return Ok(());
            }
            let released = inner.queues[stream].remove_through(last_id);
            let keep = inner.skipped[stream].split_off(&(last_id + 1));
            inner.skipped[stream] = keep;
            inner.changes_num += 1;
            self.finalize_locked(&mut inner);
            debug!(
                stream = %stream,
                first_id = batch.after_id + 1,
                last_id,
                memory_records = released,
                state = %inner.state,
                "Batch confirmed"
            );
            inner.marks[stream].read().sent
        };

        if let Err(err) = self.store().set_last_sent_id(stream, sent) {
            warn!(
                stream = %stream,
                last_id = sent,
                reason = %err,
                "Failed to persist sent watermark; records may be sent again after restart"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn row(id: u64) -> EncodedRow {
        EncodedRow {
            id,
            write_clock: 0,
            fields: Map::new(),
        }
    }

    #[test]
    fn missing_ranges_excludes_skipped_ids() {
        let skipped: BTreeSet<u64> = [4, 7].into_iter().collect();
        assert_eq!(
            missing_ranges(2, 10, &skipped),
            vec![IdGap { first: 3, last: 3 }, IdGap { first: 5, last: 6 }, IdGap {
                first: 8,
                last: 9
            }]
        );
        assert!(missing_ranges(2, 3, &skipped).is_empty());
        let all: BTreeSet<u64> = (3..10).collect();
        assert!(missing_ranges(2, 10, &all).is_empty());
    }

    #[test]
    fn merge_interleaves_and_dedups() {
        let merged = merge_by_id(vec![row(2), row(5), row(6)], vec![row(1), row(5), row(9)]);
        let ids: Vec<u64> = merged.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 5, 6, 9]);
    }

    #[test]
    fn data_loss_errors_carry_context() {
        let mut batch = Batch::empty(Stream::History, BufferState::Memory, 0, false);
        batch.data_loss.push(IdGap { first: 1, last: 2 });
        let errors = batch.data_loss_errors();
        assert_eq!(
            errors,
            vec![BufferError::DataLoss {
                stream: Stream::History,
                first_missing: 1,
                last_missing: 2,
                state: BufferState::Memory,
            }]
        );
    }
}
