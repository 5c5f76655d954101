//! Per-stream memory queue and progress watermarks.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::BufferError;
use crate::quota::QuotaLease;
use crate::record::{Record, Stream};

/// A record held in memory together with the quota it is charged for.
#[derive(Debug)]
pub struct Resident {
    pub record: Record,
    /// Admission time, seconds since epoch.
    pub write_clock: u64,
    lease: QuotaLease,
}

impl Resident {
    #[must_use]
    pub fn new(record: Record, write_clock: u64, lease: QuotaLease) -> Self {
        Self {
            record,
            write_clock,
            lease,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.record.id()
    }

    #[must_use]
    pub fn charged(&self) -> usize {
        self.lease.size()
    }

    /// Give up the record; the quota is released here.
    #[must_use]
    pub fn into_record(self) -> Record {
        self.record
    }
}

/// Id-ordered FIFO of memory-resident records for one stream.
#[derive(Debug)]
pub struct StreamQueue {
    stream: Stream,
    entries: VecDeque<Resident>,
    bytes: usize,
}

impl StreamQueue {
    #[must_use]
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            entries: VecDeque::new(),
            bytes: 0,
        }
    }

    #[must_use]
    pub fn stream(&self) -> Stream {
        self.stream
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Quota bytes held by queued records.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[must_use]
    pub fn front(&self) -> Option<&Resident> {
        self.entries.front()
    }

    #[must_use]
    pub fn tail_id(&self) -> Option<u64> {
        self.entries.back().map(Resident::id)
    }

    /// Append a record. Ids normally arrive in increasing order; a record
    /// redirected from a failed durable write may land behind the tail and is
    /// slotted into place. Reusing an id is an invariant violation.
    pub fn push(&mut self, resident: Resident) -> Result<(), BufferError> {
        if resident.record.stream() != self.stream {
            return Err(BufferError::InvariantViolation(format!(
                "{} record pushed into the {} queue",
                resident.record.stream(),
                self.stream
            )));
        }
        let id = resident.id();
        match self.tail_id() {
            Some(tail) if id <= tail => {
                let pos = self.entries.partition_point(|r| r.id() < id);
                if self.entries.get(pos).is_some_and(|r| r.id() == id) {
                    return Err(BufferError::InvariantViolation(format!(
                        "{} id {id} reused",
                        self.stream
                    )));
                }
                self.bytes += resident.charged();
                self.entries.insert(pos, resident);
            }
            _ => {
                self.bytes += resident.charged();
                self.entries.push_back(resident);
            }
        }
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Resident> {
        let resident = self.entries.pop_front()?;
        self.bytes -= resident.charged();
        Some(resident)
    }

    /// Drop every record with id `<= id`, releasing their quota.
    pub fn remove_through(&mut self, id: u64) -> usize {
        let mut removed = 0;
        while self.entries.front().is_some_and(|r| r.id() <= id) {
            let _ = self.pop_front();
            removed += 1;
        }
        removed
    }

    /// Remove one record by id, releasing its quota.
    pub fn remove_id(&mut self, id: u64) -> Option<Resident> {
        let pos = self.entries.binary_search_by_key(&id, Resident::id).ok()?;
        let resident = self.entries.remove(pos)?;
        self.bytes -= resident.charged();
        Some(resident)
    }

    /// Records with id strictly greater than `id`, in order.
    pub fn iter_after(&self, id: u64) -> impl Iterator<Item = &Resident> {
        let start = self.entries.partition_point(|r| r.id() <= id);
        self.entries.range(start..)
    }

    /// Highest id admitted at or before `cutoff` (seconds), if any.
    #[must_use]
    pub fn last_id_written_before(&self, cutoff: u64) -> Option<u64> {
        self.entries
            .iter()
            .take_while(|r| r.write_clock < cutoff)
            .last()
            .map(Resident::id)
    }

    /// Take every record out of the queue, releasing the quota.
    pub fn drain_records(&mut self) -> Vec<Record> {
        self.bytes = 0;
        self.entries.drain(..).map(Resident::into_record).collect()
    }
}

/// Progress markers for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Highest id acknowledged upstream (or expired by housekeeping).
    pub sent: u64,
    /// Highest id written to the database.
    pub persisted: u64,
    /// Highest id admitted to memory.
    pub memory: u64,
}

/// Monotonic watermark triple. Lower values are ignored, which makes late or
/// duplicated acknowledgments harmless.
#[derive(Debug, Clone, Default)]
pub struct WatermarkSet {
    marks: Watermarks,
}

impl WatermarkSet {
    #[must_use]
    pub fn new(sent: u64, persisted: u64) -> Self {
        Self {
            marks: Watermarks {
                sent,
                persisted,
                memory: 0,
            },
        }
    }

    #[must_use]
    pub fn read(&self) -> Watermarks {
        self.marks
    }

    /// Highest id that exists in some retrievable location.
    #[must_use]
    pub fn retrievable(&self) -> u64 {
        self.marks.persisted.max(self.marks.memory)
    }

    pub fn mark_persisted(&mut self, id: u64) -> bool {
        advance(&mut self.marks.persisted, id)
    }

    pub fn mark_memory(&mut self, id: u64) -> bool {
        advance(&mut self.marks.memory, id)
    }

    /// Advance the delivery watermark. Reporting an id as sent before it has
    /// been stored anywhere is an invariant violation.
    pub fn mark_sent(&mut self, id: u64) -> Result<bool, BufferError> {
        if id > self.retrievable() {
            return Err(BufferError::InvariantViolation(format!(
                "sent watermark {id} beyond highest retrievable id {}",
                self.retrievable()
            )));
        }
        Ok(advance(&mut self.marks.sent, id))
    }
}

fn advance(mark: &mut u64, id: u64) -> bool {
    if id > *mark {
        *mark = id;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaAllocator;
    use crate::record::{DiscoveryRecord, HistoryRecord, Timespec};

    fn resident(quota: &QuotaAllocator, id: u64, write_clock: u64) -> Resident {
        let mut record = Record::from(HistoryRecord::new(1, Timespec::new(0, 0), "v"));
        record.set_id(id);
        let lease = quota.allocate(record.mem_size()).unwrap();
        Resident::new(record, write_clock, lease)
    }

    #[test]
    fn fifo_order_and_byte_accounting() {
        let quota = QuotaAllocator::new(1 << 20);
        let mut queue = StreamQueue::new(Stream::History);
        for id in 1..=3 {
            queue.push(resident(&quota, id, 100)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.bytes(), quota.live());
        assert_eq!(queue.front().map(Resident::id), Some(1));

        let head = queue.pop_front().unwrap();
        assert_eq!(head.id(), 1);
        drop(head);
        assert_eq!(queue.bytes(), quota.live());
    }

    #[test]
    fn late_id_is_slotted_into_place() {
        let quota = QuotaAllocator::new(1 << 20);
        let mut queue = StreamQueue::new(Stream::History);
        queue.push(resident(&quota, 2, 0)).unwrap();
        queue.push(resident(&quota, 4, 0)).unwrap();
        queue.push(resident(&quota, 3, 0)).unwrap();
        let ids: Vec<u64> = queue.iter_after(0).map(Resident::id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn reused_id_is_rejected() {
        let quota = QuotaAllocator::new(1 << 20);
        let mut queue = StreamQueue::new(Stream::History);
        queue.push(resident(&quota, 5, 0)).unwrap();
        let err = queue.push(resident(&quota, 5, 0)).unwrap_err();
        assert!(matches!(err, BufferError::InvariantViolation(_)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.bytes(), quota.live());
    }

    #[test]
    fn wrong_stream_is_rejected() {
        let quota = QuotaAllocator::new(1 << 20);
        let mut queue = StreamQueue::new(Stream::History);
        let record = Record::from(DiscoveryRecord {
            id: 1,
            ..DiscoveryRecord::default()
        });
        let lease = quota.allocate(record.mem_size()).unwrap();
        assert!(queue.push(Resident::new(record, 0, lease)).is_err());
    }

    #[test]
    fn remove_through_releases_quota() {
        let quota = QuotaAllocator::new(1 << 20);
        let mut queue = StreamQueue::new(Stream::History);
        for id in 1..=5 {
            queue.push(resident(&quota, id, 0)).unwrap();
        }
        assert_eq!(queue.remove_through(3), 3);
        assert_eq!(queue.front().map(Resident::id), Some(4));
        assert_eq!(queue.bytes(), quota.live());
        assert_eq!(queue.remove_through(2), 0);
    }

    #[test]
    fn remove_id_takes_single_record() {
        let quota = QuotaAllocator::new(1 << 20);
        let mut queue = StreamQueue::new(Stream::History);
        for id in [2, 4, 6] {
            queue.push(resident(&quota, id, 0)).unwrap();
        }
        assert_eq!(queue.remove_id(4).map(|r| r.id()), Some(4));
        assert!(queue.remove_id(5).is_none());
        let ids: Vec<u64> = queue.iter_after(0).map(Resident::id).collect();
        assert_eq!(ids, vec![2, 6]);
        assert_eq!(queue.bytes(), quota.live());
    }

    #[test]
    fn iter_after_skips_acknowledged_prefix() {
        let quota = QuotaAllocator::new(1 << 20);
        let mut queue = StreamQueue::new(Stream::History);
        for id in [3, 5, 9] {
            queue.push(resident(&quota, id, 0)).unwrap();
        }
        let ids: Vec<u64> = queue.iter_after(4).map(Resident::id).collect();
        assert_eq!(ids, vec![5, 9]);
        assert_eq!(queue.iter_after(9).count(), 0);
    }

    #[test]
    fn last_id_written_before_cutoff() {
        let quota = QuotaAllocator::new(1 << 20);
        let mut queue = StreamQueue::new(Stream::History);
        queue.push(resident(&quota, 1, 100)).unwrap();
        queue.push(resident(&quota, 2, 200)).unwrap();
        queue.push(resident(&quota, 3, 300)).unwrap();
        assert_eq!(queue.last_id_written_before(100), None);
        assert_eq!(queue.last_id_written_before(250), Some(2));
        assert_eq!(queue.last_id_written_before(1000), Some(3));
    }

    #[test]
    fn drain_records_empties_queue_and_quota() {
        let quota = QuotaAllocator::new(1 << 20);
        let mut queue = StreamQueue::new(Stream::History);
        queue.push(resident(&quota, 1, 0)).unwrap();
        queue.push(resident(&quota, 2, 0)).unwrap();
        let records = queue.drain_records();
        assert_eq!(records.len(), 2);
        assert!(queue.is_empty());
        assert_eq!(quota.live(), 0);
    }

    #[test]
    fn sent_watermark_ignores_regression() {
        let mut marks = WatermarkSet::new(0, 10);
        assert!(marks.mark_sent(7).unwrap());
        assert!(!marks.mark_sent(6).unwrap());
        assert_eq!(marks.read().sent, 7);
    }

    #[test]
    fn sent_cannot_pass_retrievable() {
        let mut marks = WatermarkSet::new(0, 4);
        marks.mark_memory(6);
        assert_eq!(marks.retrievable(), 6);
        assert!(marks.mark_sent(6).is_ok());
        assert!(matches!(
            marks.mark_sent(7),
            Err(BufferError::InvariantViolation(_))
        ));
    }

    #[test]
    fn persisted_and_memory_are_monotonic() {
        let mut marks = WatermarkSet::default();
        assert!(marks.mark_persisted(3));
        assert!(!marks.mark_persisted(2));
        assert!(marks.mark_memory(8));
        assert!(!marks.mark_memory(8));
        assert_eq!(
            marks.read(),
            Watermarks {
                sent: 0,
                persisted: 3,
                memory: 8
            }
        );
    }
}
