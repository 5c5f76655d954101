//! Bounded memory quota for records held in process memory.
//!
//! Admission is pessimistic: callers size the whole record first and take a
//! single [`QuotaLease`] for it, so a record is never half-built when the
//! ceiling is hit. Leases return their bytes to the allocator on drop.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::BufferError;

/// Allocation refused because the ceiling would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDenied {
    pub requested: usize,
    pub free: usize,
}

impl fmt::Display for QuotaDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "requested {} bytes, {} bytes free", self.requested, self.free)
    }
}

struct QuotaInner {
    ceiling: usize,
    live: AtomicUsize,
}

impl QuotaInner {
    fn release(&self, size: usize) {
        let released = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                live.checked_sub(size)
            });
        assert!(
            released.is_ok(),
            "quota underflow: releasing {size} bytes with {} live",
            self.live.load(Ordering::Acquire)
        );
    }
}

/// Snapshot of quota usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub ceiling: usize,
    pub live: usize,
    pub free: usize,
}

/// Memory quota allocator.
///
/// Cheap to clone; clones share the same live counter.
#[derive(Clone)]
pub struct QuotaAllocator {
    inner: Arc<QuotaInner>,
}

impl fmt::Debug for QuotaAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaAllocator")
            .field("ceiling", &self.inner.ceiling)
            .field("live", &self.live())
            .finish()
    }
}

impl QuotaAllocator {
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        Self {
            inner: Arc::new(QuotaInner {
                ceiling,
                live: AtomicUsize::new(0),
            }),
        }
    }

    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.inner.ceiling
    }

    #[must_use]
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Ceiling minus live bytes; never negative.
    #[must_use]
    pub fn free_capacity(&self) -> usize {
        self.inner.ceiling.saturating_sub(self.live())
    }

    /// Whether `size` bytes would currently be admitted.
    #[must_use]
    pub fn try_reserve(&self, size: usize) -> bool {
        size <= self.free_capacity()
    }

    #[must_use]
    pub fn usage(&self) -> QuotaUsage {
        let live = self.live();
        QuotaUsage {
            ceiling: self.inner.ceiling,
            live,
            free: self.inner.ceiling.saturating_sub(live),
        }
    }

    /// Charge `size` bytes against the quota. Never blocks.
    pub fn allocate(&self, size: usize) -> Result<QuotaLease, QuotaDenied> {
        let ceiling = self.inner.ceiling;
        self.inner
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                live.checked_add(size).filter(|next| *next <= ceiling)
            })
            .map_err(|live| QuotaDenied {
                requested: size,
                free: ceiling.saturating_sub(live),
            })?;
        Ok(QuotaLease {
            owner: Arc::clone(&self.inner),
            size,
        })
    }

    /// Copy `s` into quota-charged storage (`len + 1` bytes).
    pub fn duplicate_string(&self, s: &str) -> Result<QuotaString, QuotaDenied> {
        let lease = self.allocate(s.len() + 1)?;
        Ok(QuotaString {
            value: s.to_owned(),
            lease,
        })
    }

    /// Release a lease explicitly.
    ///
    /// Handing in a lease from another allocator is a programming error. The
    /// lease still returns its bytes to the allocator that issued it.
    pub fn free(&self, lease: QuotaLease) -> Result<(), BufferError> {
        if !Arc::ptr_eq(&self.inner, &lease.owner) {
            let size = lease.size;
            drop(lease);
            tracing::error!(size, "lease freed through a foreign allocator");
            return Err(BufferError::InvariantViolation(format!(
                "free of a {size} byte lease not issued by this allocator"
            )));
        }
        drop(lease);
        Ok(())
    }
}

/// Bytes charged against a [`QuotaAllocator`], released on drop.
pub struct QuotaLease {
    owner: Arc<QuotaInner>,
    size: usize,
}

impl QuotaLease {
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Debug for QuotaLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaLease").field("size", &self.size).finish()
    }
}

impl Drop for QuotaLease {
    fn drop(&mut self) {
        self.owner.release(self.size);
    }
}

/// String whose storage is charged against the quota.
#[derive(Debug)]
pub struct QuotaString {
    value: String,
    lease: QuotaLease,
}

impl QuotaString {
    #[must_use]
    pub fn charged(&self) -> usize {
        self.lease.size()
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.value
    }
}

impl Deref for QuotaString {
    type Target = str;

    fn deref(&self) -> &str {
        &self.value
    }
}
