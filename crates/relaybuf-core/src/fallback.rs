//! Conditions that force the buffer out of memory mode.

use std::fmt;

use serde::Serialize;

use crate::quota::QuotaDenied;
use crate::record::{PerStream, Stream};
use crate::stream::StreamQueue;

/// Why the buffer left memory mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackReason {
    /// A record did not fit in the remaining quota.
    QuotaExhausted {
        stream: Stream,
        requested: usize,
        free: usize,
    },
    /// The oldest unexported memory record outlived the staleness ceiling.
    Stale {
        stream: Stream,
        id: u64,
        age_secs: u64,
        max_age_secs: u64,
    },
    /// Requested by an operator or embedding application.
    Requested { message: String },
}

impl FallbackReason {
    #[must_use]
    pub fn quota(stream: Stream, denied: QuotaDenied) -> Self {
        Self::QuotaExhausted {
            stream,
            requested: denied.requested,
            free: denied.free,
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExhausted {
                stream,
                requested,
                free,
            } => write!(
                f,
                "memory quota exhausted by {stream} record ({requested} bytes requested, {free} free), switching to database"
            ),
            Self::Stale {
                stream,
                id,
                age_secs,
                max_age_secs,
            } => write!(
                f,
                "{stream} record {id} held in memory for {age_secs}s (limit {max_age_secs}s), switching to database"
            ),
            Self::Requested { message } => f.write_str(message),
        }
    }
}

/// Staleness ceiling check over the memory queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessCheck {
    max_age_secs: u64,
}

impl StalenessCheck {
    /// `max_age_secs == 0` disables the check.
    #[must_use]
    pub const fn new(max_age_secs: u64) -> Self {
        Self { max_age_secs }
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.max_age_secs > 0
    }

    /// The oldest queue head that exceeds the ceiling, if any.
    #[must_use]
    pub fn check(&self, queues: &PerStream<StreamQueue>, now: u64) -> Option<FallbackReason> {
        if !self.enabled() {
            return None;
        }
        queues
            .iter()
            .filter_map(|(stream, queue)| {
                let head = queue.front()?;
                let age_secs = now.saturating_sub(head.write_clock);
                (age_secs > self.max_age_secs).then_some((stream, head.id(), age_secs))
            })
            .max_by_key(|(_, _, age)| *age)
            .map(|(stream, id, age_secs)| FallbackReason::Stale {
                stream,
                id,
                age_secs,
                max_age_secs: self.max_age_secs,
            })
    }
}
