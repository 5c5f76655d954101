//! Export cycle and the periodic worker that drives it.
//!
//! One cycle: staleness check, then batches per stream for as long as
//! records remain and the per-cycle record cap allows, each sent and
//! confirmed in turn, optional promotion back to memory, then housekeeping
//! when due. A failed send leaves the batch unconfirmed; the same records
//! are offered again next cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::buffer::{HousekeepReport, ProxyBuffer};
use crate::fallback::FallbackReason;
use crate::record::{PerStream, Stream};
use crate::transport::{Transport, UploadBatch};

/// Default housekeeping period.
pub const HOUSEKEEP_PERIOD_SECS: u64 = 3600;

/// Outcome of one export cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub batches: usize,
    pub records: PerStream<usize>,
    pub failed_sends: usize,
    pub data_loss_gaps: usize,
    pub degraded: bool,
    pub fallback: Option<FallbackReason>,
    pub promoted: bool,
    pub housekeeping: Option<HousekeepReport>,
    pub errors: Vec<String>,
}

impl CycleReport {
    #[must_use]
    pub fn total_records(&self) -> usize {
        self.records.iter().map(|(_, n)| *n).sum()
    }
}

/// Totals over repeated cycles.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    pub cycles: usize,
    pub records: PerStream<usize>,
    pub failed_sends: usize,
    pub data_loss_gaps: usize,
}

/// Runs export cycles against one buffer and transport.
pub struct Exporter {
    buffer: Arc<ProxyBuffer>,
    transport: Arc<dyn Transport>,
    housekeep_period_secs: u64,
    last_housekeep: Mutex<Option<u64>>,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("buffer", &self.buffer)
            .field("housekeep_period_secs", &self.housekeep_period_secs)
            .finish_non_exhaustive()
    }
}

impl Exporter {
    #[must_use]
    pub fn new(buffer: Arc<ProxyBuffer>, transport: Arc<dyn Transport>) -> Self {
        Self {
            buffer,
            transport,
            housekeep_period_secs: HOUSEKEEP_PERIOD_SECS,
            last_housekeep: Mutex::new(None),
        }
    }

    /// Run housekeeping at most once per `secs`; 0 disables it.
    #[must_use]
    pub fn with_housekeep_period(mut self, secs: u64) -> Self {
        self.housekeep_period_secs = secs;
        self
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<ProxyBuffer> {
        &self.buffer
    }

    /// One export cycle. Blocking; call from `spawn_blocking` in async code.
    pub fn run_cycle(&self) -> CycleReport {
        let buffer = &self.buffer;
        let export = &buffer.config().export;
        let now = buffer.now();
        let _span = crate::buffer_span!("export_cycle", state = %buffer.current_state()).entered();
        let mut report = CycleReport {
            fallback: buffer.check_staleness(),
            ..CycleReport::default()
        };

        let mut remaining = export.max_records_total;
        for stream in Stream::ALL {
            while remaining > 0 {
                let batch = buffer.next_batch(
                    stream,
                    export.max_records.min(remaining),
                    export.batch_limit(),
                );
                report.degraded |= batch.degraded;
                if batch.is_empty() {
                    break;
                }
                report.data_loss_gaps += batch.data_loss.len();

                let upload = UploadBatch::new(buffer.tables().get(stream), &batch, now);
                if let Err(err) = self.transport.send(&upload) {
                    warn!(
                        stream = %stream,
                        first_id = batch.first_id(),
                        last_id = batch.last_id(),
                        reason = %err,
                        "Upload failed, batch stays buffered"
                    );
                    report.failed_sends += 1;
                    report.errors.push(format!("{stream}: {err}"));
                    break;
                }
                if let Err(err) = buffer.confirm_sent(&batch) {
                    error!(stream = %stream, error = %err, "Failed to confirm batch");
                    report.errors.push(format!("{stream}: {err}"));
                    break;
                }
                remaining = remaining.saturating_sub(batch.len());
                report.records[stream] += batch.len();
                report.batches += 1;
                if !batch.more {
                    break;
                }
            }
        }

        report.promoted = buffer.promote_if_drained();

        if self.housekeeping_due(now) {
            match buffer.housekeep(now) {
                Ok(hk) => report.housekeeping = Some(hk),
                Err(err) => {
                    warn!(error = %err, "Housekeeping failed");
                    report.errors.push(format!("housekeeping: {err}"));
                }
            }
        }

        debug!(
            batches = report.batches,
            records = report.total_records(),
            failed_sends = report.failed_sends,
            state = %buffer.current_state(),
            "Export cycle finished"
        );
        report
    }

    fn housekeeping_due(&self, now: u64) -> bool {
        if self.housekeep_period_secs == 0 {
            return false;
        }
        let mut last = self
            .last_housekeep
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let due = last.is_none_or(|at| now.saturating_sub(at) >= self.housekeep_period_secs);
        if due {
            *last = Some(now);
        }
        due
    }

    /// Run cycles until one exports nothing, a send fails, or `max_cycles`
    /// is reached.
    pub fn drain(&self, max_cycles: usize) -> DrainReport {
        let mut drained = DrainReport::default();
        while drained.cycles < max_cycles {
            let report = self.run_cycle();
            drained.cycles += 1;
            for (stream, n) in report.records.iter() {
                drained.records[stream] += n;
            }
            drained.failed_sends += report.failed_sends;
            drained.data_loss_gaps += report.data_loss_gaps;
            if report.failed_sends > 0 || report.total_records() == 0 {
                break;
            }
        }
        drained
    }
}

/// Async driver for [`Exporter`].
#[derive(Debug)]
pub struct ExportWorker {
    exporter: Arc<Exporter>,
    interval: Duration,
}

impl ExportWorker {
    /// Tick at the buffer's configured export interval.
    #[must_use]
    pub fn new(exporter: Arc<Exporter>) -> Self {
        let interval = exporter.buffer().config().export.interval();
        Self { exporter, interval }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run cycles until `shutdown` is set.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            "Export worker started"
        );

        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                info!("Export worker shutting down");
                break;
            }

            let exporter = Arc::clone(&self.exporter);
            match tokio::task::spawn_blocking(move || exporter.run_cycle()).await {
                Ok(report) => {
                    for err in &report.errors {
                        warn!(error = %err, "Export cycle error");
                    }
                }
                Err(err) => warn!(error = %err, "Export cycle task failed"),
            }
        }
    }
}
